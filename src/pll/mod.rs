//! Clock recovery: flux intervals to bit cells
//!
//! The loop keeps a running cell time and a phase residue. Each flux
//! interval (plus the carried residue) is quantised to a whole number of
//! cells `n` and emitted as a one followed by `n - 1` zeros. Part of the
//! quantisation error adjusts the cell time (frequency), the rest is
//! carried into the next interval after damping (phase).
//!
//! The PLL never fails. Trouble shows up as weak or no-flux tags on the
//! cells it emits and in the aggregate [`Bitstream::lock_quality`].

/// Bit cells with reliability tags
pub mod bitstream;

pub use bitstream::{BitTag, Bitstream};

use crate::encoding::Encoding;
use crate::error::{FloppyError, Result};
use crate::flux::{FluxStream, FluxValidity};
use log::{debug, trace};

/// Lock state of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PllState {
    /// No lock; wide window, fast adaptation
    Searching,
    /// Sync pattern seen; counting in-window intervals
    Acquiring,
    /// Stable cell time, normal window
    Locked,
}

/// PLL tuning parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PllConfig {
    /// Preset name this configuration was derived from
    pub preset: &'static str,
    /// Fraction of the phase error removed per interval
    pub phase_gain: f64,
    /// Fraction of the phase error applied to the cell time
    pub freq_gain: f64,
    /// Half-width of the acceptance window, as a fraction of a cell
    pub tolerance: f64,
    /// Window used while searching for lock
    pub search_tolerance: f64,
    /// Largest allowed cell-time deviation from nominal (fraction)
    pub max_drift: f64,
    /// In-window intervals required to go from acquiring to locked
    pub warmup: u32,
    /// Consecutive out-of-window intervals that drop lock
    pub excursion_limit: u32,
    /// Intervals shorter than this (ns) are merged into the next one
    pub lowpass_ns: u32,
    /// Restart in the searching state at each index mark
    pub reset_on_index: bool,
    /// Freeze the cell time once a revolution decodes cleanly
    pub lock_on_success: bool,
}

impl Default for PllConfig {
    fn default() -> Self {
        Self {
            preset: "default",
            phase_gain: 0.10,
            freq_gain: 0.05,
            tolerance: 0.40,
            search_tolerance: 0.50,
            max_drift: 0.20,
            warmup: 32,
            excursion_limit: 8,
            lowpass_ns: 0,
            reset_on_index: true,
            lock_on_success: false,
        }
    }
}

impl PllConfig {
    /// Names accepted by [`PllConfig::preset`]
    pub const PRESETS: [&'static str; 6] = ["default", "soft", "aggressive", "amiga", "c64", "apple"];

    /// Look up a preset by name
    pub fn preset(name: &str) -> Result<Self> {
        let base = Self::default();
        let config = match name.to_ascii_lowercase().as_str() {
            "default" => base,
            "soft" => Self {
                preset: "soft",
                phase_gain: 0.05,
                freq_gain: 0.01,
                tolerance: 0.50,
                search_tolerance: 0.50,
                warmup: 64,
                excursion_limit: 16,
                lock_on_success: true,
                ..base
            },
            "aggressive" => Self {
                preset: "aggressive",
                phase_gain: 0.60,
                freq_gain: 0.05,
                tolerance: 0.30,
                warmup: 16,
                excursion_limit: 4,
                ..base
            },
            "amiga" => Self {
                preset: "amiga",
                phase_gain: 0.10,
                freq_gain: 0.04,
                tolerance: 0.35,
                max_drift: 0.10,
                ..base
            },
            "c64" => Self {
                preset: "c64",
                phase_gain: 0.15,
                freq_gain: 0.06,
                tolerance: 0.45,
                max_drift: 0.25,
                warmup: 24,
                ..base
            },
            "apple" => Self {
                preset: "apple",
                phase_gain: 0.12,
                freq_gain: 0.05,
                tolerance: 0.45,
                max_drift: 0.15,
                ..base
            },
            other => {
                return Err(FloppyError::invalid_arg(format!(
                    "unknown PLL preset '{}' (expected one of {})",
                    other,
                    Self::PRESETS.join(", ")
                )))
            }
        };
        Ok(config)
    }

    /// Preset suited to an encoding
    pub fn for_encoding(encoding: Encoding) -> Self {
        let name = match encoding {
            Encoding::AmigaMfm => "amiga",
            Encoding::GcrCbm | Encoding::GcrVictor => "c64",
            Encoding::GcrApple | Encoding::GcrMac => "apple",
            _ => "default",
        };
        Self::preset(name).unwrap_or_default()
    }

    /// Same configuration with a wider window (never narrower)
    pub fn widened(&self, tolerance: f64) -> Self {
        let tolerance = tolerance.clamp(self.tolerance, 0.5);
        Self {
            tolerance,
            search_tolerance: self.search_tolerance.max(tolerance),
            ..self.clone()
        }
    }

    /// Check gains and window are in range
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.phase_gain) {
            return Err(FloppyError::invalid_arg("pllPhaseGain must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.freq_gain) {
            return Err(FloppyError::invalid_arg("pllFreqGain must be within 0.0..=1.0"));
        }
        if !(0.05..=0.5).contains(&self.tolerance) {
            return Err(FloppyError::invalid_arg("pllWindowTolerance must be within 0.05..=0.5"));
        }
        Ok(())
    }
}

/// Software PLL for one encoding
#[derive(Debug, Clone)]
pub struct Pll {
    config: PllConfig,
    encoding: Encoding,
    nominal_ns: f64,
    clock_ns: f64,
    phase_ns: f64,
    state: PllState,
    in_window: u32,
    excursions: u32,
    history: u64,
    frozen: bool,
    sync_patterns: Vec<(u64, u32)>,
}

impl Pll {
    /// Create a PLL for a nominal cell time
    pub fn new(config: PllConfig, encoding: Encoding, cell_ns: f64) -> Self {
        let nominal_ns = if cell_ns > 0.0 { cell_ns } else { 2000.0 };
        Self {
            sync_patterns: encoding.sync_patterns(),
            config,
            encoding,
            nominal_ns,
            clock_ns: nominal_ns,
            phase_ns: 0.0,
            state: PllState::Searching,
            in_window: 0,
            excursions: 0,
            history: 0,
            frozen: false,
        }
    }

    /// Current state
    pub fn state(&self) -> PllState {
        self.state
    }

    /// Current cell time estimate
    pub fn clock_ns(&self) -> f64 {
        self.clock_ns
    }

    /// Configuration in use
    pub fn config(&self) -> &PllConfig {
        &self.config
    }

    /// Stop adapting the cell time
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Return to the searching state, keeping the cell time unless told otherwise
    pub fn reset(&mut self, reset_clock: bool) {
        self.state = PllState::Searching;
        self.phase_ns = 0.0;
        self.in_window = 0;
        self.excursions = 0;
        self.history = 0;
        if reset_clock && !self.frozen {
            self.clock_ns = self.nominal_ns;
        }
    }

    /// Recover every revolution of a flux stream
    pub fn decode(&mut self, flux: &FluxStream) -> Bitstream {
        self.decode_with(flux, |_| false)
    }

    /// Recover a single revolution
    pub fn decode_revolution(&mut self, flux: &FluxStream, revolution: usize) -> Option<Bitstream> {
        let range = flux.revolution_range(revolution)?;
        self.reset(true);
        let mut out = Bitstream::new(self.nominal_ns);
        out.mark_revolution();
        let mut stats = LockStats::default();
        for i in range {
            self.feed(flux, i, &mut out, &mut stats);
        }
        out.cell_ns = self.clock_ns;
        out.lock_quality = stats.quality();
        Some(out)
    }

    /// Recover every revolution, asking `accept` after each one whether it
    /// decoded cleanly; with `lock_on_success` the cell time is frozen from
    /// then on.
    pub fn decode_with<F>(&mut self, flux: &FluxStream, mut accept: F) -> Bitstream
    where
        F: FnMut(&Bitstream) -> bool,
    {
        let mut out = Bitstream::new(self.nominal_ns);
        let mut stats = LockStats::default();

        // segments between index marks, plus any lead-in and tail
        let mut bounds: Vec<usize> = std::iter::once(0)
            .chain(flux.index_marks().iter().copied())
            .chain(std::iter::once(flux.len()))
            .collect();
        bounds.dedup();

        for (k, pair) in bounds.windows(2).enumerate() {
            let range = pair[0]..pair[1];
            if k > 0 && self.config.reset_on_index {
                self.reset(false);
            }
            let rev_start = out.len();
            out.mark_revolution();
            let mut rev_stats = LockStats::default();
            for i in range {
                self.feed(flux, i, &mut out, &mut rev_stats);
            }
            stats.merge(&rev_stats);
            trace!(
                "pll rev {}: {} cells, clock {:.1} ns, quality {:.2}",
                k,
                out.len() - rev_start,
                self.clock_ns,
                rev_stats.quality()
            );

            if self.config.lock_on_success && !self.frozen {
                let rev = Bitstream::from_bits(out.bits()[rev_start..].to_vec(), self.clock_ns);
                if accept(&rev) {
                    debug!("pll frozen at {:.1} ns after revolution {}", self.clock_ns, k);
                    self.frozen = true;
                }
            }
        }
        out.cell_ns = self.clock_ns;
        out.lock_quality = stats.quality();
        out
    }

    fn feed(&mut self, flux: &FluxStream, index: usize, out: &mut Bitstream, stats: &mut LockStats) {
        let interval = flux.intervals()[index] as f64;
        let flagged = flux.is_invalid(index);
        let no_flux_flag = flux
            .invalid_regions()
            .iter()
            .any(|r| r.reason == FluxValidity::NoFlux && r.start <= index && index < r.start + r.len);

        let ticks = self.phase_ns + interval;
        if (interval as u32) < self.config.lowpass_ns || ticks < self.clock_ns * 0.5 {
            // glitch: carry the time into the next interval
            self.phase_ns = ticks;
            return;
        }

        let cells = (ticks / self.clock_ns).round().max(1.0);
        let n = cells as usize;
        let residual = ticks - cells * self.clock_ns;
        let max_run = self.encoding.max_run_cells() as usize;

        let tolerance = match self.state {
            PllState::Searching => self.config.search_tolerance,
            _ => self.config.tolerance,
        };
        let in_window = residual.abs() <= tolerance * self.clock_ns / 2.0 && n <= max_run + 1;

        if !self.frozen {
            let gain = match self.state {
                PllState::Searching => (self.config.freq_gain * 2.0).min(1.0),
                _ => self.config.freq_gain,
            };
            if n <= max_run + 1 {
                self.clock_ns += residual * gain / cells;
            } else {
                self.clock_ns += (self.nominal_ns - self.clock_ns) * gain;
            }
            let lo = self.nominal_ns * (1.0 - self.config.max_drift);
            let hi = self.nominal_ns * (1.0 + self.config.max_drift);
            self.clock_ns = self.clock_ns.clamp(lo, hi);
        }
        self.phase_ns = residual * (1.0 - self.config.phase_gain);

        let tag = if no_flux_flag {
            BitTag::NoFlux
        } else if flagged || !in_window {
            BitTag::Weak
        } else {
            BitTag::Confident
        };
        out.push(1, tag);
        self.shift(1);
        for z in 1..n {
            let zero_tag = if z > max_run { BitTag::NoFlux } else { tag };
            out.push(0, zero_tag);
            self.shift(0);
        }

        stats.total += 1;
        if in_window && !flagged && self.state == PllState::Locked {
            stats.locked += 1;
        }
        self.advance(in_window && !flagged);
    }

    fn shift(&mut self, bit: u8) {
        self.history = (self.history << 1) | bit as u64;
        if self.state == PllState::Searching {
            let hit = self.sync_patterns.iter().any(|&(pattern, width)| {
                let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
                self.history & mask == pattern & mask
            });
            if hit {
                trace!("pll acquiring at clock {:.1} ns", self.clock_ns);
                self.state = PllState::Acquiring;
                self.in_window = 0;
            }
        }
    }

    fn advance(&mut self, in_window: bool) {
        match self.state {
            // a sync pattern short-cuts this; a long clean run also counts
            PllState::Searching => {
                if in_window {
                    self.in_window += 1;
                    if self.in_window >= self.config.warmup {
                        self.state = PllState::Acquiring;
                        self.in_window = 0;
                    }
                } else {
                    self.in_window = 0;
                }
            }
            PllState::Acquiring => {
                if in_window {
                    self.in_window += 1;
                    if self.in_window >= self.config.warmup {
                        self.state = PllState::Locked;
                        self.excursions = 0;
                    }
                } else {
                    self.in_window = 0;
                }
            }
            PllState::Locked => {
                if in_window {
                    self.excursions = 0;
                } else {
                    self.excursions += 1;
                    if self.excursions >= self.config.excursion_limit {
                        trace!("pll lost lock after {} excursions", self.excursions);
                        self.state = PllState::Searching;
                        self.in_window = 0;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LockStats {
    total: u64,
    locked: u64,
}

impl LockStats {
    fn merge(&mut self, other: &LockStats) {
        self.total += other.total;
        self.locked += other.locked;
    }

    fn quality(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.locked as f32 / self.total as f32
        }
    }
}

/// Decode a flux stream with the preset for an encoding
pub fn recover(flux: &FluxStream, encoding: Encoding, cell_ns: f64) -> Bitstream {
    Pll::new(PllConfig::for_encoding(encoding), encoding, cell_ns).decode(flux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{self, MarkKind, RawTrack};
    use proptest::prelude::*;

    fn mfm_track() -> RawTrack {
        let mut raw = RawTrack::new(Encoding::Mfm);
        raw.fill(0x4E, 40);
        raw.fill(0x00, 12);
        for _ in 0..3 {
            raw.mark(MarkKind::Sync);
            raw.push(0xA1, 0, false);
        }
        raw.extend(&[0xFE, 0x02, 0x01, 0x05, 0x02]);
        raw.fill(0x4E, 40);
        raw
    }

    #[test]
    fn test_presets() {
        for name in PllConfig::PRESETS {
            let config = PllConfig::preset(name).unwrap();
            assert_eq!(config.preset, name);
            config.validate().unwrap();
        }
        assert!(PllConfig::preset("bogus").is_err());
        let d = PllConfig::default();
        assert_eq!((d.phase_gain, d.freq_gain, d.tolerance), (0.10, 0.05, 0.40));
    }

    #[test]
    fn test_widened_is_monotone() {
        let c = PllConfig::default();
        assert_eq!(c.widened(0.2).tolerance, 0.40);
        assert_eq!(c.widened(0.45).tolerance, 0.45);
        assert_eq!(c.widened(0.9).tolerance, 0.5);
    }

    #[test]
    fn test_clean_flux_locks_and_decodes() {
        let raw = mfm_track();
        let flux = encoding::encode(&raw, 2000.0).unwrap().to_flux();
        let mut pll = Pll::new(PllConfig::default(), Encoding::Mfm, 2000.0);
        let bits = pll.decode(&flux);
        assert!(bits.lock_quality > 0.5, "quality {}", bits.lock_quality);
        assert!((pll.clock_ns() - 2000.0).abs() < 20.0);

        let decoded = encoding::decode(Encoding::Mfm, &bits);
        let id = decoded.markers_of(MarkKind::IdAddress).next().unwrap().offset;
        assert_eq!(decoded.slice(id, 5).unwrap(), &[0xFE, 0x02, 0x01, 0x05, 0x02]);
    }

    #[test]
    fn test_tracks_slow_drive() {
        let raw = mfm_track();
        let flux = encoding::encode(&raw, 2000.0).unwrap().to_flux();
        let slow: Vec<u32> = flux.intervals().iter().map(|&t| t * 103 / 100).collect();
        let slow = FluxStream::from_intervals(slow, flux.index_marks());
        let bits = Pll::new(PllConfig::default(), Encoding::Mfm, 2000.0).decode(&slow);
        let decoded = encoding::decode(Encoding::Mfm, &bits);
        assert!(decoded.markers_of(MarkKind::IdAddress).count() == 1);
    }

    #[test]
    fn test_long_gap_is_no_flux() {
        let flux = FluxStream::from_intervals(vec![4000, 4000, 40000, 4000], &[0]);
        let bits = Pll::new(PllConfig::default(), Encoding::Mfm, 2000.0).decode(&flux);
        assert!(bits.tags().contains(&BitTag::NoFlux));
    }

    #[test]
    fn test_flagged_interval_is_weak() {
        let mut flux = FluxStream::from_intervals(vec![4000; 64], &[0]);
        flux.mark_invalid(10, 1, FluxValidity::Overflow);
        let bits = Pll::new(PllConfig::default(), Encoding::Mfm, 2000.0).decode(&flux);
        assert!(bits.tags().contains(&BitTag::Weak));
    }

    #[test]
    fn test_lock_on_success_freezes_clock() {
        let raw = mfm_track();
        let one = encoding::encode(&raw, 2000.0).unwrap().to_flux();
        let mut intervals = one.intervals().to_vec();
        let second: Vec<u32> = one.intervals().iter().map(|&t| t * 110 / 100).collect();
        let split = intervals.len();
        intervals.extend(second);
        let flux = FluxStream::from_intervals(intervals, &[0, split]);

        let config = PllConfig {
            lock_on_success: true,
            ..PllConfig::default()
        };
        let mut pll = Pll::new(config, Encoding::Mfm, 2000.0);
        assert_eq!(pll.state(), PllState::Searching);
        pll.decode_with(&flux, |_| true);
        assert!((pll.clock_ns() - 2000.0).abs() < 20.0);
    }

    proptest! {
        #[test]
        fn test_pll_never_fails(intervals in proptest::collection::vec(1u32..200_000, 0..400)) {
            let flux = FluxStream::from_intervals(intervals, &[0]);
            let bits = Pll::new(PllConfig::default(), Encoding::Mfm, 2000.0).decode(&flux);
            prop_assert!((0.0..=1.0).contains(&bits.lock_quality));
            prop_assert_eq!(bits.bits().len(), bits.tags().len());
        }
    }
}
