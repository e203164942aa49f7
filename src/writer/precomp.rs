//! Write precompensation
//!
//! Transitions recorded close together drift apart on the media (peak
//! shift). Before writing, each transition is nudged according to the
//! transitions either side of it so the read-back spacing comes out
//! nominal. Everything here is a pure function of its inputs.

use crate::encoding::Encoding;
use crate::flux::FluxStream;
use crate::pll::Bitstream;
use serde::{Deserialize, Serialize};

/// Cells at or below this duration count as high density
const HD_CELL_NS: f64 = 1500.0;

/// Direction a transition is moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Early,
    None,
    Late,
}

/// Shift for a 3-bit neighbourhood `(previous, current, next)`, written
/// most significant bit first as `0b011` etc.
pub fn shift_for(pattern: u8) -> Shift {
    match pattern & 0b111 {
        0b101 | 0b011 => Shift::Late,
        0b110 => Shift::Early,
        _ => Shift::None,
    }
}

/// Precompensation settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecompConfig {
    /// Base shift in nanoseconds; zero disables precompensation
    pub amount_ns: f64,
    /// First cylinder that gets the inner-track increment
    pub inner_from: u8,
    /// Extra nanoseconds per cylinder past `inner_from`
    pub inner_step_ns: f64,
    /// Closest spacing, in cells, two transitions can have
    pub min_run: usize,
}

impl Default for PrecompConfig {
    fn default() -> Self {
        Self {
            amount_ns: 125.0,
            inner_from: 40,
            inner_step_ns: 2.0,
            min_run: 2,
        }
    }
}

impl PrecompConfig {
    /// No precompensation at all
    pub fn none() -> Self {
        Self {
            amount_ns: 0.0,
            ..Self::default()
        }
    }

    /// Defaults for an encoding at a given cell duration
    pub fn for_encoding(encoding: Encoding, cell_ns: f64) -> Self {
        match encoding {
            Encoding::Mfm | Encoding::AmigaMfm | Encoding::M2fm => Self {
                amount_ns: if cell_ns <= HD_CELL_NS { 65.0 } else { 125.0 },
                ..Self::default()
            },
            Encoding::GcrCbm | Encoding::GcrApple | Encoding::GcrMac | Encoding::GcrVictor => Self {
                amount_ns: 150.0,
                min_run: 1,
                ..Self::default()
            },
            Encoding::Fm | Encoding::Unknown => Self::none(),
        }
    }

    /// Whether anything gets shifted
    pub fn is_enabled(&self) -> bool {
        self.amount_ns > 0.0
    }

    /// Shift applied on a cylinder
    pub fn amount_on(&self, cylinder: u8) -> f64 {
        if !self.is_enabled() {
            return 0.0;
        }
        let inner = cylinder.saturating_sub(self.inner_from) as f64;
        self.amount_ns + inner * self.inner_step_ns
    }
}

/// Flux for a cell pattern with every transition precompensated.
///
/// A transition's neighbours count as present when they sit exactly the
/// minimum run length away. Revolution starts in `bits` become index
/// marks, as [`Bitstream::to_flux`] places them.
pub fn precompensate(bits: &Bitstream, cylinder: u8, config: &PrecompConfig) -> FluxStream {
    let amount = config.amount_on(cylinder);
    let run = config.min_run.max(1);
    let cells = bits.bits();
    let at = |i: isize| -> u8 {
        if i < 0 {
            0
        } else {
            cells.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut starts = bits.revolution_starts.iter().peekable();
    let mut last: Option<f64> = None;
    let mut marks = Vec::new();
    let mut intervals = Vec::new();
    for (i, &b) in cells.iter().enumerate() {
        while starts.next_if(|&&p| p <= i).is_some() {
            marks.push(intervals.len());
        }
        if b != 1 {
            continue;
        }
        let pos = i as isize;
        let pattern = (at(pos - run as isize) << 2) | 0b010 | at(pos + run as isize);
        let nudge = match shift_for(pattern) {
            Shift::Early => -amount,
            Shift::Late => amount,
            Shift::None => 0.0,
        };
        let t = i as f64 * bits.cell_ns + nudge;
        if let Some(prev) = last {
            intervals.push(((t - prev).round() as i64).max(1) as u32);
        }
        last = Some(t);
    }
    if !cells.is_empty() {
        marks.push(intervals.len());
    }
    FluxStream::from_intervals(intervals, &marks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pattern_table() {
        assert_eq!(shift_for(0b101), Shift::Late);
        assert_eq!(shift_for(0b011), Shift::Late);
        assert_eq!(shift_for(0b110), Shift::Early);
        assert_eq!(shift_for(0b010), Shift::None);
    }

    #[test]
    fn test_defaults_per_encoding() {
        assert_eq!(PrecompConfig::for_encoding(Encoding::Mfm, 2000.0).amount_ns, 125.0);
        assert_eq!(PrecompConfig::for_encoding(Encoding::Mfm, 1000.0).amount_ns, 65.0);
        assert_eq!(PrecompConfig::for_encoding(Encoding::GcrCbm, 3250.0).amount_ns, 150.0);
        assert!(!PrecompConfig::for_encoding(Encoding::Fm, 4000.0).is_enabled());
    }

    #[test]
    fn test_inner_tracks_get_more() {
        let config = PrecompConfig::default();
        assert_eq!(config.amount_on(0), 125.0);
        assert_eq!(config.amount_on(40), 125.0);
        assert_eq!(config.amount_on(79), 125.0 + 39.0 * 2.0);
        assert_eq!(PrecompConfig::none().amount_on(79), 0.0);
    }

    #[test]
    fn test_disabled_matches_plain_flux() {
        let bits = Bitstream::from_bits(vec![1, 0, 1, 0, 0, 1, 0, 0, 0, 1, 0, 1], 2000.0);
        let plain = bits.to_flux();
        let flux = precompensate(&bits, 10, &PrecompConfig::none());
        assert_eq!(flux.intervals(), plain.intervals());
        assert_eq!(flux.index_marks(), plain.index_marks());
    }

    #[test]
    fn test_close_pair_is_shifted() {
        // 1 0 1 0 0 0 1: first pair is close, last transition stands alone
        let bits = Bitstream::from_bits(vec![1, 0, 1, 0, 0, 0, 1], 2000.0);
        let flux = precompensate(&bits, 0, &PrecompConfig::default());
        // first moves late (next close), second moves early (previous close)
        assert_eq!(flux.intervals(), &[4000 - 250, 8000 + 125]);
    }

    proptest! {
        #[test]
        fn test_pure(cells in proptest::collection::vec(0u8..2, 0..400), cylinder in 0u8..84) {
            let bits = Bitstream::from_bits(cells, 2000.0);
            let config = PrecompConfig::default();
            let a = precompensate(&bits, cylinder, &config);
            let b = precompensate(&bits, cylinder, &config);
            prop_assert_eq!(a.intervals(), b.intervals());
            prop_assert_eq!(a.index_marks(), b.index_marks());
            prop_assert_eq!(a.len(), bits.bits().iter().filter(|&&b| b == 1).count().saturating_sub(1));
        }
    }
}
