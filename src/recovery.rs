//! Multi-revolution reads with retries and sector merging
//!
//! A track is captured several revolutions at a time. Each revolution is
//! clock-recovered and decoded on its own and the resulting sectors are
//! merged, keeping the best copy of every sector id. While sectors stay
//! missing or bad the engine widens the PLL window, optionally moves the
//! head away and back or trims the motor speed, and captures again.

use crate::disk::{Disk, Geometry, Sector, SectorQuality, Track, TrackOverride, TrackStatus};
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result};
use crate::flux::histogram::FluxHistogram;
use crate::flux::{FluxArchive, FluxStream};
use crate::hw::{Capabilities, Density, FluxDevice};
use crate::pll::{Pll, PllConfig};
use crate::profile::{cell_ns_for, PlatformProfile};
use crate::session::cancel::CancelToken;
use crate::session::progress::{Outcome, Progress};
use crate::track::{decode_bits, driver, TrackDriver};
use log::{debug, info, warn};
use std::collections::HashMap;

/// Speed trims tried in turn when `vary_speed` is set
const SPEED_STEPS: [i8; 4] = [1, -1, 2, -2];

/// Tuning for the recovery loop
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    /// Revolutions captured per attempt
    pub revolutions: u8,
    /// Extra attempts after the first
    pub retries: u8,
    /// Starting PLL configuration
    pub pll: PllConfig,
    /// Tolerance added to the PLL window on each retry
    pub widen_step: f64,
    /// Step the head away and back before a retry
    pub seek_away: bool,
    /// Trim the motor speed on retries, when the device can
    pub vary_speed: bool,
    /// Keep unstable sectors as weak with a mask of differing bits
    pub weak_bits: bool,
    /// Encoding to decode with when there is no profile; `None` guesses
    pub encoding: Option<Encoding>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            revolutions: 3,
            retries: 3,
            pll: PllConfig::default(),
            widen_step: 0.05,
            seek_away: true,
            vary_speed: false,
            weak_bits: true,
            encoding: None,
        }
    }
}

impl RecoveryConfig {
    /// Defaults adjusted for a platform
    pub fn for_profile(profile: &PlatformProfile) -> Self {
        Self {
            revolutions: profile.revolutions,
            pll: PllConfig::preset(profile.pll_preset).unwrap_or_default(),
            encoding: (profile.encoding != Encoding::Unknown).then_some(profile.encoding),
            ..Self::default()
        }
    }

    /// PLL settings for an encoding: the configured ones unless they are
    /// still the plain defaults, in which case the encoding's preset
    fn pll_for(&self, encoding: Encoding) -> PllConfig {
        if self.pll == PllConfig::default() && encoding != Encoding::Unknown {
            PllConfig::for_encoding(encoding)
        } else {
            self.pll.clone()
        }
    }
}

/// How one capture is going to be decoded
#[derive(Clone, Copy)]
struct Plan {
    driver: Option<&'static dyn TrackDriver>,
    encoding: Encoding,
    cell_ns: f64,
}

/// Pick encoding, driver and cell time: the profile's, then the
/// configured encoding, then a guess from the interval histogram.
/// `None` means the capture is kept as flux only.
fn plan(flux: &FluxStream, cylinder: u8, profile: Option<&PlatformProfile>, config: &RecoveryConfig) -> Option<Plan> {
    if let Some(p) = profile {
        if p.encoding == Encoding::Unknown {
            return None;
        }
        return Some(Plan {
            driver: driver(p.track_driver).ok(),
            encoding: p.encoding,
            cell_ns: p.cell_ns_on(cylinder),
        });
    }
    if let Some(encoding) = config.encoding.filter(|&e| e != Encoding::Unknown) {
        return Some(Plan {
            driver: encoding.default_driver().and_then(|n| driver(n).ok()),
            encoding,
            cell_ns: cell_ns_for(encoding, cylinder, None),
        });
    }
    let guess = FluxHistogram::from_stream(flux).guess();
    if guess.encoding == Encoding::Unknown {
        return None;
    }
    debug!(
        "c{}: histogram suggests {} at {:.0} ns ({}%)",
        cylinder,
        guess.encoding.name(),
        guess.cell_ns,
        guess.confidence
    );
    Some(Plan {
        driver: None,
        encoding: guess.encoding,
        cell_ns: guess.cell_ns,
    })
}

fn decode_planned(
    flux: &FluxStream,
    cylinder: u8,
    head: u8,
    plan: &Plan,
    pll: &PllConfig,
    weak_bits: bool,
) -> Track {
    let mut recovered = Pll::new(pll.clone(), plan.encoding, plan.cell_ns);
    if flux.revolution_count() == 0 {
        let bits = recovered.decode(flux);
        return decode_bits(&bits, cylinder, head, plan.driver);
    }
    let mut acc: Option<Track> = None;
    for k in 0..flux.revolution_count() {
        let Some(bits) = recovered.decode_revolution(flux, k) else {
            continue;
        };
        let track = decode_bits(&bits, cylinder, head, plan.driver);
        match acc.as_mut() {
            Some(a) => merge_track(a, track, weak_bits),
            None => acc = Some(track),
        }
    }
    acc.unwrap_or_else(|| Track::new(cylinder, head))
}

/// Last resort when the histogram guess found nothing: every encoding at
/// its nominal cell time. Only a decode with at least one good header
/// counts, so noise stays an empty track.
fn try_each_encoding(flux: &FluxStream, cylinder: u8, head: u8, config: &RecoveryConfig) -> Option<Track> {
    let mut best: Option<Track> = None;
    for encoding in Encoding::ALL {
        let plan = Plan {
            driver: None,
            encoding,
            cell_ns: cell_ns_for(encoding, cylinder, None),
        };
        let track = decode_planned(flux, cylinder, head, &plan, &config.pll_for(encoding), config.weak_bits);
        if !track.sectors().iter().any(|s| s.header_crc_ok) {
            continue;
        }
        if best.as_ref().is_none_or(|b| track.confidence > b.confidence) {
            best = Some(track);
        }
    }
    if let Some(track) = &best {
        debug!("{}.{}: found {} by trying each encoding", cylinder, head, track.encoding.name());
    }
    best
}

/// Decode every revolution of a capture and merge the results.
///
/// Never fails: a capture nothing can be made of comes back as an
/// empty or unknown track.
pub fn decode_flux(
    flux: &FluxStream,
    cylinder: u8,
    head: u8,
    profile: Option<&PlatformProfile>,
    config: &RecoveryConfig,
) -> Track {
    let expected = profile.map(|p| p.sectors_on(cylinder) as usize).unwrap_or(0);
    let mut track = match plan(flux, cylinder, profile, config) {
        Some(plan) => {
            let pll = config.pll_for(plan.encoding);
            decode_planned(flux, cylinder, head, &plan, &pll, config.weak_bits)
        }
        None => Track::new(cylinder, head),
    };
    let guessing = profile.is_none() && config.encoding.is_none_or(|e| e == Encoding::Unknown);
    if guessing && !track.sectors().iter().any(|s| s.header_crc_ok) {
        if let Some(found) = try_each_encoding(flux, cylinder, head, config) {
            track = found;
        }
    }
    prune(&mut track, expected);
    track.classify(expected);
    track
}

/// Fold one more copy of a sector into the kept one.
///
/// A copy of strictly higher quality replaces the kept sector; anything
/// else leaves its payload untouched. When neither copy passes its
/// checksum the differing bits are ORed into `weak_mask` and every
/// distinct payload is kept in `variants`. Returns true when the
/// incoming copy was selected.
pub fn merge_sector(existing: &mut Sector, incoming: Sector, weak_bits: bool) -> bool {
    if incoming.quality() > existing.quality() {
        let previous = std::mem::replace(existing, incoming);
        if weak_bits && existing.quality() != SectorQuality::Good {
            fold_weak(existing, &previous);
        }
        return true;
    }
    if weak_bits && existing.quality() != SectorQuality::Good && incoming.quality() != SectorQuality::Good {
        fold_weak(existing, &incoming);
    }
    false
}

fn fold_weak(kept: &mut Sector, other: &Sector) {
    if kept.data() == other.data() {
        return;
    }
    let mut mask = kept.weak_mask.take().unwrap_or_else(|| vec![0; kept.data().len()]);
    mask.resize(kept.data().len(), 0);
    for (m, (a, b)) in mask.iter_mut().zip(kept.data().iter().zip(other.data())) {
        *m |= a ^ b;
    }
    if kept.variants.is_empty() {
        kept.variants.push(kept.data().to_vec());
    }
    if !kept.variants.iter().any(|v| v.as_slice() == other.data()) {
        kept.variants.push(other.data().to_vec());
    }
    kept.weak_mask = Some(mask);
    kept.weak = true;
}

/// Merge the sectors of another decode of the same track into `acc`
pub fn merge_track(acc: &mut Track, incoming: Track, weak_bits: bool) {
    let Track {
        driver,
        encoding,
        confidence,
        bitstream,
        residual,
        ..
    } = incoming.clone();
    if confidence > acc.confidence || acc.driver.is_none() {
        acc.driver = driver.or(acc.driver);
        if encoding != Encoding::Unknown {
            acc.encoding = encoding;
        }
        acc.confidence = acc.confidence.max(confidence);
        if bitstream.is_some() {
            acc.bitstream = bitstream;
        }
    }
    if acc.is_empty() && acc.residual.is_empty() {
        acc.residual = residual;
    }
    for sector in incoming.sectors().iter().cloned() {
        match acc.sectors().iter().position(|s| s.id == sector.id) {
            Some(i) => {
                merge_sector(&mut acc.sectors_mut()[i], sector, weak_bits);
            }
            None => acc.add_sector(sector),
        }
    }
}

/// Drop copies with a failed header checksum whose sector number also
/// appears with a good header, or all of them once the good headers
/// already cover the expected count
fn prune(track: &mut Track, expected: usize) {
    let mut good: Vec<u8> = track
        .sectors()
        .iter()
        .filter(|s| s.header_crc_ok)
        .map(|s| s.id.sector)
        .collect();
    good.sort_unstable();
    good.dedup();
    let full = expected > 0 && good.len() >= expected;
    let stale = |s: &Sector| !s.header_crc_ok && (full || good.binary_search(&s.id.sector).is_ok());
    if !track.sectors().iter().any(|s| stale(s)) {
        return;
    }
    let kept: Vec<Sector> = track.sectors().iter().filter(|s| !stale(*s)).cloned().collect();
    track.clear();
    for sector in kept {
        track.add_sector(sector);
    }
}

/// Every expected sector present and good
fn settled(track: &Track, expected: usize) -> bool {
    if track.sectors().iter().any(|s| s.has_error()) {
        return false;
    }
    expected == 0 || track.sectors_by_id().len() >= expected
}

fn store_partial(disk: &mut Disk, acc: Option<Track>, flux: Option<FluxStream>, cylinder: u8, head: u8) {
    let mut track = acc.unwrap_or_else(|| Track::new(cylinder, head));
    prune(&mut track, 0);
    if let Some(flux) = flux {
        track.flux = Some(disk.attach_flux(flux));
    }
    track.status = TrackStatus::Warning;
    disk.set_track(track);
}

pub(crate) fn stop_motor(device: &mut dyn FluxDevice) {
    if let Err(e) = device.motor(false) {
        debug!("{}: motor off failed: {}", device.backend(), e);
    }
}

/// Read one track from a device into `disk`.
///
/// Returns the final status. Tracks that stay bad after every retry are
/// stored as bad, not reported as errors; device faults are. On
/// cancellation whatever was captured is stored marked `warning`, the
/// motor is switched off and `Cancelled` is returned.
pub fn read_track(
    device: &mut dyn FluxDevice,
    disk: &mut Disk,
    cylinder: u8,
    head: u8,
    profile: Option<&PlatformProfile>,
    config: &RecoveryConfig,
    cancel: &CancelToken,
) -> Result<TrackStatus> {
    cancel.check()?;
    let physical = match profile {
        Some(p) if p.double_step => cylinder.saturating_mul(2),
        _ => cylinder,
    };
    let caps = device.capabilities();
    let known = profile
        .map(|p| p.encoding)
        .or(config.encoding)
        .unwrap_or(Encoding::Unknown);
    let expected = profile.map(|p| p.sectors_on(cylinder) as usize).unwrap_or(0);

    device.motor(true)?;
    device.seek(physical)?;
    device.select_head(head)?;
    if caps.has(Capabilities::DENSITY) && known != Encoding::Unknown {
        device.select_density(Density::for_cell_ns(cell_ns_for(known, cylinder, profile)))?;
    }

    let mut pll = config.pll_for(known);
    let mut acc: Option<Track> = None;
    let mut captured: Option<FluxStream> = None;
    let mut trimmed = false;
    for attempt in 0..=config.retries {
        if cancel.is_cancelled() {
            store_partial(disk, acc, captured, cylinder, head);
            stop_motor(device);
            return Err(FloppyError::Cancelled);
        }
        if attempt > 0 {
            pll = pll.widened(pll.tolerance + config.widen_step);
            disk.push_override(TrackOverride {
                cylinder,
                head,
                attempt,
                pll_tolerance: Some(pll.tolerance),
                phase_gain: Some(pll.phase_gain),
                freq_gain: Some(pll.freq_gain),
                note: "retry".into(),
            });
            warn!(
                "c{} h{}: retry {} of {} with window {:.2}",
                cylinder, head, attempt, config.retries, pll.tolerance
            );
            if config.seek_away {
                let away = if physical >= 4 { physical - 4 } else { physical + 4 };
                device.seek(away)?;
                device.seek(physical)?;
            }
            if config.vary_speed && caps.has(Capabilities::SPEED) {
                device.set_speed_trim(SPEED_STEPS[(attempt as usize - 1) % SPEED_STEPS.len()])?;
                trimmed = true;
            }
        }

        let flux = device.read_flux(config.revolutions)?;
        if cancel.is_cancelled() {
            store_partial(disk, acc, Some(flux), cylinder, head);
            stop_motor(device);
            return Err(FloppyError::Cancelled);
        }
        let Some(plan) = plan(&flux, cylinder, profile, config) else {
            captured = Some(flux);
            break;
        };
        if known == Encoding::Unknown && attempt == 0 {
            pll = config.pll_for(plan.encoding);
        }
        let track = decode_planned(&flux, cylinder, head, &plan, &pll, config.weak_bits);
        match acc.as_mut() {
            Some(a) => merge_track(a, track, config.weak_bits),
            None => acc = Some(track),
        }
        captured = Some(flux);
        if acc.as_ref().is_some_and(|t| settled(t, expected)) {
            break;
        }
    }
    if trimmed {
        device.set_speed_trim(0)?;
    }

    let mut track = acc.unwrap_or_else(|| Track::new(cylinder, head));
    prune(&mut track, expected);
    track.classify(expected);
    if let Some(flux) = captured {
        track.flux = Some(disk.attach_flux(flux));
    }
    let status = track.status;
    debug!(
        "c{} h{}: {} ({}/{} good)",
        cylinder,
        head,
        status,
        track.good_sectors(),
        track.sector_count()
    );
    disk.set_track(track);
    Ok(status)
}

/// Read every track of `disk`'s geometry, reporting each one.
///
/// Tracks land in `disk` as they finish, so a cancelled or failed read
/// leaves everything captured so far in place.
pub fn read_disk(
    device: &mut dyn FluxDevice,
    disk: &mut Disk,
    profile: Option<&PlatformProfile>,
    config: &RecoveryConfig,
    progress: &mut Progress,
) -> Result<Outcome> {
    let cancel = progress.cancel_token().clone();
    let (cylinders, heads) = (disk.geometry.cylinders, disk.geometry.heads.max(1));
    info!(
        "reading {} cylinders x {} heads from {}",
        cylinders,
        heads,
        device.info().name
    );
    let mut all_ok = true;
    for cylinder in 0..cylinders {
        for head in 0..heads {
            match read_track(device, disk, cylinder, head, profile, config, &cancel) {
                Ok(status) => {
                    all_ok &= status == TrackStatus::Ok;
                    if let Some(track) = disk.track(cylinder, head) {
                        progress.track(track);
                    }
                }
                Err(e) => {
                    stop_motor(device);
                    let outcome = if matches!(e, FloppyError::Cancelled) {
                        Outcome::Cancelled
                    } else {
                        progress.log(log::Level::Error, format!("c{} h{}: {}", cylinder, head, e));
                        Outcome::Failed
                    };
                    progress.complete(outcome);
                    return Err(e);
                }
            }
        }
    }
    stop_motor(device);
    let outcome = if all_ok { Outcome::Success } else { Outcome::Warnings };
    info!("read finished: {:?}", outcome);
    progress.complete(outcome);
    Ok(outcome)
}

/// Decode a whole flux archive into a disk, keeping the flux attached
pub fn decode_archive(archive: &FluxArchive, profile: Option<&PlatformProfile>, config: &RecoveryConfig) -> Disk {
    let geometry = match profile {
        Some(p) => p.geometry,
        None => Geometry::new(archive.cylinders(), archive.heads().max(1), 0, 512),
    };
    let mut disk = Disk::new(geometry);
    if archive.rpm > 0 {
        disk.geometry.rpm = archive.rpm;
    }
    for (&(cylinder, head), stream) in &archive.tracks {
        let mut track = decode_flux(stream, cylinder, head, profile, config);
        track.flux = Some(disk.attach_flux(stream.clone()));
        disk.set_track(track);
    }
    match profile {
        Some(p) => {
            disk.encoding = p.encoding;
            disk.platform = p.platform;
        }
        None => infer_layout(&mut disk),
    }
    disk.mark_unchanged();
    disk
}

/// Fill in encoding, platform and sectors per track from the drivers
/// that decoded most tracks
fn infer_layout(disk: &mut Disk) {
    let mut votes: HashMap<&'static str, usize> = HashMap::new();
    for track in disk.tracks().filter(|t| !t.is_empty()) {
        if let Some(name) = track.driver {
            *votes.entry(name).or_default() += 1;
        }
    }
    let Some(winner) = votes
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .and_then(|(name, _)| driver(name).ok())
    else {
        return;
    };
    disk.encoding = winner.encoding();
    disk.platform = winner.platform();
    let decoded: Vec<&Track> = disk.tracks().filter(|t| t.driver == Some(winner.name())).collect();
    let spt = decoded.iter().map(|t| t.sectors_by_id().len()).max().unwrap_or(0);
    let size = decoded.iter().find_map(|t| t.uniform_sector_size()).unwrap_or(512);
    let first = decoded
        .iter()
        .flat_map(|t| t.sectors().iter().map(|s| s.id.sector))
        .min()
        .unwrap_or(1);
    disk.geometry.sectors_per_track = spt.min(u8::MAX as usize) as u8;
    disk.geometry.sector_size = size as u16;
    disk.geometry.first_sector_id = first;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::SectorId;
    use crate::error::ErrorKind;
    use crate::hw::mock::MockDevice;
    use crate::profile::profile;
    use crate::session::progress::{ProgressEvent, ProgressQueue};
    use proptest::prelude::*;

    fn bad(data: Vec<u8>) -> Sector {
        let mut s = Sector::with_data(SectorId::new(0, 0, 1, 2), data);
        s.data_crc_ok = false;
        s
    }

    fn spun(disk: Disk) -> MockDevice {
        let mut dev = MockDevice::new(disk);
        dev.motor(true).unwrap();
        dev
    }

    fn pc() -> &'static PlatformProfile {
        profile("pc-720k").unwrap()
    }

    #[test]
    fn test_good_replaces_bad() {
        let mut kept = bad(vec![1; 512]);
        let id = kept.id;
        assert!(merge_sector(&mut kept, Sector::with_data(id, vec![2; 512]), true));
        assert_eq!(kept.data(), &[2; 512][..]);
        assert!(!merge_sector(&mut kept, bad(vec![3; 512]), true));
        assert_eq!(kept.data(), &[2; 512][..]);
        assert!(kept.weak_mask.is_none());
    }

    #[test]
    fn test_weak_mask_from_differing_reads() {
        let mut kept = bad(vec![0x00; 4]);
        merge_sector(&mut kept, bad(vec![0x00, 0x10, 0x00, 0x01]), true);
        merge_sector(&mut kept, bad(vec![0x80, 0x00, 0x00, 0x00]), true);
        assert_eq!(kept.weak_mask.as_deref(), Some(&[0x80, 0x10, 0x00, 0x01][..]));
        assert!(kept.weak);
        assert_eq!(kept.variants.len(), 3);
        assert_eq!(kept.variants[0], vec![0; 4]);
        assert_eq!(kept.data(), &[0; 4][..]);
        assert_eq!(kept.quality(), SectorQuality::Weak);

        let mut plain = bad(vec![0x00; 4]);
        merge_sector(&mut plain, bad(vec![0xFF; 4]), false);
        assert!(plain.weak_mask.is_none());
    }

    proptest! {
        #[test]
        fn test_merge_never_downgrades(
            first in proptest::collection::vec(any::<u8>(), 16),
            others in proptest::collection::vec((proptest::collection::vec(any::<u8>(), 16), any::<bool>()), 1..6),
            weak_bits in any::<bool>(),
        ) {
            let mut kept = Sector::with_data(SectorId::new(0, 0, 1, 0), first);
            kept.data_crc_ok = false;
            for (data, good) in others {
                let before_quality = kept.quality();
                let before = kept.data().to_vec();
                let mut s = Sector::with_data(kept.id, data);
                s.data_crc_ok = good;
                let incoming = s.quality();
                let selected = merge_sector(&mut kept, s, weak_bits);
                if incoming <= before_quality {
                    prop_assert!(!selected);
                    prop_assert_eq!(kept.data(), &before[..]);
                }
                prop_assert!(kept.quality() >= before_quality);
            }
        }
    }

    #[test]
    fn test_merge_track_fills_gaps() {
        let mut a = Track::new(0, 0);
        a.add_sector(bad(vec![0; 512]));
        let mut b = Track::new(0, 0);
        b.add_sector(Sector::with_data(SectorId::new(0, 0, 2, 2), vec![2; 512]));
        b.add_sector(Sector::with_data(SectorId::new(0, 0, 1, 2), vec![9; 512]));
        b.confidence = 80;
        merge_track(&mut a, b, true);
        assert_eq!(a.sector_count(), 2);
        assert_eq!(a.get_sector(1).unwrap().data(), &[9; 512][..]);
        assert_eq!(a.get_sector(2).unwrap().data(), &[2; 512][..]);
        assert_eq!(a.confidence, 80);
    }

    #[test]
    fn test_read_track_clean() {
        let mut dev = spun(Disk::builder().build().unwrap());
        let mut disk = Disk::new(pc().geometry);
        let status = read_track(&mut dev, &mut disk, 3, 1, Some(pc()), &RecoveryConfig::for_profile(pc()), &CancelToken::new())
            .unwrap();
        assert_eq!(status, TrackStatus::Ok);
        let track = disk.track(3, 1).unwrap();
        assert_eq!(track.good_sectors(), 9);
        assert!(disk.track_flux(3, 1).is_some());
        assert!(disk.overrides(3, 1).is_empty());
        assert_eq!(dev.read_count(), 1);
    }

    #[test]
    fn test_read_track_recovers_on_retry() {
        let mut dev = spun(Disk::builder().build().unwrap());
        dev.inject_fault(5, 0, 1);
        let mut disk = Disk::new(pc().geometry);
        let config = RecoveryConfig::for_profile(pc());
        let status = read_track(&mut dev, &mut disk, 5, 0, Some(pc()), &config, &CancelToken::new()).unwrap();
        assert_eq!(status, TrackStatus::Ok);
        assert_eq!(dev.read_count(), 2);
        let overrides = disk.overrides(5, 0);
        assert_eq!(overrides.len(), 1);
        assert!(overrides[0].pll_tolerance.unwrap() > config.pll.tolerance);
    }

    #[test]
    fn test_widening_is_monotone() {
        let mut dev = spun(Disk::builder().build().unwrap());
        dev.inject_fault(0, 0, 10);
        let mut disk = Disk::new(pc().geometry);
        let config = RecoveryConfig {
            retries: 5,
            seek_away: false,
            ..RecoveryConfig::for_profile(pc())
        };
        let status = read_track(&mut dev, &mut disk, 0, 0, Some(pc()), &config, &CancelToken::new()).unwrap();
        assert_ne!(status, TrackStatus::Ok);
        let tolerances: Vec<f64> = disk.overrides(0, 0).iter().filter_map(|o| o.pll_tolerance).collect();
        assert_eq!(tolerances.len(), 5);
        assert!(tolerances.windows(2).all(|w| w[1] >= w[0]));
        assert!(tolerances.iter().all(|&t| t <= 0.5));
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut dev = spun(Disk::builder().build().unwrap());
        let mut disk = Disk::new(pc().geometry);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = read_track(&mut dev, &mut disk, 0, 0, Some(pc()), &RecoveryConfig::default(), &cancel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(dev.read_count(), 0);
    }

    #[test]
    fn test_read_disk_reports_in_order() {
        let mut dev = spun(Disk::builder().geometry(Geometry::new(2, 2, 9, 512)).build().unwrap());
        let mut disk = Disk::new(Geometry::new(2, 2, 9, 512));
        let queue = ProgressQueue::new();
        let mut progress = Progress::with_queue(queue.clone(), CancelToken::new());
        let outcome = read_disk(&mut dev, &mut disk, Some(pc()), &RecoveryConfig::for_profile(pc()), &mut progress).unwrap();
        assert_eq!(outcome, Outcome::Success);
        let events = queue.drain();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[2], ProgressEvent::Track { cylinder: 1, head: 0, .. }));
        assert!(matches!(events[4], ProgressEvent::Complete { outcome: Outcome::Success, tracks: 4 }));
        assert!(!dev.status().unwrap().motor_on);
    }

    #[test]
    fn test_decode_archive_guesses_layout() {
        let source = Disk::builder().geometry(Geometry::new(2, 2, 9, 512)).build().unwrap();
        let mut dev = spun(source);
        let mut archive = FluxArchive::new();
        for c in 0..2 {
            for h in 0..2 {
                dev.seek(c).unwrap();
                dev.select_head(h).unwrap();
                archive.tracks.insert((c, h), dev.read_flux(2).unwrap());
            }
        }
        let disk = decode_archive(&archive, None, &RecoveryConfig::default());
        assert_eq!(disk.geometry.sectors_per_track, 9);
        assert_eq!(disk.geometry.sector_size, 512);
        assert_eq!(disk.encoding, Encoding::Mfm);
        assert_eq!(disk.flux_count(), 4);
        assert!(disk.tracks().all(|t| t.status == TrackStatus::Ok));
    }

    #[test]
    fn test_amiga_flux_without_profile() {
        let amiga = profile("amiga-dd").unwrap();
        let mut disk = Disk::builder().profile(amiga).build().unwrap();
        crate::fs::amigados::format(&mut disk, "Blank", false).unwrap();
        let mut dev = MockDevice::new(disk).with_profile(Some(amiga));
        dev.motor(true).unwrap();
        for c in [0u8, 40, 79] {
            dev.seek(c).unwrap();
            dev.select_head(1).unwrap();
            let flux = dev.read_flux(2).unwrap();
            let track = decode_flux(&flux, c, 1, None, &RecoveryConfig::default());
            assert_eq!(track.encoding, Encoding::AmigaMfm, "cylinder {}", c);
            assert_eq!(track.good_sectors(), 11);
        }
    }

    #[test]
    fn test_noise_decodes_to_nothing() {
        let mut dev = spun(Disk::new(Geometry::new(80, 2, 0, 512)));
        let flux = dev.read_flux(2).unwrap();
        let track = decode_flux(&flux, 0, 0, None, &RecoveryConfig::default());
        assert!(matches!(track.status, TrackStatus::Empty | TrackStatus::Unknown));
        assert!(track.is_empty());
    }
}
