//! Writing disks back to a drive
//!
//! Each track is laid out by its track driver, encoded to bit cells,
//! precompensated and pushed to the device as flux. With verification on
//! the track is read straight back, decoded and compared sector by sector;
//! mismatches are rewritten up to `retries` times.

pub mod precomp;

use crate::disk::{Disk, Track, TrackStatus};
use crate::error::{FloppyError, Result};
use crate::flux::FluxStream;
use crate::hw::{Capabilities, Density, FluxDevice};
use crate::image::track_bits;
use crate::profile::{cell_ns_for, PlatformProfile};
use crate::recovery::{decode_flux, stop_motor, RecoveryConfig};
use crate::session::progress::{Outcome, Progress};
use crate::track::driver_for_track;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use precomp::{precompensate, PrecompConfig};

/// Tuning for writes
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConfig {
    /// Read every track back and compare it
    pub verify: bool,
    /// Rewrites allowed after a failed compare
    pub retries: u8,
    /// Revolutions captured when verifying
    pub revolutions: u8,
    /// Precompensation; `None` picks the encoding's defaults
    pub precomp: Option<PrecompConfig>,
    /// Decoder settings for the read-back
    pub recovery: RecoveryConfig,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            verify: true,
            retries: 3,
            revolutions: 2,
            precomp: None,
            recovery: RecoveryConfig::default(),
        }
    }
}

/// A track that never verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFailure {
    pub cylinder: u8,
    pub head: u8,
    /// Sector ids that were missing or differed on the last read-back
    pub sectors: Vec<u8>,
    /// Writes attempted, zero for a verify-only pass
    pub attempts: u8,
}

/// Result of a write or verify pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Tracks written, or read for a verify pass
    pub tracks: usize,
    /// Tracks whose read-back matched
    pub verified: usize,
    pub failures: Vec<TrackFailure>,
    pub outcome: Outcome,
}

impl Report {
    fn new() -> Self {
        Self {
            tracks: 0,
            verified: 0,
            failures: Vec::new(),
            outcome: Outcome::Success,
        }
    }

    /// True when nothing failed to verify
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn physical_cylinder(cylinder: u8, profile: Option<&PlatformProfile>) -> u8 {
    match profile {
        Some(p) if p.double_step => cylinder.saturating_mul(2),
        _ => cylinder,
    }
}

/// Flux to write for one track, or `None` for a track with nothing on it.
///
/// An unmodified track with a capture attached is written from its first
/// captured revolution as is; anything else is laid out from its sectors.
pub fn track_flux(
    disk: &Disk,
    track: &Track,
    profile: Option<&PlatformProfile>,
    precomp: Option<&PrecompConfig>,
) -> Result<Option<FluxStream>> {
    if track.status != TrackStatus::Modified {
        if let Some(flux) = track.flux.and_then(|h| disk.flux(h)) {
            return Ok(Some(flux.revolution_stream(0).unwrap_or_else(|| flux.clone())));
        }
    }
    if track.is_empty() && track.bitstream.is_none() {
        return Ok(None);
    }
    let driver = driver_for_track(track, disk.encoding, profile)?;
    let cell = cell_ns_for(driver.encoding(), track.cylinder, profile);
    let bits = track_bits(track, driver, cell)?;
    let config = precomp
        .copied()
        .unwrap_or_else(|| PrecompConfig::for_encoding(driver.encoding(), cell));
    let physical = physical_cylinder(track.cylinder, profile);
    Ok(Some(precompensate(&bits, physical, &config)))
}

/// Sector ids of `expected` that `actual` lacks or holds different bytes
/// for. Sectors that were already bad in `expected` are not compared.
pub fn compare_track(expected: &Track, actual: &Track) -> Vec<u8> {
    expected
        .sectors()
        .iter()
        .filter(|s| !s.has_error())
        .filter(|s| {
            !actual
                .sectors()
                .iter()
                .any(|a| a.id == s.id && !a.has_error() && a.data() == s.data())
        })
        .map(|s| s.id.sector)
        .collect()
}

fn position(
    device: &mut dyn FluxDevice,
    track: &Track,
    encoding: crate::encoding::Encoding,
    profile: Option<&PlatformProfile>,
) -> Result<()> {
    device.seek(physical_cylinder(track.cylinder, profile))?;
    device.select_head(track.head)?;
    if device.capabilities().has(Capabilities::DENSITY) {
        let cell = cell_ns_for(encoding, track.cylinder, profile);
        device.select_density(Density::for_cell_ns(cell))?;
    }
    Ok(())
}

fn read_back(
    device: &mut dyn FluxDevice,
    expected: &Track,
    profile: Option<&PlatformProfile>,
    config: &WriteConfig,
) -> Result<Vec<u8>> {
    let flux = device.read_flux(config.revolutions)?;
    let actual = decode_flux(&flux, expected.cylinder, expected.head, profile, &config.recovery);
    Ok(compare_track(expected, &actual))
}

/// Report a track to the host with the status the pass gave it
fn report_track(progress: &mut Progress, track: &Track, ok: bool) {
    let mut shown = track.clone();
    shown.status = if ok { TrackStatus::Ok } else { TrackStatus::Bad };
    progress.track(&shown);
}

/// Deliver the completion event for a finished pass
fn finish(device: &mut dyn FluxDevice, progress: &mut Progress, result: Result<Report>) -> Result<Report> {
    stop_motor(device);
    match &result {
        Ok(report) => progress.complete(report.outcome),
        Err(FloppyError::Cancelled) => progress.complete(Outcome::Cancelled),
        Err(e) => {
            progress.log(log::Level::Error, e.to_string());
            progress.complete(Outcome::Failed);
        }
    }
    result
}

/// Write every track of `disk` to the device.
///
/// Fails with `Unsupported` when the device cannot write flux and with
/// `Permission` when the disk in the drive is write protected.
pub fn write_disk(
    device: &mut dyn FluxDevice,
    disk: &Disk,
    profile: Option<&PlatformProfile>,
    config: &WriteConfig,
    progress: &mut Progress,
) -> Result<Report> {
    let result = write_tracks(device, disk, profile, config, progress);
    finish(device, progress, result)
}

fn write_tracks(
    device: &mut dyn FluxDevice,
    disk: &Disk,
    profile: Option<&PlatformProfile>,
    config: &WriteConfig,
    progress: &mut Progress,
) -> Result<Report> {
    let cancel = progress.cancel_token().clone();
    if !device.capabilities().has(Capabilities::WRITE_FLUX) {
        return Err(FloppyError::unsupported(format!("{} cannot write flux", device.backend())));
    }
    if device.status()?.write_protected {
        return Err(FloppyError::Permission("disk is write protected".into()));
    }
    info!(
        "writing {} tracks to {} (verify {})",
        disk.track_count(),
        device.info().name,
        config.verify
    );
    device.motor(true)?;
    let mut report = Report::new();
    for track in disk.tracks() {
        cancel.check()?;
        let Some(flux) = track_flux(disk, track, profile, config.precomp.as_ref())? else {
            debug!("c{} h{}: nothing to write", track.cylinder, track.head);
            continue;
        };
        let encoding = driver_for_track(track, disk.encoding, profile)
            .map(|d| d.encoding())
            .unwrap_or(disk.encoding);
        position(device, track, encoding, profile)?;

        let mut attempts = 0u8;
        let mut mismatched = Vec::new();
        loop {
            attempts += 1;
            device.write_flux(&flux)?;
            if !config.verify {
                break;
            }
            cancel.check()?;
            mismatched = read_back(device, track, profile, config)?;
            if mismatched.is_empty() || attempts > config.retries {
                break;
            }
            warn!(
                "c{} h{}: sectors {:?} did not verify, rewriting ({} of {})",
                track.cylinder, track.head, mismatched, attempts, config.retries
            );
        }
        report.tracks += 1;
        let ok = mismatched.is_empty();
        if config.verify && ok {
            report.verified += 1;
        }
        if !ok {
            report.failures.push(TrackFailure {
                cylinder: track.cylinder,
                head: track.head,
                sectors: mismatched,
                attempts,
            });
        }
        report_track(progress, track, ok);
    }
    report.outcome = if report.is_clean() { Outcome::Success } else { Outcome::Warnings };
    info!("write finished: {} tracks, {} failed", report.tracks, report.failures.len());
    Ok(report)
}

/// Read every track of `disk` from the device and compare the sectors
/// without writing anything
pub fn verify_disk(
    device: &mut dyn FluxDevice,
    disk: &Disk,
    profile: Option<&PlatformProfile>,
    config: &WriteConfig,
    progress: &mut Progress,
) -> Result<Report> {
    let result = verify_tracks(device, disk, profile, config, progress);
    finish(device, progress, result)
}

fn verify_tracks(
    device: &mut dyn FluxDevice,
    disk: &Disk,
    profile: Option<&PlatformProfile>,
    config: &WriteConfig,
    progress: &mut Progress,
) -> Result<Report> {
    let cancel = progress.cancel_token().clone();
    device.motor(true)?;
    let mut report = Report::new();
    for track in disk.tracks().filter(|t| !t.is_empty()) {
        cancel.check()?;
        let encoding = driver_for_track(track, disk.encoding, profile)
            .map(|d| d.encoding())
            .unwrap_or(disk.encoding);
        position(device, track, encoding, profile)?;
        let mismatched = read_back(device, track, profile, config)?;
        report.tracks += 1;
        let ok = mismatched.is_empty();
        if ok {
            report.verified += 1;
        } else {
            report.failures.push(TrackFailure {
                cylinder: track.cylinder,
                head: track.head,
                sectors: mismatched,
                attempts: 0,
            });
        }
        report_track(progress, track, ok);
    }
    report.outcome = if report.is_clean() { Outcome::Success } else { Outcome::Warnings };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Geometry;
    use crate::error::ErrorKind;
    use crate::hw::mock::MockDevice;
    use crate::profile::profile;
    use crate::recovery::read_disk;
    use crate::session::cancel::CancelToken;
    use crate::session::progress::{ProgressEvent, ProgressQueue};

    fn source() -> (Disk, &'static PlatformProfile) {
        let p = profile("pc-720k").unwrap();
        let mut disk = Disk::builder()
            .profile(p)
            .geometry(Geometry::new(2, 2, 9, 512))
            .build()
            .unwrap();
        disk.write_sector(1, 1, 5, &[0xC3; 512]).unwrap();
        (disk, p)
    }

    fn blank_drive(p: &'static PlatformProfile) -> MockDevice {
        MockDevice::new(Disk::new(Geometry::new(2, 2, 0, 512))).with_profile(Some(p))
    }

    #[test]
    fn test_write_then_read_back() {
        let (disk, p) = source();
        let mut dev = blank_drive(p);
        let queue = ProgressQueue::new();
        let mut progress = Progress::with_queue(queue.clone(), CancelToken::new());
        let report = write_disk(&mut dev, &disk, Some(p), &WriteConfig::default(), &mut progress).unwrap();
        assert_eq!(report.tracks, 4);
        assert_eq!(report.verified, 4);
        assert_eq!(report.outcome, Outcome::Success);
        assert!(dev.written(1, 1).is_some());
        let events = queue.drain();
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { outcome: Outcome::Success, .. })));

        let mut copy = Disk::builder().profile(p).geometry(Geometry::new(2, 2, 9, 512)).build().unwrap();
        let mut progress = Progress::silent(CancelToken::new());
        read_disk(&mut dev, &mut copy, Some(p), &RecoveryConfig::for_profile(p), &mut progress).unwrap();
        assert_eq!(copy.read_sector(1, 1, 5).unwrap(), &[0xC3; 512][..]);
    }

    #[test]
    fn test_verify_failure_rewrites() {
        let (disk, p) = source();
        let mut dev = blank_drive(p);
        dev.inject_fault(0, 1, 2);
        let mut progress = Progress::silent(CancelToken::new());
        let report = write_disk(&mut dev, &disk, Some(p), &WriteConfig::default(), &mut progress).unwrap();
        assert!(report.is_clean());

        let mut dev = blank_drive(p);
        dev.inject_fault(0, 1, 10);
        let config = WriteConfig {
            retries: 1,
            ..WriteConfig::default()
        };
        let mut progress = Progress::silent(CancelToken::new());
        let report = write_disk(&mut dev, &disk, Some(p), &config, &mut progress).unwrap();
        assert_eq!(report.outcome, Outcome::Warnings);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 2);
        assert_eq!(report.failures[0].sectors.len(), 9);
    }

    #[test]
    fn test_write_protected_refused() {
        let (disk, p) = source();
        let mut dev = blank_drive(p);
        dev.set_write_protected(true);
        let queue = ProgressQueue::new();
        let mut progress = Progress::with_queue(queue.clone(), CancelToken::new());
        let err = write_disk(&mut dev, &disk, Some(p), &WriteConfig::default(), &mut progress).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(dev.written(0, 0).is_none());
        assert!(matches!(queue.drain().last(), Some(ProgressEvent::Complete { outcome: Outcome::Failed, .. })));
    }

    #[test]
    fn test_cancelled_write_stops() {
        let (disk, p) = source();
        let mut dev = blank_drive(p);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut progress = Progress::silent(cancel);
        let err = write_disk(&mut dev, &disk, Some(p), &WriteConfig::default(), &mut progress).unwrap_err();
        assert!(matches!(err, FloppyError::Cancelled));
        assert!(dev.written(0, 0).is_none());
        assert!(!dev.status().unwrap().motor_on);
    }

    #[test]
    fn test_verify_only_pass() {
        let (disk, p) = source();
        let mut dev = MockDevice::new(disk.clone()).with_profile(Some(p));
        let mut progress = Progress::silent(CancelToken::new());
        let report = verify_disk(&mut dev, &disk, Some(p), &WriteConfig::default(), &mut progress).unwrap();
        assert_eq!(report.verified, 4);

        let mut changed = disk.clone();
        changed.write_sector(0, 0, 2, &[0x11; 512]).unwrap();
        let mut progress = Progress::silent(CancelToken::new());
        let report = verify_disk(&mut dev, &changed, Some(p), &WriteConfig::default(), &mut progress).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].sectors, vec![2]);
    }

    #[test]
    fn test_compare_ignores_bad_source_sectors() {
        let (disk, _) = source();
        let mut expected = disk.track(0, 0).unwrap().clone();
        let actual = Track::new(0, 0);
        assert_eq!(compare_track(&expected, &actual).len(), 9);
        for s in expected.sectors_mut() {
            s.data_crc_ok = false;
        }
        assert!(compare_track(&expected, &actual).is_empty());
    }
}
