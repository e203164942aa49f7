//! Whole-disk analysis
//!
//! Summarises what was decoded on every track, which filesystem and boot
//! system the disk carries, and whether its layout looks like a known copy
//! protection. Works on any [`Disk`], read from hardware or from an image.

use crate::boot::BootDetection;
use crate::disk::{Disk, Track, TrackStatus};
use crate::encoding::Encoding;
use crate::fs;
use crate::profile::Platform;
use log::debug;
use serde::Serialize;
use std::collections::HashMap;

/// What was found on one track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAnalysis {
    pub cylinder: u8,
    pub head: u8,
    pub encoding: Encoding,
    pub status: TrackStatus,
    /// Distinct sector ids decoded
    pub sectors: usize,
    /// Sectors whose header or data checksum failed
    pub crc_errors: usize,
    /// Sectors carrying weak-bit evidence
    pub weak_sectors: usize,
    /// Decoder confidence, 0-100
    pub confidence: u8,
}

/// A recognised copy protection scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectionResult {
    /// Name of the detected protection scheme
    pub name: String,
    /// Description of why this protection was detected
    pub reason: String,
}

impl ProtectionResult {
    fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ProtectionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.reason)
    }
}

/// Everything [`analyze`] found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub platform: Platform,
    /// Encoding found on most tracks
    pub encoding: Encoding,
    pub cylinders: u8,
    pub heads: u8,
    /// Sectors per track when every formatted track agrees
    pub sectors_per_track: Option<usize>,
    pub tracks: Vec<TrackAnalysis>,
    pub empty_tracks: usize,
    pub bad_tracks: usize,
    pub crc_errors: usize,
    pub weak_sectors: usize,
    /// Filesystem driver that recognised the disk, with its score
    pub filesystem: Option<(String, u8)>,
    /// Filesystem's own name for its variant (e.g. "OFS", "FAT12")
    pub filesystem_type: Option<String>,
    pub boot: BootDetection,
    pub protection: Option<ProtectionResult>,
    /// Mean decoder confidence over tracks with data, 0-100
    pub confidence: u8,
}

impl AnalysisReport {
    /// True when nothing decodable was found at all
    pub fn is_blank(&self) -> bool {
        self.tracks
            .iter()
            .all(|t| matches!(t.status, TrackStatus::Empty | TrackStatus::Unknown))
    }
}

fn track_confidence(track: &Track) -> u8 {
    if track.driver.is_some() {
        return track.confidence;
    }
    // sector containers carry no decoder evidence; score by checksums
    let total = track.sector_count();
    if total == 0 {
        return 0;
    }
    (track.good_sectors() * 100 / total) as u8
}

fn analyse_track(track: &Track) -> TrackAnalysis {
    let sectors = track.sectors();
    TrackAnalysis {
        cylinder: track.cylinder,
        head: track.head,
        encoding: track.encoding,
        status: track.status,
        sectors: track.sectors_by_id().len(),
        crc_errors: sectors.iter().filter(|s| !s.header_crc_ok || !s.data_crc_ok).count(),
        weak_sectors: sectors.iter().filter(|s| s.weak || s.weak_mask.is_some()).count(),
        confidence: track_confidence(track),
    }
}

/// Analyse a disk
pub fn analyze(disk: &Disk) -> AnalysisReport {
    let tracks: Vec<TrackAnalysis> = disk.tracks().map(analyse_track).collect();
    let with_data: Vec<&TrackAnalysis> = tracks.iter().filter(|t| t.sectors > 0).collect();

    let mut votes: HashMap<Encoding, usize> = HashMap::new();
    for t in &with_data {
        *votes.entry(t.encoding).or_default() += 1;
    }
    let encoding = votes
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.name().cmp(a.0.name())))
        .map(|(e, _)| e)
        .filter(|&e| e != Encoding::Unknown)
        .unwrap_or(disk.encoding);

    let mut counts = with_data.iter().map(|t| t.sectors);
    let sectors_per_track = counts.next().filter(|&first| counts.all(|n| n == first));

    let confidence = if with_data.is_empty() {
        0
    } else {
        (with_data.iter().map(|t| t.confidence as usize).sum::<usize>() / with_data.len()) as u8
    };

    let filesystem = fs::detect(disk);
    let filesystem_type = filesystem
        .and_then(|(d, _)| d.mount(disk).ok())
        .map(|v| v.stat_fs().fs_type);

    let report = AnalysisReport {
        platform: disk.platform,
        encoding,
        cylinders: disk.cylinder_count(),
        heads: disk.head_count(),
        sectors_per_track,
        empty_tracks: tracks.iter().filter(|t| t.status == TrackStatus::Empty).count(),
        bad_tracks: tracks.iter().filter(|t| t.status == TrackStatus::Bad).count(),
        crc_errors: tracks.iter().map(|t| t.crc_errors).sum(),
        weak_sectors: tracks.iter().map(|t| t.weak_sectors).sum(),
        filesystem: filesystem.map(|(d, score)| (d.name().to_string(), score)),
        filesystem_type,
        boot: BootDetection::detect(disk),
        protection: detect_protection(disk),
        confidence,
        tracks,
    };
    debug!(
        "analysis: {} tracks, {} encoding, filesystem {:?}, confidence {}",
        report.tracks.len(),
        report.encoding.name(),
        report.filesystem,
        report.confidence
    );
    report
}

/// Find a byte pattern in a buffer, returning the offset if found
fn find_pattern(data: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || data.len() < pattern.len() {
        return None;
    }
    data.windows(pattern.len()).position(|window| window == pattern)
}

/// Signatures that protection loaders leave in their sectors
const SIGNATURES: &[(&str, &[u8])] = &[
    ("Alkatraz +3", b"THE ALKATRAZ PROTECTION SYSTEM"),
    ("Speedlock", b"SPEEDLOCK"),
    ("Paul Owens", b"PAUL OWENS"),
    ("Mean Protection System", b"MEAN PROTECTION SYSTEM"),
    ("Amsoft", b"Amsoft disc protection system"),
    ("Rob Northen CopyLock", b"Rob Northen Comp"),
    ("Remi Herbulot", b"PROTECTION      Remi HERBULOT"),
    ("DiscLoc", b"DISCLOC"),
];

/// Whether every formatted track has the same sector count and size
fn is_uniform(disk: &Disk) -> bool {
    let mut shape = None;
    for track in disk.tracks().filter(|t| !t.is_empty()) {
        let this = (track.sector_count(), track.uniform_sector_size());
        if this.1.is_none() {
            return false;
        }
        match shape {
            None => shape = Some(this),
            Some(s) if s != this => return false,
            _ => {}
        }
    }
    true
}

fn has_errors(disk: &Disk) -> bool {
    disk.tracks().any(|t| t.sectors().iter().any(|s| s.has_error()))
}

/// Detect copy protection from sector signatures and layout anomalies.
///
/// Returns `None` for a uniform disk without errors.
pub fn detect_protection(disk: &Disk) -> Option<ProtectionResult> {
    if disk.track_count() < 2 {
        return None;
    }
    let uniform = is_uniform(disk);
    let errors = has_errors(disk);
    let weak = disk.tracks().any(|t| t.sectors().iter().any(|s| s.weak || s.weak_mask.is_some()));
    if uniform && !errors && !weak {
        return None;
    }

    for track in disk.tracks().filter(|t| t.cylinder < 3) {
        for sector in track.sectors() {
            for (name, sig) in SIGNATURES {
                if let Some(offset) = find_pattern(sector.data(), sig) {
                    return Some(ProtectionResult::new(
                        *name,
                        format!("signed at T{}/S{} +{}", track.cylinder, sector.id.sector, offset),
                    ));
                }
            }
        }
    }

    for track in disk.tracks() {
        if let Some(s) = track.sectors().iter().find(|s| s.weak || s.weak_mask.is_some()) {
            return Some(ProtectionResult::new(
                "Weak sector",
                format!("unstable bits in T{}.{} S{}", track.cylinder, track.head, s.id.sector),
            ));
        }
        if let Some(s) = track.sectors().iter().find(|s| s.id.size_code >= 6) {
            return Some(ProtectionResult::new(
                "Oversized sector",
                format!("size code {} on T{}.{}", s.id.size_code, track.cylinder, track.head),
            ));
        }
        if let Some(s) = track
            .sectors()
            .iter()
            .find(|s| s.id.cylinder != track.cylinder && !track.is_empty())
        {
            return Some(ProtectionResult::new(
                "Cylinder mismatch",
                format!("T{} carries sector headers for cylinder {}", track.cylinder, s.id.cylinder),
            ));
        }
    }

    if !uniform && errors {
        return Some(ProtectionResult::new(
            "Unknown copy protection",
            "non-uniform layout with deliberate errors",
        ));
    }
    None
}

/// Mark tracks the protection check singles out as `protected`
pub fn mark_protected(disk: &mut Disk) -> bool {
    let Some(found) = detect_protection(disk) else {
        return false;
    };
    debug!("protection: {}", found);
    let mut marked = false;
    for track in disk.tracks_mut() {
        let odd = track
            .sectors()
            .iter()
            .any(|s| s.weak || s.weak_mask.is_some() || s.id.size_code >= 6 || s.id.cylinder != track.cylinder);
        if odd && matches!(track.status, TrackStatus::Bad | TrackStatus::Weak | TrackStatus::Warning) {
            track.status = TrackStatus::Protected;
            marked = true;
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Geometry, Sector, SectorId};
    use crate::profile::profile;

    #[test]
    fn test_find_pattern() {
        let data = b"Hello SPEEDLOCK PROTECTION SYSTEM world";
        assert_eq!(find_pattern(data, b"SPEEDLOCK"), Some(6));
        assert!(find_pattern(data, b"NOTFOUND").is_none());
        assert!(find_pattern(b"", b"X").is_none());
    }

    #[test]
    fn test_formatted_pc_disk() {
        let disk = Disk::builder().profile(profile("pc-720k").unwrap()).build().unwrap();
        let report = analyze(&disk);
        assert_eq!(report.encoding, Encoding::Mfm);
        assert_eq!(report.sectors_per_track, Some(9));
        assert_eq!(report.tracks.len(), 160);
        assert_eq!(report.crc_errors, 0);
        assert_eq!(report.confidence, 100);
        assert!(report.protection.is_none());
        assert!(!report.is_blank());
    }

    #[test]
    fn test_blank_disk() {
        let mut disk = Disk::new(Geometry::new(2, 1, 0, 512));
        disk.set_track(Track::new(0, 0));
        disk.set_track(Track::new(1, 0));
        for t in disk.tracks_mut() {
            t.classify(0);
        }
        let report = analyze(&disk);
        assert!(report.is_blank());
        assert_eq!(report.empty_tracks, 2);
        assert!(report.filesystem.is_none());
        assert_eq!(report.confidence, 0);
        assert_eq!(report.sectors_per_track, None);
    }

    #[test]
    fn test_signature_found() {
        let mut disk = Disk::builder()
            .profile(profile("spectrum-plus3").unwrap())
            .geometry(Geometry::new(3, 1, 9, 512))
            .build()
            .unwrap();
        let mut data = vec![0u8; 512];
        data[40..49].copy_from_slice(b"SPEEDLOCK");
        disk.write_sector(0, 0, 1, &data).unwrap();
        let mut odd = disk.track(2, 0).unwrap().clone();
        odd.add_sector(Sector::with_data(SectorId::new(2, 0, 0xF0, 1), vec![0; 256]));
        disk.set_track(odd);
        let found = detect_protection(&disk).unwrap();
        assert_eq!(found.name, "Speedlock");
        assert!(found.reason.contains("T0/S1"));
    }

    #[test]
    fn test_weak_track_marked() {
        let mut disk = Disk::builder()
            .profile(profile("pc-720k").unwrap())
            .geometry(Geometry::new(2, 2, 9, 512))
            .build()
            .unwrap();
        let mut track = disk.track(1, 0).unwrap().clone();
        for s in track.sectors_mut().iter_mut().filter(|s| s.id.sector == 3) {
            s.data_crc_ok = false;
            s.weak = true;
        }
        track.classify(9);
        disk.set_track(track);
        let report = analyze(&disk);
        assert_eq!(report.weak_sectors, 1);
        assert_eq!(report.protection.as_ref().unwrap().name, "Weak sector");
        assert!(mark_protected(&mut disk));
        assert_eq!(disk.track(1, 0).unwrap().status, TrackStatus::Protected);
    }
}
