//! Track data structures

use crate::disk::sector::Sector;
use crate::disk::FluxHandle;
use crate::encoding::Encoding;
use crate::pll::Bitstream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Recording mode stored by controller-level images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    /// Unknown recording mode
    Unknown,
    /// FM (Frequency Modulation) - single density
    FM,
    /// MFM (Modified Frequency Modulation) - double density
    MFM,
}

impl From<u8> for RecordingMode {
    fn from(value: u8) -> Self {
        match value {
            1 => RecordingMode::FM,
            2 => RecordingMode::MFM,
            _ => RecordingMode::Unknown,
        }
    }
}

impl From<RecordingMode> for u8 {
    fn from(mode: RecordingMode) -> Self {
        match mode {
            RecordingMode::Unknown => 0,
            RecordingMode::FM => 1,
            RecordingMode::MFM => 2,
        }
    }
}

/// Data rate stored by controller-level images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    /// Unknown data rate
    Unknown,
    /// Single/Double Density
    SingleDouble,
    /// High Density
    High,
    /// Extended Density
    Extended,
}

impl From<u8> for DataRate {
    fn from(value: u8) -> Self {
        match value {
            1 => DataRate::SingleDouble,
            2 => DataRate::High,
            3 => DataRate::Extended,
            _ => DataRate::Unknown,
        }
    }
}

impl From<DataRate> for u8 {
    fn from(rate: DataRate) -> Self {
        match rate {
            DataRate::Unknown => 0,
            DataRate::SingleDouble => 1,
            DataRate::High => 2,
            DataRate::Extended => 3,
        }
    }
}

/// Outcome classification for a whole track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    /// Not read or not decodable
    Unknown,
    /// Every expected sector present with good checksums
    Ok,
    /// Decoded but with missing sectors
    Warning,
    /// At least one sector failed its checksum
    Bad,
    /// Weak bits explain the failing sectors
    Weak,
    /// Layout matches a known copy protection signature
    Protected,
    /// No recorded data found
    Empty,
    /// Changed since it was read
    Modified,
}

impl std::fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackStatus::Unknown => "unknown",
            TrackStatus::Ok => "ok",
            TrackStatus::Warning => "warning",
            TrackStatus::Bad => "bad",
            TrackStatus::Weak => "weak",
            TrackStatus::Protected => "protected",
            TrackStatus::Empty => "empty",
            TrackStatus::Modified => "modified",
        };
        write!(f, "{}", s)
    }
}

/// A disk track containing multiple sectors
#[derive(Debug, Clone)]
pub struct Track {
    /// Physical cylinder
    pub cylinder: u8,
    /// Physical head (0 or 1)
    pub head: u8,
    /// Track classification
    pub status: TrackStatus,
    /// Encoding the track was decoded with
    pub encoding: Encoding,
    /// Name of the track driver that produced the sectors
    pub driver: Option<&'static str>,
    /// Confidence (0-100) of that driver
    pub confidence: u8,
    /// GAP#3 length
    pub gap3_length: u8,
    /// Filler byte used for formatting
    pub filler_byte: u8,
    /// Data rate (controller-level images)
    pub data_rate: DataRate,
    /// Recording mode (controller-level images)
    pub recording_mode: RecordingMode,
    /// Bit-level copy of the track, when available
    pub bitstream: Option<Bitstream>,
    /// Flux capture stored in the owning disk
    pub flux: Option<FluxHandle>,
    /// Undecodable bytes preserved for analysis
    pub residual: Vec<u8>,
    sectors: Vec<Sector>,
    sector_map: HashMap<u8, usize>,
}

impl Track {
    /// Create a new track
    pub fn new(cylinder: u8, head: u8) -> Self {
        Self {
            cylinder,
            head,
            status: TrackStatus::Unknown,
            encoding: Encoding::Unknown,
            driver: None,
            confidence: 0,
            gap3_length: 0x4E,
            filler_byte: 0xE5,
            data_rate: DataRate::Unknown,
            recording_mode: RecordingMode::Unknown,
            bitstream: None,
            flux: None,
            residual: Vec::new(),
            sectors: Vec::new(),
            sector_map: HashMap::new(),
        }
    }

    /// Append a sector, keeping duplicates of the same id in physical order
    pub fn add_sector(&mut self, sector: Sector) {
        let index = self.sectors.len();
        self.sector_map.entry(sector.id.sector).or_insert(index);
        self.sectors.push(sector);
    }

    /// Insert a decoded sector keyed by its id.
    ///
    /// An existing sector with the same id is only replaced by one from a
    /// more confident decoder; on equal confidence a passing data checksum
    /// wins. Returns true when the new sector was kept.
    pub fn insert_sector(&mut self, sector: Sector) -> bool {
        match self.sector_map.get(&sector.id.sector) {
            Some(&index) => {
                let existing = &self.sectors[index];
                let better = sector.confidence > existing.confidence
                    || (sector.confidence == existing.confidence
                        && sector.data_crc_ok
                        && !existing.data_crc_ok);
                if better {
                    self.sectors[index] = sector;
                }
                better
            }
            None => {
                self.add_sector(sector);
                true
            }
        }
    }

    /// Replace a sector in place
    pub fn replace_sector(&mut self, index: usize, sector: Sector) {
        if let Some(slot) = self.sectors.get_mut(index) {
            *slot = sector;
        }
    }

    /// Get a reference to all sectors
    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    /// Get a mutable reference to all sectors
    pub fn sectors_mut(&mut self) -> &mut [Sector] {
        &mut self.sectors
    }

    /// Get a sector by its ID
    pub fn get_sector(&self, sector_id: u8) -> Option<&Sector> {
        self.sector_map
            .get(&sector_id)
            .and_then(|&idx| self.sectors.get(idx))
    }

    /// Get a mutable reference to a sector by its ID
    pub fn get_sector_mut(&mut self, sector_id: u8) -> Option<&mut Sector> {
        self.sector_map
            .get(&sector_id)
            .and_then(|&idx| self.sectors.get_mut(idx))
    }

    /// Position of a sector id in physical order
    pub fn sector_index(&self, sector_id: u8) -> Option<usize> {
        self.sector_map.get(&sector_id).copied()
    }

    /// Get the number of sectors in this track
    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    /// Check if this track has any sectors
    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// Number of sectors with both checksums passing
    pub fn good_sectors(&self) -> usize {
        self.sectors.iter().filter(|s| !s.has_error()).count()
    }

    /// Get the total data size of all sectors in bytes
    pub fn total_data_size(&self) -> usize {
        self.sectors.iter().map(|s| s.actual_size()).sum()
    }

    /// Get the sector size if all sectors are uniform, None otherwise
    pub fn uniform_sector_size(&self) -> Option<usize> {
        let first = self.sectors.first()?.advertised_size();
        self.sectors
            .iter()
            .all(|s| s.advertised_size() == first)
            .then_some(first)
    }

    /// Clear all sectors from this track
    pub fn clear(&mut self) {
        self.sectors.clear();
        self.sector_map.clear();
    }

    /// Get list of all sector IDs in physical order
    pub fn sector_ids(&self) -> Vec<u8> {
        self.sectors.iter().map(|s| s.id.sector).collect()
    }

    /// Check if this track contains a sector with the given ID
    pub fn has_sector(&self, sector_id: u8) -> bool {
        self.sector_map.contains_key(&sector_id)
    }

    /// Sectors sorted by id, first occurrence of duplicates only
    pub fn sectors_by_id(&self) -> Vec<&Sector> {
        let mut ids: Vec<u8> = self.sector_map.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.get_sector(id))
            .collect()
    }

    /// Classify the track from its sectors against an expected count
    pub fn classify(&mut self, expected_sectors: usize) {
        self.status = if self.sectors.is_empty() {
            if self.residual.is_empty() && self.bitstream.is_none() {
                TrackStatus::Empty
            } else {
                TrackStatus::Unknown
            }
        } else if self.sectors.iter().any(|s| !s.header_crc_ok || !s.data_crc_ok) {
            if self.sectors.iter().filter(|s| s.has_error()).all(|s| s.weak || s.weak_mask.is_some()) {
                TrackStatus::Weak
            } else {
                TrackStatus::Bad
            }
        } else if expected_sectors > 0 && self.sector_map.len() < expected_sectors {
            TrackStatus::Warning
        } else {
            TrackStatus::Ok
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::sector::SectorId;

    #[test]
    fn test_new_track() {
        let track = Track::new(0, 0);
        assert_eq!(track.cylinder, 0);
        assert_eq!(track.head, 0);
        assert_eq!(track.sector_count(), 0);
        assert!(track.is_empty());
        assert_eq!(track.status, TrackStatus::Unknown);
    }

    #[test]
    fn test_get_sector() {
        let mut track = Track::new(0, 0);
        for i in 0xC1..=0xC9 {
            track.add_sector(Sector::new(SectorId::new(0, 0, i, 2)));
        }

        assert_eq!(track.sector_count(), 9);
        assert_eq!(track.get_sector(0xC5).map(|s| s.id.sector), Some(0xC5));
        assert!(track.get_sector(0xFF).is_none());
        assert_eq!(track.uniform_sector_size(), Some(512));
    }

    #[test]
    fn test_insert_sector_prefers_confidence_then_crc() {
        let mut track = Track::new(0, 0);
        let mut weak = Sector::with_data(SectorId::new(0, 0, 1, 2), vec![1; 512]);
        weak.confidence = 60;
        weak.data_crc_ok = false;
        assert!(track.insert_sector(weak.clone()));

        let mut same = weak.clone();
        same.set_data(vec![2; 512]);
        assert!(!track.insert_sector(same));
        assert_eq!(track.get_sector(1).map(|s| s.data()[0]), Some(1));

        let mut passing = weak.clone();
        passing.data_crc_ok = true;
        passing.set_data(vec![3; 512]);
        assert!(track.insert_sector(passing));
        assert_eq!(track.get_sector(1).map(|s| s.data()[0]), Some(3));

        let mut less_confident = Sector::with_data(SectorId::new(0, 0, 1, 2), vec![4; 512]);
        less_confident.confidence = 10;
        assert!(!track.insert_sector(less_confident));
        assert_eq!(track.sector_count(), 1);
    }

    #[test]
    fn test_duplicate_ids_kept_in_physical_order() {
        let mut track = Track::new(0, 0);
        track.add_sector(Sector::with_data(SectorId::new(0, 0, 5, 1), vec![1; 256]));
        track.add_sector(Sector::with_data(SectorId::new(0, 0, 5, 1), vec![2; 256]));
        assert_eq!(track.sector_count(), 2);
        assert_eq!(track.get_sector(5).map(|s| s.data()[0]), Some(1));
        assert_eq!(track.sectors_by_id().len(), 1);
    }

    #[test]
    fn test_classify() {
        let mut track = Track::new(0, 0);
        track.classify(9);
        assert_eq!(track.status, TrackStatus::Empty);

        for i in 1..=8 {
            track.add_sector(Sector::new(SectorId::new(0, 0, i, 2)));
        }
        track.classify(9);
        assert_eq!(track.status, TrackStatus::Warning);

        track.add_sector(Sector::new(SectorId::new(0, 0, 9, 2)));
        track.classify(9);
        assert_eq!(track.status, TrackStatus::Ok);

        if let Some(s) = track.get_sector_mut(3) {
            s.data_crc_ok = false;
        }
        track.classify(9);
        assert_eq!(track.status, TrackStatus::Bad);
    }

    #[test]
    fn test_recording_mode_conversion() {
        assert_eq!(RecordingMode::from(1), RecordingMode::FM);
        assert_eq!(RecordingMode::from(99), RecordingMode::Unknown);
        assert_eq!(u8::from(RecordingMode::MFM), 2);
        assert_eq!(DataRate::from(2), DataRate::High);
        assert_eq!(u8::from(DataRate::Extended), 3);
    }
}
