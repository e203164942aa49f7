//! Sector data structures

use crate::disk::geometry::size_code_to_bytes;
use crate::encoding::Encoding;
use crate::fdc::{FdcStatus1, FdcStatus2};

/// Sector ID (CHRN) - addressing information as recorded in the sector header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorId {
    /// C - Cylinder number recorded in the header
    pub cylinder: u8,
    /// H - Head number recorded in the header
    pub head: u8,
    /// R - Sector ID/Record number
    pub sector: u8,
    /// N - Size code (0=128, 1=256, 2=512, 3=1024, 4=2048, etc.)
    pub size_code: u8,
}

impl SectorId {
    /// Create a new sector ID
    pub fn new(cylinder: u8, head: u8, sector: u8, size_code: u8) -> Self {
        Self {
            cylinder,
            head,
            sector,
            size_code,
        }
    }

    /// Get the advertised sector size in bytes based on size code
    pub fn size_bytes(&self) -> usize {
        size_code_to_bytes(self.size_code)
    }
}

/// Ranking used when several reads of the same sector disagree.
///
/// Ordered so that a larger value is always preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectorQuality {
    /// Data failed its checksum and no weak bits explain it
    Bad,
    /// Data failed its checksum but carries weak-bit evidence
    Weak,
    /// Header and data checksums both passed
    Good,
}

impl std::fmt::Display for SectorQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SectorQuality::Bad => write!(f, "Bad"),
            SectorQuality::Weak => write!(f, "Weak"),
            SectorQuality::Good => write!(f, "Good"),
        }
    }
}

/// Sector status classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorStatus {
    /// Unformatted - data size is 0
    Unformatted,
    /// Formatted but contains only the track filler byte
    FormattedFiller,
    /// Formatted but contains only a single repeated byte (not the filler)
    FormattedOddFiller,
    /// Formatted and contains data (in use)
    FormattedInUse,
}

impl std::fmt::Display for SectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SectorStatus::Unformatted => write!(f, "Unformatted"),
            SectorStatus::FormattedFiller => write!(f, "Filler"),
            SectorStatus::FormattedOddFiller => write!(f, "Odd Filler"),
            SectorStatus::FormattedInUse => write!(f, "In Use"),
        }
    }
}

/// A decoded sector: addressing, payload and integrity evidence
#[derive(Debug, Clone, PartialEq)]
pub struct Sector {
    /// Sector addressing information (CHRN)
    pub id: SectorId,
    /// Header checksum passed
    pub header_crc_ok: bool,
    /// Data checksum passed
    pub data_crc_ok: bool,
    /// Written with a deleted-data address mark
    pub deleted: bool,
    /// Weak bits were observed inside the payload
    pub weak: bool,
    /// Confidence (0-100) of the track driver that produced this sector
    pub confidence: u8,
    /// Encoding the sector was recovered from
    pub encoding: Encoding,
    /// Bit offset of the header inside the source bitstream, if decoded from one
    pub bit_offset: Option<usize>,
    /// Bits that differed between reads (set bit = unstable)
    pub weak_mask: Option<Vec<u8>>,
    /// Out-of-band tag bytes (Macintosh GCR tags, Amiga label area)
    pub tags: Vec<u8>,
    /// Every distinct copy seen of an unstable sector, payload first
    pub variants: Vec<Vec<u8>>,
    /// FDC Status Register 1 as stored by controller-level images
    pub fdc_status1: FdcStatus1,
    /// FDC Status Register 2 as stored by controller-level images
    pub fdc_status2: FdcStatus2,
    data: Vec<u8>,
}

impl Sector {
    /// Create a new sector filled with the CP/M filler byte
    pub fn new(id: SectorId) -> Self {
        let size = id.size_bytes();
        Self::with_data(id, vec![0xE5; size])
    }

    /// Create a new sector with specific data and passing checksums
    pub fn with_data(id: SectorId, data: Vec<u8>) -> Self {
        Self {
            id,
            header_crc_ok: true,
            data_crc_ok: true,
            deleted: false,
            weak: false,
            confidence: 100,
            encoding: Encoding::Unknown,
            bit_offset: None,
            weak_mask: None,
            tags: Vec::new(),
            variants: Vec::new(),
            fdc_status1: FdcStatus1::new(0),
            fdc_status2: FdcStatus2::new(0),
            data,
        }
    }

    /// Create a sector from controller status registers
    pub fn with_status(
        id: SectorId,
        fdc_status1: FdcStatus1,
        fdc_status2: FdcStatus2,
        data: Vec<u8>,
    ) -> Self {
        let mut sector = Self::with_data(id, data);
        sector.fdc_status1 = fdc_status1;
        sector.fdc_status2 = fdc_status2;
        sector.data_crc_ok = !fdc_status2.data_field_error();
        sector.header_crc_ok = !(fdc_status1.data_error() && !fdc_status2.data_field_error());
        sector.deleted = fdc_status2.is_deleted();
        sector
    }

    /// Get a reference to the sector data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get a mutable reference to the sector data
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Set the sector data
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Check if this sector has any integrity problem
    pub fn has_error(&self) -> bool {
        !self.header_crc_ok
            || !self.data_crc_ok
            || self.fdc_status1.has_error()
            || self.fdc_status2.has_error()
    }

    /// Check if this sector is marked as deleted data
    pub fn is_deleted(&self) -> bool {
        self.deleted || self.fdc_status2.is_deleted()
    }

    /// Quality rank used when merging reads
    pub fn quality(&self) -> SectorQuality {
        if self.header_crc_ok && self.data_crc_ok {
            SectorQuality::Good
        } else if self.weak || self.weak_mask.is_some() {
            SectorQuality::Weak
        } else {
            SectorQuality::Bad
        }
    }

    /// Get the advertised size from the size code
    pub fn advertised_size(&self) -> usize {
        self.id.size_bytes()
    }

    /// Get the actual data size
    pub fn actual_size(&self) -> usize {
        self.data.len()
    }

    /// Check if the actual size matches the advertised size
    pub fn has_size_mismatch(&self) -> bool {
        self.actual_size() != self.advertised_size()
    }

    /// Analyze the sector status based on data content
    pub fn status(&self, filler_byte: u8) -> SectorStatus {
        let Some(&first_byte) = self.data.first() else {
            return SectorStatus::Unformatted;
        };

        if self.data.iter().all(|&b| b == first_byte) {
            if first_byte == filler_byte {
                SectorStatus::FormattedFiller
            } else {
                SectorStatus::FormattedOddFiller
            }
        } else {
            SectorStatus::FormattedInUse
        }
    }

    /// Fill the sector with a specific byte value
    pub fn fill(&mut self, byte: u8) {
        self.data.fill(byte);
    }

    /// Resize the sector data
    pub fn resize(&mut self, new_size: usize, fill_byte: u8) {
        self.data.resize(new_size, fill_byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_id_size() {
        let id = SectorId::new(0, 0, 0xC1, 2);
        assert_eq!(id.size_bytes(), 512);

        let id2 = SectorId::new(0, 0, 1, 3);
        assert_eq!(id2.size_bytes(), 1024);
    }

    #[test]
    fn test_new_sector() {
        let sector = Sector::new(SectorId::new(0, 0, 0xC1, 2));

        assert_eq!(sector.data().len(), 512);
        assert!(!sector.has_size_mismatch());
        assert!(!sector.has_error());
        assert_eq!(sector.quality(), SectorQuality::Good);
    }

    #[test]
    fn test_quality_ordering() {
        assert!(SectorQuality::Good > SectorQuality::Weak);
        assert!(SectorQuality::Weak > SectorQuality::Bad);

        let mut sector = Sector::new(SectorId::new(0, 0, 1, 2));
        sector.data_crc_ok = false;
        assert_eq!(sector.quality(), SectorQuality::Bad);
        sector.weak = true;
        assert_eq!(sector.quality(), SectorQuality::Weak);
    }

    #[test]
    fn test_sector_status() {
        let sector = Sector::new(SectorId::new(0, 0, 1, 2));
        assert_eq!(sector.status(0xE5), SectorStatus::FormattedFiller);

        let sector = Sector::with_data(SectorId::new(0, 0, 1, 2), vec![0xFF; 512]);
        assert_eq!(sector.status(0xE5), SectorStatus::FormattedOddFiller);

        let sector = Sector::with_data(SectorId::new(0, 0, 1, 2), vec![0, 1, 2, 3]);
        assert_eq!(sector.status(0xE5), SectorStatus::FormattedInUse);

        let sector = Sector::with_data(SectorId::new(0, 0, 1, 2), Vec::new());
        assert_eq!(sector.status(0xE5), SectorStatus::Unformatted);
    }

    #[test]
    fn test_status_registers_map_to_crc_flags() {
        let sector = Sector::with_status(
            SectorId::new(0, 0, 1, 2),
            FdcStatus1::new(FdcStatus1::DE),
            FdcStatus2::new(FdcStatus2::DD | FdcStatus2::CM),
            vec![0; 512],
        );
        assert!(!sector.data_crc_ok);
        assert!(sector.header_crc_ok);
        assert!(sector.is_deleted());

        let sector = Sector::with_status(
            SectorId::new(0, 0, 1, 2),
            FdcStatus1::new(FdcStatus1::DE),
            FdcStatus2::new(0),
            vec![0; 512],
        );
        assert!(!sector.header_crc_ok);
    }

    #[test]
    fn test_sector_resize() {
        let mut sector = Sector::new(SectorId::new(0, 0, 1, 2));
        sector.resize(128, 0x00);
        assert_eq!(sector.actual_size(), 128);
        assert!(sector.has_size_mismatch());
    }
}
