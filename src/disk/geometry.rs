//! Disk geometry, size codes and logical block ordering

use crate::error::{FloppyError, Result};
use serde::{Deserialize, Serialize};

/// FDC sector size code to actual byte size mapping
pub const SECTOR_SIZES: [usize; 9] = [128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768];

/// Convert FDC size code to actual byte size
#[inline]
pub fn size_code_to_bytes(size_code: u8) -> usize {
    SECTOR_SIZES
        .get(size_code as usize)
        .copied()
        .unwrap_or(512)
}

/// Convert byte size to FDC size code
#[inline]
pub fn bytes_to_size_code(bytes: usize) -> Option<u8> {
    SECTOR_SIZES
        .iter()
        .position(|&s| s == bytes)
        .map(|p| p as u8)
}

/// Validate a sector size: a power of two between 128 and 8192 bytes
pub fn validate_sector_size(bytes: usize) -> Result<()> {
    if bytes.is_power_of_two() && (128..=8192).contains(&bytes) {
        Ok(())
    } else {
        Err(FloppyError::invalid_arg(format!(
            "sector size {} is not a power of two between 128 and 8192",
            bytes
        )))
    }
}

/// Side arrangement used when flattening a double-sided disk into blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideMode {
    /// Only head 0 is used
    SingleSide,
    /// Cylinder-major: C0H0, C0H1, C1H0, C1H1, ...
    Alternate,
    /// All of head 0, then all of head 1
    Successive,
}

/// Nominal physical shape of a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Number of cylinders
    pub cylinders: u8,
    /// Number of heads (1 or 2)
    pub heads: u8,
    /// Nominal sectors per track (0 when zoned or unknown)
    pub sectors_per_track: u8,
    /// Nominal sector size in bytes
    pub sector_size: u16,
    /// Lowest sector id on a track
    pub first_sector_id: u8,
    /// Nominal rotation speed
    pub rpm: u16,
}

impl Geometry {
    /// Create a geometry with 300 RPM and sector ids starting at 1
    pub fn new(cylinders: u8, heads: u8, sectors_per_track: u8, sector_size: u16) -> Self {
        Self {
            cylinders,
            heads,
            sectors_per_track,
            sector_size,
            first_sector_id: 1,
            rpm: 300,
        }
    }

    /// Set the first sector id
    pub fn with_first_sector(mut self, first: u8) -> Self {
        self.first_sector_id = first;
        self
    }

    /// Set the rotation speed
    pub fn with_rpm(mut self, rpm: u16) -> Self {
        self.rpm = rpm;
        self
    }

    /// Check that the geometry is physically meaningful
    pub fn validate(&self) -> Result<()> {
        if self.cylinders == 0 || self.cylinders > 86 {
            return Err(FloppyError::invalid_arg(format!(
                "cylinders {} outside 1..=86",
                self.cylinders
            )));
        }
        if !(1..=2).contains(&self.heads) {
            return Err(FloppyError::invalid_arg(format!(
                "heads {} outside 1..=2",
                self.heads
            )));
        }
        if self.sectors_per_track > 64 {
            return Err(FloppyError::invalid_arg(format!(
                "sectors per track {} outside 0..=64",
                self.sectors_per_track
            )));
        }
        validate_sector_size(self.sector_size as usize)
    }

    /// Total formatted capacity in bytes for uniform geometries
    pub fn total_capacity(&self) -> usize {
        self.cylinders as usize
            * self.heads as usize
            * self.sectors_per_track as usize
            * self.sector_size as usize
    }

    /// Size code for the nominal sector size
    pub fn size_code(&self) -> u8 {
        bytes_to_size_code(self.sector_size as usize).unwrap_or(2)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry::new(80, 2, 9, 512)
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cyl x {} head x {} sec x {} bytes",
            self.cylinders, self.heads, self.sectors_per_track, self.sector_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_codes() {
        assert_eq!(size_code_to_bytes(0), 128);
        assert_eq!(size_code_to_bytes(2), 512);
        assert_eq!(size_code_to_bytes(99), 512);
        assert_eq!(bytes_to_size_code(1024), Some(3));
        assert_eq!(bytes_to_size_code(1000), None);
    }

    #[test]
    fn test_validate_sector_size() {
        assert!(validate_sector_size(128).is_ok());
        assert!(validate_sector_size(8192).is_ok());
        assert!(validate_sector_size(64).is_err());
        assert!(validate_sector_size(16384).is_err());
        assert!(validate_sector_size(500).is_err());
    }

    #[test]
    fn test_geometry_capacity() {
        let geometry = Geometry::new(80, 2, 18, 512);
        assert_eq!(geometry.total_capacity(), 1_474_560);
        assert!(geometry.validate().is_ok());
        assert!(Geometry::new(90, 2, 9, 512).validate().is_err());
        assert!(Geometry::new(80, 3, 9, 512).validate().is_err());
    }
}
