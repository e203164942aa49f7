//! Builder for creating formatted blank disks

use crate::disk::{Disk, Geometry, Sector, SectorId, Track, TrackStatus};
use crate::encoding::Encoding;
use crate::error::Result;
use crate::profile::{Platform, PlatformProfile};

/// Builder for constructing formatted disks
pub struct DiskBuilder {
    geometry: Geometry,
    encoding: Encoding,
    platform: Platform,
    filler_byte: u8,
    gap3_length: u8,
    interleave: u8,
    zones: Option<fn(u8) -> u8>,
}

impl DiskBuilder {
    /// Create a new builder with PC 720K defaults
    pub fn new() -> Self {
        Self {
            geometry: Geometry::new(80, 2, 9, 512),
            encoding: Encoding::Mfm,
            platform: Platform::Unknown,
            filler_byte: 0xE5,
            gap3_length: 0x4E,
            interleave: 1,
            zones: None,
        }
    }

    /// Take geometry, encoding and zoning from a platform profile
    pub fn profile(mut self, profile: &PlatformProfile) -> Self {
        self.geometry = profile.geometry;
        self.encoding = profile.encoding;
        self.platform = profile.platform;
        self.zones = profile.zones;
        self.gap3_length = profile.gap3;
        self.filler_byte = profile.filler_byte;
        self
    }

    /// Set the geometry
    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Set the encoding
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the filler byte for sector contents
    pub fn filler_byte(mut self, filler: u8) -> Self {
        self.filler_byte = filler;
        self
    }

    /// Set the physical sector interleave (1 = sequential)
    pub fn interleave(mut self, interleave: u8) -> Self {
        self.interleave = interleave.max(1);
        self
    }

    /// Use a per-cylinder sector count instead of the nominal one
    pub fn zones(mut self, zones: fn(u8) -> u8) -> Self {
        self.zones = Some(zones);
        self
    }

    /// Physical order of sector ids for a track with `count` sectors
    fn sector_order(&self, count: u8) -> Vec<u8> {
        let count = count as usize;
        let mut order = vec![None; count];
        let mut pos = 0usize;
        for logical in 0..count {
            while order[pos % count].is_some() {
                pos += 1;
            }
            order[pos % count] = Some(logical as u8);
            pos += self.interleave as usize;
        }
        order
            .into_iter()
            .map(|s| self.geometry.first_sector_id.wrapping_add(s.unwrap_or(0)))
            .collect()
    }

    /// Build the disk with the specified configuration
    pub fn build(self) -> Result<Disk> {
        self.geometry.validate()?;
        let mut disk = Disk::new(self.geometry);
        disk.encoding = self.encoding;
        disk.platform = self.platform;
        let size_code = self.geometry.size_code();

        for cylinder in 0..self.geometry.cylinders {
            let count = match self.zones {
                Some(zones) => zones(cylinder),
                None => self.geometry.sectors_per_track,
            };
            for head in 0..self.geometry.heads {
                let mut track = Track::new(cylinder, head);
                track.gap3_length = self.gap3_length;
                track.filler_byte = self.filler_byte;
                track.encoding = self.encoding;
                track.status = TrackStatus::Ok;
                for sector_id in self.sector_order(count) {
                    let id = SectorId::new(cylinder, head, sector_id, size_code);
                    let mut sector =
                        Sector::with_data(id, vec![self.filler_byte; self.geometry.sector_size as usize]);
                    sector.encoding = self.encoding;
                    track.add_sector(sector);
                }
                disk.set_track(track);
            }
        }
        disk.geometry = self.geometry;
        Ok(disk)
    }
}

impl Default for DiskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default() {
        let disk = DiskBuilder::new().build().unwrap();
        assert_eq!(disk.track_count(), 160);
        assert_eq!(disk.total_size(), 737_280);
    }

    #[test]
    fn test_builder_interleave() {
        let disk = DiskBuilder::new()
            .geometry(Geometry::new(1, 1, 9, 512))
            .interleave(2)
            .build()
            .unwrap();
        let ids = disk.track(0, 0).unwrap().sector_ids();
        assert_eq!(ids, vec![1, 6, 2, 7, 3, 8, 4, 9, 5]);
    }

    #[test]
    fn test_builder_zones() {
        fn zones(cylinder: u8) -> u8 {
            if cylinder < 2 {
                21
            } else {
                19
            }
        }
        let disk = DiskBuilder::new()
            .geometry(Geometry::new(3, 1, 21, 256).with_first_sector(0))
            .zones(zones)
            .build()
            .unwrap();
        assert_eq!(disk.track(0, 0).unwrap().sector_count(), 21);
        assert_eq!(disk.track(2, 0).unwrap().sector_count(), 19);
        assert!(disk.track(2, 0).unwrap().has_sector(0));
    }

    #[test]
    fn test_builder_rejects_bad_geometry() {
        assert!(DiskBuilder::new()
            .geometry(Geometry::new(80, 2, 9, 500))
            .build()
            .is_err());
    }
}
