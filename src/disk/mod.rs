//! In-memory disk model: geometry, tracks, sectors and the flux arena

/// Disk builder for creating formatted blank disks
pub mod builder;
/// Geometry and size codes
pub mod geometry;
/// Sector definition and status
pub mod sector;
/// Track definition and status
pub mod track;

pub use builder::DiskBuilder;
pub use geometry::{Geometry, SideMode};
pub use sector::{Sector, SectorId, SectorQuality, SectorStatus};
pub use track::{DataRate, RecordingMode, Track, TrackStatus};

use crate::encoding::Encoding;
use crate::error::{FloppyError, Result};
use crate::flux::FluxStream;
use crate::profile::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of a flux stream stored in a [`Disk`]'s arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FluxHandle(usize);

impl FluxHandle {
    /// Position of the stream in the arena
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Parameter change applied to one track during recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackOverride {
    /// Cylinder the override applies to
    pub cylinder: u8,
    /// Head the override applies to
    pub head: u8,
    /// Recovery attempt that introduced it
    pub attempt: u8,
    /// PLL window tolerance used
    pub pll_tolerance: Option<f64>,
    /// PLL phase gain used
    pub phase_gain: Option<f64>,
    /// PLL frequency gain used
    pub freq_gain: Option<f64>,
    /// Free-form note
    pub note: String,
}

/// A whole disk: geometry plus every track that has been read or imported
#[derive(Debug, Clone)]
pub struct Disk {
    /// Nominal geometry
    pub geometry: Geometry,
    /// Dominant encoding
    pub encoding: Encoding,
    /// Platform hint
    pub platform: Platform,
    /// Refuse sector writes
    pub read_only: bool,
    tracks: BTreeMap<(u8, u8), Track>,
    overrides: BTreeMap<(u8, u8), Vec<TrackOverride>>,
    flux: Vec<FluxStream>,
    changed: bool,
}

impl Disk {
    /// Create an empty disk with the given geometry
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            encoding: Encoding::Unknown,
            platform: Platform::Unknown,
            read_only: false,
            tracks: BTreeMap::new(),
            overrides: BTreeMap::new(),
            flux: Vec::new(),
            changed: false,
        }
    }

    /// Start a builder for a formatted blank disk
    pub fn builder() -> DiskBuilder {
        DiskBuilder::new()
    }

    /// Store or replace a track
    pub fn set_track(&mut self, track: Track) {
        let key = (track.cylinder, track.head);
        if track.cylinder >= self.geometry.cylinders {
            self.geometry.cylinders = track.cylinder.saturating_add(1);
        }
        if track.head >= self.geometry.heads {
            self.geometry.heads = track.head.saturating_add(1);
        }
        self.tracks.insert(key, track);
    }

    /// Store a track whose position came from a file, refusing positions
    /// the geometry cannot count up to
    pub fn add_track(&mut self, track: Track) -> Result<()> {
        if track.cylinder == u8::MAX || track.head == u8::MAX {
            return Err(FloppyError::corrupt(format!(
                "track position {}.{} out of range",
                track.cylinder, track.head
            )));
        }
        self.set_track(track);
        Ok(())
    }

    /// Get a track
    pub fn track(&self, cylinder: u8, head: u8) -> Option<&Track> {
        self.tracks.get(&(cylinder, head))
    }

    /// Get a mutable track
    pub fn track_mut(&mut self, cylinder: u8, head: u8) -> Option<&mut Track> {
        self.tracks.get_mut(&(cylinder, head))
    }

    /// Get a track, creating an empty one if needed
    pub fn track_entry(&mut self, cylinder: u8, head: u8) -> &mut Track {
        if !self.tracks.contains_key(&(cylinder, head)) {
            self.set_track(Track::new(cylinder, head));
        }
        self.tracks
            .entry((cylinder, head))
            .or_insert_with(|| Track::new(cylinder, head))
    }

    /// Iterate over tracks in cylinder then head order
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Iterate mutably over tracks in cylinder then head order
    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    /// Number of tracks present
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Highest cylinder present plus one
    pub fn cylinder_count(&self) -> u8 {
        self.tracks
            .keys()
            .map(|&(c, _)| c.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// Highest head present plus one
    pub fn head_count(&self) -> u8 {
        self.tracks
            .keys()
            .map(|&(_, h)| h + 1)
            .max()
            .unwrap_or(0)
    }

    fn invalid_track(&self, cylinder: u8, head: u8) -> FloppyError {
        FloppyError::InvalidTrack {
            cylinder,
            head,
            max_cylinder: self.cylinder_count().saturating_sub(1),
            max_head: self.head_count().saturating_sub(1),
        }
    }

    /// Get a sector by physical address
    pub fn sector(&self, cylinder: u8, head: u8, sector_id: u8) -> Result<&Sector> {
        let track = self
            .track(cylinder, head)
            .ok_or_else(|| self.invalid_track(cylinder, head))?;
        track
            .get_sector(sector_id)
            .ok_or(FloppyError::SectorNotFound {
                cylinder,
                head,
                sector: sector_id,
            })
    }

    /// Read sector data
    pub fn read_sector(&self, cylinder: u8, head: u8, sector_id: u8) -> Result<&[u8]> {
        Ok(self.sector(cylinder, head, sector_id)?.data())
    }

    /// Write sector data; the track is marked modified
    pub fn write_sector(&mut self, cylinder: u8, head: u8, sector_id: u8, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FloppyError::Permission("disk is read-only".into()));
        }
        let invalid = self.invalid_track(cylinder, head);
        let track = self.track_mut(cylinder, head).ok_or(invalid)?;
        let sector = track
            .get_sector_mut(sector_id)
            .ok_or(FloppyError::SectorNotFound {
                cylinder,
                head,
                sector: sector_id,
            })?;

        if data.len() != sector.data().len() {
            sector.resize(data.len(), 0);
        }
        sector.data_mut().copy_from_slice(data);
        sector.data_crc_ok = true;
        sector.header_crc_ok = true;
        sector.weak = false;
        sector.weak_mask = None;
        // captured cells and flux no longer match the payload
        track.bitstream = None;
        track.flux = None;
        track.status = TrackStatus::Modified;
        self.changed = true;
        Ok(())
    }

    /// Store a flux stream in the arena and return its handle
    pub fn attach_flux(&mut self, flux: FluxStream) -> FluxHandle {
        self.flux.push(flux);
        FluxHandle(self.flux.len() - 1)
    }

    /// Resolve a flux handle
    pub fn flux(&self, handle: FluxHandle) -> Option<&FluxStream> {
        self.flux.get(handle.0)
    }

    /// Flux stream attached to a track
    pub fn track_flux(&self, cylinder: u8, head: u8) -> Option<&FluxStream> {
        self.track(cylinder, head)
            .and_then(|t| t.flux)
            .and_then(|h| self.flux(h))
    }

    /// Number of flux streams held
    pub fn flux_count(&self) -> usize {
        self.flux.len()
    }

    /// Append a per-track override; earlier entries are never modified
    pub fn push_override(&mut self, entry: TrackOverride) {
        self.overrides
            .entry((entry.cylinder, entry.head))
            .or_default()
            .push(entry);
    }

    /// Overrides recorded for a track
    pub fn overrides(&self, cylinder: u8, head: u8) -> &[TrackOverride] {
        self.overrides
            .get(&(cylinder, head))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every override in track order
    pub fn all_overrides(&self) -> impl Iterator<Item = &TrackOverride> {
        self.overrides.values().flatten()
    }

    /// Check if the disk has been modified
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Mark the disk as unchanged
    pub fn mark_unchanged(&mut self) {
        self.changed = false;
    }

    /// Get the total size of all sector data in bytes
    pub fn total_size(&self) -> usize {
        self.tracks.values().map(|t| t.total_data_size()).sum()
    }

    /// Physical addresses of every sector in logical order.
    ///
    /// Sectors within a track are taken in id order, the way a controller
    /// reading sequential ids would return them.
    pub fn logical_order(&self, side_mode: SideMode) -> Vec<(u8, u8, u8)> {
        let cylinders = self.cylinder_count();
        let heads = match side_mode {
            SideMode::SingleSide => 1,
            _ => self.head_count().max(1),
        };
        let mut order = Vec::new();
        let push_track = |c: u8, h: u8, order: &mut Vec<(u8, u8, u8)>| {
            if let Some(track) = self.track(c, h) {
                for sector in track.sectors_by_id() {
                    order.push((c, h, sector.id.sector));
                }
            }
        };
        match side_mode {
            SideMode::SingleSide | SideMode::Alternate => {
                for c in 0..cylinders {
                    for h in 0..heads {
                        push_track(c, h, &mut order);
                    }
                }
            }
            SideMode::Successive => {
                for h in 0..heads {
                    for c in 0..cylinders {
                        push_track(c, h, &mut order);
                    }
                }
            }
        }
        order
    }
}
