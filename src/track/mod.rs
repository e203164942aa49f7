//! Track drivers: platform sector layouts on top of a line encoding
//!
//! A driver turns the bytes and marks of a [`RawTrack`] into sectors and,
//! for the write path, lays sectors back out as a `RawTrack`. Drivers are
//! pure: the same input always yields the same [`Track`].

/// Amiga trackdisk sectors
pub mod amiga;
/// Apple II and Macintosh GCR sectors
pub mod apple;
/// Commodore 1541-family sectors
pub mod cbm;
/// IBM System/34 style sectors and the platforms built on it
pub mod ibm;
/// North Star hard-sectored MFM
pub mod northstar;
/// Raw undecoded tracks
pub mod raw;
/// DEC RX02 sectors
pub mod rx02;
/// Victor 9000 sectors
pub mod victor;

use crate::disk::Track;
use crate::encoding::{self, Encoding, RawTrack};
use crate::error::{FloppyError, Result};
use crate::pll::Bitstream;
use crate::profile::{Platform, PlatformProfile};
use log::debug;
use std::sync::OnceLock;

/// Decodes and encodes the sector layout of one platform
pub trait TrackDriver: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Machine family
    fn platform(&self) -> Platform;

    /// Line encoding the driver reads
    fn encoding(&self) -> Encoding;

    /// Confidence 0-100 that the bytes hold this layout
    fn probe(&self, raw: &RawTrack) -> u8 {
        self.decode(raw, 0, 0).confidence
    }

    /// Parse sectors out of a raw track
    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track;

    /// Lay sectors out for writing
    fn encode(&self, track: &Track) -> Result<RawTrack> {
        Err(FloppyError::unsupported(format!(
            "track driver '{}' cannot encode track {}.{}",
            self.name(),
            track.cylinder,
            track.head
        )))
    }

    /// Turn a bitstream into bytes; drivers with their own framing override this
    fn raw_from_bits(&self, bits: &Bitstream) -> RawTrack {
        encoding::decode(self.encoding(), bits)
    }
}

/// Evidence a decoder gathered about one track
#[derive(Debug, Clone, Copy, Default)]
pub struct Evidence {
    /// Address marks seen
    pub marks: usize,
    /// Sectors assembled
    pub sectors: usize,
    /// Sectors with both checksums passing
    pub good: usize,
    /// Sectors the layout expects (0 = any)
    pub expected: usize,
    /// Headers agree with the layout (ids in range, sizes, track numbers)
    pub plausible: bool,
}

impl Evidence {
    /// Confidence from mark count, sector count, checksum ratio and plausibility
    pub fn confidence(&self) -> u8 {
        if self.sectors == 0 {
            return self.marks.min(10) as u8;
        }
        let crc = 40 * self.good / self.sectors;
        let count = if self.expected == 0 {
            30
        } else {
            30 * self.sectors.min(self.expected) / self.expected
        };
        let plausible = if self.plausible { 20 } else { 0 };
        let marks = if self.marks >= self.sectors { 10 } else { 5 };
        (crc + count + plausible + marks).min(100) as u8
    }
}

/// Stamp a decoded track with its driver, confidence and status
pub fn finish(track: &mut Track, driver: &dyn TrackDriver, raw: &RawTrack, evidence: Evidence) {
    let confidence = evidence.confidence();
    track.driver = Some(driver.name());
    track.encoding = driver.encoding();
    track.confidence = confidence;
    for sector in track.sectors_mut() {
        sector.confidence = confidence;
        sector.encoding = driver.encoding();
    }
    if track.is_empty() && !raw.is_empty() {
        track.residual = raw.bytes.clone();
    }
    track.classify(evidence.expected);
}

fn build_registry() -> Vec<Box<dyn TrackDriver>> {
    let mut drivers: Vec<Box<dyn TrackDriver>> = Vec::new();
    for d in ibm::variants() {
        drivers.push(Box::new(d));
    }
    drivers.push(Box::new(amiga::AmigaDriver));
    drivers.push(Box::new(cbm::CbmDriver));
    drivers.push(Box::new(apple::Apple2Driver));
    drivers.push(Box::new(apple::MacDriver));
    drivers.push(Box::new(rx02::Rx02Driver));
    drivers.push(Box::new(victor::VictorDriver));
    drivers.push(Box::new(northstar::NorthstarDriver));
    drivers.push(Box::new(raw::RawDriver));
    drivers
}

/// Every registered driver, in probing order
pub fn registry() -> &'static [Box<dyn TrackDriver>] {
    static REGISTRY: OnceLock<Vec<Box<dyn TrackDriver>>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

/// Look a driver up by name
pub fn driver(name: &str) -> Result<&'static dyn TrackDriver> {
    registry()
        .iter()
        .find(|d| d.name() == name)
        .map(|d| d.as_ref())
        .ok_or_else(|| FloppyError::NotFound(format!("track driver '{}'", name)))
}

/// Driver to lay a track back out with: the one that decoded it, then
/// the profile's, then the generic driver for its encoding
pub fn driver_for_track(
    track: &Track,
    fallback: Encoding,
    profile: Option<&PlatformProfile>,
) -> Result<&'static dyn TrackDriver> {
    if let Some(d) = track.driver.and_then(|n| driver(n).ok()) {
        return Ok(d);
    }
    let encoding = if track.encoding == Encoding::Unknown {
        fallback
    } else {
        track.encoding
    };
    if let Some(d) = profile
        .filter(|p| p.encoding == encoding)
        .and_then(|p| driver(p.track_driver).ok())
    {
        return Ok(d);
    }
    encoding
        .default_driver()
        .and_then(|n| driver(n).ok())
        .ok_or_else(|| FloppyError::unsupported(format!("no track driver for {} tracks", encoding.name())))
}

/// Most confident driver for bytes already decoded with some encoding
pub fn best_for(raw: &RawTrack) -> Option<(&'static dyn TrackDriver, u8)> {
    let mut best: Option<(&'static dyn TrackDriver, u8)> = None;
    for d in registry().iter().filter(|d| d.encoding() == raw.encoding) {
        let score = d.probe(raw);
        if score > best.map(|(_, s)| s).unwrap_or(0) {
            best = Some((d.as_ref(), score));
        }
    }
    best
}

/// Decode a bitstream, trying every encoding when no driver is given
pub fn decode_bits(bits: &Bitstream, cylinder: u8, head: u8, hint: Option<&dyn TrackDriver>) -> Track {
    if let Some(d) = hint {
        let raw = d.raw_from_bits(bits);
        let mut track = d.decode(&raw, cylinder, head);
        track.bitstream = Some(bits.clone());
        return track;
    }
    let mut best: Option<Track> = None;
    for d in registry().iter() {
        if d.encoding() == Encoding::Unknown {
            continue;
        }
        let raw = d.raw_from_bits(bits);
        if raw.markers.is_empty() {
            continue;
        }
        let track = d.decode(&raw, cylinder, head);
        if track.confidence > best.as_ref().map(|t| t.confidence).unwrap_or(0) {
            best = Some(track);
        }
    }
    let mut track = best.unwrap_or_else(|| raw::RawDriver.decode(&RawTrack::new(Encoding::Unknown), cylinder, head));
    debug!(
        "track {}.{}: {} sectors via {} (confidence {})",
        cylinder,
        head,
        track.sector_count(),
        track.driver.unwrap_or("none"),
        track.confidence
    );
    track.bitstream = Some(bits.clone());
    track
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_unique() {
        let mut names: Vec<_> = registry().iter().map(|d| d.name()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(driver("ibm-mfm").is_ok());
        assert!(driver("amiga").is_ok());
        assert!(driver("missing").is_err());
    }

    #[test]
    fn test_registry_is_stable() {
        let first = registry().as_ptr();
        let again = registry().as_ptr();
        assert_eq!(first, again);
        let a = driver("cbm").unwrap() as *const dyn TrackDriver as *const u8;
        let b = driver("cbm").unwrap() as *const dyn TrackDriver as *const u8;
        assert_eq!(a, b);
    }

    #[test]
    fn test_driver_for_track() {
        let mut track = Track::new(0, 0);
        assert_eq!(driver_for_track(&track, Encoding::Mfm, None).unwrap().name(), "ibm-mfm");
        let st = crate::profile::profile("atari-st-ds").unwrap();
        assert_eq!(driver_for_track(&track, Encoding::Mfm, Some(st)).unwrap().name(), "atari-st");
        track.driver = Some("amiga");
        assert_eq!(driver_for_track(&track, Encoding::Mfm, Some(st)).unwrap().name(), "amiga");
        assert!(driver_for_track(&Track::new(0, 0), Encoding::Unknown, None).is_err());
    }

    #[test]
    fn test_confidence_scale() {
        let none = Evidence::default();
        assert_eq!(none.confidence(), 0);
        let perfect = Evidence {
            marks: 22,
            sectors: 11,
            good: 11,
            expected: 11,
            plausible: true,
        };
        assert_eq!(perfect.confidence(), 100);
        let half = Evidence {
            good: 5,
            plausible: false,
            ..perfect
        };
        assert!(half.confidence() < 70);
    }
}
