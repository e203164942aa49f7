//! Commodore G64 GCR bitstreams
//!
//! Header "GCR-1541", version, half-track count and maximum track size,
//! then a table of track offsets and a table of speed zones, one entry
//! per half-track. Each track is a length-prefixed run of raw GCR bytes.

use crate::disk::{Disk, Geometry};
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::image::{note, track_bits, Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::{le16, le32, ByteWriter};
use crate::pll::Bitstream;
use crate::profile::{profile, Platform, PlatformProfile};
use crate::track::cbm::CbmDriver;
use crate::track::decode_bits;
use log::debug;

const SIGNATURE: &[u8] = b"GCR-1541";
const HEADER_LEN: usize = 12;
const HALF_TRACKS: usize = 84;
/// Largest track a 1541 can hold at the slowest zone, in bytes
pub const MAX_TRACK_SIZE: u16 = 7928;

/// Speed zone for a 1-based track number
pub fn speed_zone(track: u8) -> u32 {
    match track {
        0..=17 => 3,
        18..=24 => 2,
        25..=30 => 1,
        _ => 0,
    }
}

fn c64_profile(cylinders: u8) -> Option<&'static PlatformProfile> {
    profile(if cylinders > 35 { "c64-40" } else { "c64" }).ok()
}

fn cell_ns(cylinder: u8) -> f64 {
    c64_profile(35).map(|p| p.cell_ns_on(cylinder)).unwrap_or(3250.0)
}

fn parse_g64(data: &[u8], options: &ParseOptions) -> Result<Image> {
    if !data.starts_with(SIGNATURE) {
        return Err(FloppyError::invalid_format("not a G64 file"));
    }
    if data.len() < HEADER_LEN {
        return Err(FloppyError::parse(data.len(), "G64 header truncated"));
    }
    let mut warnings = Vec::new();
    if data[8] != 0 {
        note(&mut warnings, options.strict, Warning::new(8, format!("version {}", data[8])))?;
    }
    let half_tracks = data[9] as usize;
    let max_size = le16(data, 10) as usize;
    let tables_end = HEADER_LEN + half_tracks * 8;
    if data.len() < tables_end {
        return Err(FloppyError::parse(data.len(), "track tables truncated"));
    }

    let mut disk = Disk::new(Geometry::new(0, 1, 0, 256));
    for index in (0..half_tracks).step_by(2) {
        let offset = le32(data, HEADER_LEN + index * 4) as usize;
        if offset == 0 {
            continue;
        }
        let cylinder = (index / 2) as u8;
        let Some(len) = data.get(offset..offset + 2).map(|b| le16(b, 0) as usize) else {
            note(&mut warnings, options.strict, Warning::new(offset, format!("track {} outside the file", cylinder + 1)))?;
            continue;
        };
        if len > max_size {
            note(&mut warnings, options.strict, Warning::new(offset, format!("track {} longer than the maximum", cylinder + 1)))?;
        }
        let Some(bytes) = data.get(offset + 2..offset + 2 + len) else {
            note(&mut warnings, options.strict, Warning::new(offset, format!("track {} truncated", cylinder + 1)))?;
            continue;
        };
        let speed = le32(data, HEADER_LEN + half_tracks * 4 + index * 4);
        if speed <= 3 && speed != speed_zone(cylinder + 1) {
            debug!("g64: track {} recorded at speed zone {}", cylinder + 1, speed);
        }
        let bits = Bitstream::from_bytes_msb(bytes, len * 8, cell_ns(cylinder));
        disk.add_track(decode_bits(&bits, cylinder, 0, Some(&CbmDriver)))?;
    }
    if has_half_tracks(data, half_tracks) {
        debug!("g64: half-track data ignored");
    }
    disk.encoding = Encoding::GcrCbm;
    disk.platform = Platform::C64;
    disk.geometry = Geometry::new(disk.cylinder_count(), 1, 21, 256).with_first_sector(0);
    disk.mark_unchanged();

    let profile = options.profile.or_else(|| c64_profile(disk.cylinder_count()));
    let mut image = Image::new(disk, "g64").with_profile(profile);
    image.warnings = warnings;
    Ok(image)
}

fn has_half_tracks(data: &[u8], half_tracks: usize) -> bool {
    (1..half_tracks).step_by(2).any(|i| le32(data, HEADER_LEN + i * 4) != 0)
}

fn serialize_g64(image: &Image) -> Result<Vec<u8>> {
    let disk = &image.disk;
    if disk.encoding != Encoding::GcrCbm {
        return Err(FloppyError::unsupported(format!("G64 holds Commodore GCR tracks, not {}", disk.encoding.name())));
    }
    let mut out = SIGNATURE.to_vec();
    out.push(0);
    out.push(HALF_TRACKS as u8);
    out.put_u16_le(MAX_TRACK_SIZE);

    let mut offsets = vec![0u32; HALF_TRACKS];
    let mut speeds = vec![0u32; HALF_TRACKS];
    let mut body = Vec::new();
    let body_start = HEADER_LEN + HALF_TRACKS * 8;
    for track in disk.tracks().filter(|t| t.head == 0) {
        let index = track.cylinder as usize * 2;
        if index >= HALF_TRACKS {
            continue;
        }
        let bytes = track_bits(track, &CbmDriver, cell_ns(track.cylinder))?.to_bytes_msb();
        if bytes.len() > MAX_TRACK_SIZE as usize {
            return Err(FloppyError::invalid_arg(format!(
                "track {} needs {} bytes, more than {}",
                track.cylinder + 1,
                bytes.len(),
                MAX_TRACK_SIZE
            )));
        }
        offsets[index] = (body_start + body.len()) as u32;
        speeds[index] = speed_zone(track.cylinder + 1);
        body.put_u16_le(bytes.len() as u16);
        body.extend_from_slice(&bytes);
        body.resize(body.len() + MAX_TRACK_SIZE as usize - bytes.len(), 0xFF);
    }
    for offset in offsets {
        out.put_u32_le(offset);
    }
    for speed in speeds {
        out.put_u32_le(speed);
    }
    out.extend(body);
    Ok(out)
}

/// G64 codec
#[derive(Debug, Clone, Copy, Default)]
pub struct G64Codec;

impl ImageCodec for G64Codec {
    fn name(&self) -> &'static str {
        "g64"
    }

    fn description(&self) -> &'static str {
        "Commodore 1541 GCR bitstream"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["g64"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Bitstream
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if data.starts_with(SIGNATURE) {
            100
        } else {
            0
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_g64(data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_g64(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::d64::blank_1541;

    fn sample() -> Image {
        let mut disk = blank_1541(35, *b"AB").unwrap();
        disk.write_sector(17, 0, 1, &[0x42; 256]).unwrap();
        Image::new(disk, "d64")
    }

    #[test]
    fn test_speed_zones() {
        assert_eq!(speed_zone(1), 3);
        assert_eq!(speed_zone(18), 2);
        assert_eq!(speed_zone(30), 1);
        assert_eq!(speed_zone(35), 0);
    }

    #[test]
    fn test_round_trip_sectors() {
        let bytes = serialize_g64(&sample()).unwrap();
        assert_eq!(bytes[9], 84);
        assert_eq!(le32(&bytes, HEADER_LEN + 84 * 4), 3);
        let image = parse_g64(&bytes, &ParseOptions { strict: true, profile: None }).unwrap();
        assert_eq!(image.disk.track_count(), 35);
        assert_eq!(image.disk.track(30, 0).unwrap().sector_count(), 17);
        assert_eq!(image.disk.read_sector(17, 0, 1).unwrap(), &[0x42; 256][..]);
        assert_eq!(image.disk.sector(17, 0, 1).unwrap().tags, b"AB".to_vec());
        assert_eq!(image.profile.map(|p| p.name), Some("c64"));
        assert_eq!(serialize_g64(&image).unwrap(), bytes);
    }

    #[test]
    fn test_missing_track() {
        let mut bytes = serialize_g64(&sample()).unwrap();
        // drop track 2
        bytes[HEADER_LEN + 8..HEADER_LEN + 12].copy_from_slice(&[0; 4]);
        let image = parse_g64(&bytes, &ParseOptions::default()).unwrap();
        assert!(image.disk.track(1, 0).is_none());
        assert_eq!(image.disk.track_count(), 34);
    }

    #[test]
    fn test_rejects_mfm() {
        let disk = Disk::builder().build().unwrap();
        assert!(serialize_g64(&Image::new(disk, "img")).is_err());
    }
}
