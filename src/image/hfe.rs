//! HxC Floppy Emulator HFE (revision 1)
//!
//! A 512-byte header, a track list of `(block offset, length)` pairs, then
//! track data in 512-byte blocks each holding 256 bytes of side 0 followed
//! by 256 bytes of side 1. Cells are stored LSB first at twice the data
//! bit rate.

use crate::disk::{Disk, Geometry};
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::image::{note, track_bits, Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::{le16, ByteWriter};
use crate::pll::Bitstream;
use crate::profile::Platform;
use crate::track::{decode_bits, driver, TrackDriver};
use log::debug;

const SIGNATURE: &[u8] = b"HXCPICFE";
const SIGNATURE_V3: &[u8] = b"HXCHFEV3";
const BLOCK: usize = 512;
const HALF: usize = 256;
const HEADER_BLOB: &str = "hfe-header";

/// Track encoding byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfeEncoding {
    /// IBM MFM
    IsoIbmMfm,
    /// Amiga MFM
    AmigaMfm,
    /// IBM FM
    IsoIbmFm,
    /// Emulator FM
    EmuFm,
    /// Not specified
    Unknown,
}

impl HfeEncoding {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => HfeEncoding::IsoIbmMfm,
            1 => HfeEncoding::AmigaMfm,
            2 => HfeEncoding::IsoIbmFm,
            3 => HfeEncoding::EmuFm,
            _ => HfeEncoding::Unknown,
        }
    }

    fn byte(self) -> u8 {
        match self {
            HfeEncoding::IsoIbmMfm => 0,
            HfeEncoding::AmigaMfm => 1,
            HfeEncoding::IsoIbmFm => 2,
            HfeEncoding::EmuFm => 3,
            HfeEncoding::Unknown => 0xFF,
        }
    }

    fn for_encoding(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Mfm => HfeEncoding::IsoIbmMfm,
            Encoding::AmigaMfm => HfeEncoding::AmigaMfm,
            Encoding::Fm => HfeEncoding::IsoIbmFm,
            _ => HfeEncoding::Unknown,
        }
    }

    fn driver_name(self) -> Option<&'static str> {
        match self {
            HfeEncoding::IsoIbmMfm => Some("ibm-mfm"),
            HfeEncoding::AmigaMfm => Some("amiga"),
            HfeEncoding::IsoIbmFm | HfeEncoding::EmuFm => Some("ibm-fm"),
            HfeEncoding::Unknown => None,
        }
    }
}

/// Cell time for a header bit rate in kbit/s
pub fn cell_ns(bitrate_kbps: u16) -> f64 {
    1e9 / (bitrate_kbps.max(1) as f64 * 2000.0)
}

/// Header bit rate for a cell time
pub fn bitrate_kbps(cell_ns: f64) -> u16 {
    (1e9 / (cell_ns * 2000.0)).round() as u16
}

fn interface_mode(platform: Platform, high_density: bool) -> u8 {
    match (platform, high_density) {
        (Platform::Pc, false) => 0,
        (Platform::Pc, true) => 1,
        (Platform::AtariSt, false) => 2,
        (Platform::AtariSt, true) => 3,
        (Platform::Amiga, false) => 4,
        (Platform::Amiga, true) => 5,
        (Platform::AmstradCpc, _) => 6,
        (Platform::Msx, _) => 9,
        (Platform::C64, _) => 10,
        _ => 7,
    }
}

/// Split one track's interleaved blocks into its two sides
fn split_sides(data: &[u8], len: usize) -> [Vec<u8>; 2] {
    let side_len = len / 2;
    let mut sides = [Vec::with_capacity(side_len), Vec::with_capacity(side_len)];
    for (side, out) in sides.iter_mut().enumerate() {
        let mut chunk = 0;
        while out.len() < side_len {
            let at = chunk * BLOCK + side * HALF;
            let take = (side_len - out.len()).min(HALF);
            match data.get(at..at + take) {
                Some(bytes) => out.extend_from_slice(bytes),
                None => break,
            }
            chunk += 1;
        }
    }
    sides
}

fn parse_hfe(data: &[u8], options: &ParseOptions) -> Result<Image> {
    if data.starts_with(SIGNATURE_V3) {
        return Err(FloppyError::unsupported("HFE revision 3 opcode streams"));
    }
    if !data.starts_with(SIGNATURE) {
        return Err(FloppyError::invalid_format("not an HFE file"));
    }
    if data.len() < BLOCK {
        return Err(FloppyError::parse(data.len(), "HFE header truncated"));
    }
    let mut warnings = Vec::new();
    if data[8] != 0 {
        note(&mut warnings, options.strict, Warning::new(8, format!("format revision {}", data[8])))?;
    }
    let tracks = data[9];
    let sides = data[10].clamp(1, 2);
    let encoding = HfeEncoding::from_byte(data[11]);
    let bitrate = le16(data, 12);
    let rpm = le16(data, 14);
    let list_at = le16(data, 18) as usize * BLOCK;
    let cell = cell_ns(bitrate);

    let driver: Option<&'static dyn TrackDriver> = options
        .profile
        .and_then(|p| driver(p.track_driver).ok())
        .or_else(|| encoding.driver_name().and_then(|n| driver(n).ok()));

    let mut disk = Disk::new(Geometry::new(0, sides, 0, 512));
    for cylinder in 0..tracks {
        let entry_at = list_at + cylinder as usize * 4;
        let Some(entry) = data.get(entry_at..entry_at + 4) else {
            note(&mut warnings, options.strict, Warning::new(entry_at, "track list truncated"))?;
            break;
        };
        let offset = le16(entry, 0) as usize * BLOCK;
        let len = le16(entry, 2) as usize;
        let Some(track_data) = data.get(offset..) else {
            note(&mut warnings, options.strict, Warning::new(entry_at, format!("track {} outside the file", cylinder)))?;
            continue;
        };
        if track_data.len() < len.div_ceil(BLOCK) * BLOCK {
            note(&mut warnings, options.strict, Warning::new(offset, format!("track {} truncated", cylinder)))?;
        }
        let halves = split_sides(track_data, len);
        for (head, bytes) in halves.iter().enumerate().take(sides as usize) {
            let bits = Bitstream::from_bytes_lsb(bytes, bytes.len() * 8, cell);
            let track = decode_bits(&bits, cylinder, head as u8, driver);
            debug!("hfe: track {}.{} {} sectors", cylinder, head, track.sector_count());
            disk.add_track(track)?;
        }
    }

    let first = disk.track(0, 0);
    let spt = first.map(|t| t.sector_count() as u8).unwrap_or(0);
    let size = first.and_then(|t| t.uniform_sector_size()).unwrap_or(512) as u16;
    let first_id = first.and_then(|t| t.sector_ids().into_iter().min()).unwrap_or(1);
    disk.encoding = first.map(|t| t.encoding).unwrap_or(Encoding::Unknown);
    disk.platform = options.profile.map(|p| p.platform).unwrap_or(Platform::Unknown);
    disk.geometry = Geometry::new(tracks, sides, spt, size).with_first_sector(first_id).with_rpm(rpm.max(1));
    disk.mark_unchanged();

    let mut image = Image::new(disk, "hfe").with_profile(options.profile);
    image.warnings = warnings;
    image.blobs.insert(HEADER_BLOB.into(), data[..26].to_vec());
    Ok(image)
}

fn serialize_hfe(image: &Image) -> Result<Vec<u8>> {
    let disk = &image.disk;
    let encoding = HfeEncoding::for_encoding(disk.encoding);
    let driver = match image.profile.and_then(|p| driver(p.track_driver).ok()) {
        Some(d) if d.encoding() == disk.encoding => d,
        _ => encoding
            .driver_name()
            .and_then(|n| driver(n).ok())
            .ok_or_else(|| FloppyError::unsupported(format!("HFE cannot hold {} tracks", disk.encoding.name())))?,
    };
    let nominal = image.profile.map(|p| p.cell_ns).unwrap_or(match disk.encoding {
        Encoding::Fm => 4000.0,
        _ => 2000.0,
    });
    let tracks = disk.cylinder_count();
    let sides = disk.head_count().clamp(1, 2);
    let stored = image.blob(HEADER_BLOB).filter(|h| h.len() >= 26);

    let mut out = SIGNATURE.to_vec();
    out.push(0);
    out.push(tracks);
    out.push(sides);
    out.push(encoding.byte());
    out.put_u16_le(stored.map(|h| le16(h, 12)).unwrap_or_else(|| bitrate_kbps(nominal)));
    out.put_u16_le(disk.geometry.rpm);
    out.push(stored.map(|h| h[16]).unwrap_or_else(|| interface_mode(disk.platform, nominal < 1500.0)));
    out.push(1);
    out.put_u16_le(1);
    out.push(stored.map(|h| h[20]).unwrap_or(if disk.read_only { 0 } else { 0xFF }));
    out.push(stored.map(|h| h[21]).unwrap_or(0xFF));
    out.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
    out.resize(BLOCK, 0xFF);

    let cell = stored.map(|h| cell_ns(le16(h, 12))).unwrap_or(nominal);
    let list_blocks = (tracks as usize * 4).div_ceil(BLOCK).max(1);
    let mut list = Vec::with_capacity(list_blocks * BLOCK);
    let mut body = Vec::new();
    let mut block = 1 + list_blocks;
    for cylinder in 0..tracks {
        let mut halves: Vec<Vec<u8>> = Vec::with_capacity(2);
        for head in 0..sides {
            let bytes = match disk.track(cylinder, head) {
                Some(track) => track_bits(track, driver, cell)?.to_bytes_lsb(),
                None => Vec::new(),
            };
            halves.push(bytes);
        }
        let side_len = halves.iter().map(Vec::len).max().unwrap_or(0);
        for half in halves.iter_mut() {
            half.resize(side_len, 0);
        }
        let chunks = side_len.div_ceil(HALF);
        let mut track_data = vec![0u8; chunks * BLOCK];
        for (side, half) in halves.iter().enumerate() {
            for (k, piece) in half.chunks(HALF).enumerate() {
                let at = k * BLOCK + side * HALF;
                track_data[at..at + piece.len()].copy_from_slice(piece);
            }
        }
        list.put_u16_le(block as u16);
        list.put_u16_le((side_len * 2) as u16);
        block += track_data.len() / BLOCK;
        body.extend(track_data);
    }
    list.resize(list_blocks * BLOCK, 0xFF);
    out.extend(list);
    out.extend(body);
    Ok(out)
}

/// HFE codec
#[derive(Debug, Clone, Copy, Default)]
pub struct HfeCodec;

impl ImageCodec for HfeCodec {
    fn name(&self) -> &'static str {
        "hfe"
    }

    fn description(&self) -> &'static str {
        "HxC Floppy Emulator bitstream"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["hfe"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Bitstream
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if data.starts_with(SIGNATURE) {
            100
        } else if data.starts_with(SIGNATURE_V3) {
            95
        } else {
            0
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_hfe(data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_hfe(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn st_image() -> Image {
        let p = profile("atari-st-ds").unwrap();
        let mut disk = Disk::builder().profile(p).build().unwrap();
        disk.write_sector(0, 0, 1, &[0x60; 512]).unwrap();
        disk.write_sector(10, 1, 9, &(0..512u32).map(|i| i as u8).collect::<Vec<_>>()).unwrap();
        Image::new(disk, "st").with_profile(Some(p))
    }

    #[test]
    fn test_rates() {
        assert_eq!(cell_ns(250), 2000.0);
        assert_eq!(bitrate_kbps(1000.0), 500);
    }

    #[test]
    fn test_round_trip_sectors() {
        let image = st_image();
        let bytes = serialize_hfe(&image).unwrap();
        assert_eq!(HfeCodec.probe(&bytes), 100);
        assert_eq!(bytes[9], 80);
        assert_eq!(bytes[10], 2);
        assert_eq!(le16(&bytes, 12), 250);
        assert_eq!(bytes[16], 2);
        let back = parse_hfe(&bytes, &ParseOptions { strict: true, profile: image.profile }).unwrap();
        assert_eq!(back.disk.track_count(), 160);
        assert_eq!(back.disk.read_sector(0, 0, 1).unwrap(), &[0x60; 512][..]);
        assert_eq!(back.disk.read_sector(10, 1, 9).unwrap()[300], 44);
        assert_eq!(back.disk.geometry.sectors_per_track, 9);
        assert_eq!(serialize_hfe(&back).unwrap(), bytes);
    }

    #[test]
    fn test_side_interleave() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i / 256) as u8).collect();
        let [side0, side1] = split_sides(&data, 1024);
        assert_eq!(side0.len(), 512);
        assert!(side0[..256].iter().all(|&b| b == 0));
        assert!(side0[256..].iter().all(|&b| b == 2));
        assert!(side1[..256].iter().all(|&b| b == 1));
    }

    #[test]
    fn test_revision_three_is_unsupported() {
        let mut data = SIGNATURE_V3.to_vec();
        data.resize(1024, 0);
        assert_eq!(HfeCodec.probe(&data), 95);
        assert!(parse_hfe(&data, &ParseOptions::default()).is_err());
    }
}
