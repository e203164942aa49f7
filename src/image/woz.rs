//! Applesauce WOZ 1.0 and 2.x bitstream images
//!
//! An 8-byte signature, a CRC-32 of everything after the 12-byte header,
//! then tagged chunks. `INFO` describes the disk, `TMAP` maps quarter
//! tracks (5.25") or track/side pairs (3.5") to `TRKS` entries, and
//! `META` carries tab-separated metadata.

use crate::disk::{Disk, Geometry};
use crate::encoding::crc::crc32;
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::image::{note, track_bits, Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::{le16, le32, ByteReader, ByteWriter};
use crate::pll::Bitstream;
use crate::profile::{profile, Platform};
use crate::track::apple::{Apple2Driver, MacDriver};
use crate::track::{decode_bits, TrackDriver};
use log::debug;
use std::collections::BTreeMap;

const WOZ1: &[u8] = b"WOZ1";
const WOZ2: &[u8] = b"WOZ2";
const TAIL: [u8; 4] = [0xFF, 0x0A, 0x0D, 0x0A];
const HEADER_LEN: usize = 12;
const INFO_LEN: usize = 60;
const TMAP_LEN: usize = 160;
const WOZ1_TRACK_LEN: usize = 6656;
const WOZ1_BITS_LEN: usize = 6646;
const BLOCK: usize = 512;
const EMPTY: u8 = 0xFF;
const CREATOR: &str = "unifloppy";

/// Disk type stored in INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WozDiskType {
    /// 5.25" Apple II
    FiveQuarter,
    /// 3.5" Macintosh / Apple IIgs
    ThreeHalf,
}

impl WozDiskType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(WozDiskType::FiveQuarter),
            2 => Some(WozDiskType::ThreeHalf),
            _ => None,
        }
    }

    fn byte(self) -> u8 {
        match self {
            WozDiskType::FiveQuarter => 1,
            WozDiskType::ThreeHalf => 2,
        }
    }

    fn driver(self) -> &'static dyn TrackDriver {
        match self {
            WozDiskType::FiveQuarter => &Apple2Driver,
            WozDiskType::ThreeHalf => &MacDriver,
        }
    }

    fn nominal_cell_ns(self) -> f64 {
        match self {
            WozDiskType::FiveQuarter => 4000.0,
            WozDiskType::ThreeHalf => 2000.0,
        }
    }

    /// TMAP slot of a physical track
    fn slot(self, cylinder: u8, head: u8) -> usize {
        match self {
            WozDiskType::FiveQuarter => cylinder as usize * 4,
            WozDiskType::ThreeHalf => cylinder as usize * 2 + head as usize,
        }
    }
}

/// Parsed INFO chunk
#[derive(Debug, Clone, PartialEq)]
pub struct WozInfo {
    /// INFO version (1 for WOZ1, 2 or 3 for WOZ2)
    pub version: u8,
    /// 5.25" or 3.5"
    pub disk_type: WozDiskType,
    /// Write protect tab
    pub write_protected: bool,
    /// Tracks were captured index-synchronised
    pub synchronized: bool,
    /// Creator string, trimmed
    pub creator: String,
    /// Cell time in nanoseconds
    pub bit_timing_ns: f64,
}

fn parse_info(data: &[u8]) -> Result<WozInfo> {
    if data.len() < 37 {
        return Err(FloppyError::parse(HEADER_LEN + 8, "INFO chunk truncated"));
    }
    let disk_type = WozDiskType::from_byte(data[1])
        .ok_or_else(|| FloppyError::parse(HEADER_LEN + 9, format!("disk type {}", data[1])))?;
    let creator = String::from_utf8_lossy(&data[5..37]).trim_end().to_string();
    let bit_timing_ns = match data.get(39) {
        Some(&t) if data[0] >= 2 && t > 0 => t as f64 * 125.0,
        _ => disk_type.nominal_cell_ns(),
    };
    Ok(WozInfo {
        version: data[0],
        disk_type,
        write_protected: data[2] != 0,
        synchronized: data[3] != 0,
        creator,
        bit_timing_ns,
    })
}

fn parse_meta(data: &[u8]) -> BTreeMap<String, String> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Bytes and bit count of one TRKS entry
fn track_data<'a>(data: &'a [u8], trks: &'a [u8], trks_at: usize, version2: bool, index: usize) -> Result<(&'a [u8], usize)> {
    if version2 {
        let entry = trks
            .get(index * 8..index * 8 + 8)
            .ok_or_else(|| FloppyError::parse(trks_at, format!("TRK entry {} missing", index)))?;
        let start = le16(entry, 0) as usize * BLOCK;
        let blocks = le16(entry, 2) as usize;
        let bits = le32(entry, 4) as usize;
        let bytes = data
            .get(start..start + blocks * BLOCK)
            .ok_or_else(|| FloppyError::parse(start, format!("track {} data outside the file", index)))?;
        Ok((bytes, bits))
    } else {
        let at = index * WOZ1_TRACK_LEN;
        let entry = trks
            .get(at..at + WOZ1_TRACK_LEN)
            .ok_or_else(|| FloppyError::parse(trks_at + at, format!("track {} missing", index)))?;
        let bits = le16(entry, WOZ1_BITS_LEN + 2) as usize;
        Ok((&entry[..WOZ1_BITS_LEN], bits))
    }
}

fn parse_woz(data: &[u8], options: &ParseOptions) -> Result<Image> {
    let version2 = match data.get(..4) {
        Some(m) if m == WOZ2 => true,
        Some(m) if m == WOZ1 => false,
        _ => return Err(FloppyError::invalid_format("not a WOZ file")),
    };
    if data.len() < HEADER_LEN || data[4..8] != TAIL {
        return Err(FloppyError::parse(4, "WOZ header damaged"));
    }
    let mut warnings = Vec::new();
    let stored_crc = le32(data, 8);
    if stored_crc != 0 && stored_crc != crc32(&data[HEADER_LEN..]) {
        note(&mut warnings, options.strict, Warning::new(8, "CRC-32 mismatch"))?;
    }

    let mut chunks: BTreeMap<[u8; 4], (usize, &[u8])> = BTreeMap::new();
    let mut reader = ByteReader::at(data, HEADER_LEN);
    while reader.remaining() >= 8 {
        let id = reader.array::<4>()?;
        let size = reader.u32_le()? as usize;
        let at = reader.pos();
        match reader.bytes(size) {
            Ok(body) => {
                chunks.insert(id, (at, body));
            }
            Err(_) => {
                note(&mut warnings, options.strict, Warning::new(at, format!("chunk {} truncated", String::from_utf8_lossy(&id))))?;
                chunks.insert(id, (at, &data[at..]));
                break;
            }
        }
    }
    let (_, info) = chunks.get(b"INFO").ok_or_else(|| FloppyError::parse(HEADER_LEN, "INFO chunk missing"))?;
    let info_fields = parse_info(info)?;
    let (_, tmap) = chunks.get(b"TMAP").ok_or_else(|| FloppyError::parse(HEADER_LEN, "TMAP chunk missing"))?;
    let (trks_at, trks) = chunks.get(b"TRKS").copied().ok_or_else(|| FloppyError::parse(HEADER_LEN, "TRKS chunk missing"))?;

    let disk_type = info_fields.disk_type;
    let driver = disk_type.driver();
    let (cylinders, heads) = match disk_type {
        WozDiskType::FiveQuarter => (40u8, 1u8),
        WozDiskType::ThreeHalf => (80, 2),
    };
    let mut disk = Disk::new(Geometry::new(0, 1, 0, 256));
    for cylinder in 0..cylinders {
        for head in 0..heads {
            let index = match tmap.get(disk_type.slot(cylinder, head)) {
                Some(&EMPTY) | None => continue,
                Some(&i) => i as usize,
            };
            let (bytes, bit_count) = track_data(data, trks, trks_at, version2, index)?;
            if bit_count == 0 {
                continue;
            }
            let bits = Bitstream::from_bytes_msb(bytes, bit_count, info_fields.bit_timing_ns);
            let track = decode_bits(&bits, cylinder, head, Some(driver));
            debug!("woz: track {}.{} {} bits, {} sectors", cylinder, head, bit_count, track.sector_count());
            disk.add_track(track)?;
        }
    }
    disk.encoding = driver.encoding();
    disk.platform = match disk_type {
        WozDiskType::FiveQuarter => Platform::AppleII,
        WozDiskType::ThreeHalf => Platform::Mac,
    };
    disk.read_only = info_fields.write_protected;
    disk.geometry = match disk_type {
        WozDiskType::FiveQuarter => Geometry::new(disk.cylinder_count().max(35), 1, 16, 256).with_first_sector(0),
        WozDiskType::ThreeHalf => Geometry::new(80, disk.head_count().max(1), 12, 512).with_first_sector(0),
    };
    disk.mark_unchanged();

    let default_profile = match disk_type {
        WozDiskType::FiveQuarter => profile("apple2-dos33").ok(),
        WozDiskType::ThreeHalf if disk.head_count() == 2 => profile("mac-800k").ok(),
        WozDiskType::ThreeHalf => profile("mac-400k").ok(),
    };
    let mut image = Image::new(disk, "woz").with_profile(options.profile.or(default_profile));
    image.warnings = warnings;
    image.blobs.insert("woz-info".into(), info.to_vec());
    if let Some((_, meta)) = chunks.get(b"META") {
        image.blobs.insert("woz-meta".into(), meta.to_vec());
    }
    Ok(image)
}

/// Metadata pairs stored in an image's META chunk
pub fn metadata(image: &Image) -> BTreeMap<String, String> {
    image.blob("woz-meta").map(parse_meta).unwrap_or_default()
}

fn info_chunk(image: &Image, disk_type: WozDiskType, largest_blocks: u16) -> Vec<u8> {
    let stored = image.blob("woz-info").and_then(|i| parse_info(i).ok());
    let mut info = vec![2, disk_type.byte(), image.disk.read_only as u8];
    info.push(stored.as_ref().map(|s| s.synchronized as u8).unwrap_or(0));
    info.push(0);
    let mut creator = CREATOR.as_bytes().to_vec();
    creator.resize(32, b' ');
    info.extend_from_slice(&creator);
    info.push(image.disk.head_count().max(1));
    info.push(match disk_type {
        WozDiskType::FiveQuarter => 1,
        WozDiskType::ThreeHalf => 0,
    });
    info.push((disk_type.nominal_cell_ns() / 125.0) as u8);
    info.put_u16_le(0);
    info.put_u16_le(0);
    info.put_u16_le(largest_blocks);
    info.resize(INFO_LEN, 0);
    info
}

fn push_chunk(out: &mut Vec<u8>, id: &[u8], body: &[u8]) {
    out.extend_from_slice(id);
    out.put_u32_le(body.len() as u32);
    out.extend_from_slice(body);
}

/// Write a WOZ 2 image
fn serialize_woz(image: &Image) -> Result<Vec<u8>> {
    let disk = &image.disk;
    let disk_type = match disk.encoding {
        Encoding::GcrMac => WozDiskType::ThreeHalf,
        Encoding::GcrApple => WozDiskType::FiveQuarter,
        other => {
            return Err(FloppyError::unsupported(format!("WOZ holds Apple GCR tracks, not {}", other.name())));
        }
    };
    let driver = disk_type.driver();

    let mut tmap = vec![EMPTY; TMAP_LEN];
    let mut streams: Vec<(Vec<u8>, usize)> = Vec::new();
    for track in disk.tracks() {
        let bits = track_bits(track, driver, disk_type.nominal_cell_ns())?;
        let index = streams.len() as u8;
        let slot = disk_type.slot(track.cylinder, track.head);
        if slot >= TMAP_LEN {
            continue;
        }
        tmap[slot] = index;
        if disk_type == WozDiskType::FiveQuarter {
            // neighbouring quarter tracks read the same data
            if slot > 0 && tmap[slot - 1] == EMPTY {
                tmap[slot - 1] = index;
            }
            if slot + 1 < TMAP_LEN {
                tmap[slot + 1] = index;
            }
        }
        streams.push((bits.to_bytes_msb(), bits.len()));
    }

    let largest = streams.iter().map(|(b, _)| b.len().div_ceil(BLOCK)).max().unwrap_or(0) as u16;
    let mut out = WOZ2.to_vec();
    out.extend_from_slice(&TAIL);
    out.put_u32_le(0);
    push_chunk(&mut out, b"INFO", &info_chunk(image, disk_type, largest));
    push_chunk(&mut out, b"TMAP", &tmap);

    // TRKS: 160 entries, then block-aligned data starting right after them
    let trks_start = out.len() + 8;
    let first_block = (trks_start + TMAP_LEN * 8).div_ceil(BLOCK);
    let mut entries = Vec::with_capacity(TMAP_LEN * 8);
    let mut payload = Vec::new();
    let mut block = first_block;
    for (bytes, bit_count) in &streams {
        let blocks = bytes.len().div_ceil(BLOCK);
        entries.put_u16_le(block as u16);
        entries.put_u16_le(blocks as u16);
        entries.put_u32_le(*bit_count as u32);
        let mut padded = bytes.clone();
        padded.resize(blocks * BLOCK, 0);
        payload.extend(padded);
        block += blocks;
    }
    entries.resize(TMAP_LEN * 8, 0);
    let mut trks = entries;
    trks.resize(first_block * BLOCK - trks_start, 0);
    trks.extend(payload);
    push_chunk(&mut out, b"TRKS", &trks);

    if let Some(meta) = image.blob("woz-meta") {
        push_chunk(&mut out, b"META", meta);
    }
    let crc = crc32(&out[HEADER_LEN..]);
    out[8..12].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// WOZ codec
#[derive(Debug, Clone, Copy, Default)]
pub struct WozCodec;

impl ImageCodec for WozCodec {
    fn name(&self) -> &'static str {
        "woz"
    }

    fn description(&self) -> &'static str {
        "Applesauce WOZ bitstream"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["woz"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Bitstream
    }

    fn probe(&self, data: &[u8]) -> u8 {
        match data.get(..8) {
            Some(h) if (h.starts_with(WOZ1) || h.starts_with(WOZ2)) && h[4..] == TAIL => 100,
            Some(h) if h.starts_with(b"WOZ") => 90,
            _ => 0,
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_woz(data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_woz(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dos33_disk() -> Disk {
        let mut disk = Disk::builder().profile(profile("apple2-dos33").unwrap()).build().unwrap();
        disk.write_sector(17, 0, 0, &[0x11; 256]).unwrap();
        disk.write_sector(3, 0, 9, &(0..=255u8).collect::<Vec<_>>()).unwrap();
        disk
    }

    #[test]
    fn test_round_trip_sectors() {
        let bytes = serialize_woz(&Image::new(dos33_disk(), "do")).unwrap();
        assert_eq!(WozCodec.probe(&bytes), 100);
        let image = parse_woz(&bytes, &ParseOptions { strict: true, profile: None }).unwrap();
        assert_eq!(image.disk.track_count(), 35);
        assert_eq!(image.disk.read_sector(17, 0, 0).unwrap(), &[0x11; 256][..]);
        assert_eq!(image.disk.read_sector(3, 0, 9).unwrap()[200], 200);
        assert_eq!(image.profile.map(|p| p.name), Some("apple2-dos33"));
        assert!(image.disk.tracks().all(|t| t.good_sectors() == 16));
    }

    #[test]
    fn test_layout() {
        let bytes = serialize_woz(&Image::new(dos33_disk(), "do")).unwrap();
        assert_eq!(&bytes[12..16], b"INFO");
        let tmap_at = HEADER_LEN + 8 + INFO_LEN + 8;
        assert_eq!(&bytes[tmap_at - 8..tmap_at - 4], b"TMAP");
        assert_eq!(bytes[tmap_at], 0);
        assert_eq!(bytes[tmap_at + 1], 0);
        assert_eq!(bytes[tmap_at + 2], EMPTY);
        assert_eq!(bytes[tmap_at + 3], 1);
        assert_eq!(bytes[tmap_at + 4], 1);
        assert_eq!(bytes[tmap_at + 35 * 4], EMPTY);
        // track data starts after the 160 TRK entries
        let trks_at = tmap_at + TMAP_LEN + 8;
        let first = le16(&bytes, trks_at) as usize * BLOCK;
        assert!(first >= trks_at + TMAP_LEN * 8 && first < bytes.len());
        assert_eq!(le32(&bytes, 8), crc32(&bytes[HEADER_LEN..]));
    }

    #[test]
    fn test_reserialize_keeps_bitstreams() {
        let bytes = serialize_woz(&Image::new(dos33_disk(), "do")).unwrap();
        let image = parse_woz(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(serialize_woz(&image).unwrap(), bytes);
    }

    #[test]
    fn test_corrupted_crc() {
        let mut bytes = serialize_woz(&Image::new(dos33_disk(), "do")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(parse_woz(&bytes, &ParseOptions { strict: true, profile: None }).is_err());
        let image = parse_woz(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(image.warnings.len(), 1);
    }

    #[test]
    fn test_meta_pairs() {
        let mut image = Image::new(dos33_disk(), "do");
        image.blobs.insert("woz-meta".into(), b"title\tHello\nlanguage\tEnglish".to_vec());
        let bytes = serialize_woz(&image).unwrap();
        let back = parse_woz(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(metadata(&back).get("title").map(String::as_str), Some("Hello"));
    }
}
