//! Sydex Teledisk (TD0)
//!
//! A 12-byte header ("TD" plain, "td" LZHUF-compressed after the header),
//! an optional dated comment block, then track records each followed by
//! their sector records. Sector payloads are stored raw, as a repeated
//! two-byte pattern, or as a run of literal and pattern blocks.

use crate::disk::{DataRate, Disk, Geometry, RecordingMode, Sector, SectorId, Track};
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::image::{lzhuf, note, Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::{ByteReader, ByteWriter};
use log::debug;

const PLAIN: &[u8; 2] = b"TD";
const COMPRESSED: &[u8; 2] = b"td";
const HEADER_LEN: usize = 12;
const COMMENT_HEADER_LEN: usize = 10;
const END_OF_TRACKS: u8 = 0xFF;
const HAS_COMMENT: u8 = 0x80;
const FM_FLAG: u8 = 0x80;

const SECTOR_CRC_ERROR: u8 = 0x02;
const SECTOR_DELETED: u8 = 0x04;
const SECTOR_SKIPPED: u8 = 0x10;
const SECTOR_NO_DATA: u8 = 0x20;

/// Teledisk CRC-16 (polynomial 0xA097, zero initial value)
pub fn crc(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0xA097 } else { crc << 1 };
        }
    }
    crc
}

/// Expand a method-2 payload of literal and pattern blocks
fn expand_blocks(reader: &mut ByteReader, size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size);
    while out.len() < size {
        let kind = reader.u8()?;
        if kind == 0 {
            let len = reader.u8()? as usize;
            out.extend_from_slice(reader.bytes(len)?);
        } else {
            let pattern_len = 1usize << kind.min(7);
            let repeat = reader.u8()? as usize;
            let pattern = reader.bytes(pattern_len)?;
            for _ in 0..repeat {
                out.extend_from_slice(pattern);
            }
        }
    }
    out.truncate(size);
    Ok(out)
}

fn read_payload(reader: &mut ByteReader, size: usize) -> Result<Vec<u8>> {
    let at = reader.pos();
    let len = reader.u16_le()? as usize;
    if len == 0 {
        return Err(FloppyError::parse(at, "empty sector data block"));
    }
    let block = reader.bytes(len)?;
    let mut inner = ByteReader::new(block);
    let method = inner.u8()?;
    let mut data = match method {
        0 => inner.bytes(len - 1)?.to_vec(),
        1 => {
            let count = inner.u16_le()? as usize;
            let pattern = inner.array::<2>()?;
            pattern.iter().copied().cycle().take(count * 2).collect()
        }
        2 => expand_blocks(&mut inner, size)?,
        _ => return Err(FloppyError::parse(at + 2, format!("sector encoding method {}", method))),
    };
    data.resize(size, 0);
    Ok(data)
}

fn parse_td0(data: &[u8], options: &ParseOptions) -> Result<Image> {
    if data.len() < HEADER_LEN {
        return Err(FloppyError::parse(data.len(), "Teledisk header truncated"));
    }
    let compressed = match &data[..2] {
        s if s == PLAIN => false,
        s if s == COMPRESSED => true,
        _ => return Err(FloppyError::invalid_format("not a Teledisk file")),
    };
    let mut warnings = Vec::new();
    let stored_crc = u16::from_le_bytes([data[10], data[11]]);
    if crc(&data[..10]) != stored_crc {
        note(&mut warnings, options.strict, Warning::new(10, "header CRC mismatch"))?;
    }
    let rate = data[5];
    let stepping = data[7];
    let body = if compressed {
        lzhuf::decompress(&data[HEADER_LEN..])
    } else {
        data[HEADER_LEN..].to_vec()
    };
    // offsets below are into the (decompressed) body
    let mut reader = ByteReader::new(&body);
    let mut comment = None;
    if stepping & HAS_COMMENT != 0 {
        let header = reader.bytes(COMMENT_HEADER_LEN)?;
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let text = reader.bytes(len)?;
        let mut covered = header[2..].to_vec();
        covered.extend_from_slice(text);
        if crc(&covered) != u16::from_le_bytes([header[0], header[1]]) {
            note(&mut warnings, options.strict, Warning::new(0, "comment CRC mismatch"))?;
        }
        comment = Some((header[4..].to_vec(), text.to_vec()));
    }

    let mut disk = Disk::new(Geometry::new(0, 1, 0, 512));
    loop {
        let at = reader.pos();
        let count = match reader.u8() {
            Ok(END_OF_TRACKS) => break,
            Ok(count) => count,
            Err(e) => {
                note(&mut warnings, options.strict, Warning::new(at, "track list is not terminated"))?;
                debug!("td0: {}", e);
                break;
            }
        };
        let cylinder = reader.u8()?;
        let head_byte = reader.u8()?;
        let track_crc = reader.u8()?;
        if crc(&[count, cylinder, head_byte]) as u8 != track_crc {
            note(&mut warnings, options.strict, Warning::new(at + 3, format!("track {} header CRC mismatch", cylinder)))?;
        }
        let head = head_byte & 0x01;
        let fm = head_byte & FM_FLAG != 0 || rate & FM_FLAG != 0;
        let mut track = Track::new(cylinder, head);
        track.encoding = if fm { Encoding::Fm } else { Encoding::Mfm };
        track.recording_mode = if fm { RecordingMode::FM } else { RecordingMode::MFM };
        track.data_rate = if rate & 0x03 == 2 { DataRate::High } else { DataRate::SingleDouble };

        for _ in 0..count {
            let sector_at = reader.pos();
            let [c, h, r, n, flags, sector_crc] = reader.array::<6>()?;
            let id = SectorId::new(c, h, r, n);
            let size = if n <= 6 { 128usize << n } else { 0 };
            let payload = if flags & SECTOR_NO_DATA != 0 || size == 0 {
                Vec::new()
            } else if flags & SECTOR_SKIPPED != 0 {
                vec![0; size]
            } else {
                read_payload(&mut reader, size)?
            };
            if !payload.is_empty() && crc(&payload) as u8 != sector_crc {
                note(&mut warnings, options.strict, Warning::new(sector_at + 5, format!("sector {}.{}.{} data CRC mismatch", cylinder, head, r)))?;
            }
            let mut sector = Sector::with_data(id, payload);
            sector.data_crc_ok = flags & SECTOR_CRC_ERROR == 0 && !sector.data().is_empty();
            sector.deleted = flags & SECTOR_DELETED != 0;
            sector.encoding = track.encoding;
            track.add_sector(sector);
        }
        track.classify(count as usize);
        disk.add_track(track)?;
    }

    let layout = disk.track(0, 0).map(|first| {
        (
            first.sector_count() as u8,
            first.uniform_sector_size().unwrap_or(512) as u16,
            first.sector_ids().into_iter().min().unwrap_or(1),
            first.encoding,
        )
    });
    if let Some((sectors, size, first_id, encoding)) = layout {
        disk.geometry.sectors_per_track = sectors;
        disk.geometry.sector_size = size;
        disk.geometry.first_sector_id = first_id;
        disk.encoding = encoding;
    }
    disk.mark_unchanged();
    debug!("td0: {} tracks, compressed={}", disk.track_count(), compressed);

    let mut image = Image::new(disk, "td0").with_profile(options.profile);
    image.warnings = warnings;
    image.blobs.insert("td0-header".into(), data[2..10].to_vec());
    if let Some((date, text)) = comment {
        image.blobs.insert("td0-date".into(), date);
        image.blobs.insert("comment".into(), text);
    }
    Ok(image)
}

fn encode_payload(data: &[u8], out: &mut Vec<u8>) {
    let uniform_pairs = data.len() >= 2 && data.len() % 2 == 0 && data.chunks(2).all(|p| p == &data[..2]);
    if uniform_pairs {
        out.put_u16_le(5);
        out.push(1);
        out.put_u16_le((data.len() / 2) as u16);
        out.extend_from_slice(&data[..2]);
    } else {
        out.put_u16_le(data.len() as u16 + 1);
        out.push(0);
        out.extend_from_slice(data);
    }
}

/// Write an uncompressed ("TD") Teledisk image
fn serialize_td0(image: &Image) -> Result<Vec<u8>> {
    let disk = &image.disk;
    let fm = disk.encoding == Encoding::Fm;
    let high = disk.tracks().any(|t| t.data_rate == DataRate::High);
    let mut header = match image.blob("td0-header") {
        Some(stored) if stored.len() == 8 => stored.to_vec(),
        _ => vec![0, 0, 21, if high { 2 } else { 0 } | if fm { FM_FLAG } else { 0 }, if high { 2 } else { 3 }, 0, 0, disk.head_count().max(1)],
    };
    let comment = image.blob("comment");
    if comment.is_some() {
        header[5] |= HAS_COMMENT;
    } else {
        header[5] &= !HAS_COMMENT;
    }

    let mut out = PLAIN.to_vec();
    out.extend_from_slice(&header);
    let header_crc = crc(&out);
    out.put_u16_le(header_crc);

    if let Some(text) = comment {
        let mut block = Vec::new();
        block.put_u16_le(text.len() as u16);
        match image.blob("td0-date") {
            Some(date) if date.len() == 6 => block.extend_from_slice(date),
            _ => block.extend_from_slice(&[0; 6]),
        }
        block.extend_from_slice(text);
        out.put_u16_le(crc(&block));
        out.extend_from_slice(&block);
    }

    for track in disk.tracks() {
        if track.sector_count() > 0xFE {
            return Err(FloppyError::unsupported("Teledisk tracks hold at most 254 sectors"));
        }
        let head_byte = track.head | if track.encoding == Encoding::Fm && !fm { FM_FLAG } else { 0 };
        let head = [track.sector_count() as u8, track.cylinder, head_byte];
        out.extend_from_slice(&head);
        out.push(crc(&head) as u8);
        for sector in track.sectors() {
            let data = sector.data();
            let mut flags = 0;
            if !sector.data_crc_ok && !data.is_empty() {
                flags |= SECTOR_CRC_ERROR;
            }
            if sector.deleted {
                flags |= SECTOR_DELETED;
            }
            if data.is_empty() {
                flags |= SECTOR_NO_DATA;
            }
            let id = sector.id;
            let sector_crc = if data.is_empty() { 0 } else { crc(data) as u8 };
            out.extend_from_slice(&[id.cylinder, id.head, id.sector, id.size_code, flags, sector_crc]);
            if !data.is_empty() {
                encode_payload(data, &mut out);
            }
        }
    }
    out.push(END_OF_TRACKS);
    Ok(out)
}

/// Teledisk codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Td0Codec;

impl ImageCodec for Td0Codec {
    fn name(&self) -> &'static str {
        "td0"
    }

    fn description(&self) -> &'static str {
        "Sydex Teledisk"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["td0"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if data.len() < HEADER_LEN || !(data.starts_with(PLAIN) || data.starts_with(COMPRESSED)) {
            return 0;
        }
        if crc(&data[..10]) == u16::from_le_bytes([data[10], data[11]]) {
            95
        } else {
            10
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_td0(data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_td0(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn sample_image() -> Image {
        let mut disk = Disk::builder().profile(profile("pc-720k").unwrap()).build().unwrap();
        disk.write_sector(3, 1, 4, &(0..512u32).map(|i| (i * 7) as u8).collect::<Vec<_>>()).unwrap();
        disk.track_mut(0, 0).unwrap().get_sector_mut(2).unwrap().data_crc_ok = false;
        let mut image = Image::new(disk, "td0");
        image.blobs.insert("comment".into(), b"archived".to_vec());
        image
    }

    #[test]
    fn test_plain_round_trip() {
        let bytes = serialize_td0(&sample_image()).unwrap();
        assert_eq!(Td0Codec.probe(&bytes), 95);
        let image = parse_td0(&bytes, &ParseOptions { strict: true, profile: None }).unwrap();
        assert_eq!(image.disk.track_count(), 160);
        assert_eq!(image.disk.read_sector(3, 1, 4).unwrap()[1], 7);
        assert!(!image.disk.sector(0, 0, 2).unwrap().data_crc_ok);
        assert_eq!(image.blob("comment"), Some(&b"archived"[..]));
        assert_eq!(serialize_td0(&image).unwrap(), bytes);
    }

    #[test]
    fn test_compressed_body() {
        let plain = serialize_td0(&sample_image()).unwrap();
        let mut packed = COMPRESSED.to_vec();
        packed.extend_from_slice(&plain[2..10]);
        let header_crc = crc(&packed);
        packed.put_u16_le(header_crc);
        packed.extend(lzhuf::encode_literals(&plain[HEADER_LEN..]));

        let image = parse_td0(&packed, &ParseOptions::default()).unwrap();
        assert!(image.warnings.is_empty());
        assert_eq!(image.disk.read_sector(3, 1, 4).unwrap()[2], 14);
    }

    #[test]
    fn test_pattern_blocks() {
        let block = [0u8, 2, 0xAA, 0xBB, 1, 3, 0x11, 0x22];
        let mut reader = ByteReader::new(&block);
        let out = expand_blocks(&mut reader, 8).unwrap();
        assert_eq!(out, [0xAA, 0xBB, 0x11, 0x22, 0x11, 0x22, 0x11, 0x22]);
    }

    #[test]
    fn test_last_cylinder_number_rejected() {
        let mut bytes = PLAIN.to_vec();
        bytes.extend_from_slice(&[0, 0, 0x15, 0x02, 0, 0, 0, 2]);
        let header_crc = crc(&bytes);
        bytes.put_u16_le(header_crc);
        for cylinder in [254u8, 255] {
            let mut file = bytes.clone();
            file.extend_from_slice(&[0, cylinder, 0, crc(&[0, cylinder, 0]) as u8, END_OF_TRACKS]);
            let parsed = parse_td0(&file, &ParseOptions::default());
            if cylinder == 254 {
                assert_eq!(parsed.unwrap().disk.geometry.cylinders, 255);
            } else {
                assert_eq!(parsed.unwrap_err().kind(), crate::error::ErrorKind::Corrupt);
            }
        }
    }

    #[test]
    fn test_bad_header_crc() {
        let mut bytes = serialize_td0(&sample_image()).unwrap();
        bytes[4] ^= 1;
        assert_eq!(Td0Codec.probe(&bytes), 10);
        assert!(parse_td0(&bytes, &ParseOptions { strict: true, profile: None }).is_err());
        assert!(!parse_td0(&bytes, &ParseOptions::default()).unwrap().warnings.is_empty());
    }
}
