//! SPS/CAPS IPF (read only)
//!
//! A chain of records, each a 12-byte header (four-character type,
//! big-endian length, CRC-32 of the record with its CRC field zeroed).
//! `INFO` names the platform and track range, one `IMGE` per track gives
//! its layout and a data key, and the `DATA` record with that key is
//! followed by block descriptors and an element stream describing the
//! cells: sync and raw elements are literal cells, data and gap elements
//! are bytes to MFM-encode, fuzzy elements are weak cells.

use crate::disk::{Disk, Geometry};
use crate::encoding::crc::crc32;
use crate::encoding::mfm;
use crate::error::{FloppyError, Result, Warning};
use crate::image::{note, Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::be32;
use crate::pll::{BitTag, Bitstream};
use crate::profile::{profile, Platform, PlatformProfile};
use crate::track::{decode_bits, driver};
use log::debug;
use std::collections::HashMap;

const RECORD_HEADER: usize = 12;
const BLOCK_DESCRIPTOR: usize = 32;
const DATA_IN_BITS: u32 = 0x04;

/// Platform codes of the INFO record
fn platform_for(code: u32) -> Option<(Platform, &'static str)> {
    match code {
        1 => Some((Platform::Amiga, "amiga-dd")),
        2 => Some((Platform::AtariSt, "atari-st-ds")),
        3 => Some((Platform::Pc, "pc-720k")),
        4 => Some((Platform::AmstradCpc, "cpc-data")),
        5 => Some((Platform::Spectrum, "spectrum-plus3")),
        6 => Some((Platform::SamCoupe, "sam")),
        _ => None,
    }
}

struct Record<'a> {
    kind: [u8; 4],
    offset: usize,
    body: &'a [u8],
    extra: &'a [u8],
}

fn records<'a>(data: &'a [u8], strict: bool, warnings: &mut Vec<Warning>) -> Result<Vec<Record<'a>>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + RECORD_HEADER <= data.len() {
        let kind = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
        let length = be32(data, pos + 4) as usize;
        let stored = be32(data, pos + 8);
        if length < RECORD_HEADER || pos + length > data.len() {
            return Err(FloppyError::parse(pos, format!("record length {} out of range", length)));
        }
        let mut copy = data[pos..pos + length].to_vec();
        copy[8..12].fill(0);
        if crc32(&copy) != stored {
            let name = String::from_utf8_lossy(&kind).to_string();
            note(warnings, strict, Warning::new(pos, format!("{} record checksum mismatch", name)))?;
        }
        let body = &data[pos + RECORD_HEADER..pos + length];
        let extra_len = if &kind == b"DATA" { be32(body, 0) as usize } else { 0 };
        let extra_start = pos + length;
        let extra = data
            .get(extra_start..extra_start + extra_len)
            .ok_or_else(|| FloppyError::parse(extra_start, "DATA payload truncated"))?;
        if extra_len > 0 && crc32(extra) != be32(body, 8) {
            note(warnings, strict, Warning::new(extra_start, "DATA payload checksum mismatch"))?;
        }
        out.push(Record {
            kind,
            offset: pos,
            body,
            extra,
        });
        pos = extra_start + extra_len;
    }
    if pos != data.len() {
        note(warnings, strict, Warning::new(pos, "trailing bytes after last record"))?;
    }
    Ok(out)
}

/// Layout of one track from its IMGE record
#[derive(Debug, Clone, Copy)]
struct TrackInfo {
    cylinder: u8,
    head: u8,
    density: u32,
    track_bits: usize,
    block_count: usize,
    data_key: u32,
}

impl TrackInfo {
    fn parse(body: &[u8]) -> Self {
        let word = |i: usize| be32(body, i * 4);
        Self {
            cylinder: word(0) as u8,
            head: word(1) as u8,
            density: word(2),
            track_bits: word(9) as usize,
            block_count: word(10) as usize,
            data_key: word(13),
        }
    }
}

/// Append `len` bits of `bytes` as literal cells
fn push_cells(bits: &mut Bitstream, bytes: &[u8], len: usize) {
    for i in 0..len.min(bytes.len() * 8) {
        bits.push((bytes[i / 8] >> (7 - i % 8)) & 1, BitTag::Confident);
    }
}

/// Append `len` data bits of `bytes` MFM-encoded; returns the last data bit
fn push_mfm(bits: &mut Bitstream, bytes: &[u8], len: usize, prev: u8) -> u8 {
    let data: Vec<u8> = (0..len.min(bytes.len() * 8))
        .map(|i| (bytes[i / 8] >> (7 - i % 8)) & 1)
        .collect();
    let mut cells = Vec::with_capacity(data.len() * 2);
    let last = mfm::encode_data_bits(&data, prev, &mut cells);
    bits.extend_bits(&cells);
    last
}

/// Cells for one track from its block descriptors and element streams
fn track_cells(info: &TrackInfo, extra: &[u8], cell_ns: f64) -> Result<Bitstream> {
    let mut bits = Bitstream::new(cell_ns);
    bits.mark_revolution();
    let mut prev = 0u8;
    for block in 0..info.block_count {
        let at = block * BLOCK_DESCRIPTOR;
        if at + BLOCK_DESCRIPTOR > extra.len() {
            return Err(FloppyError::parse(at, format!("block descriptor {} truncated", block)));
        }
        let word = |i: usize| be32(extra, at + i * 4);
        let (block_bits, gap_bits, flags, gap_default, data_offset) =
            (word(0) as usize, word(1) as usize, word(5), word(6), word(7) as usize);
        let start = bits.len();
        let mut pos = data_offset;
        while let Some(&head) = extra.get(pos) {
            pos += 1;
            let kind = head & 0x1F;
            if kind == 0 {
                break;
            }
            let width = (head >> 5) as usize;
            let size = extra
                .get(pos..pos + width)
                .ok_or_else(|| FloppyError::parse(pos, "element size truncated"))?
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            pos += width;
            let bit_len = if flags & DATA_IN_BITS != 0 { size } else { size * 8 };
            if kind == 5 {
                // fuzzy: no stored bytes, just unreliable cells
                for i in 0..bit_len {
                    bits.push((i % 2) as u8, BitTag::Weak);
                }
                continue;
            }
            let byte_len = bit_len.div_ceil(8);
            let payload = extra
                .get(pos..pos + byte_len)
                .ok_or_else(|| FloppyError::parse(pos, "element data truncated"))?;
            pos += byte_len;
            match kind {
                1 | 4 => {
                    push_cells(&mut bits, payload, bit_len);
                    prev = payload.last().map(|b| b & 1).unwrap_or(prev);
                }
                2 | 3 => prev = push_mfm(&mut bits, payload, bit_len, prev),
                other => debug!("ipf: skipping element type {}", other),
            }
        }
        if block_bits > 0 && bits.len() > start + block_bits {
            debug!("ipf: block {} overran its {} cells", block, block_bits);
        }
        let gap = [gap_default as u8];
        let mut remaining = gap_bits / 2;
        while remaining > 0 {
            let n = remaining.min(8);
            prev = push_mfm(&mut bits, &gap, n, prev);
            remaining -= n;
        }
    }
    if info.track_bits > 0 && bits.len() < info.track_bits {
        let pad = [0u8];
        while bits.len() + 1 < info.track_bits {
            prev = push_mfm(&mut bits, &pad, 1, prev);
        }
    }
    Ok(bits)
}

fn parse_ipf(data: &[u8], options: &ParseOptions) -> Result<Image> {
    if !data.starts_with(b"CAPS") {
        return Err(FloppyError::invalid_format("not an IPF file"));
    }
    let mut warnings = Vec::new();
    let records = records(data, options.strict, &mut warnings)?;

    let info = records
        .iter()
        .find(|r| &r.kind == b"INFO")
        .ok_or_else(|| FloppyError::parse(RECORD_HEADER, "INFO record missing"))?;
    let encoder = be32(info.body, 4);
    if encoder != 1 && encoder != 2 {
        return Err(FloppyError::unsupported(format!("IPF encoder type {}", encoder)));
    }
    let platform = (12..16)
        .map(|i| be32(info.body, i * 4))
        .find_map(platform_for);
    let matched: Option<&'static PlatformProfile> = options
        .profile
        .or_else(|| platform.and_then(|(_, name)| profile(name).ok()));
    let hint = matched.and_then(|p| driver(p.track_driver).ok());

    let data_by_key: HashMap<u32, &Record> = records
        .iter()
        .filter(|r| &r.kind == b"DATA")
        .map(|r| (be32(r.body, 12), r))
        .collect();

    let mut disk = Disk::new(Geometry::new(0, 1, 0, 512));
    for r in records.iter().filter(|r| &r.kind == b"IMGE") {
        let track = TrackInfo::parse(r.body);
        let Some(payload) = data_by_key.get(&track.data_key) else {
            note(
                &mut warnings,
                options.strict,
                Warning::new(r.offset, format!("track {}.{} has no DATA record", track.cylinder, track.head)),
            )?;
            continue;
        };
        if track.density == 1 {
            // unformatted noise track
            continue;
        }
        let cell = if track.track_bits > 150_000 { 1000.0 } else { 2000.0 };
        let bits = track_cells(&track, payload.extra, cell)?;
        disk.add_track(decode_bits(&bits, track.cylinder, track.head, hint))?;
    }

    if let Some(p) = matched {
        disk.geometry = Geometry {
            cylinders: disk.geometry.cylinders,
            heads: disk.geometry.heads,
            ..p.geometry
        };
        disk.encoding = p.encoding;
        disk.platform = p.platform;
    } else {
        let first = disk
            .tracks()
            .find(|t| !t.is_empty())
            .map(|t| (t.encoding, t.sector_count() as u8, t.uniform_sector_size().unwrap_or(512) as u16));
        if let Some((encoding, sectors, size)) = first {
            disk.encoding = encoding;
            disk.geometry.sectors_per_track = sectors;
            disk.geometry.sector_size = size;
        }
    }
    disk.read_only = true;
    disk.mark_unchanged();

    let mut image = Image::new(disk, "ipf").with_profile(matched);
    image.warnings = warnings;
    image.blobs.insert("ipf-info".into(), info.body.to_vec());
    Ok(image)
}

/// IPF preservation images
#[derive(Debug, Clone, Copy, Default)]
pub struct IpfCodec;

impl ImageCodec for IpfCodec {
    fn name(&self) -> &'static str {
        "ipf"
    }

    fn description(&self) -> &'static str {
        "SPS/CAPS IPF preservation image (read only)"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ipf"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Bitstream
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if data.starts_with(b"CAPS") && be32(data, 4) == RECORD_HEADER as u32 {
            95
        } else {
            0
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_ipf(data, options)
    }

    fn can_write(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::crc::crc16;
    use crate::error::ErrorKind;
    use crate::image::detect;
    use crate::io::ByteWriter;

    fn record(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = kind.to_vec();
        out.put_u32_be((RECORD_HEADER + body.len()) as u32);
        out.put_u32_be(0);
        out.extend_from_slice(body);
        let crc = crc32(&out);
        out[8..12].copy_from_slice(&crc.to_be_bytes());
        out
    }

    fn words(values: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        for &v in values {
            out.put_u32_be(v);
        }
        out
    }

    fn element(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![(2 << 5) | kind];
        out.put_u16_be(payload.len() as u16);
        out.extend_from_slice(payload);
        out
    }

    /// One IBM sector (C0 H0 R1 N2) as sync and data elements
    fn pc_track_stream() -> Vec<u8> {
        let sync = [0x44, 0x89, 0x44, 0x89, 0x44, 0x89];
        let header = [0xFE, 0, 0, 1, 2];
        let mut crc_in = vec![0xA1; 3];
        crc_in.extend_from_slice(&header);
        let mut header_field = header.to_vec();
        header_field.extend_from_slice(&crc16(&crc_in).to_be_bytes());

        let mut data_field = vec![0xFB];
        data_field.extend(std::iter::repeat(0x3C).take(512));
        let mut crc_in = vec![0xA1; 3];
        crc_in.extend_from_slice(&data_field);
        data_field.extend_from_slice(&crc16(&crc_in).to_be_bytes());

        let mut s = element(2, &[0x4E; 40]);
        s.extend(element(2, &[0; 12]));
        s.extend(element(1, &sync));
        s.extend(element(2, &header_field));
        s.extend(element(2, &[0x4E; 22]));
        s.extend(element(2, &[0; 12]));
        s.extend(element(1, &sync));
        s.extend(element(2, &data_field));
        s.push(0);
        s
    }

    fn sample_ipf(platform: u32) -> Vec<u8> {
        let mut file = record(b"CAPS", &[]);
        let mut info = vec![1, 2, 1, 1, 1, 0, 0, 0, 0, 0, 20_261_018, 0];
        info.extend([platform, 0, 0, 0, 1, 0, 0, 0, 0]);
        file.extend(record(b"INFO", &words(&info)));
        file.extend(record(
            b"IMGE",
            &words(&[0, 0, 2, 1, 0, 0, 0, 0, 0, 100_000, 1, 0, 0, 7, 0, 0, 0]),
        ));
        let stream = pc_track_stream();
        let mut extra = words(&[0, 400, 0, 0, 1, 0, 0x4E, BLOCK_DESCRIPTOR as u32]);
        extra.extend(stream);
        let body = words(&[extra.len() as u32, 0, crc32(&extra), 7]);
        file.extend(record(b"DATA", &body));
        file.extend(extra);
        file
    }

    #[test]
    fn test_decodes_pc_track() {
        let data = sample_ipf(3);
        assert_eq!(detect(None, &data).unwrap().codec.name(), "ipf");
        let image = parse_ipf(&data, &ParseOptions { strict: true, ..ParseOptions::default() }).unwrap();
        assert!(image.warnings.is_empty());
        assert_eq!(image.profile.unwrap().platform, Platform::Pc);
        let track = image.disk.track(0, 0).unwrap();
        assert_eq!(track.sector_count(), 1);
        let sector = track.get_sector(1).unwrap();
        assert!(sector.data_crc_ok);
        assert_eq!(sector.data(), &[0x3C; 512][..]);
        assert!(image.disk.read_only);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut data = sample_ipf(3);
        // inside the sector payload
        let at = data.len() - 20;
        data[at] ^= 0xFF;
        let strict = ParseOptions {
            strict: true,
            ..ParseOptions::default()
        };
        assert!(parse_ipf(&data, &strict).is_err());
        let lenient = parse_ipf(&data, &ParseOptions::default()).unwrap();
        assert!(!lenient.warnings.is_empty());
    }

    #[test]
    fn test_not_writable() {
        let image = parse_ipf(&sample_ipf(0), &ParseOptions::default()).unwrap();
        assert!(image.profile.is_none());
        assert!(!IpfCodec.can_write());
        assert_eq!(IpfCodec.serialize(&image).unwrap_err().kind(), ErrorKind::Unsupported);
    }
}
