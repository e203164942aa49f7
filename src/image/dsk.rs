//! CPCEMU DSK and extended DSK
//!
//! A 256-byte disk information block is followed by one track block per
//! cylinder and head (cylinder-major). Each track block starts with a
//! 256-byte `Track-Info` header listing the sectors' CHRN and uPD765
//! status registers; sector payloads follow in physical order.
//!
//! Extended files give every track its own size (in 256-byte units, 0 for
//! an unformatted track) and every sector its own stored length. A stored
//! length that is a multiple of the sector size holds several reads of a
//! weak sector back to back.

use crate::disk::{DataRate, Disk, Geometry, RecordingMode, Sector, SectorId, Track, TrackStatus};
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::fdc::{registers_for, FdcStatus1, FdcStatus2};
use crate::image::{note, Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::{le16, ByteWriter};
use crate::profile::{profile, Platform, PlatformProfile};
use log::debug;

/// Standard DSK signature
pub const STANDARD_SIGNATURE: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
/// Extended DSK signature
pub const EXTENDED_SIGNATURE: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
/// Track block marker
pub const TRACK_MARKER: &[u8] = b"Track-Info\r\n";

const INFO_BLOCK: usize = 0x100;
const CREATOR_AT: usize = 0x22;
const CREATOR_LEN: usize = 14;
const TRACKS_AT: usize = 0x30;
const SIDES_AT: usize = 0x31;
const TRACK_SIZE_AT: usize = 0x32;
const SIZE_TABLE_AT: usize = 0x34;
const SECTOR_INFO_AT: usize = 0x18;
const SECTOR_INFO_LEN: usize = 8;
/// Largest payload a DSK stores for one sector
const MAX_STORED: usize = 0x1800;
const CREATOR: &[u8] = b"unifloppy";

/// Bytes a DSK stores for a sector of size code `n`
pub fn stored_bytes(size_code: u8) -> usize {
    (128usize << size_code.min(6)).min(MAX_STORED)
}

/// Container variant, kept in [`Image::blobs`] under `"dsk"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DskVariant {
    /// Fixed track size, no per-sector lengths
    Standard,
    /// Per-track sizes and per-sector lengths
    Extended,
}

fn variant_of(data: &[u8]) -> Option<DskVariant> {
    if data.starts_with(&EXTENDED_SIGNATURE[..8]) {
        Some(DskVariant::Extended)
    } else if data.starts_with(&STANDARD_SIGNATURE[..8]) {
        Some(DskVariant::Standard)
    } else {
        None
    }
}

/// Split a stored payload into its copies and build the sector
fn build_sector(id: SectorId, st1: u8, st2: u8, stored: Vec<u8>) -> Sector {
    let size = id.size_bytes();
    let copies = if size > 0 && stored.len() > size && stored.len() % size == 0 {
        stored.len() / size
    } else {
        1
    };
    if copies == 1 {
        return Sector::with_status(id, FdcStatus1::new(st1), FdcStatus2::new(st2), stored);
    }
    let variants: Vec<Vec<u8>> = stored.chunks(size).map(|c| c.to_vec()).collect();
    let mut mask = vec![0u8; size];
    for v in &variants[1..] {
        for (m, (a, b)) in mask.iter_mut().zip(variants[0].iter().zip(v)) {
            *m |= a ^ b;
        }
    }
    let mut sector = Sector::with_status(id, FdcStatus1::new(st1), FdcStatus2::new(st2), variants[0].clone());
    sector.weak = true;
    sector.weak_mask = Some(mask);
    sector.variants = variants;
    sector
}

fn parse_track(block: &[u8], variant: DskVariant, at: usize, cylinder: u8, head: u8, warnings: &mut Vec<Warning>, strict: bool) -> Result<Track> {
    if !block.starts_with(&TRACK_MARKER[..10]) {
        return Err(FloppyError::parse(at, format!("missing Track-Info for track {}.{}", cylinder, head)));
    }
    if block.len() < INFO_BLOCK {
        return Err(FloppyError::parse(at, "track block shorter than its header"));
    }
    let mut track = Track::new(cylinder, head);
    track.data_rate = DataRate::from(block[0x12]);
    track.recording_mode = RecordingMode::from(block[0x13]);
    let track_size_code = block[0x14];
    let count = block[0x15] as usize;
    track.gap3_length = block[0x16];
    track.filler_byte = block[0x17];
    track.encoding = match track.recording_mode {
        RecordingMode::FM => Encoding::Fm,
        _ => Encoding::Mfm,
    };
    if block[0x10] != cylinder || block[0x11] != head {
        note(
            warnings,
            strict,
            Warning::new(at + 0x10, format!("track block {}.{} found where {}.{} was expected", block[0x10], block[0x11], cylinder, head)),
        )?;
    }

    let mut offset = INFO_BLOCK;
    for i in 0..count {
        let info_at = SECTOR_INFO_AT + i * SECTOR_INFO_LEN;
        let Some(info) = block.get(info_at..info_at + SECTOR_INFO_LEN) else {
            note(warnings, strict, Warning::new(at + info_at, "sector list runs past the track header"))?;
            break;
        };
        let id = SectorId::new(info[0], info[1], info[2], info[3]);
        let length = match variant {
            DskVariant::Extended => le16(info, 6) as usize,
            DskVariant::Standard => stored_bytes(track_size_code),
        };
        let end = offset + length;
        let mut stored = block.get(offset..end.min(block.len())).unwrap_or(&[]).to_vec();
        if stored.len() < length {
            note(warnings, strict, Warning::new(at + offset, format!("sector {} truncated", id.sector)))?;
            stored.resize(length, track.filler_byte);
        }
        offset = end;
        let mut sector = build_sector(id, info[4], info[5], stored);
        sector.encoding = track.encoding;
        track.add_sector(sector);
    }
    track.classify(count);
    Ok(track)
}

fn guess_profile(disk: &Disk) -> Option<&'static PlatformProfile> {
    let first = disk.track(0, 0)?.sectors_by_id().first()?.id.sector;
    let name = match first {
        0xC1 => "cpc-data",
        0x41 => "cpc-system",
        1 if disk.head_count() == 1 => "spectrum-plus3",
        _ => return None,
    };
    profile(name).ok()
}

fn parse_dsk(data: &[u8], options: &ParseOptions) -> Result<Image> {
    let variant = variant_of(data).ok_or_else(|| FloppyError::invalid_format("not a DSK file"))?;
    if data.len() < INFO_BLOCK {
        return Err(FloppyError::parse(data.len(), "disk information block truncated"));
    }
    let mut warnings = Vec::new();
    let tracks = data[TRACKS_AT];
    let sides = data[SIDES_AT];
    if sides == 0 || sides > 2 {
        return Err(FloppyError::parse(SIDES_AT, format!("{} sides", sides)));
    }
    let standard_size = le16(data, TRACK_SIZE_AT) as usize;

    let mut disk = Disk::new(Geometry::new(tracks.max(1), sides, 0, 512));
    disk.platform = Platform::AmstradCpc;
    disk.encoding = Encoding::Mfm;
    let mut at = INFO_BLOCK;
    for index in 0..tracks as usize * sides as usize {
        let cylinder = (index / sides as usize) as u8;
        let head = (index % sides as usize) as u8;
        let size = match variant {
            DskVariant::Standard => standard_size,
            DskVariant::Extended => data.get(SIZE_TABLE_AT + index).copied().unwrap_or(0) as usize * 256,
        };
        if size == 0 {
            continue;
        }
        let Some(block) = data.get(at..(at + size).min(data.len())).filter(|b| !b.is_empty()) else {
            note(&mut warnings, options.strict, Warning::new(at, format!("file ends before track {}.{}", cylinder, head)))?;
            break;
        };
        let track = parse_track(block, variant, at, cylinder, head, &mut warnings, options.strict)?;
        disk.add_track(track)?;
        at += size;
    }
    if at < data.len() {
        note(&mut warnings, options.strict, Warning::new(at, format!("{} trailing bytes", data.len() - at)))?;
    }

    let layout = disk.tracks().find(|t| !t.is_empty()).map(|track| {
        let first = track.sectors_by_id().first().map(|s| s.id.sector).unwrap_or(1);
        (track.sector_count() as u8, track.uniform_sector_size().unwrap_or(512) as u16, first)
    });
    if let Some((sectors, size, first)) = layout {
        disk.geometry.sectors_per_track = sectors;
        disk.geometry.sector_size = size;
        disk.geometry.first_sector_id = first;
    }
    disk.mark_unchanged();
    debug!("dsk: {:?}, {} tracks, {} sides", variant, tracks, sides);

    let profile = options.profile.or_else(|| guess_profile(&disk));
    let mut image = Image::new(disk, "dsk").with_profile(profile);
    image.warnings = warnings;
    image.blobs.insert("dsk".into(), vec![(variant == DskVariant::Extended) as u8, tracks, sides]);
    image.blobs.insert("creator".into(), data[CREATOR_AT..CREATOR_AT + CREATOR_LEN].to_vec());
    image.blobs.insert("dsk-signature".into(), data[..CREATOR_AT].to_vec());
    Ok(image)
}

/// Stored payload of a sector: every variant for weak sectors
fn stored_payload(sector: &Sector, variant: DskVariant) -> Vec<u8> {
    let limit = stored_bytes(sector.id.size_code);
    match variant {
        DskVariant::Standard => {
            let mut out = sector.data()[..sector.data().len().min(limit)].to_vec();
            out.resize(limit, 0);
            out
        }
        DskVariant::Extended => {
            if sector.variants.len() > 1 && sector.variants[0] == sector.data() {
                sector.variants.concat()
            } else {
                sector.data().to_vec()
            }
        }
    }
}

fn track_block(track: Option<&Track>, cylinder: u8, head: u8, variant: DskVariant, padded_to: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(padded_to.max(INFO_BLOCK));
    out.extend_from_slice(TRACK_MARKER);
    out.resize(0x10, 0);
    let sectors: &[Sector] = track.map(|t| t.sectors()).unwrap_or(&[]);
    let (rate, mode, gap3, filler) = match track {
        Some(t) => (t.data_rate.into(), t.recording_mode.into(), t.gap3_length, t.filler_byte),
        None => (0u8, 0u8, 0x4E, 0xE5),
    };
    let size_code = sectors.first().map(|s| s.id.size_code).unwrap_or(2);
    out.extend_from_slice(&[cylinder, head, rate, mode, size_code, sectors.len() as u8, gap3, filler]);

    let payloads: Vec<Vec<u8>> = sectors.iter().map(|s| stored_payload(s, variant)).collect();
    for (sector, payload) in sectors.iter().zip(&payloads) {
        let (st1, st2) = registers_for(sector);
        let id = sector.id;
        out.extend_from_slice(&[id.cylinder, id.head, id.sector, id.size_code, st1.0, st2.0]);
        match variant {
            DskVariant::Extended => out.put_u16_le(payload.len() as u16),
            DskVariant::Standard => out.put_u16_le(0),
        }
    }
    out.resize(INFO_BLOCK, 0);
    for payload in payloads {
        out.extend_from_slice(&payload);
    }
    let target = padded_to.max(out.len().div_ceil(256) * 256);
    out.resize(target, 0);
    out
}

fn serialize_dsk(image: &Image) -> Result<Vec<u8>> {
    let disk = &image.disk;
    let stored = image.blob("dsk");
    let variant = match stored.and_then(|b| b.first()) {
        Some(0) => DskVariant::Standard,
        _ => DskVariant::Extended,
    };
    let tracks = stored.and_then(|b| b.get(1)).copied().unwrap_or(0).max(disk.cylinder_count());
    let sides = stored.and_then(|b| b.get(2)).copied().unwrap_or(0).max(disk.head_count()).max(1);
    if disk.tracks().any(|t| t.sector_count() > (INFO_BLOCK - SECTOR_INFO_AT) / SECTOR_INFO_LEN) {
        return Err(FloppyError::unsupported("DSK track headers hold at most 29 sectors"));
    }

    let mut blocks = Vec::new();
    for c in 0..tracks {
        for h in 0..sides {
            let track = disk.track(c, h);
            let unformatted = track.map(|t| t.is_empty() && t.status == TrackStatus::Empty).unwrap_or(true);
            blocks.push((c, h, track, unformatted));
        }
    }

    let canonical = match variant {
        DskVariant::Standard => STANDARD_SIGNATURE,
        DskVariant::Extended => EXTENDED_SIGNATURE,
    };
    // other tools vary the text after the variant prefix
    let signature = image
        .blob("dsk-signature")
        .filter(|s| s.len() == CREATOR_AT && s.starts_with(&canonical[..8]))
        .unwrap_or(canonical);
    let mut out = signature.to_vec();
    out.resize(CREATOR_AT, 0);
    let creator = image.blob("creator").unwrap_or(CREATOR);
    out.extend_from_slice(&creator[..creator.len().min(CREATOR_LEN)]);
    out.resize(TRACKS_AT, 0);
    out.push(tracks);
    out.push(sides);

    let mut body = Vec::new();
    match variant {
        DskVariant::Standard => {
            let size = blocks
                .iter()
                .map(|&(c, h, t, _)| track_block(t, c, h, variant, 0).len())
                .max()
                .unwrap_or(INFO_BLOCK);
            out.put_u16_le(size as u16);
            for (c, h, t, _) in blocks {
                body.extend(track_block(t, c, h, variant, size));
            }
        }
        DskVariant::Extended => {
            out.put_u16_le(0);
            for (c, h, t, unformatted) in blocks {
                if unformatted {
                    out.push(0);
                    continue;
                }
                let block = track_block(t, c, h, variant, 0);
                out.push((block.len() / 256) as u8);
                body.extend(block);
            }
        }
    }
    out.resize(INFO_BLOCK, 0);
    out.extend(body);
    Ok(out)
}

/// DSK / EDSK codec
#[derive(Debug, Clone, Copy, Default)]
pub struct DskCodec;

impl ImageCodec for DskCodec {
    fn name(&self) -> &'static str {
        "dsk"
    }

    fn description(&self) -> &'static str {
        "CPCEMU DSK / extended DSK"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["dsk", "edsk"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        match variant_of(data) {
            Some(_) if data.get(INFO_BLOCK..INFO_BLOCK + 10) == Some(&TRACK_MARKER[..10]) => 100,
            Some(_) => 92,
            None => 0,
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_dsk(data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_dsk(image)
    }
}
