//! Commodore D64, D71 and D81 block dumps
//!
//! The file is every 256-byte DOS block in track/sector order, optionally
//! followed by one 1541 error byte per block. D81 blocks are packed two
//! to a physical 512-byte MFM sector.

use crate::disk::{Disk, Geometry, Sector, SectorId, TrackStatus};
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::fdc::{d64_error_code, d64_error_flags};
use crate::fs::cbm::{CbmLayout, BLOCK_SIZE};
use crate::image::{note, Image, ImageCodec, ImageKind, ParseOptions};
use crate::profile::{profile, Platform};
use log::debug;

/// Key of the stored error table in [`Image::blobs`]
pub const ERRORS_BLOB: &str = "errors";

#[derive(Debug, Clone, Copy)]
struct Variant {
    size: usize,
    layout: CbmLayout,
    errors: bool,
}

fn blocks(layout: CbmLayout) -> usize {
    (1..=layout.tracks()).map(|t| layout.sectors_in(t) as usize).sum()
}

fn variant(layout: CbmLayout, errors: bool) -> Variant {
    let n = blocks(layout);
    Variant {
        size: n * BLOCK_SIZE + if errors { n } else { 0 },
        layout,
        errors,
    }
}

fn d64_variants() -> Vec<Variant> {
    [35, 40, 42]
        .into_iter()
        .flat_map(|tracks| {
            let layout = CbmLayout::D1541 { tracks };
            [variant(layout, false), variant(layout, true)]
        })
        .collect()
}

fn d71_variants() -> Vec<Variant> {
    vec![variant(CbmLayout::D1571, false), variant(CbmLayout::D1571, true)]
}

fn d81_variants() -> Vec<Variant> {
    vec![variant(CbmLayout::D1581, false), variant(CbmLayout::D1581, true)]
}

/// Empty disk with every physical sector of a layout
fn blank(layout: CbmLayout) -> Result<Disk> {
    let (geometry, encoding, size_code) = match layout {
        CbmLayout::D1541 { tracks } => (Geometry::new(tracks, 1, 21, 256).with_first_sector(0), Encoding::GcrCbm, 1),
        CbmLayout::D1571 => (Geometry::new(35, 2, 21, 256).with_first_sector(0), Encoding::GcrCbm, 1),
        CbmLayout::D1581 => (Geometry::new(80, 2, 10, 512), Encoding::Mfm, 2),
    };
    let mut disk = Disk::new(geometry);
    disk.encoding = encoding;
    disk.platform = Platform::C64;
    for t in 1..=layout.tracks() {
        for s in 0..layout.sectors_in(t) {
            let ((c, h, id), offset) = layout.locate(t, s)?;
            if offset != 0 {
                continue;
            }
            let track = disk.track_entry(c, h);
            track.encoding = encoding;
            track.filler_byte = 0;
            track.status = TrackStatus::Ok;
            let mut sector = Sector::with_data(SectorId::new(c, h, id, size_code), vec![0; 128 << size_code]);
            sector.encoding = encoding;
            track.add_sector(sector);
        }
    }
    Ok(disk)
}

/// Disk id bytes as the GCR header carries them (id2, id1)
fn disk_id(data: &[u8], layout: CbmLayout) -> Option<[u8; 2]> {
    let (at, offset) = match layout {
        CbmLayout::D1581 => (block_offset(layout, 40, 0)?, 0x16),
        _ => (block_offset(layout, 18, 0)?, 0xA2),
    };
    let id = data.get(at + offset..at + offset + 2)?;
    Some([id[1], id[0]])
}

/// File offset of a DOS block
fn block_offset(layout: CbmLayout, track: u8, sector: u8) -> Option<usize> {
    if track == 0 || track > layout.tracks() || sector >= layout.sectors_in(track) {
        return None;
    }
    let before: usize = (1..track).map(|t| layout.sectors_in(t) as usize).sum();
    Some((before + sector as usize) * BLOCK_SIZE)
}

fn parse_cbm(name: &'static str, variants: &[Variant], data: &[u8], options: &ParseOptions) -> Result<Image> {
    let mut warnings = Vec::new();
    let v = match variants.iter().find(|v| v.size == data.len()) {
        Some(v) => *v,
        None => {
            if options.strict {
                return Err(FloppyError::invalid_arg(format!("{} bytes is not a valid {} size", data.len(), name)));
            }
            let v = variants
                .iter()
                .find(|v| !v.errors && v.size >= data.len())
                .or_else(|| variants.last())
                .copied()
                .ok_or_else(|| FloppyError::Internal(format!("{} has no size variants", name)))?;
            note(
                &mut warnings,
                false,
                Warning::new(data.len(), format!("{} bytes does not match a {} size; padding", data.len(), name)),
            )?;
            v
        }
    };
    let layout = v.layout;
    let block_count = blocks(layout);
    let errors = if v.errors {
        data.get(block_count * BLOCK_SIZE..block_count * BLOCK_SIZE + block_count)
    } else {
        None
    };
    let id = disk_id(data, layout);
    let mut disk = blank(layout)?;

    let mut index = 0usize;
    for t in 1..=layout.tracks() {
        for s in 0..layout.sectors_in(t) {
            let ((c, h, sid), offset) = layout.locate(t, s)?;
            let at = index * BLOCK_SIZE;
            let mut block = data.get(at..(at + BLOCK_SIZE).min(data.len())).unwrap_or(&[]).to_vec();
            block.resize(BLOCK_SIZE, 0);
            let code = errors.map(|e| e[index]);
            index += 1;

            let sector = disk
                .track_mut(c, h)
                .and_then(|tr| tr.get_sector_mut(sid))
                .ok_or_else(|| FloppyError::Internal(format!("block {}/{} has no sector", t, s)))?;
            sector.data_mut()[offset..offset + BLOCK_SIZE].copy_from_slice(&block);
            if let Some(id) = id {
                sector.tags = id.to_vec();
            }
            if let Some(code) = code {
                let (header_ok, data_ok) = d64_error_flags(code);
                sector.header_crc_ok &= header_ok;
                sector.data_crc_ok &= data_ok;
            }
        }
    }
    for track in disk.tracks_mut() {
        if track.sectors().iter().any(|s| s.has_error()) {
            track.status = TrackStatus::Bad;
        }
    }
    disk.mark_unchanged();
    debug!("{}: {} tracks, error table {}", name, layout.tracks(), v.errors);

    let profile = match layout {
        CbmLayout::D1541 { tracks: 35 } => profile("c64").ok(),
        CbmLayout::D1541 { .. } => profile("c64-40").ok(),
        _ => None,
    };
    let mut image = Image::new(disk, name).with_profile(profile);
    image.warnings = warnings;
    if let Some(errors) = errors {
        image.blobs.insert(ERRORS_BLOB.into(), errors.to_vec());
    }
    Ok(image)
}

fn serialize_cbm(image: &Image, layout: CbmLayout) -> Result<Vec<u8>> {
    let disk = &image.disk;
    let previous = image.blob(ERRORS_BLOB);
    let block_count = blocks(layout);
    let mut out = Vec::with_capacity(block_count * (BLOCK_SIZE + 1));
    let mut codes = Vec::with_capacity(block_count);
    for t in 1..=layout.tracks() {
        for s in 0..layout.sectors_in(t) {
            let ((c, h, sid), offset) = layout.locate(t, s)?;
            let index = codes.len();
            match disk.track(c, h).and_then(|tr| tr.get_sector(sid)) {
                Some(sector) => {
                    let data = sector.data();
                    let start = out.len();
                    out.extend_from_slice(data.get(offset..offset + BLOCK_SIZE).unwrap_or(&[]));
                    out.resize(start + BLOCK_SIZE, 0);
                    codes.push(d64_error_code(sector, previous.and_then(|p| p.get(index).copied())));
                }
                None => {
                    out.resize(out.len() + BLOCK_SIZE, 0);
                    // 2: header block not found
                    codes.push(2);
                }
            }
        }
    }
    if previous.is_some() || codes.iter().any(|&c| c != 1) {
        out.extend_from_slice(&codes);
    }
    Ok(out)
}

fn probe_cbm(variants: &[Variant], data: &[u8]) -> u8 {
    let Some(v) = variants.iter().find(|v| v.size == data.len()) else {
        return 0;
    };
    let (track, dos_at) = match v.layout {
        CbmLayout::D1581 => (40, 2),
        _ => (18, 2),
    };
    let dos = block_offset(v.layout, track, 0).and_then(|at| data.get(at + dos_at)).copied();
    match (v.layout, dos) {
        (CbmLayout::D1581, Some(b'D')) => 80,
        (CbmLayout::D1581, _) => 50,
        (_, Some(b'A')) => 85,
        _ => 60,
    }
}

/// 1541 D64
#[derive(Debug, Clone, Copy, Default)]
pub struct D64Codec;

impl ImageCodec for D64Codec {
    fn name(&self) -> &'static str {
        "d64"
    }

    fn description(&self) -> &'static str {
        "Commodore 1541 disk image"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["d64"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        probe_cbm(&d64_variants(), data)
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_cbm(self.name(), &d64_variants(), data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        let tracks = match image.disk.cylinder_count() {
            0..=35 => 35,
            36..=40 => 40,
            _ => 42,
        };
        serialize_cbm(image, CbmLayout::D1541 { tracks })
    }
}

/// 1571 D71
#[derive(Debug, Clone, Copy, Default)]
pub struct D71Codec;

impl ImageCodec for D71Codec {
    fn name(&self) -> &'static str {
        "d71"
    }

    fn description(&self) -> &'static str {
        "Commodore 1571 disk image"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["d71"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        probe_cbm(&d71_variants(), data)
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_cbm(self.name(), &d71_variants(), data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_cbm(image, CbmLayout::D1571)
    }
}

/// 1581 D81
#[derive(Debug, Clone, Copy, Default)]
pub struct D81Codec;

impl ImageCodec for D81Codec {
    fn name(&self) -> &'static str {
        "d81"
    }

    fn description(&self) -> &'static str {
        "Commodore 1581 disk image"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["d81"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        probe_cbm(&d81_variants(), data)
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_cbm(self.name(), &d81_variants(), data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_cbm(image, CbmLayout::D1581)
    }
}

/// Build an empty 1541 disk of `tracks` tracks with a disk id
pub fn blank_1541(tracks: u8, id: [u8; 2]) -> Result<Disk> {
    let mut disk = blank(CbmLayout::D1541 { tracks })?;
    for track in disk.tracks_mut() {
        for sector in track.sectors_mut() {
            sector.tags = id.to_vec();
        }
    }
    Ok(disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::cbm;

    fn sample(size: usize) -> Vec<u8> {
        let mut data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        // BAM at 18/0: link, DOS type 'A', id "XY"
        let bam = block_offset(CbmLayout::D1541 { tracks: 35 }, 18, 0).unwrap();
        data[bam] = 18;
        data[bam + 1] = 1;
        data[bam + 2] = 0x41;
        data[bam + 0xA2] = b'X';
        data[bam + 0xA3] = b'Y';
        data
    }

    #[test]
    fn test_sizes() {
        let sizes: Vec<_> = d64_variants().iter().map(|v| v.size).collect();
        assert_eq!(sizes, vec![174_848, 175_531, 196_608, 197_376, 205_312, 206_114]);
        assert_eq!(d71_variants()[0].size, 349_696);
        assert_eq!(d81_variants()[0].size, 819_200);
        assert_eq!(d81_variants()[1].size, 822_400);
    }

    #[test]
    fn test_bam_at_track_18() {
        let data = sample(174_848);
        assert_eq!(D64Codec.probe(&data), 85);
        let image = D64Codec.parse(&data, &ParseOptions::default()).unwrap();
        let bam = image.disk.read_sector(17, 0, 0).unwrap();
        assert_eq!(bam.len(), 256);
        assert_eq!(bam[2], 0x41);
        assert_eq!(image.disk.sector(17, 0, 0).unwrap().tags, vec![b'Y', b'X']);
        assert_eq!(D64Codec.serialize(&image).unwrap(), data);
    }

    #[test]
    fn test_error_table() {
        let mut data = sample(175_531);
        let table = 174_848;
        data[table..].fill(1);
        data[table + 3] = 5;
        data[table + 4] = 0x0F;
        let image = D64Codec.parse(&data, &ParseOptions::default()).unwrap();
        let s3 = image.disk.sector(0, 0, 3).unwrap();
        assert!(s3.header_crc_ok && !s3.data_crc_ok);
        let s4 = image.disk.sector(0, 0, 4).unwrap();
        assert!(!s4.header_crc_ok && !s4.data_crc_ok);
        assert_eq!(image.disk.track(0, 0).unwrap().status, TrackStatus::Bad);
        assert_eq!(D64Codec.serialize(&image).unwrap(), data);
    }

    #[test]
    fn test_d81_blocks_share_sectors() {
        let data: Vec<u8> = (0..819_200).map(|i| (i / 256) as u8).collect();
        let image = D81Codec.parse(&data, &ParseOptions::default()).unwrap();
        // track 1 blocks 0/1 are physical sector 1 on head 0; blocks 20/21 are on head 1
        let s = image.disk.read_sector(0, 0, 1).unwrap();
        assert_eq!(s.len(), 512);
        assert_eq!((s[0], s[256]), (0, 1));
        assert_eq!(image.disk.read_sector(0, 1, 1).unwrap()[0], 20);
        assert_eq!(D81Codec.serialize(&image).unwrap(), data);
        let ((c, h, sid), off) = cbm::CbmLayout::D1581.locate(40, 3).unwrap();
        assert_eq!(image.disk.read_sector(c, h, sid).unwrap()[off], ((39 * 40 + 3) % 256) as u8);
    }

    #[test]
    fn test_strict_rejects_odd_size() {
        let strict = ParseOptions {
            strict: true,
            ..ParseOptions::default()
        };
        assert!(D64Codec.parse(&vec![0; 170_000], &strict).is_err());
        let image = D64Codec.parse(&vec![0; 170_000], &ParseOptions::default()).unwrap();
        assert_eq!(image.warnings.len(), 1);
    }
}
