//! ImageDisk (IMD)
//!
//! An ASCII header and free-form comment terminated by 0x1A, then one
//! record per track: mode, cylinder, head (with map flags), sector count,
//! size code, the sector numbering map, optional cylinder/head maps and an
//! optional per-sector size table, followed by one typed data record per
//! sector.

use crate::disk::geometry::bytes_to_size_code;
use crate::disk::{DataRate, Disk, Geometry, RecordingMode, Sector, SectorId, Track};
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::fdc::{imd_record_flags, imd_record_type};
use crate::image::{note, Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::{ByteReader, ByteWriter};
use log::debug;

const SIGNATURE: &[u8] = b"IMD ";
const COMMENT_END: u8 = 0x1A;
const CYLINDER_MAP: u8 = 0x80;
const HEAD_MAP: u8 = 0x40;
const SIZE_TABLE: u8 = 0xFF;
/// Blob holding `(cylinder, head, mode)` for every track, in file order
const MODES_BLOB: &str = "imd-modes";

/// Transfer rate and density of a track record
fn mode_info(mode: u8) -> Option<(Encoding, DataRate)> {
    match mode {
        0 => Some((Encoding::Fm, DataRate::High)),
        1 | 2 => Some((Encoding::Fm, DataRate::SingleDouble)),
        3 => Some((Encoding::Mfm, DataRate::High)),
        4 | 5 => Some((Encoding::Mfm, DataRate::SingleDouble)),
        _ => None,
    }
}

/// Mode byte for a track with no recorded mode
fn mode_for(track: &Track) -> u8 {
    let fm = track.encoding == Encoding::Fm || track.recording_mode == RecordingMode::FM;
    match (fm, track.data_rate) {
        (true, DataRate::High) => 0,
        (true, _) => 2,
        (false, DataRate::High) => 3,
        (false, _) => 5,
    }
}

fn parse_imd(data: &[u8], options: &ParseOptions) -> Result<Image> {
    if !data.starts_with(SIGNATURE) {
        return Err(FloppyError::invalid_format("not an ImageDisk file"));
    }
    let comment_end = data
        .iter()
        .position(|&b| b == COMMENT_END)
        .ok_or_else(|| FloppyError::parse(data.len(), "comment is not terminated"))?;
    let mut warnings = Vec::new();
    let mut reader = ByteReader::at(data, comment_end + 1);
    let mut disk = Disk::new(Geometry::new(0, 1, 0, 512));
    let mut modes = Vec::new();

    while !reader.is_empty() {
        let at = reader.pos();
        let mode = reader.u8()?;
        let cylinder = reader.u8()?;
        let head_flags = reader.u8()?;
        let count = reader.u8()? as usize;
        let size_code = reader.u8()?;
        let head = head_flags & 0x01;
        let (encoding, rate) = match mode_info(mode) {
            Some(info) => info,
            None => {
                note(&mut warnings, options.strict, Warning::new(at, format!("unknown mode {}", mode)))?;
                (Encoding::Mfm, DataRate::Unknown)
            }
        };

        let numbers = reader.bytes(count)?.to_vec();
        let cylinders = if head_flags & CYLINDER_MAP != 0 { reader.bytes(count)?.to_vec() } else { vec![cylinder; count] };
        let heads = if head_flags & HEAD_MAP != 0 { reader.bytes(count)?.to_vec() } else { vec![head; count] };
        let sizes: Vec<usize> = if size_code == SIZE_TABLE {
            (0..count).map(|_| reader.u16_le().map(usize::from)).collect::<Result<_>>()?
        } else {
            if size_code > 6 {
                return Err(FloppyError::parse(at + 4, format!("sector size code {}", size_code)));
            }
            vec![128usize << size_code; count]
        };

        let mut track = Track::new(cylinder, head);
        track.encoding = encoding;
        track.data_rate = rate;
        track.recording_mode = if encoding == Encoding::Fm { RecordingMode::FM } else { RecordingMode::MFM };
        for i in 0..count {
            let record_at = reader.pos();
            let record = reader.u8()?;
            let code = bytes_to_size_code(sizes[i]).unwrap_or(SIZE_TABLE);
            let id = SectorId::new(cylinders[i], heads[i], numbers[i], code);
            let payload = match record {
                0 => Vec::new(),
                1 | 3 | 5 | 7 => reader.bytes(sizes[i])?.to_vec(),
                2 | 4 | 6 | 8 => vec![reader.u8()?; sizes[i]],
                _ => return Err(FloppyError::parse(record_at, format!("sector record type {}", record))),
            };
            let mut sector = Sector::with_data(id, payload);
            let (deleted, error) = imd_record_flags(record);
            sector.deleted = record != 0 && deleted;
            sector.data_crc_ok = record != 0 && !error;
            sector.encoding = encoding;
            track.add_sector(sector);
        }
        track.classify(count);
        modes.extend_from_slice(&[cylinder, head, mode]);
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
    debug!("imd: {} tracks", disk.track_count());

    let mut image = Image::new(disk, "imd").with_profile(options.profile);
    image.warnings = warnings;
    image.blobs.insert("comment".into(), data[..comment_end].to_vec());
    image.blobs.insert(MODES_BLOB.into(), modes);
    Ok(image)
}

fn default_comment() -> Vec<u8> {
    let now = chrono::Local::now();
    format!("IMD 1.18: {}\r\n", now.format("%d/%m/%Y %H:%M:%S")).into_bytes()
}

fn serialize_imd(image: &Image) -> Result<Vec<u8>> {
    let mut out = match image.blob("comment") {
        Some(comment) if comment.starts_with(SIGNATURE) => comment.to_vec(),
        Some(comment) => [default_comment(), comment.to_vec()].concat(),
        None => default_comment(),
    };
    out.push(COMMENT_END);
    let stored_modes = image.blob(MODES_BLOB).unwrap_or(&[]);

    for track in image.disk.tracks() {
        let sectors = track.sectors();
        if sectors.len() > u8::MAX as usize {
            return Err(FloppyError::unsupported("ImageDisk tracks hold at most 255 sectors"));
        }
        let mode = stored_modes
            .chunks_exact(3)
            .find(|m| m[0] == track.cylinder && m[1] == track.head)
            .map(|m| m[2])
            .unwrap_or_else(|| mode_for(track));
        let lengths: Vec<usize> = sectors.iter().map(|s| s.data().len().max(s.id.size_bytes())).collect();
        let uniform = lengths
            .first()
            .and_then(|&len| bytes_to_size_code(len).filter(|_| lengths.iter().all(|&l| l == len)));
        let cyl_map = sectors.iter().any(|s| s.id.cylinder != track.cylinder);
        let head_map = sectors.iter().any(|s| s.id.head != track.head);

        let mut flags = track.head;
        if cyl_map {
            flags |= CYLINDER_MAP;
        }
        if head_map {
            flags |= HEAD_MAP;
        }
        out.extend_from_slice(&[mode, track.cylinder, flags, sectors.len() as u8, uniform.unwrap_or(SIZE_TABLE)]);
        out.extend(sectors.iter().map(|s| s.id.sector));
        if cyl_map {
            out.extend(sectors.iter().map(|s| s.id.cylinder));
        }
        if head_map {
            out.extend(sectors.iter().map(|s| s.id.head));
        }
        if uniform.is_none() {
            for &len in &lengths {
                out.put_u16_le(len as u16);
            }
        }

        for (sector, &len) in sectors.iter().zip(&lengths) {
            let data = sector.data();
            if data.is_empty() {
                out.push(0);
                continue;
            }
            let mut payload = data.to_vec();
            payload.resize(len, track.filler_byte);
            let compressed = payload.iter().all(|&b| b == payload[0]);
            out.push(imd_record_type(sector, compressed));
            if compressed {
                out.push(payload[0]);
            } else {
                out.extend_from_slice(&payload);
            }
        }
    }
    Ok(out)
}

/// ImageDisk codec
#[derive(Debug, Clone, Copy, Default)]
pub struct ImdCodec;

impl ImageCodec for ImdCodec {
    fn name(&self) -> &'static str {
        "imd"
    }

    fn description(&self) -> &'static str {
        "ImageDisk"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["imd"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if data.starts_with(SIGNATURE) && data.iter().take(1024).any(|&b| b == COMMENT_END) {
            95
        } else {
            0
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        parse_imd(data, options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        serialize_imd(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn sample() -> Vec<u8> {
        let mut disk = Disk::builder().profile(profile("pc-360k").unwrap()).build().unwrap();
        disk.write_sector(0, 0, 1, &(0..=255u8).cycle().take(512).collect::<Vec<_>>()).unwrap();
        let sector = disk.track_mut(0, 1).unwrap().get_sector_mut(3).unwrap();
        sector.data_crc_ok = false;
        sector.deleted = true;
        let mut image = Image::new(disk, "imd");
        image.blobs.insert("comment".into(), b"IMD 1.18: 01/01/2024 00:00:00\r\ntest".to_vec());
        serialize_imd(&image).unwrap()
    }

    #[test]
    fn test_round_trip_is_bytewise() {
        let bytes = sample();
        let image = parse_imd(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(image.disk.track_count(), 80);
        assert_eq!(image.disk.geometry.sectors_per_track, 9);
        assert_eq!(serialize_imd(&image).unwrap(), bytes);
    }

    #[test]
    fn test_compressed_and_flagged_records() {
        let bytes = sample();
        let image = parse_imd(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(image.disk.read_sector(0, 0, 1).unwrap()[255], 255);
        assert_eq!(image.disk.read_sector(5, 1, 9).unwrap(), &[0xF6; 512][..]);
        let s = image.disk.sector(0, 1, 3).unwrap();
        assert!(s.deleted && !s.data_crc_ok);
        // 0xF6-filled sectors are stored as 2-byte compressed records
        assert!(bytes.len() < 40 * 2 * 9 * 10 + 2 * 512 + 100);
    }

    #[test]
    fn test_size_table_and_maps() {
        let mut disk = Disk::new(Geometry::new(1, 1, 2, 256));
        let mut track = Track::new(0, 0);
        track.add_sector(Sector::with_data(SectorId::new(7, 1, 1, 1), vec![1; 256]));
        track.add_sector(Sector::with_data(SectorId::new(7, 1, 2, 2), vec![2; 512]));
        disk.set_track(track);
        let mut image = Image::new(disk, "imd");
        image.blobs.insert("comment".into(), b"IMD 1.18".to_vec());
        let bytes = serialize_imd(&image).unwrap();
        assert_eq!(bytes[11], 0xC0);
        assert_eq!(bytes[13], SIZE_TABLE);
        let back = parse_imd(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(back.disk.sector(0, 0, 2).unwrap().id.cylinder, 7);
        assert_eq!(back.disk.read_sector(0, 0, 2).unwrap().len(), 512);
        assert_eq!(serialize_imd(&back).unwrap(), bytes);
    }

    #[test]
    fn test_unterminated_comment() {
        assert!(parse_imd(b"IMD 1.18 no end", &ParseOptions::default()).is_err());
        assert_eq!(ImdCodec.probe(b"IMD 1.18 no end"), 0);
    }
}
