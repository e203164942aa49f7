//! SuperCard Pro flux container
//!
//! Layout: a 16-byte header, a table of 168 little-endian track offsets,
//! then one `TRK` block per captured track. Each block lists, per
//! revolution, the index-to-index time, the number of flux cells and the
//! offset of the cells. Cells are big-endian 16-bit tick counts at
//! 25 ns × (resolution + 1); a zero cell adds 65536 ticks to the next one.

use crate::error::{FloppyError, Result, Warning};
use crate::flux::{FluxArchive, FluxStream};
use crate::io::{le32, ByteReader, ByteWriter};
use log::warn;

/// File magic
pub const MAGIC: &[u8; 3] = b"SCP";

/// Number of entries in the track offset table
pub const TRACK_TABLE_LEN: usize = 168;

/// Header length
pub const HEADER_LEN: usize = 0x10;

/// Base sample clock (25 ns ticks)
pub const BASE_RATE: u32 = 40_000_000;

/// Header flag: captured from index
pub const FLAG_INDEX: u8 = 0x01;
/// Header flag: 96 tpi drive
pub const FLAG_96TPI: u8 = 0x02;
/// Header flag: 360 rpm drive
pub const FLAG_360RPM: u8 = 0x04;

/// Whether data starts with the SCP magic
pub fn is_scp(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Parse an SCP file
pub fn parse(data: &[u8], strict: bool) -> Result<(FluxArchive, Vec<Warning>)> {
    let mut warnings = Vec::new();
    let mut r = ByteReader::new(data);
    r.expect(MAGIC)?;
    let version = r.u8()?;
    let disk_type = r.u8()?;
    let revolutions = r.u8()?;
    let start_track = r.u8()?;
    let end_track = r.u8()?;
    let flags = r.u8()?;
    let cell_width = r.u8()?;
    let heads = r.u8()?;
    let resolution = r.u8()?;
    let checksum = r.u32_le()?;

    if cell_width != 0 && cell_width != 16 {
        return Err(FloppyError::unsupported(format!("SCP cell width {} bits", cell_width)));
    }
    if revolutions == 0 {
        return Err(FloppyError::parse(5, "SCP header declares zero revolutions"));
    }

    let computed = data[HEADER_LEN..]
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    if checksum != 0 && checksum != computed {
        let message = format!("checksum {:08X} does not match {:08X}", checksum, computed);
        if strict {
            return Err(FloppyError::Crc(format!("SCP {}", message)));
        }
        warn!("SCP {}", message);
        warnings.push(Warning::new(0x0C, message));
    }

    let sample_rate = BASE_RATE / (resolution as u32 + 1);
    let mut archive = FluxArchive::new();
    archive.rpm = if flags & FLAG_360RPM != 0 { 360 } else { 300 };
    archive.metadata.insert("scp.version".into(), format!("{:#04x}", version));
    archive.metadata.insert("scp.disk_type".into(), format!("{:#04x}", disk_type));
    archive.metadata.insert("scp.heads".into(), heads.to_string());

    for track in start_track..=end_track {
        let entry = HEADER_LEN + track as usize * 4;
        if track as usize >= TRACK_TABLE_LEN {
            break;
        }
        let offset = le32(data, entry) as usize;
        if offset == 0 {
            continue;
        }
        match parse_track(data, offset, track, revolutions, sample_rate) {
            Ok(stream) => {
                let key = match heads {
                    1 => (track, 0),
                    2 => (track, 1),
                    _ => (track / 2, track % 2),
                };
                archive.tracks.insert(key, stream);
            }
            Err(e) if !strict => {
                warn!("SCP track {} skipped: {}", track, e);
                warnings.push(Warning::new(offset, format!("track {}: {}", track, e)));
            }
            Err(e) => return Err(e),
        }
    }
    Ok((archive, warnings))
}

fn parse_track(data: &[u8], offset: usize, track: u8, revolutions: u8, sample_rate: u32) -> Result<FluxStream> {
    let mut r = ByteReader::at(data, offset);
    r.expect(b"TRK")?;
    let number = r.u8()?;
    if number != track {
        return Err(FloppyError::parse(offset + 3, format!("TRK block numbered {}", number)));
    }
    let mut stream = FluxStream::new(sample_rate);
    stream.push_index();
    for _ in 0..revolutions {
        let _index_time = r.u32_le()?;
        let cells = r.u32_le()? as usize;
        let data_offset = r.u32_le()? as usize;
        let mut cr = ByteReader::at(data, offset + data_offset);
        let mut carry = 0u64;
        for _ in 0..cells {
            let v = cr.u16_be()?;
            if v == 0 {
                carry += 0x10000;
                continue;
            }
            stream.push_ticks(carry + v as u64);
            carry = 0;
        }
        stream.push_index();
    }
    Ok(stream)
}

/// Serialise an archive; every track must hold the same number of revolutions
pub fn serialize(archive: &FluxArchive) -> Vec<u8> {
    let revolutions = archive
        .tracks
        .values()
        .map(|s| s.revolution_count().max(1))
        .min()
        .unwrap_or(1)
        .min(u8::MAX as usize) as u8;
    let single_side = archive.heads() <= 1;
    let track_number = |(c, h): (u8, u8)| -> u8 {
        if single_side {
            c
        } else {
            c.saturating_mul(2).saturating_add(h)
        }
    };
    let numbers: Vec<u8> = archive.tracks.keys().map(|&k| track_number(k)).collect();
    let start = numbers.iter().copied().min().unwrap_or(0);
    let end = numbers.iter().copied().max().unwrap_or(0);

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(
        archive
            .metadata
            .get("scp.version")
            .and_then(|v| u8::from_str_radix(v.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0x19),
    );
    out.push(
        archive
            .metadata
            .get("scp.disk_type")
            .and_then(|v| u8::from_str_radix(v.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0x80),
    );
    out.push(revolutions);
    out.push(start);
    out.push(end);
    out.push(FLAG_INDEX | if archive.rpm == 360 { FLAG_360RPM } else { 0 });
    out.push(0);
    out.push(if single_side { 1 } else { 0 });
    out.push(0);
    out.put_u32_le(0);
    out.put_fill(0, TRACK_TABLE_LEN * 4);

    for (&key, stream) in &archive.tracks {
        let number = track_number(key);
        if number as usize >= TRACK_TABLE_LEN {
            continue;
        }
        let block = out.len();
        out.patch_u32_le(HEADER_LEN + number as usize * 4, block as u32);
        out.extend_from_slice(b"TRK");
        out.push(number);

        let mut encoded: Vec<(u32, Vec<u8>, u32)> = Vec::new();
        for k in 0..revolutions as usize {
            let intervals = stream.revolution(k).unwrap_or(stream.intervals());
            let ticks = FluxStream::from_intervals(intervals.to_vec(), &[]).to_ticks(BASE_RATE);
            let mut cells = Vec::with_capacity(ticks.len() * 2);
            let mut count = 0u32;
            for &t in &ticks {
                let mut t = t as u64;
                while t >= 0x10000 {
                    cells.put_u16_be(0);
                    count += 1;
                    t -= 0x10000;
                }
                cells.put_u16_be(t.max(1) as u16);
                count += 1;
            }
            let index_time = ticks.iter().map(|&t| t as u64).sum::<u64>().min(u32::MAX as u64) as u32;
            encoded.push((index_time, cells, count));
        }

        let mut data_offset = 4 + encoded.len() * 12;
        for (index_time, cells, count) in &encoded {
            out.put_u32_le(*index_time);
            out.put_u32_le(*count);
            out.put_u32_le(data_offset as u32);
            data_offset += cells.len();
        }
        for (_, cells, _) in encoded {
            out.extend_from_slice(&cells);
        }
    }

    let checksum = out[HEADER_LEN..]
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    out.patch_u32_le(0x0C, checksum);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> FluxArchive {
        let mut a = FluxArchive::new();
        for head in 0..2u8 {
            let mut intervals = Vec::new();
            for i in 0..300u32 {
                intervals.push(4000 + (i % 3) * 2000 + head as u32 * 25);
            }
            let n = intervals.len();
            intervals.extend_from_slice(&intervals.clone());
            intervals.push(3_000_000);
            a.tracks.insert((0, head), FluxStream::from_intervals(intervals, &[0, n, 2 * n + 1]));
        }
        a
    }

    #[test]
    fn test_round_trip_within_a_tick() {
        let a = archive();
        let bytes = serialize(&a);
        assert!(is_scp(&bytes));
        let (parsed, warnings) = parse(&bytes, true).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(parsed.tracks.len(), 2);
        let t = &parsed.tracks[&(0, 1)];
        assert_eq!(t.revolution_count(), 2);
        assert!(t.approx_eq(&a.tracks[&(0, 1)], 25));

        let (again, _) = parse(&serialize(&parsed), true).unwrap();
        assert!(again.approx_eq(&parsed, 0));
    }

    #[test]
    fn test_long_interval_uses_overflow_cells() {
        let bytes = serialize(&archive());
        let (parsed, _) = parse(&bytes, true).unwrap();
        let last = *parsed.tracks[&(0, 0)].intervals().last().unwrap();
        assert!((last as i64 - 3_000_000).abs() <= 25);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = serialize(&archive());
        let n = bytes.len();
        bytes[n - 1] ^= 0x01;
        assert!(matches!(parse(&bytes, true), Err(FloppyError::Crc(_))));
        let (_, warnings) = parse(&bytes, false).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_bad_magic() {
        assert!(parse(b"XYZ\0\0\0\0\0\0\0\0\0\0\0\0\0", false).is_err());
    }
}
