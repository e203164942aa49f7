//! A2R (Applesauce) flux captures, versions 2 and 3
//!
//! An 8-byte header is followed by chunks (`INFO`, `STRM` or `RWCP`,
//! `META`, ...). Flux timings are stored one byte per interval at
//! 125 ns by default; a byte of 255 means "add 255 and keep reading".

use crate::error::{FloppyError, Result, Warning};
use crate::flux::{FluxArchive, FluxStream};
use crate::io::{ByteReader, ByteWriter};
use log::{debug, warn};

/// Version 2 magic
pub const MAGIC_V2: &[u8; 4] = b"A2R2";
/// Version 3 magic
pub const MAGIC_V3: &[u8; 4] = b"A2R3";
/// Bytes following the magic in every version
pub const HEADER_TAIL: [u8; 4] = [0xFF, 0x0A, 0x0D, 0x0A];

/// Default tick length in picoseconds
pub const DEFAULT_RESOLUTION_PS: u32 = 125_000;

/// Drive type: 5.25" single sided, quarter-track stepping
pub const DRIVE_525_SS: u8 = 1;
/// Drive type: 5.25" double sided 80 track
pub const DRIVE_525_DS80: u8 = 3;

const CAPTURE_TIMING: u8 = 1;
const CAPTURE_XTIMING: u8 = 3;

/// Whether data carries an A2R header
pub fn is_a2r(data: &[u8]) -> bool {
    data.len() >= 8 && (data.starts_with(MAGIC_V2) || data.starts_with(MAGIC_V3)) && data[4..8] == HEADER_TAIL
}

fn location_to_track(drive_type: u8, location: u16) -> Option<(u8, u8)> {
    if drive_type == DRIVE_525_SS {
        // quarter tracks; only whole tracks are kept
        (location % 4 == 0).then_some(((location / 4) as u8, 0))
    } else {
        Some(((location >> 1) as u8, (location & 1) as u8))
    }
}

fn track_to_location(drive_type: u8, cylinder: u8, head: u8) -> u16 {
    if drive_type == DRIVE_525_SS {
        cylinder as u16 * 4
    } else {
        ((cylinder as u16) << 1) | head as u16
    }
}

fn decode_timings(data: &[u8], stream: &mut FluxStream) {
    let mut acc = 0u64;
    for &b in data {
        acc += b as u64;
        if b != 255 {
            stream.push_ticks(acc);
            acc = 0;
        }
    }
}

/// Map index tick positions to interval positions
fn index_marks_from_ticks(stream: &FluxStream, positions: &[u32]) -> Vec<usize> {
    let ticks = stream.to_ticks(stream.sample_rate);
    let mut starts = Vec::with_capacity(ticks.len());
    let mut t = 0u64;
    for &d in &ticks {
        starts.push(t);
        t += d as u64;
    }
    let mut marks: Vec<usize> = positions
        .iter()
        .map(|&p| starts.partition_point(|&s| s < p as u64))
        .collect();
    marks.sort_unstable();
    marks
}

/// Parse an A2R file
pub fn parse(data: &[u8], strict: bool) -> Result<(FluxArchive, Vec<Warning>)> {
    if !is_a2r(data) {
        return Err(FloppyError::invalid_format("missing A2R header"));
    }
    let version = data[3] - b'0';
    let mut warnings = Vec::new();
    let mut archive = FluxArchive::new();
    let mut drive_type = DRIVE_525_SS;
    let mut r = ByteReader::at(data, 8);

    while r.remaining() >= 8 {
        let id = r.array::<4>()?;
        let size = r.u32_le()? as usize;
        let at = r.pos();
        let body = match r.bytes(size) {
            Ok(b) => b,
            Err(e) if strict => return Err(e),
            Err(_) => {
                warnings.push(Warning::new(at, "chunk runs past end of file"));
                &data[at..]
            }
        };
        match &id {
            b"INFO" => {
                if body.len() >= 35 {
                    let creator = String::from_utf8_lossy(&body[1..33]).trim().to_string();
                    drive_type = body[33];
                    archive.metadata.insert("a2r.creator".into(), creator);
                    archive.metadata.insert("a2r.drive_type".into(), drive_type.to_string());
                    archive.metadata.insert("a2r.write_protected".into(), (body[34] != 0).to_string());
                }
            }
            b"STRM" => parse_strm(body, drive_type, &mut archive, &mut warnings)?,
            b"RWCP" => parse_rwcp(body, at, drive_type, strict, &mut archive, &mut warnings)?,
            b"META" => {
                for line in String::from_utf8_lossy(body).lines() {
                    if let Some((k, v)) = line.split_once('\t') {
                        archive.metadata.insert(k.to_string(), v.to_string());
                    }
                }
            }
            other => debug!("a2r: skipping chunk {}", String::from_utf8_lossy(other)),
        }
    }
    archive.metadata.insert("a2r.version".into(), version.to_string());
    Ok((archive, warnings))
}

fn parse_strm(body: &[u8], drive_type: u8, archive: &mut FluxArchive, warnings: &mut Vec<Warning>) -> Result<()> {
    let mut r = ByteReader::new(body);
    while !r.is_empty() {
        let location = r.u8()?;
        if location == 0xFF {
            break;
        }
        let capture = r.u8()?;
        let len = r.u32_le()? as usize;
        let loop_point = r.u32_le()?;
        let timings = r.bytes(len)?;
        if capture != CAPTURE_TIMING && capture != CAPTURE_XTIMING {
            continue;
        }
        let Some(key) = location_to_track(drive_type, location as u16) else {
            continue;
        };
        let rate = (1_000_000_000_000u64 / DEFAULT_RESOLUTION_PS as u64) as u32;
        let mut stream = FluxStream::new(rate);
        decode_timings(timings, &mut stream);
        let marks = index_marks_from_ticks(&stream, &[0, loop_point]);
        for m in marks {
            stream.push_index_at(m);
        }
        if archive.tracks.insert(key, stream).is_some() {
            warnings.push(Warning::new(0, format!("duplicate capture for track {}.{}", key.0, key.1)));
        }
    }
    Ok(())
}

fn parse_rwcp(
    body: &[u8],
    base: usize,
    drive_type: u8,
    strict: bool,
    archive: &mut FluxArchive,
    warnings: &mut Vec<Warning>,
) -> Result<()> {
    let mut r = ByteReader::new(body);
    let _version = r.u8()?;
    let resolution = r.u32_le()?.max(1);
    r.skip(11)?;
    let rate = (1_000_000_000_000u64 / resolution as u64).min(u32::MAX as u64) as u32;
    loop {
        let at = base + r.pos();
        let mark = r.u8()?;
        match mark {
            b'X' => break,
            b'C' => {}
            other => {
                let message = format!("unexpected RWCP mark {:#04x}", other);
                if strict {
                    return Err(FloppyError::parse(at, message));
                }
                warn!("a2r: {}", message);
                warnings.push(Warning::new(at, message));
                break;
            }
        }
        let capture = r.u8()?;
        let location = r.u16_le()?;
        let index_count = r.u8()? as usize;
        let mut indexes = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            indexes.push(r.u32_le()?);
        }
        let len = r.u32_le()? as usize;
        let timings = r.bytes(len)?;
        if capture != CAPTURE_TIMING && capture != CAPTURE_XTIMING {
            continue;
        }
        let Some(key) = location_to_track(drive_type, location) else {
            continue;
        };
        let mut stream = FluxStream::new(rate);
        decode_timings(timings, &mut stream);
        for m in index_marks_from_ticks(&stream, &indexes) {
            stream.push_index_at(m);
        }
        archive.tracks.insert(key, stream);
    }
    Ok(())
}

/// Serialise an archive as A2R version 3
pub fn serialize(archive: &FluxArchive) -> Vec<u8> {
    let drive_type = archive
        .metadata
        .get("a2r.drive_type")
        .and_then(|v| v.parse().ok())
        .unwrap_or(if archive.heads() > 1 { DRIVE_525_DS80 } else { DRIVE_525_SS });
    let rate = (1_000_000_000_000u64 / DEFAULT_RESOLUTION_PS as u64) as u32;

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC_V3);
    out.extend_from_slice(&HEADER_TAIL);

    let mut info = vec![1u8];
    let mut creator = b"unifloppy".to_vec();
    creator.resize(32, b' ');
    info.extend_from_slice(&creator);
    info.push(drive_type);
    info.push(u8::from(archive.metadata.get("a2r.write_protected").is_some_and(|v| v == "true")));
    info.push(0);
    info.push(0);
    push_chunk(&mut out, b"INFO", &info);

    let mut rwcp = vec![1u8];
    rwcp.put_u32_le(DEFAULT_RESOLUTION_PS);
    rwcp.put_fill(0, 11);
    for (&(cylinder, head), stream) in &archive.tracks {
        let ticks = stream.to_ticks(rate);
        let mut starts = Vec::with_capacity(ticks.len() + 1);
        let mut t = 0u64;
        for &d in &ticks {
            starts.push(t);
            t += d as u64;
        }
        starts.push(t);
        let indexes: Vec<u32> = stream
            .index_marks()
            .iter()
            .take(u8::MAX as usize)
            .map(|&m| starts[m.min(ticks.len())].min(u32::MAX as u64) as u32)
            .collect();

        rwcp.push(b'C');
        rwcp.push(CAPTURE_XTIMING);
        rwcp.put_u16_le(track_to_location(drive_type, cylinder, head));
        rwcp.push(indexes.len() as u8);
        for i in &indexes {
            rwcp.put_u32_le(*i);
        }
        let mut timings = Vec::with_capacity(ticks.len());
        for &d in &ticks {
            let mut d = d;
            while d >= 255 {
                timings.push(255);
                d -= 255;
            }
            timings.push(d as u8);
        }
        rwcp.put_u32_le(timings.len() as u32);
        rwcp.extend_from_slice(&timings);
    }
    rwcp.push(b'X');
    push_chunk(&mut out, b"RWCP", &rwcp);

    let meta: String = archive
        .metadata
        .iter()
        .filter(|(k, _)| !k.starts_with("a2r.") && !k.starts_with("scp."))
        .map(|(k, v)| format!("{}\t{}\n", k, v))
        .collect();
    if !meta.is_empty() {
        push_chunk(&mut out, b"META", meta.as_bytes());
    }
    out
}

fn push_chunk(out: &mut Vec<u8>, id: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(id);
    out.put_u32_le(body.len() as u32);
    out.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> FluxArchive {
        let mut a = FluxArchive::new();
        a.metadata.insert("title".into(), "Test Disk".into());
        for cyl in 0..3u8 {
            let intervals: Vec<u32> = (0..400u32).map(|i| 4000 + (i % 3) * 4000 + cyl as u32 * 125).collect();
            a.tracks.insert((cyl, 0), FluxStream::from_intervals(intervals, &[0, 200, 400]));
        }
        a
    }

    #[test]
    fn test_round_trip_v3() {
        let a = archive();
        let bytes = serialize(&a);
        assert!(is_a2r(&bytes));
        let (parsed, warnings) = parse(&bytes, true).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(parsed.tracks.len(), 3);
        assert_eq!(parsed.metadata.get("title").map(String::as_str), Some("Test Disk"));
        let t = &parsed.tracks[&(2, 0)];
        assert_eq!(t.index_marks(), &[0, 200, 400]);
        assert!(t.approx_eq(&a.tracks[&(2, 0)], 125));

        let (again, _) = parse(&serialize(&parsed), true).unwrap();
        assert!(again.approx_eq(&parsed, 0));
    }

    #[test]
    fn test_long_interval_continuation() {
        let mut stream = FluxStream::new(8_000_000);
        decode_timings(&[255, 255, 10, 32], &mut stream);
        assert_eq!(stream.to_ticks(8_000_000), vec![520, 32]);
    }

    #[test]
    fn test_v2_strm() {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC_V2);
        data.extend_from_slice(&HEADER_TAIL);
        let mut strm = vec![8u8, CAPTURE_TIMING];
        strm.put_u32_le(4);
        strm.put_u32_le(64);
        strm.extend_from_slice(&[32, 32, 32, 32]);
        strm.push(0xFF);
        push_chunk(&mut data, b"STRM", &strm);
        let (a, _) = parse(&data, true).unwrap();
        let t = &a.tracks[&(2, 0)];
        assert_eq!(t.len(), 4);
        assert_eq!(t.index_marks(), &[0, 2]);
    }

    #[test]
    fn test_location_mapping() {
        assert_eq!(location_to_track(DRIVE_525_SS, 8), Some((2, 0)));
        assert_eq!(location_to_track(DRIVE_525_SS, 9), None);
        assert_eq!(location_to_track(DRIVE_525_DS80, 9), Some((4, 1)));
        assert_eq!(track_to_location(DRIVE_525_DS80, 4, 1), 9);
    }
}
