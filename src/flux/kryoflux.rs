//! KryoFlux stream files (`trackNN.S.raw`)
//!
//! A stream is a byte code: short flux values are single bytes, longer
//! ones use a two- or three-byte form, `Ovl16` adds 65536 to the next
//! value, and out-of-band blocks carry index pulses, stream info and the
//! end marker. Index positions refer to offsets in the in-band stream.

use crate::error::{FloppyError, Result, Warning};
use crate::flux::{FluxArchive, FluxStream, FluxValidity};
use crate::io::ByteReader;
use log::{debug, warn};
use std::path::Path;

/// Default sample clock: ((18.432 MHz × 73) / 14) / 2
pub const SAMPLE_CLOCK: f64 = 18_432_000.0 * 73.0 / 14.0 / 2.0;

/// Index clock (sample clock / 8)
pub const INDEX_CLOCK: f64 = SAMPLE_CLOCK / 8.0;

const OP_NOP1: u8 = 0x08;
const OP_NOP2: u8 = 0x09;
const OP_NOP3: u8 = 0x0A;
const OP_OVL16: u8 = 0x0B;
const OP_FLUX3: u8 = 0x0C;
const OP_OOB: u8 = 0x0D;

const OOB_STREAM_INFO: u8 = 0x01;
const OOB_INDEX: u8 = 0x02;
const OOB_STREAM_END: u8 = 0x03;
const OOB_KF_INFO: u8 = 0x04;
const OOB_EOF: u8 = 0x0D;

/// Values this long (about 5 ms) mean the head saw no flux at all
const NO_FLUX_TICKS: u64 = 0x40000;

/// File name used for a track by the KryoFlux tools
pub fn track_file_name(cylinder: u8, head: u8) -> String {
    format!("track{:02}.{}.raw", cylinder, head)
}

/// Parse one stream file
pub fn parse(data: &[u8], strict: bool) -> Result<(FluxStream, Vec<Warning>)> {
    let mut warnings = Vec::new();
    let mut sample_rate = SAMPLE_CLOCK;
    let mut ticks: Vec<u64> = Vec::new();
    // in-band offset at which each flux value started
    let mut starts: Vec<u32> = Vec::new();
    let mut index_positions: Vec<u32> = Vec::new();
    let mut r = ByteReader::new(data);
    let mut stream_pos: u32 = 0;
    let mut carry: u64 = 0;
    let mut value_start: Option<u32> = None;
    let mut ended = false;

    while !r.is_empty() {
        let at = r.pos();
        let op = r.u8()?;
        match op {
            0x00..=0x07 => {
                let lo = r.u8()?;
                starts.push(value_start.take().unwrap_or(stream_pos));
                ticks.push(carry + (((op as u64) << 8) | lo as u64));
                carry = 0;
                stream_pos += 2;
            }
            OP_NOP1 | OP_NOP2 | OP_NOP3 => {
                let skip = (op - OP_NOP1) as usize;
                r.skip(skip)?;
                stream_pos += 1 + skip as u32;
            }
            OP_OVL16 => {
                value_start.get_or_insert(stream_pos);
                carry += 0x10000;
                stream_pos += 1;
            }
            OP_FLUX3 => {
                let v = r.u16_be()?;
                starts.push(value_start.take().unwrap_or(stream_pos));
                ticks.push(carry + v as u64);
                carry = 0;
                stream_pos += 3;
            }
            OP_OOB => {
                let kind = r.u8()?;
                if kind == OOB_EOF {
                    ended = true;
                    break;
                }
                let size = r.u16_le()? as usize;
                let payload = r.bytes(size)?;
                match kind {
                    OOB_INDEX if size >= 12 => {
                        let pos = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                        index_positions.push(pos);
                    }
                    OOB_STREAM_INFO | OOB_STREAM_END => {
                        if kind == OOB_STREAM_END && size >= 8 {
                            let result = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
                            if result != 0 {
                                let message = format!("stream ended with result code {}", result);
                                if strict {
                                    return Err(FloppyError::parse(at, message));
                                }
                                warnings.push(Warning::new(at, message));
                            }
                        }
                    }
                    OOB_KF_INFO => {
                        let text = String::from_utf8_lossy(payload);
                        if let Some(sck) = info_value(&text, "sck") {
                            sample_rate = sck;
                        }
                        debug!("kryoflux info: {}", text.trim_end_matches('\0'));
                    }
                    _ => {
                        let message = format!("unknown OOB block type {:#04x}", kind);
                        if strict {
                            return Err(FloppyError::parse(at, message));
                        }
                        warnings.push(Warning::new(at, message));
                    }
                }
            }
            _ => {
                starts.push(value_start.take().unwrap_or(stream_pos));
                ticks.push(carry + op as u64);
                carry = 0;
                stream_pos += 1;
            }
        }
    }
    if !ended {
        let message = "stream has no EOF block".to_string();
        if strict {
            return Err(FloppyError::parse(data.len(), message));
        }
        warn!("kryoflux: {}", message);
        warnings.push(Warning::new(data.len(), message));
    }

    let mut stream = FluxStream::new(sample_rate.round() as u32);
    let mut positions = Vec::with_capacity(ticks.len());
    for (i, &t) in ticks.iter().enumerate() {
        let before = stream.len();
        stream.push_ticks(t);
        if stream.len() > before {
            positions.push(starts[i]);
            if t >= NO_FLUX_TICKS {
                stream.mark_invalid(before, 1, FluxValidity::NoFlux);
            }
        }
    }
    let mut marks: Vec<usize> = index_positions
        .iter()
        .map(|&pos| positions.partition_point(|&p| p < pos))
        .collect();
    marks.sort_unstable();
    for m in marks {
        stream.push_index_at(m);
    }
    Ok((stream, warnings))
}

fn info_value(text: &str, key: &str) -> Option<f64> {
    text.split([',', '\0'])
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// Encode a stream as a KryoFlux stream file
pub fn serialize(stream: &FluxStream) -> Vec<u8> {
    let ticks = stream.to_ticks(SAMPLE_CLOCK.round() as u32);
    let mut out = Vec::with_capacity(ticks.len() * 2);
    let mut stream_pos: u32 = 0;

    let info = format!(
        "name=unifloppy, version={}, sck={:.7}, ick={:.7}\0",
        env!("CARGO_PKG_VERSION"),
        SAMPLE_CLOCK,
        INDEX_CLOCK
    );
    push_oob(&mut out, OOB_KF_INFO, info.as_bytes());

    let marks = stream.index_marks();
    let mut next_mark = 0;
    let mut sample_counter: u32 = 0;
    let mut emit_marks = |out: &mut Vec<u8>, i: usize, pos: u32, counter: u32| {
        while next_mark < marks.len() && marks[next_mark] <= i {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&pos.to_le_bytes());
            payload.extend_from_slice(&counter.to_le_bytes());
            payload.extend_from_slice(&(next_mark as u32).to_le_bytes());
            push_oob(out, OOB_INDEX, &payload);
            next_mark += 1;
        }
    };

    for (i, &t) in ticks.iter().enumerate() {
        emit_marks(&mut out, i, stream_pos, sample_counter);
        let mut t = t as u64;
        while t >= 0x10000 {
            out.push(OP_OVL16);
            stream_pos += 1;
            t -= 0x10000;
        }
        let t = t as u32;
        if (0x0E..=0xFF).contains(&t) {
            out.push(t as u8);
            stream_pos += 1;
        } else if t < 0x800 {
            out.push((t >> 8) as u8);
            out.push(t as u8);
            stream_pos += 2;
        } else {
            out.push(OP_FLUX3);
            out.extend_from_slice(&(t as u16).to_be_bytes());
            stream_pos += 3;
        }
        sample_counter = sample_counter.wrapping_add(t);
    }
    emit_marks(&mut out, ticks.len(), stream_pos, sample_counter);

    let mut end = Vec::with_capacity(8);
    end.extend_from_slice(&stream_pos.to_le_bytes());
    end.extend_from_slice(&0u32.to_le_bytes());
    push_oob(&mut out, OOB_STREAM_END, &end);
    out.extend_from_slice(&[OP_OOB, OOB_EOF, 0x0D, 0x0D]);
    out
}

fn push_oob(out: &mut Vec<u8>, kind: u8, payload: &[u8]) {
    out.push(OP_OOB);
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Load every `trackNN.S.raw` file of a capture directory
pub fn load_dir(dir: &Path, strict: bool) -> Result<(FluxArchive, Vec<Warning>)> {
    let mut archive = FluxArchive::new();
    let mut warnings = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some((cylinder, head)) = parse_file_name(&name) else {
            continue;
        };
        let data = std::fs::read(entry.path())?;
        let (stream, w) = parse(&data, strict)?;
        warnings.extend(w);
        archive.tracks.insert((cylinder, head), stream);
    }
    if archive.tracks.is_empty() {
        return Err(FloppyError::NotFound(format!("no KryoFlux stream files in {}", dir.display())));
    }
    Ok((archive, warnings))
}

/// Write one stream file per track into a directory
pub fn save_dir(archive: &FluxArchive, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for (&(cylinder, head), stream) in &archive.tracks {
        std::fs::write(dir.join(track_file_name(cylinder, head)), serialize(stream))?;
    }
    Ok(())
}

/// Cylinder and head from a stream file name
pub fn parse_file_name(name: &str) -> Option<(u8, u8)> {
    let rest = name.strip_prefix("track")?.strip_suffix(".raw")?;
    let (cylinder, head) = rest.split_once('.')?;
    Some((cylinder.parse().ok()?, head.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes() {
        // Flux1, Flux2, Nop2, Ovl16 + Flux1, Flux3, EOF
        let data = [
            0x30, 0x01, 0x20, OP_NOP2, 0xAA, OP_OVL16, 0x10, OP_FLUX3, 0x12, 0x34, OP_OOB, OOB_EOF, 0x0D, 0x0D,
        ];
        let (stream, warnings) = parse(&data, true).unwrap();
        assert!(warnings.is_empty());
        let ticks = stream.to_ticks(stream.sample_rate);
        assert_eq!(ticks, vec![0x30, 0x120, 0x10010, 0x1234]);
    }

    #[test]
    fn test_index_position_maps_to_flux() {
        let mut data = vec![0x40, 0x40];
        push_oob(&mut data, OOB_INDEX, &[2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        data.extend_from_slice(&[0x40, 0x40]);
        data.extend_from_slice(&[OP_OOB, OOB_EOF, 0x0D, 0x0D]);
        let (stream, _) = parse(&data, true).unwrap();
        assert_eq!(stream.index_marks(), &[2]);
    }

    #[test]
    fn test_round_trip() {
        let mut intervals = Vec::new();
        for i in 0..500u32 {
            intervals.push(2000 + (i % 7) * 700);
        }
        intervals.push(2_500_000);
        let original = FluxStream::from_intervals(intervals, &[0, 250, 501]);
        let (parsed, warnings) = parse(&serialize(&original), true).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(parsed.index_marks(), original.index_marks());
        let tick = parsed.resolution_ns().ceil() as u32;
        assert!(parsed.approx_eq(&original, tick));

        let (again, _) = parse(&serialize(&parsed), true).unwrap();
        assert!(again.approx_eq(&parsed, 0));
    }

    #[test]
    fn test_missing_eof() {
        assert!(parse(&[0x30, 0x31], true).is_err());
        let (stream, warnings) = parse(&[0x30, 0x31], false).unwrap();
        assert_eq!(stream.len(), 2);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(track_file_name(3, 1), "track03.1.raw");
        assert_eq!(parse_file_name("track79.0.raw"), Some((79, 0)));
        assert_eq!(parse_file_name("notes.txt"), None);
    }
}
