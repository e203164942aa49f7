//! MFM: a clock cell is written only between two zero data bits

use crate::encoding::{Encoding, EncodingCodec, MarkKind, RawTrack};
use crate::pll::Bitstream;

/// A1 with a missing clock, the IBM sector sync
pub const SYNC_A1: u16 = 0x4489;

/// C2 with a missing clock, the IBM index sync
pub const SYNC_C2: u16 = 0x5224;

/// Append the cells for one data byte; returns the last data bit
pub fn encode_byte(byte: u8, mut prev: u8, out: &mut Vec<u8>) -> u8 {
    for i in (0..8).rev() {
        let d = (byte >> i) & 1;
        let clock = u8::from(prev == 0 && d == 0);
        out.push(clock);
        out.push(d);
        prev = d;
    }
    prev
}

/// Append cells for a sequence of data bits; returns the last data bit
pub fn encode_data_bits(bits: &[u8], mut prev: u8, out: &mut Vec<u8>) -> u8 {
    for &d in bits {
        let clock = u8::from(prev == 0 && d == 0);
        out.push(clock);
        out.push(d & 1);
        prev = d & 1;
    }
    prev
}

/// Data byte carried by 16 cells (data in the odd cells)
pub fn decode_cells(cells: &[u8]) -> u8 {
    (0..8).fold(0u8, |acc, i| (acc << 1) | (cells.get(i * 2 + 1).copied().unwrap_or(0) & 1))
}

/// Push a 16-bit literal cell pattern
pub fn push_pattern(pattern: u16, out: &mut Vec<u8>) {
    for i in (0..16).rev() {
        out.push(((pattern >> i) & 1) as u8);
    }
}

/// Classify the byte following a sync run
fn mark_kind(byte: u8, after_index_sync: bool) -> Option<MarkKind> {
    match byte {
        0xFE if !after_index_sync => Some(MarkKind::IdAddress),
        0xFB | 0xFA if !after_index_sync => Some(MarkKind::DataAddress),
        0xF8 | 0xF9 if !after_index_sync => Some(MarkKind::DeletedData),
        0xFC => Some(MarkKind::IndexAddress),
        _ => None,
    }
}

/// The 16 cells starting at `start` as a pattern, if there are that many
fn pattern_at(cells: &[u8], start: usize) -> Option<u16> {
    let window = cells.get(start..start + 16)?;
    Some(window.iter().fold(0u16, |acc, &b| (acc << 1) | (b & 1) as u16))
}

/// Whether `start` opens an index address mark: three C2 syncs then FC
///
/// A single 0x5224 turns up in ordinary data and at the edge of the
/// zero gap before an A1 run, so C2 alone never syncs.
fn index_run_at(cells: &[u8], start: usize) -> bool {
    (0..3).all(|n| pattern_at(cells, start + n * 16) == Some(SYNC_C2))
        && cells
            .get(start + 48..start + 64)
            .is_some_and(|c| decode_cells(c) == 0xFC)
}

/// Bytes that follow a mark before sync detection resumes
fn field_length(kind: MarkKind, sector_size: usize) -> usize {
    match kind {
        // C H R N and the CRC
        MarkKind::IdAddress => 6,
        MarkKind::DataAddress | MarkKind::DeletedData if sector_size > 0 => sector_size + 2,
        _ => 0,
    }
}

/// IBM-style MFM codec
#[derive(Debug, Clone, Copy, Default)]
pub struct MfmCodec;

impl EncodingCodec for MfmCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Mfm
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        let mut raw = RawTrack::new(Encoding::Mfm);
        let cells = bits.bits();
        let mut reg: u16 = 0;
        let mut byte_start: Option<usize> = None;
        let mut sync_run = 0usize;
        let mut index_sync = false;
        // bytes of the current field still to come, read without resyncing
        let mut owed = 0usize;
        let mut id_byte: Option<usize> = None;
        let mut sector_size = 0usize;

        for (i, &b) in cells.iter().enumerate() {
            reg = (reg << 1) | b as u16;
            if owed == 0 && i >= 15 {
                let start = i + 1 - 16;
                let continues = byte_start == Some(start) && sync_run > 0;
                let sync = match reg {
                    SYNC_A1 => Some(0xA1),
                    SYNC_C2 if (continues && index_sync) || index_run_at(cells, start) => Some(0xC2),
                    _ => None,
                };
                if let Some(value) = sync {
                    if !continues {
                        sync_run = 0;
                    }
                    raw.mark(MarkKind::Sync);
                    raw.push(value, start, bits.any_weak(start, 16));
                    index_sync = value == 0xC2;
                    sync_run += 1;
                    byte_start = Some(i + 1);
                    continue;
                }
            }
            if let Some(start) = byte_start {
                if i + 1 - start == 16 {
                    let byte = decode_cells(&cells[start..start + 16]);
                    if owed > 0 {
                        owed -= 1;
                        if let Some(n) = id_byte.as_mut() {
                            *n += 1;
                            if *n == 4 {
                                sector_size = 128 << byte.min(6);
                                id_byte = None;
                            }
                        }
                    } else if sync_run > 0 {
                        if let Some(kind) = mark_kind(byte, index_sync) {
                            raw.mark(kind);
                            owed = field_length(kind, sector_size);
                            id_byte = (kind == MarkKind::IdAddress).then_some(0);
                        }
                    }
                    raw.push(byte, start, bits.any_weak(start, 16));
                    sync_run = 0;
                    byte_start = Some(i + 1);
                }
            }
        }
        raw
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        let mut cells = Vec::with_capacity(raw.len() * 16);
        let mut prev = 0u8;
        for (i, &byte) in raw.bytes.iter().enumerate() {
            if raw.has_marker(i, MarkKind::Sync) && (byte == 0xA1 || byte == 0xC2) {
                let pattern = if byte == 0xA1 { SYNC_A1 } else { SYNC_C2 };
                push_pattern(pattern, &mut cells);
                prev = byte & 1;
            } else {
                prev = encode_byte(byte, prev, &mut cells);
            }
        }
        Bitstream::from_bits(cells, cell_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a1_missing_clock() {
        let mut cells = Vec::new();
        encode_byte(0xA1, 0, &mut cells);
        let normal = cells.iter().fold(0u16, |acc, &b| (acc << 1) | b as u16);
        assert_eq!(normal, 0x44A9);
        assert_eq!(normal & !0x0020, SYNC_A1);
        assert_eq!(decode_cells(&cells), 0xA1);
    }

    #[test]
    fn test_c2_missing_clock() {
        let mut cells = Vec::new();
        encode_byte(0xC2, 0, &mut cells);
        let normal = cells.iter().fold(0u16, |acc, &b| (acc << 1) | b as u16);
        assert_eq!(normal, 0x52A4);
        assert_eq!(normal & !0x0080, SYNC_C2);
    }

    #[test]
    fn test_round_trip_with_marks() {
        let mut raw = RawTrack::new(Encoding::Mfm);
        raw.fill(0x4E, 10);
        raw.fill(0x00, 12);
        for _ in 0..3 {
            raw.mark(MarkKind::Sync);
            raw.push(0xA1, 0, false);
        }
        raw.extend(&[0xFE, 0x01, 0x00, 0x03, 0x02, 0x12, 0x34]);
        raw.fill(0x4E, 22);

        let bits = MfmCodec.encode(&raw, 2000.0);
        let decoded = MfmCodec.decode(&bits);

        assert_eq!(decoded.markers_of(MarkKind::Sync).count(), 3);
        let id = decoded.markers_of(MarkKind::IdAddress).next().unwrap().offset;
        assert_eq!(
            decoded.slice(id, 7).unwrap(),
            &[0xFE, 0x01, 0x00, 0x03, 0x02, 0x12, 0x34]
        );
        assert_eq!(decoded.bytes[..3], [0xA1, 0xA1, 0xA1]);
    }

    fn sync_run(raw: &mut RawTrack, value: u8) {
        raw.fill(0x00, 12);
        for _ in 0..3 {
            raw.mark(MarkKind::Sync);
            raw.push(value, 0, false);
        }
    }

    #[test]
    fn test_data_field_never_resyncs() {
        let mut raw = RawTrack::new(Encoding::Mfm);
        raw.fill(0x4E, 40);
        sync_run(&mut raw, 0xC2);
        raw.push(0xFC, 0, false);
        raw.fill(0x4E, 50);
        sync_run(&mut raw, 0xA1);
        raw.extend(&[0xFE, 0x00, 0x00, 0x01, 0x02, 0xAA, 0x55]);
        raw.fill(0x4E, 22);
        sync_run(&mut raw, 0xA1);
        let mut field = vec![0xFB];
        field.extend((0..512u32).map(|i| i as u8));
        field.extend([0x28, 0x29, 0x2A, 0x12, 0x34]);
        raw.extend(&field);
        raw.fill(0x4E, 40);

        let decoded = MfmCodec.decode(&MfmCodec.encode(&raw, 2000.0));
        assert_eq!(decoded.markers_of(MarkKind::Sync).count(), 9);
        assert_eq!(decoded.markers_of(MarkKind::IndexAddress).count(), 1);
        let data = decoded.markers_of(MarkKind::DataAddress).next().unwrap().offset;
        assert_eq!(decoded.slice(data, field.len()).unwrap(), &field[..]);
    }

    #[test]
    fn test_lone_c2_pattern_is_data() {
        let mut raw = RawTrack::new(Encoding::Mfm);
        raw.fill(0x4E, 20);
        raw.mark(MarkKind::Sync);
        raw.push(0xC2, 0, false);
        raw.fill(0x4E, 20);
        let decoded = MfmCodec.decode(&MfmCodec.encode(&raw, 2000.0));
        assert_eq!(decoded.markers_of(MarkKind::Sync).count(), 0);
    }

    #[test]
    fn test_no_sync_decodes_nothing() {
        let mut raw = RawTrack::new(Encoding::Mfm);
        raw.fill(0x4E, 50);
        let bits = MfmCodec.encode(&raw, 2000.0);
        assert!(MfmCodec.decode(&bits).is_empty());
    }

    #[test]
    fn test_run_lengths_legal() {
        let mut cells = Vec::new();
        let mut prev = 0;
        for b in 0..=255u8 {
            prev = encode_byte(b, prev, &mut cells);
        }
        let ones: Vec<usize> = cells
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == 1)
            .map(|(i, _)| i)
            .collect();
        for pair in ones.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((2..=4).contains(&gap), "gap {}", gap);
        }
    }
}
