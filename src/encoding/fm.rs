//! FM: every data bit is preceded by a clock cell

use crate::encoding::{Encoding, EncodingCodec, MarkKind, RawTrack};
use crate::pll::Bitstream;

/// Clock pattern used for sector marks
pub const MARK_CLOCK: u8 = 0xC7;

/// Clock pattern used for the index mark
pub const INDEX_CLOCK: u8 = 0xD7;

/// Interleave clock and data into 16 cells
pub const fn cells(data: u8, clock: u8) -> u16 {
    let mut out = 0u16;
    let mut i = 0;
    while i < 8 {
        let bit = 7 - i;
        out = (out << 2) | ((((clock >> bit) & 1) as u16) << 1) | (((data >> bit) & 1) as u16);
        i += 1;
    }
    out
}

/// FE with clock C7
pub const ID_MARK_PATTERN: u16 = cells(0xFE, MARK_CLOCK);

/// Mark patterns and what they introduce
pub const MARK_PATTERNS: [(u16, MarkKind); 5] = [
    (cells(0xFE, MARK_CLOCK), MarkKind::IdAddress),
    (cells(0xFB, MARK_CLOCK), MarkKind::DataAddress),
    (cells(0xF8, MARK_CLOCK), MarkKind::DeletedData),
    (cells(0xFD, MARK_CLOCK), MarkKind::DataAddress),
    (cells(0xFC, INDEX_CLOCK), MarkKind::IndexAddress),
];

/// Append the cells for a byte with a given clock
pub fn encode_byte(byte: u8, clock: u8, out: &mut Vec<u8>) {
    let pattern = cells(byte, clock);
    for i in (0..16).rev() {
        out.push(((pattern >> i) & 1) as u8);
    }
}

/// Data carried by 16 cells (data in the odd cells)
pub fn decode_cells(cells: &[u8]) -> u8 {
    crate::encoding::mfm::decode_cells(cells)
}

/// Clock a marker of this kind is written with
pub fn clock_for(kind: MarkKind) -> u8 {
    match kind {
        MarkKind::IndexAddress => INDEX_CLOCK,
        _ => MARK_CLOCK,
    }
}

/// Find the mark pattern a 16-cell window matches
fn match_mark(window: u16) -> Option<(u8, MarkKind)> {
    MARK_PATTERNS
        .iter()
        .find(|(p, _)| *p == window)
        .map(|&(p, kind)| ((0..8).fold(0u8, |acc, i| (acc << 1) | ((p >> (14 - i * 2)) & 1) as u8), kind))
}

/// FM codec
#[derive(Debug, Clone, Copy, Default)]
pub struct FmCodec;

impl EncodingCodec for FmCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Fm
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        let mut raw = RawTrack::new(Encoding::Fm);
        let cells = bits.bits();
        let mut reg: u16 = 0;
        let mut byte_start: Option<usize> = None;

        for (i, &b) in cells.iter().enumerate() {
            reg = (reg << 1) | b as u16;
            if i >= 15 {
                if let Some((byte, kind)) = match_mark(reg) {
                    let start = i + 1 - 16;
                    raw.mark(kind);
                    raw.push(byte, start, bits.any_weak(start, 16));
                    byte_start = Some(i + 1);
                    continue;
                }
            }
            if let Some(start) = byte_start {
                if i + 1 - start == 16 {
                    raw.push(
                        decode_cells(&cells[start..start + 16]),
                        start,
                        bits.any_weak(start, 16),
                    );
                    byte_start = Some(i + 1);
                }
            }
        }
        raw
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        let mut out = Vec::with_capacity(raw.len() * 16);
        for (i, &byte) in raw.bytes.iter().enumerate() {
            let clock = raw
                .markers
                .iter()
                .find(|m| m.offset == i && m.kind != MarkKind::Sync)
                .map(|m| clock_for(m.kind))
                .unwrap_or(0xFF);
            encode_byte(byte, clock, &mut out);
        }
        Bitstream::from_bits(out, cell_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_mark_patterns() {
        assert_eq!(cells(0xFE, 0xC7), 0xF57E);
        assert_eq!(cells(0xFB, 0xC7), 0xF56F);
        assert_eq!(cells(0xF8, 0xC7), 0xF56A);
        assert_eq!(cells(0xFC, 0xD7), 0xF77A);
    }

    #[test]
    fn test_match_mark_returns_data_byte() {
        assert_eq!(match_mark(0xF57E), Some((0xFE, MarkKind::IdAddress)));
        assert_eq!(match_mark(0xF56A), Some((0xF8, MarkKind::DeletedData)));
        assert_eq!(match_mark(0xFFFF), None);
    }

    #[test]
    fn test_round_trip() {
        let mut raw = RawTrack::new(Encoding::Fm);
        raw.fill(0xFF, 16);
        raw.fill(0x00, 6);
        raw.mark(MarkKind::IdAddress);
        raw.extend(&[0xFE, 5, 0, 3, 1, 0xAB, 0xCD]);
        raw.fill(0xFF, 11);
        raw.fill(0x00, 6);
        raw.mark(MarkKind::DataAddress);
        raw.push(0xFB, 0, false);
        raw.extend(&[0x55; 256]);

        let decoded = FmCodec.decode(&FmCodec.encode(&raw, 4000.0));
        let id = decoded.markers_of(MarkKind::IdAddress).next().unwrap().offset;
        assert_eq!(decoded.slice(id, 7).unwrap(), &[0xFE, 5, 0, 3, 1, 0xAB, 0xCD]);
        let data = decoded.markers_of(MarkKind::DataAddress).next().unwrap().offset;
        assert_eq!(decoded.bytes[data], 0xFB);
        assert!(decoded.slice(data + 1, 256).unwrap().iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_run_lengths_legal() {
        let mut out = Vec::new();
        for b in 0..=255u8 {
            encode_byte(b, 0xFF, &mut out);
        }
        let ones: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == 1)
            .map(|(i, _)| i)
            .collect();
        assert!(ones.windows(2).all(|p| (1..=2).contains(&(p[1] - p[0]))));
    }
}
