//! DEC RX02 modified MFM
//!
//! Headers and marks are ordinary FM at half the cell rate (every FM cell
//! is written as the cell followed by a zero). A data mark of FD switches
//! the following 256 data bytes and their CRC to M2FM, where a clock is
//! only written between two zero data bits that were not themselves
//! separated by a clock.

use crate::encoding::fm;
use crate::encoding::mfm;
use crate::encoding::{Encoding, EncodingCodec, MarkKind, RawTrack};
use crate::pll::Bitstream;

/// Data mark introducing an M2FM data field
pub const M2FM_DATA_MARK: u8 = 0xFD;

/// Bytes recorded in M2FM after the FD mark (payload and CRC)
pub const M2FM_FIELD_LEN: usize = 258;

/// Spread a 16-cell FM pattern over 32 cells
pub const fn doubled(pattern: u16) -> u32 {
    let mut out = 0u32;
    let mut i = 0;
    while i < 16 {
        out |= (((pattern >> i) & 1) as u32) << (i * 2 + 1);
        i += 1;
    }
    out
}

/// Append an M2FM byte; returns the last (data, clock) pair
pub fn encode_byte(byte: u8, mut prev_data: u8, mut prev_clock: u8, out: &mut Vec<u8>) -> (u8, u8) {
    for i in (0..8).rev() {
        let d = (byte >> i) & 1;
        let clock = u8::from(prev_data == 0 && d == 0 && prev_clock == 0);
        out.push(clock);
        out.push(d);
        prev_data = d;
        prev_clock = clock;
    }
    (prev_data, prev_clock)
}

fn push_doubled(pattern: u16, out: &mut Vec<u8>) {
    let wide = doubled(pattern);
    for i in (0..32).rev() {
        out.push(((wide >> i) & 1) as u8);
    }
}

fn match_mark(window: u32) -> Option<(u8, MarkKind)> {
    fm::MARK_PATTERNS.iter().find_map(|&(p, kind)| {
        (doubled(p) == window).then(|| ((0..8).fold(0u8, |acc, i| (acc << 1) | ((p >> (14 - i * 2)) & 1) as u8), kind))
    })
}

/// DEC RX02 codec
#[derive(Debug, Clone, Copy, Default)]
pub struct M2fmCodec;

impl EncodingCodec for M2fmCodec {
    fn encoding(&self) -> Encoding {
        Encoding::M2fm
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        let mut raw = RawTrack::new(Encoding::M2fm);
        let cells = bits.bits();
        let mut reg: u32 = 0;
        let mut i = 0;
        let mut byte_start: Option<usize> = None;

        while i < cells.len() {
            reg = (reg << 1) | cells[i] as u32;
            i += 1;
            if i >= 32 {
                if let Some((byte, kind)) = match_mark(reg) {
                    let start = i - 32;
                    raw.mark(kind);
                    raw.push(byte, start, bits.any_weak(start, 32));
                    if byte == M2FM_DATA_MARK {
                        let mut pos = i;
                        for _ in 0..M2FM_FIELD_LEN {
                            if pos + 16 > cells.len() {
                                break;
                            }
                            raw.push(mfm::decode_cells(&cells[pos..pos + 16]), pos, bits.any_weak(pos, 16));
                            pos += 16;
                        }
                        i = pos;
                        reg = 0;
                    }
                    byte_start = Some(i);
                    continue;
                }
            }
            if let Some(start) = byte_start {
                if i - start == 32 {
                    let data = (0..8).fold(0u8, |acc, k| (acc << 1) | cells[start + k * 4 + 2]);
                    raw.push(data, start, bits.any_weak(start, 32));
                    byte_start = Some(i);
                }
            }
        }
        raw
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        let mut cells = Vec::with_capacity(raw.len() * 32);
        let mut i = 0;
        while i < raw.len() {
            let byte = raw.bytes[i];
            let mark = raw
                .markers
                .iter()
                .find(|m| m.offset == i && m.kind != MarkKind::Sync)
                .map(|m| m.kind);
            match mark {
                Some(kind) => push_doubled(fm::cells(byte, fm::clock_for(kind)), &mut cells),
                None => push_doubled(fm::cells(byte, 0xFF), &mut cells),
            }
            i += 1;
            if mark == Some(MarkKind::DataAddress) && byte == M2FM_DATA_MARK {
                let (mut d, mut c) = (1u8, 0u8);
                let end = (i + M2FM_FIELD_LEN).min(raw.len());
                for &b in &raw.bytes[i..end] {
                    (d, c) = encode_byte(b, d, c, &mut cells);
                }
                i = end;
            }
        }
        Bitstream::from_bits(cells, cell_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubled() {
        assert_eq!(doubled(0b11), 0b1010);
        assert_eq!(doubled(0x8000), 0x8000_0000);
    }

    #[test]
    fn test_fd_mark_pattern() {
        assert_eq!(fm::cells(0xFD, fm::MARK_CLOCK), 0xF57B);
        assert_eq!(match_mark(doubled(0xF57B)), Some((0xFD, MarkKind::DataAddress)));
    }

    #[test]
    fn test_m2fm_run_lengths() {
        let mut cells = vec![0u8, 1];
        let (mut d, mut c) = (1, 0);
        for b in 0..=255u8 {
            (d, c) = encode_byte(b, d, c, &mut cells);
        }
        let ones: Vec<usize> = cells
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == 1)
            .map(|(i, _)| i)
            .collect();
        for pair in ones.windows(2) {
            assert!((2..=5).contains(&(pair[1] - pair[0])));
        }
    }

    #[test]
    fn test_round_trip_header_and_data() {
        let mut raw = RawTrack::new(Encoding::M2fm);
        raw.fill(0x00, 6);
        raw.mark(MarkKind::IdAddress);
        raw.extend(&[0xFE, 7, 0, 3, 1, 0x11, 0x22]);
        raw.fill(0xFF, 4);
        raw.fill(0x00, 6);
        raw.mark(MarkKind::DataAddress);
        raw.push(M2FM_DATA_MARK, 0, false);
        let payload: Vec<u8> = (0..M2FM_FIELD_LEN).map(|i| (i * 3) as u8).collect();
        raw.extend(&payload);
        raw.fill(0xFF, 8);

        let decoded = M2fmCodec.decode(&M2fmCodec.encode(&raw, 1000.0));
        let id = decoded.markers_of(MarkKind::IdAddress).next().unwrap().offset;
        assert_eq!(decoded.slice(id, 7).unwrap(), &[0xFE, 7, 0, 3, 1, 0x11, 0x22]);
        let data = decoded.markers_of(MarkKind::DataAddress).next().unwrap().offset;
        assert_eq!(decoded.bytes[data], M2FM_DATA_MARK);
        assert_eq!(decoded.slice(data + 1, M2FM_FIELD_LEN).unwrap(), &payload[..]);
        assert_eq!(decoded.bytes[data + 1 + M2FM_FIELD_LEN], 0xFF);
    }
}
