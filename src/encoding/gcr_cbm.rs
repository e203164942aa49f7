//! Commodore 4-to-5 GCR
//!
//! Every nibble is written as a 5-bit code with no more than two
//! consecutive zeros. A run of ten or more ones cannot occur in data and
//! is used as the sync; the byte stream restarts at the first zero after
//! it. The same table is used by the Victor 9000.

use crate::encoding::{Encoding, EncodingCodec, MarkKind, RawTrack};
use crate::pll::Bitstream;

/// Nibble to 5-bit code
pub const GCR_ENCODE: [u8; 16] = [
    0x0A, 0x0B, 0x12, 0x13, 0x0E, 0x0F, 0x16, 0x17, 0x09, 0x19, 0x1A, 0x1B, 0x0D, 0x1D, 0x1E, 0x15,
];

/// Ones that make up a sync run when writing
pub const SYNC_LENGTH: usize = 40;

/// Minimum ones recognised as a sync when reading
pub const SYNC_MIN: usize = 10;

/// Gap bytes written after each block, as raw cells
pub const GAP_BYTES: usize = 8;

/// 5-bit code to nibble
pub fn gcr_decode(code: u8) -> Option<u8> {
    GCR_ENCODE.iter().position(|&c| c == code & 0x1F).map(|n| n as u8)
}

/// Append the 10 cells for a byte
pub fn encode_byte(byte: u8, out: &mut Vec<u8>) {
    let code = ((GCR_ENCODE[(byte >> 4) as usize] as u16) << 5) | GCR_ENCODE[(byte & 0x0F) as usize] as u16;
    for i in (0..10).rev() {
        out.push(((code >> i) & 1) as u8);
    }
}

/// Decode 10 cells; `None` when either half is not a valid code
pub fn decode_group(cells: &[u8]) -> Option<u8> {
    let code = cells.iter().take(10).fold(0u16, |acc, &b| (acc << 1) | b as u16);
    let hi = gcr_decode((code >> 5) as u8)?;
    let lo = gcr_decode((code & 0x1F) as u8)?;
    Some((hi << 4) | lo)
}

/// Cell ranges between sync runs
pub fn segments(cells: &[u8]) -> Vec<std::ops::Range<usize>> {
    let mut out = Vec::new();
    let mut ones = 0usize;
    let mut start: Option<usize> = None;
    for (i, &c) in cells.iter().enumerate() {
        if c == 1 {
            ones += 1;
            if ones == SYNC_MIN {
                if let Some(s) = start.take() {
                    out.push(s..i + 1 - SYNC_MIN);
                }
            }
        } else {
            if ones >= SYNC_MIN {
                start = Some(i);
            }
            ones = 0;
        }
    }
    if let Some(s) = start {
        out.push(s..cells.len());
    }
    out
}

/// Decode every segment of a bitstream, classifying the first byte of each
pub fn decode_segments(
    bits: &Bitstream,
    encoding: Encoding,
    classify: fn(u8) -> Option<MarkKind>,
) -> RawTrack {
    let mut raw = RawTrack::new(encoding);
    let cells = bits.bits();
    for range in segments(cells) {
        raw.mark(MarkKind::Sync);
        let mut pos = range.start;
        let mut first = true;
        while pos + 10 <= range.end {
            let decoded = decode_group(&cells[pos..pos + 10]);
            let byte = decoded.unwrap_or(0);
            if first {
                if let Some(kind) = decoded.and_then(classify) {
                    raw.mark(kind);
                }
                first = false;
            }
            raw.push(byte, pos, decoded.is_none() || bits.any_weak(pos, 10));
            pos += 10;
        }
    }
    raw
}

/// Encode a raw track: each marked segment gets a sync run before it and a gap after it
pub fn encode_segments(raw: &RawTrack, cell_ns: f64) -> Bitstream {
    let mut starts: Vec<usize> = raw.markers.iter().map(|m| m.offset).collect();
    starts.sort_unstable();
    starts.dedup();

    let mut cells = Vec::with_capacity(raw.len() * 10 + starts.len() * (SYNC_LENGTH + GAP_BYTES * 8));
    let first = starts.first().copied().unwrap_or(raw.len());
    for &b in &raw.bytes[..first] {
        encode_byte(b, &mut cells);
    }
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(raw.len()).min(raw.len());
        cells.extend(std::iter::repeat(1u8).take(SYNC_LENGTH));
        for &b in &raw.bytes[start.min(end)..end] {
            encode_byte(b, &mut cells);
        }
        for _ in 0..GAP_BYTES * 4 {
            cells.extend_from_slice(&[0, 1]);
        }
    }
    Bitstream::from_bits(cells, cell_ns)
}

fn classify(byte: u8) -> Option<MarkKind> {
    match byte {
        0x08 => Some(MarkKind::IdAddress),
        0x07 => Some(MarkKind::DataAddress),
        _ => None,
    }
}

/// Commodore 1541-family GCR codec
#[derive(Debug, Clone, Copy, Default)]
pub struct CbmGcrCodec;

impl EncodingCodec for CbmGcrCodec {
    fn encoding(&self) -> Encoding {
        Encoding::GcrCbm
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        decode_segments(bits, Encoding::GcrCbm, classify)
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        encode_segments(raw, cell_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_bijective() {
        for n in 0..16u8 {
            assert_eq!(gcr_decode(GCR_ENCODE[n as usize]), Some(n));
        }
        assert_eq!(gcr_decode(0x00), None);
        assert_eq!(gcr_decode(0x1F), None);
    }

    #[test]
    fn test_header_mark_is_52() {
        let mut cells = Vec::new();
        encode_byte(0x08, &mut cells);
        let first8 = cells[..8].iter().fold(0u8, |acc, &b| (acc << 1) | b);
        assert_eq!(first8, 0x52);
    }

    #[test]
    fn test_no_long_runs_in_data() {
        let mut cells = Vec::new();
        for b in 0..=255u8 {
            encode_byte(b, &mut cells);
        }
        let mut ones = 0;
        let mut zeros = 0;
        for &c in &cells {
            if c == 1 {
                ones += 1;
                zeros = 0;
            } else {
                zeros += 1;
                ones = 0;
            }
            assert!(ones < SYNC_MIN);
            assert!(zeros <= 2);
        }
    }

    #[test]
    fn test_round_trip_segments() {
        let mut raw = RawTrack::new(Encoding::GcrCbm);
        raw.mark(MarkKind::Sync);
        raw.extend(&[0x08, 0x12, 0x00, 0x12, 0x41, 0x42, 0x0F, 0x0F]);
        raw.mark(MarkKind::Sync);
        raw.push(0x07, 0, false);
        raw.extend(&[0xAA; 16]);

        let decoded = CbmGcrCodec.decode(&CbmGcrCodec.encode(&raw, 3250.0));
        assert_eq!(decoded.markers_of(MarkKind::Sync).count(), 2);
        let id = decoded.markers_of(MarkKind::IdAddress).next().unwrap().offset;
        assert_eq!(decoded.slice(id, 8).unwrap(), &[0x08, 0x12, 0x00, 0x12, 0x41, 0x42, 0x0F, 0x0F]);
        let data = decoded.markers_of(MarkKind::DataAddress).next().unwrap().offset;
        assert_eq!(decoded.bytes[data], 0x07);
        assert_eq!(decoded.slice(data + 1, 16).unwrap(), &[0xAA; 16]);
    }

    #[test]
    fn test_invalid_code_is_weak() {
        let mut cells = vec![1u8; 12];
        cells.extend_from_slice(&[0, 0, 0, 0, 0, 0, 1, 0, 1, 0]);
        let raw = CbmGcrCodec.decode(&Bitstream::from_bits(cells, 3250.0));
        assert_eq!(raw.len(), 1);
        assert!(raw.weak[0]);
    }
}
