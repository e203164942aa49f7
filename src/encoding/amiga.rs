//! Amiga MFM: whole-sector odd/even bit split behind a double 4489 sync

use crate::encoding::mfm::{self, SYNC_A1};
use crate::encoding::{Encoding, EncodingCodec, MarkKind, RawTrack};
use crate::pll::Bitstream;

/// Decoded bytes in one sector record (info, label, checksums, data)
pub const RECORD_LEN: usize = 540;

/// Field lengths in decoded bytes, in recording order
pub const FIELDS: [usize; 5] = [4, 16, 4, 4, 512];

/// Offset of the header checksum inside a record
pub const HEADER_CHECKSUM_OFFSET: usize = 20;

/// Offset of the data checksum inside a record
pub const DATA_CHECKSUM_OFFSET: usize = 24;

/// Offset of the sector payload inside a record
pub const DATA_OFFSET: usize = 28;

/// Amiga checksum over decoded bytes: longword XOR folded onto the data bits
pub fn checksum(data: &[u8]) -> u32 {
    let x = data
        .chunks(4)
        .map(|c| {
            let mut long = [0u8; 4];
            long[..c.len()].copy_from_slice(c);
            u32::from_be_bytes(long)
        })
        .fold(0u32, |acc, l| acc ^ l);
    ((x >> 1) ^ x) & 0x5555_5555
}

/// Split a field into its odd-bit half followed by its even-bit half
pub fn split_bits(field: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(field.len() * 8);
    for shift in [1u8, 0] {
        for &b in field {
            for k in (0..4).rev() {
                bits.push((b >> (k * 2 + shift)) & 1);
            }
        }
    }
    bits
}

/// Reassemble a field from odd/even data bits starting at `first` (in data-bit units)
fn join_bits(cells: &[u8], sync_end: usize, first: usize, len: usize) -> Vec<u8> {
    let bit = |j: usize| cells.get(sync_end + 2 * j + 1).copied().unwrap_or(0) & 1;
    (0..len)
        .map(|k| {
            let mut byte = 0u8;
            for n in 0..4 {
                let odd = bit(first + 4 * k + n);
                let even = bit(first + 4 * len + 4 * k + n);
                byte |= odd << (7 - n * 2);
                byte |= even << (6 - n * 2);
            }
            byte
        })
        .collect()
}

/// Amiga sector-level MFM codec
#[derive(Debug, Clone, Copy, Default)]
pub struct AmigaCodec;

impl EncodingCodec for AmigaCodec {
    fn encoding(&self) -> Encoding {
        Encoding::AmigaMfm
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        let mut raw = RawTrack::new(Encoding::AmigaMfm);
        let cells = bits.bits();
        let record_cells = RECORD_LEN * 16;
        let double_sync = ((SYNC_A1 as u32) << 16) | SYNC_A1 as u32;
        let mut reg: u32 = 0;
        let mut i = 0;

        while i < cells.len() {
            reg = (reg << 1) | cells[i] as u32;
            i += 1;
            if i < 32 || reg != double_sync {
                continue;
            }
            let sync_end = i;
            if sync_end + record_cells > cells.len() {
                break;
            }
            raw.mark(MarkKind::IdAddress);
            let mut first = 0;
            for (n, &len) in FIELDS.iter().enumerate() {
                if n == FIELDS.len() - 1 {
                    raw.mark(MarkKind::DataAddress);
                }
                let field = join_bits(cells, sync_end, first, len);
                for (k, byte) in field.into_iter().enumerate() {
                    let odd_cell = sync_end + 2 * (first + 4 * k);
                    let even_cell = sync_end + 2 * (first + 4 * len + 4 * k);
                    let weak = bits.any_weak(odd_cell, 8) || bits.any_weak(even_cell, 8);
                    raw.push(byte, odd_cell, weak);
                }
                first += len * 8;
            }
            i = sync_end + record_cells;
            reg = 0;
        }
        raw
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        let mut cells = Vec::with_capacity(raw.len() * 16 + 64);
        let mut prev = 0u8;
        let mut i = 0;
        while i < raw.len() {
            if raw.has_marker(i, MarkKind::IdAddress) && i + RECORD_LEN <= raw.len() {
                prev = mfm::encode_byte(0x00, prev, &mut cells);
                mfm::encode_byte(0x00, prev, &mut cells);
                mfm::push_pattern(SYNC_A1, &mut cells);
                mfm::push_pattern(SYNC_A1, &mut cells);
                prev = 1;
                let mut offset = i;
                for &len in FIELDS.iter() {
                    let split = split_bits(&raw.bytes[offset..offset + len]);
                    prev = mfm::encode_data_bits(&split, prev, &mut cells);
                    offset += len;
                }
                i += RECORD_LEN;
            } else {
                prev = mfm::encode_byte(raw.bytes[i], prev, &mut cells);
                i += 1;
            }
        }
        Bitstream::from_bits(cells, cell_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fill: u8) -> Vec<u8> {
        let mut rec = vec![0u8; RECORD_LEN];
        rec[..4].copy_from_slice(&[0xFF, 0x03, 0x05, 0x06]);
        for (i, b) in rec[DATA_OFFSET..].iter_mut().enumerate() {
            *b = fill.wrapping_add(i as u8);
        }
        let hdr = checksum(&rec[..20]);
        rec[HEADER_CHECKSUM_OFFSET..24].copy_from_slice(&hdr.to_be_bytes());
        let data = checksum(&rec[DATA_OFFSET..]);
        rec[DATA_CHECKSUM_OFFSET..28].copy_from_slice(&data.to_be_bytes());
        rec
    }

    #[test]
    fn test_split_bits_order() {
        // 0xA5 = 1010_0101: odd bits 1,1,0,0 then even bits 0,0,1,1
        assert_eq!(split_bits(&[0xA5]), vec![1, 1, 0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_checksum_matches_raw_definition() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        let mut expected = 0u32;
        for c in data.chunks(4) {
            let l = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
            expected ^= (l >> 1) & 0x5555_5555;
            expected ^= l & 0x5555_5555;
        }
        assert_eq!(checksum(&data), expected);
    }

    #[test]
    fn test_round_trip_two_records() {
        let mut raw = RawTrack::new(Encoding::AmigaMfm);
        for fill in [0x10u8, 0x80] {
            raw.mark(MarkKind::IdAddress);
            raw.extend(&record(fill));
        }
        raw.fill(0x00, 64);

        let bits = AmigaCodec.encode(&raw, 2000.0);
        let decoded = AmigaCodec.decode(&bits);
        let starts: Vec<usize> = decoded
            .markers_of(MarkKind::IdAddress)
            .map(|m| m.offset)
            .collect();
        assert_eq!(starts, vec![0, RECORD_LEN]);
        assert_eq!(decoded.slice(0, RECORD_LEN).unwrap(), &record(0x10)[..]);
        assert_eq!(decoded.slice(RECORD_LEN, RECORD_LEN).unwrap(), &record(0x80)[..]);
    }

    #[test]
    fn test_truncated_record_ignored() {
        let mut raw = RawTrack::new(Encoding::AmigaMfm);
        raw.mark(MarkKind::IdAddress);
        raw.extend(&record(0));
        let bits = AmigaCodec.encode(&raw, 2000.0);
        let cut = Bitstream::from_bits(bits.bits()[..bits.len() / 2].to_vec(), 2000.0);
        assert!(AmigaCodec.decode(&cut).is_empty());
    }
}
