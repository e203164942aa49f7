//! Apple disk-byte GCR, shared by the Apple II and the Macintosh
//!
//! The disk controller shifts bits into a latch until the top bit is set,
//! so a disk byte ("nibble") always starts with a one and extra zeros
//! between nibbles are skipped. Self-sync bytes are FF followed by two
//! zero cells.

use crate::encoding::{Encoding, EncodingCodec, MarkKind, RawTrack};
use crate::pll::Bitstream;

/// 6-bit value to disk byte (6-and-2 and GCR-6 share this table)
pub const WRITE_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6, 0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// Address field prologue
pub const ADDRESS_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0x96];

/// Data field prologue
pub const DATA_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0xAD];

/// Field epilogue
pub const EPILOGUE: [u8; 3] = [0xDE, 0xAA, 0xEB];

/// Disk bytes in an Apple II 6-and-2 data field, checksum included
pub const APPLE_DATA_NIBBLES: usize = 343;

/// Bytes in a Macintosh sector (12 tag bytes then 512 data bytes)
pub const MAC_SECTOR_LEN: usize = 524;

/// Disk bytes in a Macintosh data field, checksum included
pub const MAC_DATA_NIBBLES: usize = 703;

const BIT_REVERSE: [u8; 4] = [0, 2, 1, 3];

/// Disk byte to 6-bit value
pub fn read_table(nibble: u8) -> Option<u8> {
    WRITE_TABLE.iter().position(|&n| n == nibble).map(|v| v as u8)
}

/// Encode a byte as two 4-and-4 disk bytes
pub fn encode_44(value: u8) -> [u8; 2] {
    [(value >> 1) | 0xAA, value | 0xAA]
}

/// Decode two 4-and-4 disk bytes
pub fn decode_44(a: u8, b: u8) -> u8 {
    ((a << 1) | 1) & b
}

/// Encode 256 bytes as 343 disk bytes (342 values plus checksum)
pub fn encode_62(data: &[u8]) -> Vec<u8> {
    let byte = |i: usize| data.get(i).copied().unwrap_or(0);
    let mut values = [0u8; APPLE_DATA_NIBBLES];
    for (c, value) in values.iter_mut().enumerate().take(86) {
        let mut v = BIT_REVERSE[(byte(c) & 3) as usize] | (BIT_REVERSE[(byte(c + 86) & 3) as usize] << 2);
        if c + 172 < 256 {
            v |= BIT_REVERSE[(byte(c + 172) & 3) as usize] << 4;
        }
        *value = v;
    }
    for c in 0..256 {
        values[86 + c] = byte(c) >> 2;
    }
    values[342] = values[341];
    for location in (1..342).rev() {
        values[location] ^= values[location - 1];
    }
    values.iter().map(|&v| WRITE_TABLE[(v & 0x3F) as usize]).collect()
}

/// Decode 343 disk bytes; returns the payload and whether the checksum matched.
///
/// Disk bytes outside the table decode as zero and fail the checksum.
pub fn decode_62(nibbles: &[u8]) -> (Vec<u8>, bool) {
    let mut valid = nibbles.len() >= APPLE_DATA_NIBBLES;
    let mut values = [0u8; APPLE_DATA_NIBBLES];
    for (i, value) in values.iter_mut().enumerate() {
        *value = match nibbles.get(i).copied().and_then(read_table) {
            Some(v) => v,
            None => {
                valid = false;
                0
            }
        };
    }
    let mut plain = [0u8; 342];
    let mut last = 0u8;
    for (i, p) in plain.iter_mut().enumerate() {
        last ^= values[i];
        *p = last;
    }
    let checksum_ok = valid && values[342] == last;

    let mut data = vec![0u8; 256];
    for (c, out) in data.iter_mut().enumerate() {
        let aux = plain[c % 86] >> ((c / 86) * 2);
        *out = (plain[86 + c] << 2) | BIT_REVERSE[(aux & 3) as usize];
    }
    (data, checksum_ok)
}

/// Encode 524 Macintosh bytes as 703 6-bit values (not yet table-mapped)
pub fn encode_mac_values(input: &[u8]) -> Vec<u8> {
    const GROUPS: usize = MAC_SECTOR_LEN / 3;
    let byte = |i: usize| input.get(i).copied().unwrap_or(0) as u32;
    let mut b1 = [0u8; GROUPS + 1];
    let mut b2 = [0u8; GROUPS + 1];
    let mut b3 = [0u8; GROUPS + 1];
    let (mut c1, mut c2, mut c3) = (0u32, 0u32, 0u32);
    let mut pos = 0;
    let mut j = 0;
    loop {
        c1 = (c1 & 0xFF) << 1;
        if c1 & 0x100 != 0 {
            c1 += 1;
        }
        let val = byte(pos);
        pos += 1;
        c3 += val;
        if c1 & 0x100 != 0 {
            c3 += 1;
            c1 &= 0xFF;
        }
        b1[j] = ((val ^ c1) & 0xFF) as u8;

        let val = byte(pos);
        pos += 1;
        c2 += val;
        if c3 > 0xFF {
            c2 += 1;
            c3 &= 0xFF;
        }
        b2[j] = ((val ^ c3) & 0xFF) as u8;

        if pos == MAC_SECTOR_LEN {
            break;
        }

        let val = byte(pos);
        pos += 1;
        c1 += val;
        if c2 > 0xFF {
            c1 += 1;
            c2 &= 0xFF;
        }
        b3[j] = ((val ^ c2) & 0xFF) as u8;
        j += 1;
    }
    let c4 = ((c1 & 0xC0) >> 6) | ((c2 & 0xC0) >> 4) | ((c3 & 0xC0) >> 2);
    b3[GROUPS] = 0;

    let mut out = Vec::with_capacity(MAC_DATA_NIBBLES);
    for i in 0..=GROUPS {
        let w4 = ((b1[i] & 0xC0) >> 2) | ((b2[i] & 0xC0) >> 4) | ((b3[i] & 0xC0) >> 6);
        out.push(w4);
        out.push(b1[i] & 0x3F);
        out.push(b2[i] & 0x3F);
        if i != GROUPS {
            out.push(b3[i] & 0x3F);
        }
    }
    for c in [c4, c3, c2, c1] {
        out.push((c & 0x3F) as u8);
    }
    out
}

/// Decode 703 6-bit values into 524 Macintosh bytes and a checksum verdict
pub fn decode_mac_values(values: &[u8]) -> (Vec<u8>, bool) {
    const GROUPS: usize = MAC_SECTOR_LEN / 3;
    let mut input = values.iter().copied().chain(std::iter::repeat(0));
    let mut next = move || input.next().unwrap_or(0) as u32;
    let mut b1 = [0u32; GROUPS + 1];
    let mut b2 = [0u32; GROUPS + 1];
    let mut b3 = [0u32; GROUPS + 1];
    for i in 0..=GROUPS {
        let w4 = next();
        let w1 = next();
        let w2 = next();
        b1[i] = (w1 & 0x3F) | ((w4 << 2) & 0xC0);
        b2[i] = (w2 & 0x3F) | ((w4 << 4) & 0xC0);
        if i != GROUPS {
            let w3 = next();
            b3[i] = (w3 & 0x3F) | ((w4 << 6) & 0xC0);
        }
    }

    let mut out = Vec::with_capacity(MAC_SECTOR_LEN);
    let (mut c1, mut c2, mut c3) = (0u32, 0u32, 0u32);
    let mut j = 0;
    loop {
        c1 = (c1 & 0xFF) << 1;
        if c1 & 0x100 != 0 {
            c1 += 1;
        }
        let val = (b1[j] ^ c1) & 0xFF;
        c3 += val;
        if c1 & 0x100 != 0 {
            c3 += 1;
            c1 &= 0xFF;
        }
        out.push(val as u8);

        let val = (b2[j] ^ c3) & 0xFF;
        c2 += val;
        if c3 > 0xFF {
            c2 += 1;
            c3 &= 0xFF;
        }
        out.push(val as u8);

        if out.len() == MAC_SECTOR_LEN {
            break;
        }

        let val = (b3[j] ^ c2) & 0xFF;
        c1 += val;
        if c2 > 0xFF {
            c1 += 1;
            c2 &= 0xFF;
        }
        out.push(val as u8);
        j += 1;
    }

    let c4 = ((c1 & 0xC0) >> 6) | ((c2 & 0xC0) >> 4) | ((c3 & 0xC0) >> 2);
    let expected = [c4 & 0x3F, c3 & 0x3F, c2 & 0x3F, c1 & 0x3F];
    let found = [next(), next(), next(), next()];
    (out, values.len() >= MAC_DATA_NIBBLES && expected == found)
}

/// Latch disk bytes out of a bitstream and mark address/data prologues
fn latch(bits: &Bitstream, encoding: Encoding) -> RawTrack {
    let mut raw = RawTrack::new(encoding);
    let cells = bits.bits();
    let mut i = 0;
    while i < cells.len() {
        if cells[i] == 0 {
            i += 1;
            continue;
        }
        if i + 8 > cells.len() {
            break;
        }
        let nibble = cells[i..i + 8].iter().fold(0u8, |acc, &b| (acc << 1) | b);
        raw.push(nibble, i, bits.any_weak(i, 8));
        i += 8;

        let n = raw.len();
        if n >= 3 && raw.bytes[n - 3] == 0xD5 && raw.bytes[n - 2] == 0xAA {
            match raw.bytes[n - 1] {
                0x96 => raw.mark_at(n - 3, MarkKind::IdAddress),
                0xAD => raw.mark_at(n - 3, MarkKind::DataAddress),
                _ => {}
            }
        }
    }
    raw
}

/// Cells for a raw track of disk bytes; sync-marked FF bytes get two extra zero cells
fn write_nibbles(raw: &RawTrack, cell_ns: f64) -> Bitstream {
    let mut cells = Vec::with_capacity(raw.len() * 9);
    for (i, &b) in raw.bytes.iter().enumerate() {
        for k in (0..8).rev() {
            cells.push((b >> k) & 1);
        }
        if b == 0xFF && raw.has_marker(i, MarkKind::Sync) {
            cells.extend_from_slice(&[0, 0]);
        }
    }
    Bitstream::from_bits(cells, cell_ns)
}

/// Apple II disk-byte codec
#[derive(Debug, Clone, Copy, Default)]
pub struct AppleGcrCodec;

impl EncodingCodec for AppleGcrCodec {
    fn encoding(&self) -> Encoding {
        Encoding::GcrApple
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        latch(bits, Encoding::GcrApple)
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        write_nibbles(raw, cell_ns)
    }
}

/// Macintosh disk-byte codec
#[derive(Debug, Clone, Copy, Default)]
pub struct MacGcrCodec;

impl EncodingCodec for MacGcrCodec {
    fn encoding(&self) -> Encoding {
        Encoding::GcrMac
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        latch(bits, Encoding::GcrMac)
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        write_nibbles(raw, cell_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_table_properties() {
        for &n in WRITE_TABLE.iter() {
            assert!(n & 0x80 != 0);
            assert_ne!(n, 0xD5);
            assert_ne!(n, 0xAA);
        }
        assert_eq!(read_table(0x96), Some(0));
        assert_eq!(read_table(0xFF), Some(63));
        assert_eq!(read_table(0xD5), None);
    }

    #[test]
    fn test_44() {
        for v in [0x00u8, 0xFE, 0x11, 0xA5] {
            let [a, b] = encode_44(v);
            assert_eq!(decode_44(a, b), v);
        }
    }

    #[test]
    fn test_62_round_trip_and_checksum() {
        let data: Vec<u8> = (0..256).map(|i| (i * 7 + 3) as u8).collect();
        let nibbles = encode_62(&data);
        assert_eq!(nibbles.len(), APPLE_DATA_NIBBLES);
        let (back, ok) = decode_62(&nibbles);
        assert!(ok);
        assert_eq!(back, data);

        let mut broken = nibbles.clone();
        broken[100] = if broken[100] == 0x96 { 0x97 } else { 0x96 };
        assert!(!decode_62(&broken).1);
    }

    #[test]
    fn test_mac_round_trip_and_checksum() {
        let data: Vec<u8> = (0..MAC_SECTOR_LEN).map(|i| (i * 13) as u8).collect();
        let values = encode_mac_values(&data);
        assert_eq!(values.len(), MAC_DATA_NIBBLES);
        assert!(values.iter().all(|&v| v < 64));
        let (back, ok) = decode_mac_values(&values);
        assert!(ok);
        assert_eq!(back, data);

        let mut broken = values.clone();
        broken[10] ^= 0x01;
        assert!(!decode_mac_values(&broken).1);
    }

    #[test]
    fn test_latch_skips_sync_zeros() {
        let mut raw = RawTrack::new(Encoding::GcrApple);
        for _ in 0..5 {
            raw.mark(MarkKind::Sync);
            raw.push(0xFF, 0, false);
        }
        raw.extend(&ADDRESS_PROLOGUE);
        raw.extend(&encode_44(254));
        raw.extend(&EPILOGUE);
        raw.extend(&DATA_PROLOGUE);

        let bits = AppleGcrCodec.encode(&raw, 4000.0);
        assert_eq!(bits.len(), 5 * 10 + 11 * 8);
        let decoded = AppleGcrCodec.decode(&bits);
        assert_eq!(decoded.bytes, raw.bytes);
        let id = decoded.markers_of(MarkKind::IdAddress).next().unwrap().offset;
        assert_eq!(id, 5);
        let data = decoded.markers_of(MarkKind::DataAddress).next().unwrap().offset;
        assert_eq!(data, 13);
    }
}
