//! Checksums used by on-disk formats and containers

/// CRC-16/CCITT polynomial used by IBM-style floppy controllers
pub const CCITT_POLY: u16 = 0x1021;

/// Initial register value used by uPD765/WD177x controllers
pub const CCITT_INIT: u16 = 0xFFFF;

/// Continue a CRC-16/CCITT over more bytes
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CCITT_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// CRC-16/CCITT with the controller initial value
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(CCITT_INIT, data)
}

/// Reflected CRC-32 (IEEE) polynomial
pub const CRC32_POLY: u32 = 0xEDB8_8320;

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { CRC32_POLY ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

/// Continue a CRC-32 over more bytes; start from 0
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut c = !crc;
    for &byte in data {
        c = CRC32_TABLE[((c ^ byte as u32) & 0xFF) as usize] ^ (c >> 8);
    }
    !c
}

/// CRC-32 (IEEE) as used by WOZ and IPF containers
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

/// XOR of all bytes, the checksum used by Commodore and Apple GCR sectors
pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/CCITT-FALSE check value
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_id_field() {
        // A1 A1 A1 FE 00 00 01 02 is the first sector header of a PC disk
        assert_eq!(
            crc16(&[0xA1, 0xA1, 0xA1, 0xFE, 0x00, 0x00, 0x01, 0x02]),
            0xCA6F
        );
        let with_crc = crc16(&[0xA1, 0xA1, 0xA1, 0xFE, 0x00, 0x00, 0x01, 0x02, 0xCA, 0x6F]);
        assert_eq!(with_crc, 0);
    }

    #[test]
    fn test_crc32() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
        assert_eq!(crc32_update(crc32(b"1234"), b"56789"), 0xCBF43926);
    }

    #[test]
    fn test_xor8() {
        assert_eq!(xor8(&[0x12, 0x34, 0x56]), 0x12 ^ 0x34 ^ 0x56);
    }
}
