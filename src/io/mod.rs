//! Bounds-checked binary reading and writing for container formats

use crate::error::{FloppyError, Result};

/// Cursor over a byte slice; every read reports the offset it failed at
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Start reading at offset 0
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at an offset
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    /// Current offset
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Move to an absolute offset
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(FloppyError::parse(pos, "seek past end of data"));
        }
        self.pos = pos;
        Ok(())
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// True when nothing is left
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take `len` bytes
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                FloppyError::parse(self.pos, format!("need {} bytes, {} left", len, self.remaining()))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Skip `len` bytes
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    /// Read a fixed-size array
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Read one byte
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a little-endian u16
    pub fn u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a big-endian u16
    pub fn u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    /// Read a little-endian u32
    pub fn u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Read a big-endian u32
    pub fn u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Expect a magic byte string
    pub fn expect(&mut self, magic: &[u8]) -> Result<()> {
        let at = self.pos;
        let found = self.bytes(magic.len())?;
        if found != magic {
            return Err(FloppyError::parse(
                at,
                format!("expected {:02X?}, found {:02X?}", magic, found),
            ));
        }
        Ok(())
    }
}

/// Little helpers for building container files
pub trait ByteWriter {
    /// Append a little-endian u16
    fn put_u16_le(&mut self, v: u16);
    /// Append a big-endian u16
    fn put_u16_be(&mut self, v: u16);
    /// Append a little-endian u32
    fn put_u32_le(&mut self, v: u32);
    /// Append a big-endian u32
    fn put_u32_be(&mut self, v: u32);
    /// Overwrite a little-endian u32 at an offset
    fn patch_u32_le(&mut self, at: usize, v: u32);
    /// Append `len` bytes of `value`
    fn put_fill(&mut self, value: u8, len: usize);
}

impl ByteWriter for Vec<u8> {
    fn put_u16_le(&mut self, v: u16) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u16_be(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32_le(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32_be(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn patch_u32_le(&mut self, at: usize, v: u32) {
        if at + 4 <= self.len() {
            self[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    fn put_fill(&mut self, value: u8, len: usize) {
        self.resize(self.len() + len, value);
    }
}

/// Read a little-endian u16 at an offset, zero when out of range
pub fn le16(data: &[u8], at: usize) -> u16 {
    match data.get(at..at + 2) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => 0,
    }
}

/// Read a big-endian u16 at an offset, zero when out of range
pub fn be16(data: &[u8], at: usize) -> u16 {
    match data.get(at..at + 2) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}

/// Read a little-endian u32 at an offset, zero when out of range
pub fn le32(data: &[u8], at: usize) -> u32 {
    match data.get(at..at + 4) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

/// Read a big-endian u32 at an offset, zero when out of range
pub fn be32(data: &[u8], at: usize) -> u32 {
    match data.get(at..at + 4) {
        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_offset() {
        let data = [1u8, 2, 3];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.u16_le().unwrap(), 0x0201);
        match r.u32_be() {
            Err(FloppyError::ParseError { offset, .. }) => assert_eq!(offset, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expect_magic() {
        let mut r = ByteReader::new(b"SCP\x19");
        r.expect(b"SCP").unwrap();
        assert_eq!(r.u8().unwrap(), 0x19);
        assert!(ByteReader::new(b"XYZ").expect(b"SCP").is_err());
    }

    #[test]
    fn test_writer() {
        let mut out = Vec::new();
        out.put_u16_be(0x1234);
        out.put_u32_le(0);
        out.patch_u32_le(2, 0xAABBCCDD);
        out.put_fill(0xE5, 2);
        assert_eq!(out, vec![0x12, 0x34, 0xDD, 0xCC, 0xBB, 0xAA, 0xE5, 0xE5]);
        assert_eq!(be16(&out, 0), 0x1234);
        assert_eq!(le32(&out, 2), 0xAABBCCDD);
        assert_eq!(le16(&out, 7), 0);
    }
}
