//! DiskMasher (DMS) archives
//!
//! Recognised so that detection names them, but the compressed track
//! records are not unpacked.

use crate::error::{FloppyError, Result};
use crate::image::{Image, ImageCodec, ImageKind, ParseOptions};
use crate::io::be16;

const MAGIC: &[u8] = b"DMS!";

/// Header fields worth reporting when refusing an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmsHeader {
    /// First cylinder stored
    pub low_track: u16,
    /// Last cylinder stored
    pub high_track: u16,
    /// Packing mode of the archive
    pub compression: u16,
}

/// Read the fixed 56-byte header
pub fn header(data: &[u8]) -> Result<DmsHeader> {
    if !data.starts_with(MAGIC) {
        return Err(FloppyError::invalid_format("not a DMS archive"));
    }
    if data.len() < 56 {
        return Err(FloppyError::parse(data.len(), "DMS header truncated"));
    }
    Ok(DmsHeader {
        low_track: be16(data, 16),
        high_track: be16(data, 18),
        compression: be16(data, 50),
    })
}

/// DiskMasher archives
#[derive(Debug, Clone, Copy, Default)]
pub struct DmsCodec;

impl ImageCodec for DmsCodec {
    fn name(&self) -> &'static str {
        "dms"
    }

    fn description(&self) -> &'static str {
        "DiskMasher archive (detection only)"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["dms"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if data.starts_with(MAGIC) {
            95
        } else {
            0
        }
    }

    fn parse(&self, data: &[u8], _options: &ParseOptions) -> Result<Image> {
        let h = header(data)?;
        Err(FloppyError::unsupported(format!(
            "DMS unpacking (tracks {}-{}, mode {})",
            h.low_track, h.high_track, h.compression
        )))
    }

    fn can_write(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::image::detect;

    #[test]
    fn test_detected_but_not_unpacked() {
        let mut data = vec![0u8; 56];
        data[..4].copy_from_slice(MAGIC);
        data[19] = 79;
        assert_eq!(detect(None, &data).unwrap().codec.name(), "dms");
        assert_eq!(header(&data).unwrap().high_track, 79);
        let err = DmsCodec.parse(&data, &ParseOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(DmsCodec.parse(&data[..10], &ParseOptions::default()).is_err());
    }
}
