//! Victor 9000 GCR: Commodore code table, Victor record ids, zoned bit rate

use crate::encoding::gcr_cbm;
use crate::encoding::{Encoding, EncodingCodec, MarkKind, RawTrack};
use crate::pll::Bitstream;

/// Header record id
pub const HEADER_ID: u8 = 0x07;

/// Data record id
pub const DATA_ID: u8 = 0x08;

fn classify(byte: u8) -> Option<MarkKind> {
    match byte {
        HEADER_ID => Some(MarkKind::IdAddress),
        DATA_ID => Some(MarkKind::DataAddress),
        _ => None,
    }
}

/// Victor 9000 GCR codec
#[derive(Debug, Clone, Copy, Default)]
pub struct VictorGcrCodec;

impl EncodingCodec for VictorGcrCodec {
    fn encoding(&self) -> Encoding {
        Encoding::GcrVictor
    }

    fn decode(&self, bits: &Bitstream) -> RawTrack {
        gcr_cbm::decode_segments(bits, Encoding::GcrVictor, classify)
    }

    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream {
        gcr_cbm::encode_segments(raw, cell_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ids_swap_relative_to_commodore() {
        let mut raw = RawTrack::new(Encoding::GcrVictor);
        raw.mark(MarkKind::Sync);
        raw.extend(&[HEADER_ID, 3, 4, 7]);
        let decoded = VictorGcrCodec.decode(&VictorGcrCodec.encode(&raw, 2000.0));
        assert_eq!(decoded.encoding, Encoding::GcrVictor);
        let id = decoded.markers_of(MarkKind::IdAddress).next().unwrap().offset;
        assert_eq!(decoded.slice(id, 4).unwrap(), &[HEADER_ID, 3, 4, 7]);
        assert_eq!(decoded.markers_of(MarkKind::DataAddress).count(), 0);
    }
}
