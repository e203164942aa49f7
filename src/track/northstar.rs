//! North Star hard-sectored MFM
//!
//! Ten sectors per revolution, each started by its own sector hole. A
//! record is a run of zero bytes, the sync byte FB, 512 data bytes and a
//! checksum (XOR each byte in, then rotate left). There is no header, so
//! sectors are numbered by their order after the index.

use crate::disk::{Sector, SectorId, Track};
use crate::encoding::mfm;
use crate::encoding::{Encoding, MarkKind, RawTrack};
use crate::error::{FloppyError, Result};
use crate::pll::Bitstream;
use crate::profile::Platform;
use crate::track::{finish, Evidence, TrackDriver};

/// Sectors per revolution
pub const SECTORS: usize = 10;

/// Sync byte opening a record
pub const SYNC_BYTE: u8 = 0xFB;

/// MFM cells of a zero byte followed by the sync byte
pub const SYNC_PATTERN: u32 = 0xAAAA_5545;

const DATA_LEN: usize = 512;

/// Record checksum
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |c, &b| (c ^ b).rotate_left(1))
}

/// North Star driver
#[derive(Debug, Clone, Copy, Default)]
pub struct NorthstarDriver;

impl TrackDriver for NorthstarDriver {
    fn name(&self) -> &'static str {
        "northstar"
    }

    fn platform(&self) -> Platform {
        Platform::Northstar
    }

    fn encoding(&self) -> Encoding {
        Encoding::Mfm
    }

    fn raw_from_bits(&self, bits: &Bitstream) -> RawTrack {
        let mut raw = RawTrack::new(Encoding::Mfm);
        let cells = bits.bits();
        let mut reg: u32 = 0;
        let mut i = 0;
        while i < cells.len() {
            reg = (reg << 1) | cells[i] as u32;
            i += 1;
            if i < 32 || reg != SYNC_PATTERN {
                continue;
            }
            let start = i - 16;
            raw.mark(MarkKind::IdAddress);
            raw.push(SYNC_BYTE, start, bits.any_weak(start, 16));
            for _ in 0..=DATA_LEN {
                if i + 16 > cells.len() {
                    break;
                }
                raw.push(mfm::decode_cells(&cells[i..i + 16]), i, bits.any_weak(i, 16));
                i += 16;
            }
            reg = 0;
        }
        raw
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        track.filler_byte = 0;
        let mut evidence = Evidence {
            expected: SECTORS,
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != Encoding::Mfm {
            finish(&mut track, self, raw, Evidence::default());
            return track;
        }
        let records: Vec<usize> = raw
            .markers_of(MarkKind::IdAddress)
            .map(|m| m.offset)
            .filter(|&o| raw.bytes[o] == SYNC_BYTE)
            .collect();
        for (n, &at) in records.iter().enumerate() {
            evidence.marks += 1;
            let Some(block) = raw.slice(at + 1, DATA_LEN + 1) else {
                continue;
            };
            if n >= SECTORS {
                evidence.plausible = false;
            }
            let ok = checksum(&block[..DATA_LEN]) == block[DATA_LEN];
            let mut sector = Sector::with_data(SectorId::new(cylinder, head, n as u8, 2), block[..DATA_LEN].to_vec());
            sector.data_crc_ok = ok;
            sector.weak = !ok && raw.any_weak(at, DATA_LEN + 2);
            sector.bit_offset = raw.bit_offset(at);
            if ok {
                evidence.good += 1;
            }
            evidence.sectors += 1;
            track.insert_sector(sector);
        }
        if evidence.sectors == 0 {
            evidence.plausible = false;
        }
        finish(&mut track, self, raw, evidence);
        track
    }

    fn encode(&self, track: &Track) -> Result<RawTrack> {
        let mut raw = RawTrack::new(Encoding::Mfm);
        for sector in track.sectors_by_id() {
            if sector.data().len() != DATA_LEN {
                return Err(FloppyError::invalid_arg(format!(
                    "North Star sector {} holds {} bytes",
                    sector.id.sector,
                    sector.data().len()
                )));
            }
            raw.fill(0x00, 32);
            raw.mark(MarkKind::IdAddress);
            raw.push(SYNC_BYTE, 0, false);
            raw.extend(sector.data());
            let mut sum = checksum(sector.data());
            if !sector.data_crc_ok {
                sum ^= 0xFF;
            }
            raw.push(sum, 0, false);
            raw.fill(0x00, 16);
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::mfm::MfmCodec;
    use crate::encoding::EncodingCodec;

    #[test]
    fn test_checksum_rotates() {
        assert_eq!(checksum(&[0x01]), 0x02);
        assert_eq!(checksum(&[0x80]), 0x01);
        assert_eq!(checksum(&[0x01, 0x01]), 0x06);
    }

    #[test]
    fn test_round_trip_through_cells() {
        let mut original = Track::new(3, 1);
        for s in 0..SECTORS as u8 {
            original.add_sector(Sector::with_data(SectorId::new(3, 1, s, 2), vec![s.wrapping_mul(17); DATA_LEN]));
        }
        let raw = NorthstarDriver.encode(&original).unwrap();
        let bits = MfmCodec.encode(&raw, 2000.0);
        let track = NorthstarDriver.decode(&NorthstarDriver.raw_from_bits(&bits), 3, 1);
        assert_eq!(track.sector_count(), SECTORS);
        assert_eq!(track.confidence, 100);
        assert_eq!(track.get_sector(9).unwrap().data(), &[9u8.wrapping_mul(17); DATA_LEN][..]);
    }

    #[test]
    fn test_ibm_stream_is_not_north_star() {
        let mut raw = RawTrack::new(Encoding::Mfm);
        raw.mark(MarkKind::IdAddress);
        raw.extend(&[0xFE, 0, 0, 1, 2, 0, 0]);
        assert_eq!(NorthstarDriver.probe(&raw), 0);
    }
}
