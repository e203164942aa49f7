//! Commodore 1541-family sector layout
//!
//! Header block: `08 checksum sector track id2 id1 0F 0F`, where the
//! checksum is the XOR of sector, track and the two disk id bytes.
//! Data block: `07 <256 bytes> xor 00 00`. Tracks are numbered from 1;
//! the disk model stores them by cylinder (track - 1).

use crate::disk::{Sector, SectorId, Track};
use crate::encoding::crc::xor8;
use crate::encoding::{Encoding, MarkKind, RawTrack};
use crate::error::{FloppyError, Result};
use crate::profile::{c64_zone, Platform};
use crate::track::{finish, Evidence, TrackDriver};

/// Header block id
pub const HEADER_BLOCK: u8 = 0x08;
/// Data block id
pub const DATA_BLOCK: u8 = 0x07;

/// Commodore GCR driver
#[derive(Debug, Clone, Copy, Default)]
pub struct CbmDriver;

impl TrackDriver for CbmDriver {
    fn name(&self) -> &'static str {
        "cbm"
    }

    fn platform(&self) -> Platform {
        Platform::C64
    }

    fn encoding(&self) -> Encoding {
        Encoding::GcrCbm
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        track.filler_byte = 0;
        let mut evidence = Evidence {
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != Encoding::GcrCbm {
            finish(&mut track, self, raw, Evidence::default());
            return track;
        }
        let headers: Vec<usize> = raw.markers_of(MarkKind::IdAddress).map(|m| m.offset).collect();
        let mut header_track: Option<u8> = None;

        for (n, &at) in headers.iter().enumerate() {
            evidence.marks += 1;
            let Some(h) = raw.slice(at, 8) else {
                continue;
            };
            let (stored, sector_id, number, id2, id1) = (h[1], h[2], h[3], h[4], h[5]);
            let header_ok = stored == sector_id ^ number ^ id2 ^ id1 && !raw.any_weak(at, 6);
            if header_ok {
                let zone = c64_zone(number.saturating_sub(1));
                if number == 0 || sector_id >= zone || header_track.is_some_and(|t| t != number) {
                    evidence.plausible = false;
                }
                header_track.get_or_insert(number);
            }

            let next = headers.get(n + 1).copied().unwrap_or(usize::MAX);
            let data_at = raw
                .markers_of(MarkKind::DataAddress)
                .map(|m| m.offset)
                .find(|&o| o > at && o < next);
            let id = SectorId::new(number.saturating_sub(1), 0, sector_id, 1);
            let mut sector = match data_at.and_then(|o| raw.slice(o + 1, 257).map(|b| (o, b))) {
                Some((o, block)) => {
                    evidence.marks += 1;
                    let data_ok = xor8(&block[..256]) == block[256];
                    let mut s = Sector::with_data(id, block[..256].to_vec());
                    s.data_crc_ok = data_ok;
                    s.weak = !data_ok && raw.any_weak(o, 258);
                    s
                }
                None => {
                    let mut s = Sector::with_data(id, vec![0; 256]);
                    s.data_crc_ok = false;
                    s
                }
            };
            sector.header_crc_ok = header_ok;
            sector.tags = vec![id2, id1];
            sector.bit_offset = raw.bit_offset(at);
            if header_ok && sector.data_crc_ok {
                evidence.good += 1;
            }
            evidence.sectors += 1;
            track.insert_sector(sector);
        }
        evidence.expected = match header_track {
            Some(t) => c64_zone(t.saturating_sub(1)) as usize,
            None => c64_zone(cylinder) as usize,
        };
        if evidence.sectors == 0 {
            evidence.plausible = false;
        }
        finish(&mut track, self, raw, evidence);
        track
    }

    fn encode(&self, track: &Track) -> Result<RawTrack> {
        let number = track.cylinder + 1;
        let mut raw = RawTrack::new(Encoding::GcrCbm);
        for sector in track.sectors_by_id() {
            if sector.data().len() != 256 {
                return Err(FloppyError::invalid_arg(format!(
                    "Commodore sector {} holds {} bytes",
                    sector.id.sector,
                    sector.data().len()
                )));
            }
            let (id2, id1) = match sector.tags.as_slice() {
                [a, b, ..] => (*a, *b),
                _ => (0x30, 0x30),
            };
            let mut check = sector.id.sector ^ number ^ id2 ^ id1;
            if !sector.header_crc_ok {
                check ^= 0xFF;
            }
            raw.mark(MarkKind::IdAddress);
            raw.extend(&[HEADER_BLOCK, check, sector.id.sector, number, id2, id1, 0x0F, 0x0F]);

            raw.mark(MarkKind::DataAddress);
            raw.push(DATA_BLOCK, 0, false);
            raw.extend(sector.data());
            let mut sum = xor8(sector.data());
            if !sector.data_crc_ok {
                sum ^= 0xFF;
            }
            raw.extend(&[sum, 0x00, 0x00]);
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::gcr_cbm::CbmGcrCodec;
    use crate::encoding::EncodingCodec;

    fn c64_track(cylinder: u8) -> Track {
        let mut track = Track::new(cylinder, 0);
        for s in 0..c64_zone(cylinder) {
            let mut sector = Sector::with_data(SectorId::new(cylinder, 0, s, 1), vec![s.wrapping_mul(3); 256]);
            sector.tags = vec![0x41, 0x42];
            track.add_sector(sector);
        }
        track
    }

    #[test]
    fn test_full_gcr_round_trip() {
        for cylinder in [0u8, 17, 34] {
            let original = c64_track(cylinder);
            let raw = CbmDriver.encode(&original).unwrap();
            let bits = CbmGcrCodec.encode(&raw, 3250.0);
            let track = CbmDriver.decode(&CbmGcrCodec.decode(&bits), cylinder, 0);
            assert_eq!(track.sector_count(), c64_zone(cylinder) as usize);
            assert_eq!(track.confidence, 100, "cylinder {}", cylinder);
            for s in original.sectors() {
                let back = track.get_sector(s.id.sector).unwrap();
                assert_eq!(back.data(), s.data());
                assert_eq!(back.tags, vec![0x41, 0x42]);
                assert_eq!(back.id.cylinder, cylinder);
            }
        }
    }

    #[test]
    fn test_header_checksum() {
        let mut raw = RawTrack::new(Encoding::GcrCbm);
        raw.mark(MarkKind::IdAddress);
        raw.extend(&[HEADER_BLOCK, 0x00, 3, 18, 0x41, 0x42, 0x0F, 0x0F]);
        let track = CbmDriver.decode(&raw, 17, 0);
        let sector = track.get_sector(3).unwrap();
        assert!(!sector.header_crc_ok);
        assert!(!sector.data_crc_ok);
    }
}
