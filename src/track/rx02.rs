//! DEC RX02 sector layout: FM headers, M2FM double-density data
//!
//! ID field `FE track 00 sector 00 crc` is plain FM. A data mark of FD
//! introduces 256 bytes plus CRC recorded in M2FM; FB introduces a
//! single-density 128-byte FM field.

use crate::disk::{Sector, SectorId, Track};
use crate::encoding::crc::crc16;
use crate::encoding::m2fm::M2FM_DATA_MARK;
use crate::encoding::{Encoding, MarkKind, RawTrack};
use crate::error::{FloppyError, Result};
use crate::profile::Platform;
use crate::track::{finish, Evidence, TrackDriver};

/// Sectors on every RX02 track
pub const SECTORS: usize = 26;

const DATA_MARK_WINDOW: usize = 40;

/// DEC RX02 driver
#[derive(Debug, Clone, Copy, Default)]
pub struct Rx02Driver;

fn stored_crc(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

impl TrackDriver for Rx02Driver {
    fn name(&self) -> &'static str {
        "rx02"
    }

    fn platform(&self) -> Platform {
        Platform::Dec
    }

    fn encoding(&self) -> Encoding {
        Encoding::M2fm
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        let mut evidence = Evidence {
            expected: SECTORS,
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != Encoding::M2fm {
            finish(&mut track, self, raw, Evidence::default());
            return track;
        }
        let headers: Vec<usize> = raw
            .markers_of(MarkKind::IdAddress)
            .map(|m| m.offset)
            .filter(|&o| raw.bytes[o] == 0xFE)
            .collect();
        for (n, &at) in headers.iter().enumerate() {
            evidence.marks += 1;
            let Some(h) = raw.slice(at, 7) else {
                continue;
            };
            let header_ok = crc16(&h[..5]) == stored_crc(&h[5..]);
            let (number, sector_id) = (h[1], h[3]);
            if header_ok && (sector_id == 0 || sector_id as usize > SECTORS || number != cylinder) {
                evidence.plausible = false;
            }

            let next = headers.get(n + 1).copied().unwrap_or(usize::MAX);
            let data_at = raw
                .markers_of(MarkKind::DataAddress)
                .map(|m| m.offset)
                .find(|&o| o > at && o < next && o < at + DATA_MARK_WINDOW);
            let field = data_at.and_then(|o| {
                let len = if raw.bytes[o] == M2FM_DATA_MARK { 256 } else { 128 };
                raw.slice(o, len + 3).map(|b| (o, len, b))
            });
            let mut sector = match field {
                Some((o, len, b)) => {
                    evidence.marks += 1;
                    let ok = crc16(&b[..len + 1]) == stored_crc(&b[len + 1..]);
                    let size_code = if len == 256 { 1 } else { 0 };
                    let mut s = Sector::with_data(SectorId::new(number, 0, sector_id, size_code), b[1..=len].to_vec());
                    s.data_crc_ok = ok;
                    s.weak = !ok && raw.any_weak(o, len + 3);
                    s
                }
                None => {
                    let mut s = Sector::with_data(SectorId::new(number, 0, sector_id, 1), vec![0; 256]);
                    s.data_crc_ok = false;
                    s
                }
            };
            sector.header_crc_ok = header_ok;
            sector.bit_offset = raw.bit_offset(at);
            if header_ok && sector.data_crc_ok {
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
        let mut raw = RawTrack::new(Encoding::M2fm);
        raw.fill(0xFF, 40);
        for sector in track.sectors_by_id() {
            let mark = match sector.data().len() {
                256 => M2FM_DATA_MARK,
                128 => 0xFB,
                n => {
                    return Err(FloppyError::invalid_arg(format!(
                        "RX02 sector {} holds {} bytes",
                        sector.id.sector, n
                    )))
                }
            };
            raw.fill(0x00, 6);
            raw.mark(MarkKind::IdAddress);
            let header = [0xFE, track.cylinder, 0x00, sector.id.sector, 0x00];
            let mut crc = crc16(&header);
            if !sector.header_crc_ok {
                crc ^= 0xFFFF;
            }
            raw.extend(&header);
            raw.extend(&crc.to_be_bytes());
            raw.fill(0xFF, 11);
            raw.fill(0x00, 6);

            raw.mark(MarkKind::DataAddress);
            raw.push(mark, 0, false);
            raw.extend(sector.data());
            let mut crc = crc16(&[&[mark][..], sector.data()].concat());
            if !sector.data_crc_ok {
                crc ^= 0xFFFF;
            }
            raw.extend(&crc.to_be_bytes());
            raw.fill(0xFF, 27);
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::m2fm::M2fmCodec;
    use crate::encoding::EncodingCodec;

    #[test]
    fn test_double_density_round_trip() {
        let mut original = Track::new(12, 0);
        for s in 1..=SECTORS as u8 {
            original.add_sector(Sector::with_data(SectorId::new(12, 0, s, 1), vec![s; 256]));
        }
        let raw = Rx02Driver.encode(&original).unwrap();
        let bits = M2fmCodec.encode(&raw, 1000.0);
        let track = Rx02Driver.decode(&M2fmCodec.decode(&bits), 12, 0);
        assert_eq!(track.sector_count(), SECTORS);
        assert_eq!(track.good_sectors(), SECTORS);
        assert_eq!(track.confidence, 100);
        assert_eq!(track.get_sector(26).unwrap().data(), &[26u8; 256][..]);
    }

    #[test]
    fn test_rejects_odd_sizes() {
        let mut original = Track::new(0, 0);
        original.add_sector(Sector::with_data(SectorId::new(0, 0, 1, 2), vec![0; 512]));
        assert!(Rx02Driver.encode(&original).is_err());
    }
}
