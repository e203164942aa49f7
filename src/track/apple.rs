//! Apple II (16-sector) and Macintosh GCR sector layouts
//!
//! Sectors are stored in the disk model under their physical numbers.
//! Operating systems address them through a skew table: see
//! [`DOS33_ORDER`] and [`PRODOS_ORDER`].

use crate::disk::{Sector, SectorId, Track};
use crate::encoding::gcr_apple::{
    decode_44, decode_62, decode_mac_values, encode_44, encode_62, encode_mac_values, read_table,
    ADDRESS_PROLOGUE, APPLE_DATA_NIBBLES, DATA_PROLOGUE, EPILOGUE, MAC_DATA_NIBBLES, MAC_SECTOR_LEN,
    WRITE_TABLE,
};
use crate::encoding::{Encoding, MarkKind, RawTrack};
use crate::error::{FloppyError, Result};
use crate::profile::{mac_zone, Platform};
use crate::track::{finish, Evidence, TrackDriver};

/// DOS 3.3 logical sector to physical sector
pub const DOS33_ORDER: [u8; 16] = [0, 13, 11, 9, 7, 5, 3, 1, 14, 12, 10, 8, 6, 4, 2, 15];

/// ProDOS logical sector (two per block) to physical sector
pub const PRODOS_ORDER: [u8; 16] = [0, 2, 4, 6, 8, 10, 12, 14, 1, 3, 5, 7, 9, 11, 13, 15];

/// Default DOS volume number
pub const DEFAULT_VOLUME: u8 = 254;

/// Farthest a data prologue may follow its address field, in disk bytes
const DATA_WINDOW: usize = 48;

fn data_after(raw: &RawTrack, from: usize, limit: usize) -> Option<usize> {
    raw.markers_of(MarkKind::DataAddress)
        .map(|m| m.offset)
        .find(|&o| o > from && o < limit)
}

fn push_sync(raw: &mut RawTrack, count: usize) {
    for _ in 0..count {
        raw.mark(MarkKind::Sync);
        raw.push(0xFF, 0, false);
    }
}

/// Apple II 6-and-2 driver
#[derive(Debug, Clone, Copy, Default)]
pub struct Apple2Driver;

impl TrackDriver for Apple2Driver {
    fn name(&self) -> &'static str {
        "apple2"
    }

    fn platform(&self) -> Platform {
        Platform::AppleII
    }

    fn encoding(&self) -> Encoding {
        Encoding::GcrApple
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        track.filler_byte = 0;
        let mut evidence = Evidence {
            expected: 16,
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != Encoding::GcrApple {
            finish(&mut track, self, raw, Evidence::default());
            return track;
        }
        let headers: Vec<usize> = raw.markers_of(MarkKind::IdAddress).map(|m| m.offset).collect();
        let mut header_track: Option<u8> = None;
        for (n, &at) in headers.iter().enumerate() {
            evidence.marks += 1;
            let Some(f) = raw.slice(at + 3, 8) else {
                continue;
            };
            let volume = decode_44(f[0], f[1]);
            let number = decode_44(f[2], f[3]);
            let physical = decode_44(f[4], f[5]);
            let check = decode_44(f[6], f[7]);
            let header_ok = check == volume ^ number ^ physical && !raw.any_weak(at, 11);
            if header_ok {
                if physical >= 16 || header_track.is_some_and(|t| t != number) {
                    evidence.plausible = false;
                }
                header_track.get_or_insert(number);
            }

            let next = headers.get(n + 1).copied().unwrap_or(usize::MAX);
            let limit = (at + 11 + DATA_WINDOW).min(next);
            let id = SectorId::new(number, 0, physical, 1);
            let mut sector = match data_after(raw, at + 11, limit)
                .and_then(|o| raw.slice(o + 3, APPLE_DATA_NIBBLES).map(|b| (o, b)))
            {
                Some((o, nibbles)) => {
                    evidence.marks += 1;
                    let (data, ok) = decode_62(nibbles);
                    let mut s = Sector::with_data(id, data);
                    s.data_crc_ok = ok;
                    s.weak = !ok && raw.any_weak(o, APPLE_DATA_NIBBLES + 3);
                    s
                }
                None => {
                    let mut s = Sector::with_data(id, vec![0; 256]);
                    s.data_crc_ok = false;
                    s
                }
            };
            sector.header_crc_ok = header_ok;
            sector.tags = vec![volume];
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
        let mut raw = RawTrack::new(Encoding::GcrApple);
        push_sync(&mut raw, 48);
        for sector in track.sectors_by_id() {
            if sector.data().len() != 256 {
                return Err(FloppyError::invalid_arg(format!(
                    "Apple II sector {} holds {} bytes",
                    sector.id.sector,
                    sector.data().len()
                )));
            }
            let volume = sector.tags.first().copied().unwrap_or(DEFAULT_VOLUME);
            let number = track.cylinder;
            let mut check = volume ^ number ^ sector.id.sector;
            if !sector.header_crc_ok {
                check ^= 0xFF;
            }
            raw.extend(&ADDRESS_PROLOGUE);
            for v in [volume, number, sector.id.sector, check] {
                raw.extend(&encode_44(v));
            }
            raw.extend(&EPILOGUE);
            push_sync(&mut raw, 6);

            raw.extend(&DATA_PROLOGUE);
            let mut nibbles = encode_62(sector.data());
            if !sector.data_crc_ok {
                if let Some(last) = nibbles.last_mut() {
                    *last = if *last == WRITE_TABLE[0] { WRITE_TABLE[1] } else { WRITE_TABLE[0] };
                }
            }
            raw.extend(&nibbles);
            raw.extend(&EPILOGUE);
            push_sync(&mut raw, 20);
        }
        Ok(raw)
    }
}

/// Macintosh GCR driver (400K/800K)
#[derive(Debug, Clone, Copy, Default)]
pub struct MacDriver;

/// Mac address field values after the prologue
const MAC_HEADER_VALUES: usize = 5;

impl TrackDriver for MacDriver {
    fn name(&self) -> &'static str {
        "mac"
    }

    fn platform(&self) -> Platform {
        Platform::Mac
    }

    fn encoding(&self) -> Encoding {
        Encoding::GcrMac
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        track.filler_byte = 0;
        let mut evidence = Evidence {
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != Encoding::GcrMac {
            finish(&mut track, self, raw, Evidence::default());
            return track;
        }
        let headers: Vec<usize> = raw.markers_of(MarkKind::IdAddress).map(|m| m.offset).collect();
        let mut header_track: Option<u8> = None;
        for (n, &at) in headers.iter().enumerate() {
            evidence.marks += 1;
            let Some(f) = raw.slice(at + 3, MAC_HEADER_VALUES) else {
                continue;
            };
            let values: Vec<Option<u8>> = f.iter().map(|&b| read_table(b)).collect();
            let [Some(low), Some(physical), Some(side), Some(format), Some(check)] = values[..] else {
                evidence.plausible = false;
                continue;
            };
            let number = low | ((side & 0x01) << 6);
            let side_bit = u8::from(side & 0x20 != 0);
            let header_ok = check == (low ^ physical ^ side ^ format) & 0x3F;
            if header_ok {
                if physical >= 12 || header_track.is_some_and(|t| t != number) {
                    evidence.plausible = false;
                }
                header_track.get_or_insert(number);
            }

            let next = headers.get(n + 1).copied().unwrap_or(usize::MAX);
            let limit = (at + 3 + MAC_HEADER_VALUES + DATA_WINDOW).min(next);
            let id = SectorId::new(number, side_bit, physical, 2);
            let data_at = data_after(raw, at + 3 + MAC_HEADER_VALUES, limit);
            let mut sector = match data_at.and_then(|o| raw.slice(o + 4, MAC_DATA_NIBBLES).map(|b| (o, b))) {
                Some((o, nibbles)) => {
                    evidence.marks += 1;
                    let mapped: Vec<Option<u8>> = nibbles.iter().map(|&b| read_table(b)).collect();
                    let clean = mapped.iter().all(Option::is_some);
                    let values: Vec<u8> = mapped.into_iter().map(|v| v.unwrap_or(0)).collect();
                    let (bytes, ok) = decode_mac_values(&values);
                    let mut s = Sector::with_data(id, bytes[12..].to_vec());
                    s.tags = bytes[..12].to_vec();
                    s.data_crc_ok = ok && clean;
                    s.weak = !s.data_crc_ok && raw.any_weak(o, MAC_DATA_NIBBLES + 4);
                    s
                }
                None => {
                    let mut s = Sector::with_data(id, vec![0; 512]);
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
        evidence.expected = mac_zone(header_track.unwrap_or(cylinder)) as usize;
        if evidence.sectors == 0 {
            evidence.plausible = false;
        }
        finish(&mut track, self, raw, evidence);
        track
    }

    fn encode(&self, track: &Track) -> Result<RawTrack> {
        let mut raw = RawTrack::new(Encoding::GcrMac);
        push_sync(&mut raw, 64);
        let format = 0x22u8;
        let low = track.cylinder & 0x3F;
        let side = (track.cylinder >> 6) | if track.head == 1 { 0x20 } else { 0 };
        for sector in track.sectors_by_id() {
            if sector.data().len() != 512 {
                return Err(FloppyError::invalid_arg(format!(
                    "Macintosh sector {} holds {} bytes",
                    sector.id.sector,
                    sector.data().len()
                )));
            }
            let physical = sector.id.sector & 0x3F;
            let mut check = (low ^ physical ^ side ^ format) & 0x3F;
            if !sector.header_crc_ok {
                check ^= 0x3F;
            }
            raw.extend(&ADDRESS_PROLOGUE);
            for v in [low, physical, side, format, check] {
                raw.push(WRITE_TABLE[v as usize & 0x3F], 0, false);
            }
            raw.extend(&EPILOGUE[..2]);
            push_sync(&mut raw, 5);

            raw.extend(&DATA_PROLOGUE);
            raw.push(WRITE_TABLE[physical as usize], 0, false);
            let mut input = Vec::with_capacity(MAC_SECTOR_LEN);
            input.extend(sector.tags.iter().copied().take(12));
            input.resize(12, 0);
            input.extend_from_slice(sector.data());
            let mut values = encode_mac_values(&input);
            if !sector.data_crc_ok {
                if let Some(last) = values.last_mut() {
                    *last ^= 0x01;
                }
            }
            for v in values {
                raw.push(WRITE_TABLE[v as usize & 0x3F], 0, false);
            }
            raw.extend(&EPILOGUE[..2]);
            push_sync(&mut raw, 20);
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::gcr_apple::{AppleGcrCodec, MacGcrCodec};
    use crate::encoding::EncodingCodec;

    #[test]
    fn test_skew_tables_are_permutations() {
        for table in [DOS33_ORDER, PRODOS_ORDER] {
            let mut sorted = table;
            sorted.sort_unstable();
            assert_eq!(sorted, std::array::from_fn::<u8, 16, _>(|i| i as u8));
        }
    }

    #[test]
    fn test_apple2_round_trip() {
        let mut original = Track::new(17, 0);
        for s in 0..16u8 {
            let data: Vec<u8> = (0..256).map(|i| (i as u8).wrapping_add(s * 7)).collect();
            original.add_sector(Sector::with_data(SectorId::new(17, 0, s, 1), data));
        }
        let raw = Apple2Driver.encode(&original).unwrap();
        let bits = AppleGcrCodec.encode(&raw, 4000.0);
        let track = Apple2Driver.decode(&AppleGcrCodec.decode(&bits), 17, 0);
        assert_eq!(track.sector_count(), 16);
        assert_eq!(track.confidence, 100);
        for s in original.sectors() {
            let back = track.get_sector(s.id.sector).unwrap();
            assert_eq!(back.data(), s.data());
            assert_eq!(back.tags, vec![DEFAULT_VOLUME]);
        }
    }

    #[test]
    fn test_mac_round_trip_with_tags() {
        let mut original = Track::new(70, 1);
        for s in 0..mac_zone(70) {
            let mut sector = Sector::with_data(SectorId::new(70, 1, s, 2), vec![s ^ 0x5A; 512]);
            sector.tags = (0..12).map(|i| i + s).collect();
            original.add_sector(sector);
        }
        let raw = MacDriver.encode(&original).unwrap();
        let bits = MacGcrCodec.encode(&raw, 2000.0);
        let track = MacDriver.decode(&MacGcrCodec.decode(&bits), 70, 1);
        assert_eq!(track.sector_count(), 8);
        assert_eq!(track.good_sectors(), 8);
        let back = track.get_sector(3).unwrap();
        assert_eq!(back.id, SectorId::new(70, 1, 3, 2));
        assert_eq!(back.tags, (3..15).collect::<Vec<u8>>());
        assert_eq!(back.data(), &[3 ^ 0x5A; 512][..]);
    }

    #[test]
    fn test_apple2_bad_data_checksum() {
        let mut original = Track::new(0, 0);
        let mut sector = Sector::with_data(SectorId::new(0, 0, 5, 1), vec![9; 256]);
        sector.data_crc_ok = false;
        original.add_sector(sector);
        let raw = Apple2Driver.encode(&original).unwrap();
        let track = Apple2Driver.decode(&AppleGcrCodec.decode(&AppleGcrCodec.encode(&raw, 4000.0)), 0, 0);
        assert!(!track.get_sector(5).unwrap().data_crc_ok);
    }
}
