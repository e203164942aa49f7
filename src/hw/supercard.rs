//! SuperCard Pro USB flux controller
//!
//! Packets are `[cmd, len, payload.., checksum]` with the checksum
//! starting at 0x4A; replies are `[cmd, status]` with 0x4F meaning OK.
//! Multi-byte values are big-endian. Flux is captured into the board's
//! 512 KiB RAM first and then fetched over USB as 16-bit cells at 25 ns.

use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::FluxStream;
use crate::hw::transport::{fault, SerialTransport, Transport};
use crate::hw::{
    check_revolutions, revolution_timeout, Backend, Capabilities, Density, DeviceInfo, DriveStatus, FluxDevice,
    MotorTimer, COMMAND_TIMEOUT, USB_TIMEOUT,
};
use log::{debug, trace};
use std::path::Path;
use std::time::Duration;

/// Backend name
pub const NAME: &str = "supercard";
/// Sample clock
pub const SAMPLE_CLOCK: u32 = 40_000_000;
/// On-board capture RAM
pub const RAM_SIZE: usize = 512 * 1024;

const CHECKSUM_INIT: u8 = 0x4A;

const CMD_SELA: u8 = 0x80;
const CMD_MTRAON: u8 = 0x84;
const CMD_MTRAOFF: u8 = 0x86;
const CMD_SEEK0: u8 = 0x88;
const CMD_STEPTO: u8 = 0x89;
const CMD_SELDENS: u8 = 0x8C;
const CMD_SIDE: u8 = 0x8D;
const CMD_STATUS: u8 = 0x8E;
const CMD_READFLUX: u8 = 0xA0;
const CMD_GETFLUXINFO: u8 = 0xA1;
const CMD_WRITEFLUX: u8 = 0xA2;
const CMD_SENDRAM_USB: u8 = 0xA9;
const CMD_LOADRAM_USB: u8 = 0xAA;
const CMD_SCPINFO: u8 = 0xD0;

const PR_OK: u8 = 0x4F;
const PR_TIMEOUT: u8 = 0x04;
const PR_NOTRK0: u8 = 0x05;
const PR_NOINDEX: u8 = 0x09;
const PR_WPENABLED: u8 = 0x0F;

const FF_INDEX: u8 = 0x01;
const FF_WIPE: u8 = 0x04;

const ST_WRITEPROTECT: u16 = 0x0080;
const ST_DISKCHANGE: u16 = 0x0040;
const ST_TRACK0: u16 = 0x0020;

fn status_fault(code: u8) -> HardwareFault {
    match code {
        PR_NOINDEX => HardwareFault::NoIndex,
        PR_WPENABLED => HardwareFault::WriteProtected,
        PR_NOTRK0 => HardwareFault::SeekError,
        PR_TIMEOUT => HardwareFault::Timeout,
        _ => HardwareFault::Io,
    }
}

/// Checksum over command, length and payload
pub fn checksum(cmd: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(CHECKSUM_INIT.wrapping_add(cmd).wrapping_add(payload.len() as u8), |acc, &b| {
            acc.wrapping_add(b)
        })
}

/// Command packet with checksum
pub fn packet(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![cmd, payload.len() as u8];
    out.extend_from_slice(payload);
    out.push(checksum(cmd, payload));
    out
}

/// Decode big-endian 16-bit cells; a zero cell carries 65536 ticks forward
pub fn decode_cells(data: &[u8]) -> Vec<u32> {
    let mut ticks = Vec::with_capacity(data.len() / 2);
    let mut carry = 0u32;
    for pair in data.chunks_exact(2) {
        let v = u16::from_be_bytes([pair[0], pair[1]]) as u32;
        if v == 0 {
            carry += 0x10000;
        } else {
            ticks.push(carry + v);
            carry = 0;
        }
    }
    ticks
}

/// Encode ticks as big-endian 16-bit cells.
///
/// A zero cell only adds to the cell after it, so an interval that is an
/// exact multiple of 65536 ticks has no exact form and is stored one tick
/// long.
pub fn encode_cells(ticks: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ticks.len() * 2);
    for &t in ticks {
        let mut t = t.max(1);
        while t > 0xFFFF {
            out.extend_from_slice(&[0, 0]);
            t -= 0x10000;
        }
        let t = t.max(1) as u16;
        out.extend_from_slice(&t.to_be_bytes());
    }
    out
}

/// An opened SuperCard Pro
pub struct SupercardDevice<T: Transport> {
    transport: T,
    info: DeviceInfo,
    motor: MotorTimer,
}

impl<T: Transport> SupercardDevice<T> {
    /// Identify the board and select drive A
    pub fn with_transport(transport: T, path: &str) -> Result<Self> {
        let mut dev = Self {
            transport,
            info: DeviceInfo {
                backend: NAME.into(),
                path: path.into(),
                name: "SuperCard Pro".into(),
                firmware: None,
                sample_rate: SAMPLE_CLOCK,
                capabilities: Capabilities(
                    Capabilities::READ_FLUX | Capabilities::WRITE_FLUX | Capabilities::DENSITY | Capabilities::DOUBLE_SIDED,
                ),
            },
            motor: MotorTimer::default(),
        };
        dev.command(CMD_SCPINFO, &[])?;
        let version = dev.read(2, COMMAND_TIMEOUT)?;
        dev.info.firmware = Some(format!("hw {}.{} fw {}.{}", version[0] >> 4, version[0] & 15, version[1] >> 4, version[1] & 15));
        debug!("supercard: {}", dev.info.firmware.as_deref().unwrap_or(""));
        dev.command(CMD_SELA, &[])?;
        Ok(dev)
    }

    fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.transport.recv(len, timeout).map_err(|e| fault(NAME, e))
    }

    fn response(&mut self, cmd: u8, timeout: Duration) -> Result<()> {
        let reply = self.read(2, timeout)?;
        if reply[0] != cmd {
            return Err(FloppyError::hardware(
                NAME,
                HardwareFault::Io,
                reply[0] as u32,
                format!("reply to {:#04x} echoed {:#04x}", cmd, reply[0]),
            ));
        }
        if reply[1] != PR_OK {
            return Err(FloppyError::hardware(
                NAME,
                status_fault(reply[1]),
                reply[1] as u32,
                format!("command {:#04x} failed", cmd),
            ));
        }
        Ok(())
    }

    fn command(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        trace!("supercard cmd {:02X} {:02X?}", cmd, payload);
        self.transport.send(&packet(cmd, payload)).map_err(|e| fault(NAME, e))?;
        self.response(cmd, COMMAND_TIMEOUT)
    }
}

impl<T: Transport + 'static> FluxDevice for SupercardDevice<T> {
    fn backend(&self) -> &'static str {
        NAME
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn status(&mut self) -> Result<DriveStatus> {
        self.command(CMD_STATUS, &[])?;
        let word = self.read(2, COMMAND_TIMEOUT)?;
        let bits = u16::from_be_bytes([word[0], word[1]]);
        Ok(DriveStatus {
            ready: true,
            write_protected: bits & ST_WRITEPROTECT != 0,
            disk_present: bits & ST_DISKCHANGE == 0,
            track0: bits & ST_TRACK0 != 0,
            motor_on: self.motor.is_on(),
        })
    }

    fn motor(&mut self, on: bool) -> Result<()> {
        if on {
            self.command(CMD_MTRAON, &[])?;
            self.motor.started();
        } else if self.motor.is_on() {
            self.motor.stopping();
            self.command(CMD_MTRAOFF, &[])?;
        }
        Ok(())
    }

    fn seek(&mut self, cylinder: u8) -> Result<()> {
        if cylinder == 0 {
            self.command(CMD_SEEK0, &[])
        } else {
            self.command(CMD_STEPTO, &[cylinder])
        }
    }

    fn select_head(&mut self, head: u8) -> Result<()> {
        self.command(CMD_SIDE, &[head])
    }

    fn select_density(&mut self, density: Density) -> Result<()> {
        self.command(CMD_SELDENS, &[u8::from(density != Density::Double)])
    }

    fn read_flux(&mut self, revolutions: u8) -> Result<FluxStream> {
        let revolutions = check_revolutions(NAME, revolutions)?;
        if !self.motor.is_on() {
            self.motor(true)?;
        }
        self.transport
            .send(&packet(CMD_READFLUX, &[revolutions, FF_INDEX]))
            .map_err(|e| fault(NAME, e))?;
        self.response(CMD_READFLUX, COMMAND_TIMEOUT + revolution_timeout(300) * revolutions as u32)?;
        self.command(CMD_GETFLUXINFO, &[])?;
        let info = self.read(40, COMMAND_TIMEOUT)?;
        let cells: Vec<usize> = (0..revolutions as usize)
            .map(|r| u32::from_be_bytes([info[r * 8 + 4], info[r * 8 + 5], info[r * 8 + 6], info[r * 8 + 7]]) as usize)
            .collect();
        let total: usize = cells.iter().sum();
        if total == 0 {
            return Err(FloppyError::hardware(NAME, HardwareFault::NoIndex, PR_NOINDEX as u32, "no flux captured"));
        }
        let bytes = (total * 2).min(RAM_SIZE);
        let mut payload = 0u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&(bytes as u32).to_be_bytes());
        self.command(CMD_SENDRAM_USB, &payload)?;
        let raw = self.read(bytes, USB_TIMEOUT)?;

        // cell counts include the zero overflow cells, so split on raw positions
        let mut ticks = Vec::with_capacity(total);
        let mut marks = vec![0];
        let mut at = 0;
        for count in cells {
            let end = (at + count * 2).min(raw.len());
            ticks.extend(decode_cells(&raw[at..end]));
            marks.push(ticks.len());
            at = end;
        }
        debug!("supercard: {} transitions over {} revolutions", ticks.len(), revolutions);
        Ok(FluxStream::from_ticks(&ticks, SAMPLE_CLOCK, &marks))
    }

    fn write_flux(&mut self, flux: &FluxStream) -> Result<()> {
        if !self.motor.is_on() {
            self.motor(true)?;
        }
        let ticks = match flux.revolution_stream(0) {
            Some(rev) => rev.to_ticks(SAMPLE_CLOCK),
            None => flux.to_ticks(SAMPLE_CLOCK),
        };
        let cells = encode_cells(&ticks);
        if cells.len() > RAM_SIZE {
            return Err(FloppyError::invalid_arg(format!("{} bytes of flux exceed the capture RAM", cells.len())));
        }
        let mut payload = 0u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&(cells.len() as u32).to_be_bytes());
        self.transport
            .send(&packet(CMD_LOADRAM_USB, &payload))
            .map_err(|e| fault(NAME, e))?;
        self.transport.send(&cells).map_err(|e| fault(NAME, e))?;
        self.response(CMD_LOADRAM_USB, USB_TIMEOUT)?;
        let mut payload = ((cells.len() / 2) as u32).to_be_bytes().to_vec();
        payload.push(FF_INDEX | FF_WIPE);
        self.command(CMD_WRITEFLUX, &payload)
    }
}

/// Finds SuperCard Pro boards by their FTDI serial node
#[derive(Debug, Clone, Copy, Default)]
pub struct SupercardBackend;

impl Backend for SupercardBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "SuperCard Pro USB flux controller"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev/serial/by-id") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_ascii_lowercase();
                name.contains("supercard") || name.contains("scp")
            })
            .map(|e| DeviceInfo {
                backend: NAME.into(),
                path: e.path().display().to_string(),
                name: "SuperCard Pro".into(),
                firmware: None,
                sample_rate: SAMPLE_CLOCK,
                capabilities: Capabilities(Capabilities::READ_FLUX | Capabilities::WRITE_FLUX),
            })
            .collect()
    }

    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        let transport = SerialTransport::open(Path::new(path)).map_err(|e| fault(NAME, e))?;
        Ok(Box::new(SupercardDevice::with_transport(transport, path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hw::transport::Loopback;

    fn board(revs: Vec<Vec<u32>>, wp: bool) -> Loopback {
        let ram: Vec<u8> = revs.iter().flat_map(|r| encode_cells(r)).collect();
        let counts: Vec<u32> = revs.iter().map(|r| (encode_cells(r).len() / 2) as u32).collect();
        let mut loading = false;
        Loopback::new(move |p| {
            if loading {
                loading = false;
                return vec![CMD_LOADRAM_USB, PR_OK];
            }
            assert_eq!(*p.last().unwrap(), checksum(p[0], &p[2..p.len() - 1]));
            match p[0] {
                CMD_SCPINFO => vec![p[0], PR_OK, 0x10, 0x17],
                CMD_STATUS => vec![p[0], PR_OK, 0, if wp { 0x80 } else { 0 }],
                CMD_GETFLUXINFO => {
                    let mut r = vec![p[0], PR_OK];
                    for i in 0..5 {
                        r.extend_from_slice(&200_000_000u32.to_be_bytes()[..]);
                        r.extend_from_slice(&counts.get(i).copied().unwrap_or(0).to_be_bytes());
                    }
                    r
                }
                CMD_SENDRAM_USB => {
                    let mut r = vec![p[0], PR_OK];
                    r.extend_from_slice(&ram);
                    r
                }
                CMD_LOADRAM_USB => {
                    loading = true;
                    Vec::new()
                }
                CMD_WRITEFLUX if wp => vec![p[0], PR_WPENABLED],
                other => vec![other, PR_OK],
            }
        })
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(CMD_SELA, &[]), 0xCA);
        assert_eq!(packet(CMD_STEPTO, &[40]), vec![0x89, 1, 40, 0xFC]);
    }

    #[test]
    fn test_cells_overflow() {
        let ticks = vec![80, 120, 70_000, 0x1FFFF, 0x10000, 90];
        let cells = encode_cells(&ticks);
        assert_eq!(&cells[4..8], &[0, 0, 0x11, 0x70]);
        assert_eq!(&cells[8..12], &[0, 0, 0xFF, 0xFF]);
        assert_eq!(&cells[12..16], &[0, 0, 0, 1]);
        assert_eq!(decode_cells(&cells), vec![80, 120, 70_000, 0x1FFFF, 0x10001, 90]);
    }

    #[test]
    fn test_read_two_revolutions() {
        let dev_revs = vec![vec![80u32; 300], vec![120u32; 200]];
        let mut dev = SupercardDevice::with_transport(board(dev_revs, false), "loop").unwrap();
        assert_eq!(dev.info().firmware.as_deref(), Some("hw 1.0 fw 1.7"));
        dev.motor.started();
        let flux = dev.read_flux(2).unwrap();
        assert_eq!(flux.revolution_count(), 2);
        assert_eq!(flux.revolution(0).unwrap().len(), 300);
        assert_eq!(flux.intervals()[0], 2000);
        assert_eq!(flux.revolution(1).unwrap()[0], 3000);
    }

    #[test]
    fn test_write_protect_status_and_write() {
        let mut dev = SupercardDevice::with_transport(board(Vec::new(), true), "loop").unwrap();
        assert!(dev.status().unwrap().write_protected);
        dev.motor.started();
        let flux = FluxStream::from_intervals(vec![2000; 16], &[0, 16]);
        let err = dev.write_flux(&flux).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn test_empty_capture_is_no_index() {
        let mut dev = SupercardDevice::with_transport(board(Vec::new(), false), "loop").unwrap();
        dev.motor.started();
        let err = dev.read_flux(1).unwrap_err();
        assert!(matches!(err, FloppyError::Hardware { fault: HardwareFault::NoIndex, .. }));
    }
}
