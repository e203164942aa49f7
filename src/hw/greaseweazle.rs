//! Greaseweazle USB flux controller (CDC-ACM serial protocol)
//!
//! Commands are `[cmd, total_len, params...]`; every command is answered
//! with `[cmd, ack]`. Flux travels as a byte stream terminated by 0:
//! 1-249 is a direct tick count, 250-254 starts a two-byte count, and 255
//! introduces an opcode (index, space) carrying a 28-bit value.

use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::FluxStream;
use crate::hw::transport::{fault, SerialTransport, Transport};
use crate::hw::{
    check_revolutions, revolution_timeout, Backend, Capabilities, Density, DeviceInfo, DriveStatus, FluxDevice,
    MotorTimer, COMMAND_TIMEOUT, SEEK_TIMEOUT,
};
use log::{debug, trace};
use std::path::Path;

/// Backend name
pub const NAME: &str = "greaseweazle";
/// Sample clock of the F1/F7 boards
pub const SAMPLE_CLOCK: u32 = 72_000_000;

const CMD_GET_INFO: u8 = 0x00;
const CMD_SEEK: u8 = 0x02;
const CMD_HEAD: u8 = 0x03;
const CMD_MOTOR: u8 = 0x06;
const CMD_READ_FLUX: u8 = 0x07;
const CMD_WRITE_FLUX: u8 = 0x08;
const CMD_GET_FLUX_STATUS: u8 = 0x09;
const CMD_SELECT: u8 = 0x0C;
const CMD_SET_BUS_TYPE: u8 = 0x0E;
const CMD_SET_PIN: u8 = 0x0F;
const CMD_GET_PIN: u8 = 0x14;

const ACK_OK: u8 = 0x00;
const ACK_NO_INDEX: u8 = 0x02;
const ACK_NO_TRK0: u8 = 0x03;
const ACK_WRPROT: u8 = 0x06;
const ACK_NO_UNIT: u8 = 0x07;

const OP_INDEX: u8 = 1;
const OP_SPACE: u8 = 2;

const BUS_IBM_PC: u8 = 1;
const PIN_DENSITY: u8 = 2;
const PIN_WRPROT: u8 = 28;
const PIN_TRK0: u8 = 26;

const MAX_STREAM: usize = 32 << 20;

fn ack_fault(ack: u8) -> HardwareFault {
    match ack {
        ACK_NO_INDEX => HardwareFault::NoIndex,
        ACK_NO_TRK0 => HardwareFault::SeekError,
        ACK_WRPROT => HardwareFault::WriteProtected,
        ACK_NO_UNIT => HardwareFault::NoDevice,
        _ => HardwareFault::Io,
    }
}

fn read_n28(b: &[u8]) -> u32 {
    ((b[0] as u32 & 0xFE) >> 1) | ((b[1] as u32 & 0xFE) << 6) | ((b[2] as u32 & 0xFE) << 13) | ((b[3] as u32 & 0xFE) << 20)
}

fn write_n28(out: &mut Vec<u8>, v: u32) {
    out.push(1 | ((v << 1) & 0xFE) as u8);
    out.push(1 | ((v >> 6) & 0xFE) as u8);
    out.push(1 | ((v >> 13) & 0xFE) as u8);
    out.push(1 | ((v >> 20) & 0xFE) as u8);
}

/// Decode a flux stream (without its terminating 0) into ticks and index positions
pub fn decode_stream(data: &[u8]) -> Result<(Vec<u32>, Vec<usize>)> {
    let mut ticks = Vec::with_capacity(data.len());
    let mut index = Vec::new();
    let mut pending: u32 = 0;
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        match b {
            0 => break,
            1..=249 => {
                ticks.push(pending + b as u32);
                pending = 0;
                i += 1;
            }
            250..=254 => {
                let Some(&next) = data.get(i + 1) else {
                    return Err(FloppyError::corrupt("greaseweazle: truncated two-byte sample"));
                };
                ticks.push(pending + 250 + (b as u32 - 250) * 255 + next as u32 - 1);
                pending = 0;
                i += 2;
            }
            _ => {
                let Some(op) = data.get(i + 1..i + 6) else {
                    return Err(FloppyError::corrupt("greaseweazle: truncated opcode"));
                };
                let value = read_n28(&op[1..]);
                match op[0] {
                    OP_INDEX => index.push(ticks.len()),
                    OP_SPACE => pending += value,
                    other => trace!("greaseweazle: opcode {} ignored", other),
                }
                i += 6;
            }
        }
    }
    Ok((ticks, index))
}

/// Encode ticks into a write stream, terminator included
pub fn encode_stream(ticks: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ticks.len() + 1);
    for &t in ticks {
        let t = t.max(1);
        if t < 250 {
            out.push(t as u8);
        } else if t < 1525 {
            let over = t - 250;
            out.push(250 + (over / 255) as u8);
            out.push(1 + (over % 255) as u8);
        } else {
            out.push(0xFF);
            out.push(OP_SPACE);
            write_n28(&mut out, t - 249);
            out.push(249);
        }
    }
    out.push(0);
    out
}

/// An opened Greaseweazle
pub struct GreaseweazleDevice<T: Transport> {
    transport: T,
    info: DeviceInfo,
    motor: MotorTimer,
    unit: u8,
    cylinder: u8,
    density: Density,
}

impl<T: Transport> GreaseweazleDevice<T> {
    /// Handshake over an open transport
    pub fn with_transport(transport: T, path: &str) -> Result<Self> {
        let mut dev = Self {
            transport,
            info: DeviceInfo {
                backend: NAME.into(),
                path: path.into(),
                name: "Greaseweazle".into(),
                firmware: None,
                sample_rate: SAMPLE_CLOCK,
                capabilities: Capabilities(
                    Capabilities::READ_FLUX | Capabilities::WRITE_FLUX | Capabilities::DENSITY | Capabilities::DOUBLE_SIDED,
                ),
            },
            motor: MotorTimer::default(),
            unit: 0,
            cylinder: 0,
            density: Density::Double,
        };
        dev.command(CMD_GET_INFO, &[0])?;
        let info = dev.transport.recv(32, COMMAND_TIMEOUT).map_err(|e| fault(NAME, e))?;
        let rate = u32::from_le_bytes([info[4], info[5], info[6], info[7]]);
        if rate > 0 {
            dev.info.sample_rate = rate;
        }
        dev.info.firmware = Some(format!("{}.{}", info[0], info[1]));
        dev.info.name = format!("Greaseweazle F{}", info[8]);
        debug!("greaseweazle firmware {}.{}, {} Hz", info[0], info[1], dev.info.sample_rate);
        dev.command(CMD_SET_BUS_TYPE, &[BUS_IBM_PC])?;
        dev.command(CMD_SELECT, &[dev.unit])?;
        Ok(dev)
    }

    fn command(&mut self, cmd: u8, params: &[u8]) -> Result<()> {
        let mut packet = vec![cmd, (params.len() + 2) as u8];
        packet.extend_from_slice(params);
        trace!("greaseweazle cmd {:02X} {:02X?}", cmd, params);
        self.transport.send(&packet).map_err(|e| fault(NAME, e))?;
        let reply = self.transport.recv(2, COMMAND_TIMEOUT).map_err(|e| fault(NAME, e))?;
        if reply[0] != cmd {
            return Err(FloppyError::hardware(
                NAME,
                HardwareFault::Io,
                reply[0] as u32,
                format!("reply to command {:#04x} echoed {:#04x}", cmd, reply[0]),
            ));
        }
        if reply[1] != ACK_OK {
            return Err(FloppyError::hardware(
                NAME,
                ack_fault(reply[1]),
                reply[1] as u32,
                format!("command {:#04x} refused", cmd),
            ));
        }
        Ok(())
    }

    fn pin(&mut self, pin: u8) -> Result<bool> {
        self.command(CMD_GET_PIN, &[pin])?;
        let level = self.transport.recv(1, COMMAND_TIMEOUT).map_err(|e| fault(NAME, e))?;
        Ok(level[0] != 0)
    }
}

impl<T: Transport + 'static> FluxDevice for GreaseweazleDevice<T> {
    fn backend(&self) -> &'static str {
        NAME
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn status(&mut self) -> Result<DriveStatus> {
        // both lines are active low
        let write_protected = !self.pin(PIN_WRPROT)?;
        let track0 = !self.pin(PIN_TRK0)?;
        Ok(DriveStatus {
            ready: true,
            write_protected,
            disk_present: true,
            track0,
            motor_on: self.motor.is_on(),
        })
    }

    fn motor(&mut self, on: bool) -> Result<()> {
        if on {
            self.command(CMD_MOTOR, &[self.unit, 1])?;
            self.motor.started();
        } else if self.motor.is_on() {
            self.motor.stopping();
            self.command(CMD_MOTOR, &[self.unit, 0])?;
        }
        Ok(())
    }

    fn seek(&mut self, cylinder: u8) -> Result<()> {
        let started = std::time::Instant::now();
        self.command(CMD_SEEK, &[cylinder])?;
        if started.elapsed() > SEEK_TIMEOUT {
            return Err(FloppyError::hardware(NAME, HardwareFault::Timeout, 0, format!("seek to {} too slow", cylinder)));
        }
        self.cylinder = cylinder;
        Ok(())
    }

    fn select_head(&mut self, head: u8) -> Result<()> {
        self.command(CMD_HEAD, &[head])
    }

    fn select_density(&mut self, density: Density) -> Result<()> {
        let level = u8::from(density == Density::Double);
        self.command(CMD_SET_PIN, &[PIN_DENSITY, level])?;
        self.density = density;
        Ok(())
    }

    fn read_flux(&mut self, revolutions: u8) -> Result<FluxStream> {
        let revolutions = check_revolutions(NAME, revolutions)?;
        if !self.motor.is_on() {
            self.motor(true)?;
        }
        let mut params = 0u32.to_le_bytes().to_vec();
        params.extend_from_slice(&(revolutions as u16 + 1).to_le_bytes());
        self.command(CMD_READ_FLUX, &params)?;
        let timeout = revolution_timeout(300) * (revolutions as u32 + 2);
        let mut stream = self
            .transport
            .recv_until(0, timeout, MAX_STREAM)
            .map_err(|e| fault(NAME, e))?;
        stream.pop();
        self.command(CMD_GET_FLUX_STATUS, &[])?;
        let (ticks, index) = decode_stream(&stream)?;
        if index.len() < 2 {
            return Err(FloppyError::hardware(
                NAME,
                HardwareFault::NoIndex,
                ACK_NO_INDEX as u32,
                format!("{} index pulses in capture", index.len()),
            ));
        }
        debug!(
            "greaseweazle: cyl {} ({:?}) read {} transitions, {} index pulses",
            self.cylinder,
            self.density,
            ticks.len(),
            index.len()
        );
        Ok(FluxStream::from_ticks(&ticks, self.info.sample_rate, &index))
    }

    fn write_flux(&mut self, flux: &FluxStream) -> Result<()> {
        if !self.motor.is_on() {
            self.motor(true)?;
        }
        let body = match flux.revolution_stream(0) {
            Some(rev) => rev.to_ticks(self.info.sample_rate),
            None => flux.to_ticks(self.info.sample_rate),
        };
        // cue at index, stop at the next index
        self.command(CMD_WRITE_FLUX, &[1, 1])?;
        self.transport.send(&encode_stream(&body)).map_err(|e| fault(NAME, e))?;
        self.transport.recv(1, revolution_timeout(300) * 3).map_err(|e| fault(NAME, e))?;
        self.command(CMD_GET_FLUX_STATUS, &[])
    }
}

/// Finds Greaseweazles under /dev/serial/by-id
#[derive(Debug, Clone, Copy, Default)]
pub struct GreaseweazleBackend;

impl Backend for GreaseweazleBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Greaseweazle USB flux controller"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev/serial/by-id") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("Greaseweazle"))
            .map(|e| DeviceInfo {
                backend: NAME.into(),
                path: e.path().display().to_string(),
                name: "Greaseweazle".into(),
                firmware: None,
                sample_rate: SAMPLE_CLOCK,
                capabilities: Capabilities(Capabilities::READ_FLUX | Capabilities::WRITE_FLUX),
            })
            .collect()
    }

    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        let transport = SerialTransport::open(Path::new(path)).map_err(|e| fault(NAME, e))?;
        Ok(Box::new(GreaseweazleDevice::with_transport(transport, path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hw::transport::Loopback;

    fn emulator(flux: Vec<u8>, wrprot: bool) -> Loopback {
        let mut writing = false;
        Loopback::new(move |packet| {
            if writing {
                writing = false;
                return vec![0];
            }
            let cmd = packet[0];
            match cmd {
                CMD_GET_INFO => {
                    let mut r = vec![cmd, ACK_OK, 1, 2, 1, 32];
                    r.extend_from_slice(&SAMPLE_CLOCK.to_le_bytes());
                    r.push(7);
                    r.resize(2 + 32, 0);
                    r
                }
                CMD_READ_FLUX => {
                    let mut r = vec![cmd, ACK_OK];
                    r.extend_from_slice(&flux);
                    r.push(0);
                    r
                }
                CMD_WRITE_FLUX if wrprot => vec![cmd, ACK_WRPROT],
                CMD_WRITE_FLUX => {
                    writing = true;
                    vec![cmd, ACK_OK]
                }
                CMD_GET_PIN => vec![cmd, ACK_OK, u8::from(!(wrprot && packet[2] == PIN_WRPROT))],
                _ => vec![cmd, ACK_OK],
            }
        })
    }

    fn index_op() -> Vec<u8> {
        let mut v = vec![0xFF, OP_INDEX];
        write_n28(&mut v, 0);
        v
    }

    #[test]
    fn test_stream_round_trip() {
        let ticks = vec![144, 216, 288, 249, 250, 1524, 1525, 100_000];
        let encoded = encode_stream(&ticks);
        assert_eq!(*encoded.last().unwrap(), 0);
        let (back, index) = decode_stream(&encoded).unwrap();
        assert_eq!(back, ticks);
        assert!(index.is_empty());
    }

    #[test]
    fn test_n28() {
        let mut v = Vec::new();
        write_n28(&mut v, 0x0ABC_DEF1);
        assert!(v.iter().all(|b| b & 1 == 1));
        assert_eq!(read_n28(&v), 0x0ABC_DEF1);
    }

    #[test]
    fn test_read_flux_over_loopback() {
        let mut stream = index_op();
        stream.extend(std::iter::repeat(144).take(100));
        stream.extend(index_op());
        stream.extend(std::iter::repeat(216).take(50));
        stream.extend(index_op());
        let mut dev = GreaseweazleDevice::with_transport(emulator(stream, false), "loop").unwrap();
        assert_eq!(dev.info().firmware.as_deref(), Some("1.2"));
        dev.seek(5).unwrap();
        let flux = dev.read_flux(2).unwrap();
        assert_eq!(flux.revolution_count(), 2);
        assert_eq!(flux.revolution(0).unwrap().len(), 100);
        assert_eq!(flux.intervals()[0], 2000);
        assert_eq!(flux.revolution(1).unwrap()[0], 3000);
        assert!(!dev.status().unwrap().write_protected);
    }

    #[test]
    fn test_no_index_is_reported() {
        let stream = vec![144; 10];
        let mut dev = GreaseweazleDevice::with_transport(emulator(stream, false), "loop").unwrap();
        dev.motor.started();
        let err = dev.read_flux(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(matches!(err, FloppyError::Hardware { fault: HardwareFault::NoIndex, .. }));
    }

    #[test]
    fn test_write_protected() {
        let mut dev = GreaseweazleDevice::with_transport(emulator(Vec::new(), true), "loop").unwrap();
        assert!(dev.status().unwrap().write_protected);
        dev.motor.started();
        let flux = FluxStream::from_intervals(vec![2000; 10], &[0, 10]);
        let err = dev.write_flux(&flux).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn test_write_flux_sends_stream() {
        let mut dev = GreaseweazleDevice::with_transport(emulator(Vec::new(), false), "loop").unwrap();
        dev.motor.started();
        let flux = FluxStream::from_intervals(vec![2000; 10], &[0, 10]);
        dev.write_flux(&flux).unwrap();
        let sent = &dev.transport.sent;
        let stream = sent.iter().find(|p| p.len() == 11).unwrap();
        assert_eq!(stream[0], 144);
        assert_eq!(stream[10], 0);
    }

    #[test]
    fn test_revolution_range_checked() {
        let mut dev = GreaseweazleDevice::with_transport(emulator(Vec::new(), false), "loop").unwrap();
        assert_eq!(dev.read_flux(6).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}
