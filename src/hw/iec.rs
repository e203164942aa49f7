//! Commodore drives on a parallel-port IEC cable, read through nibtools
//!
//! `nibread` pulls raw GCR from the drive's read head into a NIB file:
//! a 256-byte header listing (halftrack, density) pairs followed by one
//! 8 KiB block of GCR bytes per track. The GCR is turned back into flux
//! at the cell time of its speed zone so it flows through the same
//! decoder as any other capture.

use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::FluxStream;
use crate::hw::{
    check_revolutions, find_tool, run_tool, scratch_dir, Backend, Capabilities, Density, DeviceInfo, DriveStatus,
    FluxDevice,
};
use crate::pll::Bitstream;
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Backend name
pub const NAME: &str = "iec";

const NIB_MAGIC: &[u8] = b"MNIB-1541-RAW";
const NIB_HEADER_LEN: usize = 0x100;
const NIB_TRACK_LEN: usize = 0x2000;

/// Cell time for a 1541 density code
pub fn density_cell_ns(density: u8) -> f64 {
    match density & 3 {
        3 => 3250.0,
        2 => 3500.0,
        1 => 3750.0,
        _ => 4000.0,
    }
}

/// One track pulled from a NIB file
#[derive(Debug, Clone, PartialEq)]
pub struct NibTrack {
    /// Halftrack number, 2 for track 1
    pub halftrack: u8,
    /// Density code 0-3
    pub density: u8,
    /// Raw GCR bytes
    pub gcr: Vec<u8>,
}

/// Split a NIB file into its tracks
pub fn parse_nib(data: &[u8]) -> Result<Vec<NibTrack>> {
    if !data.starts_with(NIB_MAGIC) {
        return Err(FloppyError::invalid_format("not a NIB file"));
    }
    if data.len() < NIB_HEADER_LEN {
        return Err(FloppyError::parse(data.len(), "NIB header truncated"));
    }
    let mut tracks = Vec::new();
    for (i, entry) in data[0x10..NIB_HEADER_LEN].chunks_exact(2).enumerate() {
        if entry[0] == 0 {
            break;
        }
        let start = NIB_HEADER_LEN + i * NIB_TRACK_LEN;
        let gcr = data
            .get(start..start + NIB_TRACK_LEN)
            .ok_or_else(|| FloppyError::parse(start, format!("halftrack {} data truncated", entry[0])))?;
        tracks.push(NibTrack {
            halftrack: entry[0],
            density: entry[1],
            gcr: gcr.to_vec(),
        });
    }
    Ok(tracks)
}

/// Flux for `revolutions` passes over a GCR track
pub fn gcr_to_flux(track: &NibTrack, revolutions: u8) -> FluxStream {
    let mut bits = Bitstream::new(density_cell_ns(track.density));
    let one = Bitstream::from_bytes_msb(&track.gcr, track.gcr.len() * 8, bits.cell_ns);
    for _ in 0..revolutions {
        bits.mark_revolution();
        bits.extend_bits(one.bits());
    }
    bits.to_flux()
}

/// A 1541-class drive behind a parallel cable
#[derive(Debug)]
pub struct IecDevice {
    tool: PathBuf,
    info: DeviceInfo,
    cylinder: u8,
    motor_on: bool,
}

impl IecDevice {
    /// Drive the cable on `port` through `tool`
    pub fn new(tool: PathBuf, port: &str) -> Self {
        Self {
            tool,
            info: DeviceInfo {
                backend: NAME.into(),
                path: port.into(),
                name: "Commodore 1541 (parallel IEC)".into(),
                firmware: None,
                sample_rate: 0,
                capabilities: Capabilities(Capabilities::READ_FLUX),
            },
            cylinder: 0,
            motor_on: false,
        }
    }
}

impl FluxDevice for IecDevice {
    fn backend(&self) -> &'static str {
        NAME
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn status(&mut self) -> Result<DriveStatus> {
        Ok(DriveStatus {
            ready: true,
            write_protected: false,
            disk_present: true,
            track0: self.cylinder == 0,
            motor_on: self.motor_on,
        })
    }

    fn motor(&mut self, on: bool) -> Result<()> {
        self.motor_on = on;
        Ok(())
    }

    fn seek(&mut self, cylinder: u8) -> Result<()> {
        if cylinder > 41 {
            return Err(FloppyError::hardware(NAME, HardwareFault::SeekError, cylinder as u32, "1541 stops at track 42"));
        }
        self.cylinder = cylinder;
        Ok(())
    }

    fn select_head(&mut self, head: u8) -> Result<()> {
        if head != 0 {
            return Err(FloppyError::hardware(NAME, HardwareFault::NotSupported, head as u32, "single-sided drive"));
        }
        Ok(())
    }

    fn select_density(&mut self, _density: Density) -> Result<()> {
        // the drive picks its speed zone per track
        Ok(())
    }

    fn read_flux(&mut self, revolutions: u8) -> Result<FluxStream> {
        let revolutions = check_revolutions(NAME, revolutions)?;
        let dir = scratch_dir(NAME)?;
        let file = dir.join("capture.nib");
        let track = self.cylinder + 1;
        let result = run_tool(
            NAME,
            Command::new(&self.tool)
                .arg(format!("-S{}", track))
                .arg(format!("-E{}", track))
                .arg(&file),
        )
        .and_then(|()| parse_nib(&std::fs::read(&file)?))
        .and_then(|tracks| {
            tracks
                .into_iter()
                .find(|t| t.halftrack == track * 2)
                .ok_or_else(|| FloppyError::hardware(NAME, HardwareFault::NoIndex, 0, "track missing from capture"))
        });
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!("iec: leaving {}: {}", dir.display(), e);
        }
        Ok(gcr_to_flux(&result?, revolutions))
    }
}

/// Parallel ports with nibtools installed
#[derive(Debug, Clone, Copy, Default)]
pub struct IecBackend;

impl Backend for IecBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Commodore drive on a parallel-port IEC cable (nibtools)"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        let Some(tool) = find_tool(Path::new("nibread")) else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("parport"))
            .map(|e| IecDevice::new(tool.clone(), &e.path().display().to_string()).info)
            .collect()
    }

    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        let tool = find_tool(Path::new("nibread"))
            .ok_or_else(|| FloppyError::hardware(NAME, HardwareFault::NoDevice, 0, "nibread not found"))?;
        Ok(Box::new(IecDevice::new(tool, path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nib(tracks: &[(u8, u8, u8)]) -> Vec<u8> {
        let mut data = vec![0u8; NIB_HEADER_LEN];
        data[..NIB_MAGIC.len()].copy_from_slice(NIB_MAGIC);
        for (i, &(ht, density, fill)) in tracks.iter().enumerate() {
            data[0x10 + i * 2] = ht;
            data[0x11 + i * 2] = density;
            data.extend(std::iter::repeat(fill).take(NIB_TRACK_LEN));
        }
        data
    }

    #[test]
    fn test_parse_nib() {
        let tracks = parse_nib(&nib(&[(2, 3, 0x55), (4, 3, 0xFF)])).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].halftrack, 4);
        assert_eq!(tracks[0].gcr[100], 0x55);
        assert!(parse_nib(b"NOPE").is_err());
        let mut short = nib(&[(2, 3, 0)]);
        short.truncate(0x1000);
        assert!(parse_nib(&short).is_err());
    }

    #[test]
    fn test_gcr_to_flux() {
        let track = &parse_nib(&nib(&[(2, 3, 0x55)])).unwrap()[0];
        let flux = gcr_to_flux(track, 2);
        assert_eq!(flux.revolution_count(), 2);
        // 0x55: a transition every second cell
        assert_eq!(flux.intervals()[0], 6500);
        assert_eq!(density_cell_ns(0), 4000.0);
    }

    #[test]
    fn test_head_and_seek_limits() {
        let mut dev = IecDevice::new(PathBuf::from("nibread"), "/dev/parport0");
        assert!(dev.select_head(1).is_err());
        assert!(dev.seek(50).is_err());
        dev.seek(17).unwrap();
        assert!(!dev.status().unwrap().track0);
    }
}
