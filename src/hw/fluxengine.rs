//! FluxEngine (and compatible boards) through the `fluxengine` client
//!
//! Captures are exchanged with the tool as single-track SCP files.

use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::{scp, FluxArchive, FluxStream};
use crate::hw::{
    check_revolutions, find_tool, run_tool, scratch_dir, Backend, Capabilities, Density, DeviceInfo, DriveStatus,
    FluxDevice,
};
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Backend name
pub const NAME: &str = "fluxengine";

/// Device state tracked on the host side
#[derive(Debug)]
pub struct FluxEngineDevice {
    tool: PathBuf,
    info: DeviceInfo,
    drive: u8,
    cylinder: u8,
    head: u8,
    high_density: bool,
    motor_on: bool,
}

impl FluxEngineDevice {
    /// Drive unit `drive` through `tool`
    pub fn new(tool: PathBuf, drive: u8) -> Self {
        Self {
            info: DeviceInfo {
                backend: NAME.into(),
                path: tool.display().to_string(),
                name: "FluxEngine".into(),
                firmware: None,
                sample_rate: scp::BASE_RATE,
                capabilities: Capabilities(
                    Capabilities::READ_FLUX
                        | Capabilities::WRITE_FLUX
                        | Capabilities::DENSITY
                        | Capabilities::DOUBLE_SIDED,
                ),
            },
            tool,
            drive,
            cylinder: 0,
            head: 0,
            high_density: false,
            motor_on: false,
        }
    }

    fn track_args(&self) -> Vec<String> {
        vec![
            format!("-c{}", self.cylinder),
            format!("-h{}", self.head),
            format!("--drive.high_density={}", self.high_density),
        ]
    }

    /// Arguments for a capture into `file`
    pub fn read_args(&self, file: &Path, revolutions: u8) -> Vec<String> {
        let mut args = vec![
            "rawread".to_string(),
            "-s".into(),
            format!("drive:{}", self.drive),
            "-d".into(),
            file.display().to_string(),
            format!("--drive.revolutions={}", revolutions),
        ];
        args.extend(self.track_args());
        args
    }

    /// Arguments for writing `file` back
    pub fn write_args(&self, file: &Path) -> Vec<String> {
        let mut args = vec![
            "rawwrite".to_string(),
            "-s".into(),
            file.display().to_string(),
            "-d".into(),
            format!("drive:{}", self.drive),
        ];
        args.extend(self.track_args());
        args
    }

    fn cleanup(dir: &Path) {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            debug!("fluxengine: leaving {}: {}", dir.display(), e);
        }
    }
}

impl FluxDevice for FluxEngineDevice {
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
        self.cylinder = cylinder;
        Ok(())
    }

    fn select_head(&mut self, head: u8) -> Result<()> {
        self.head = head;
        Ok(())
    }

    fn select_density(&mut self, density: Density) -> Result<()> {
        self.high_density = density != Density::Double;
        Ok(())
    }

    fn read_flux(&mut self, revolutions: u8) -> Result<FluxStream> {
        let revolutions = check_revolutions(NAME, revolutions)?;
        let dir = scratch_dir(NAME)?;
        let file = dir.join("capture.scp");
        let result = run_tool(NAME, Command::new(&self.tool).args(self.read_args(&file, revolutions)))
            .and_then(|()| {
                let data = std::fs::read(&file)?;
                let (mut archive, _) = scp::parse(&data, false)?;
                archive
                    .tracks
                    .remove(&(self.cylinder, self.head))
                    .or_else(|| archive.tracks.into_values().next())
                    .ok_or_else(|| FloppyError::hardware(NAME, HardwareFault::NoIndex, 0, "capture is empty"))
            });
        Self::cleanup(&dir);
        result
    }

    fn write_flux(&mut self, flux: &FluxStream) -> Result<()> {
        let dir = scratch_dir(NAME)?;
        let file = dir.join("write.scp");
        let mut archive = FluxArchive::new();
        archive.tracks.insert((self.cylinder, self.head), flux.clone());
        std::fs::write(&file, scp::serialize(&archive))?;
        let result = run_tool(NAME, Command::new(&self.tool).args(self.write_args(&file)));
        Self::cleanup(&dir);
        result
    }
}

/// Finds the `fluxengine` client
#[derive(Debug, Clone)]
pub struct FluxEngineBackend {
    /// Tool name or path
    pub tool: PathBuf,
}

impl Default for FluxEngineBackend {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("fluxengine"),
        }
    }
}

impl Backend for FluxEngineBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "FluxEngine via its command-line client"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        find_tool(&self.tool)
            .map(|tool| FluxEngineDevice::new(tool, 0).info)
            .into_iter()
            .collect()
    }

    /// `path` is the tool, optionally suffixed with `:N` for the drive unit
    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        let (tool, drive) = match path.rsplit_once(':') {
            Some((tool, unit)) if unit.parse::<u8>().is_ok() => (tool, unit.parse().unwrap_or(0)),
            _ => (path, 0),
        };
        let tool = find_tool(Path::new(tool))
            .or_else(|| find_tool(&self.tool))
            .ok_or_else(|| FloppyError::hardware(NAME, HardwareFault::NoDevice, 0, "fluxengine not found"))?;
        Ok(Box::new(FluxEngineDevice::new(tool, drive)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments() {
        let mut dev = FluxEngineDevice::new(PathBuf::from("fluxengine"), 1);
        dev.seek(12).unwrap();
        dev.select_head(1).unwrap();
        dev.select_density(Density::High).unwrap();
        let args = dev.read_args(Path::new("/tmp/c.scp"), 3);
        assert_eq!(&args[..3], &["rawread", "-s", "drive:1"]);
        assert!(args.contains(&"--drive.revolutions=3".to_string()));
        assert!(args.contains(&"-c12".to_string()));
        assert!(args.contains(&"--drive.high_density=true".to_string()));
        assert_eq!(dev.write_args(Path::new("/tmp/w.scp"))[4], "drive:1");
    }

    #[test]
    fn test_missing_tool() {
        let backend = FluxEngineBackend {
            tool: PathBuf::from("/nonexistent/fluxengine"),
        };
        assert!(backend.enumerate().is_empty());
        assert!(backend.open("/nonexistent/fluxengine:1").is_err());
    }
}
