//! The parameter namespace accepted by the `start_*` operations
//!
//! Keys serialise in camelCase exactly as the host shell names them.
//! Values arriving as strings go through [`Params::set`], which parses and
//! range checks them one at a time; [`Params::validate`] checks a whole set
//! loaded from elsewhere.

use crate::encoding::Encoding;
use crate::error::{FloppyError, Result};
use crate::pll::PllConfig;
use crate::profile::PlatformProfile;
use crate::recovery::RecoveryConfig;
use crate::writer::WriteConfig;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;

const CYLINDERS: RangeInclusive<u8> = 1..=86;
const HEADS: RangeInclusive<u8> = 1..=2;
const SECTORS: RangeInclusive<u8> = 0..=64;
const RETRIES: RangeInclusive<u8> = 0..=50;
const REVOLUTIONS: RangeInclusive<u8> = 1..=5;
const GAIN: RangeInclusive<f64> = 0.0..=1.0;
const WINDOW: RangeInclusive<f64> = 0.05..=0.5;
const WRITE_RETRIES: RangeInclusive<u8> = 0..=10;
const DRIVE: RangeInclusive<u8> = 0..=3;

/// Operation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Params {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    /// Container name, or `auto` to probe
    pub format: String,
    pub cylinders: u8,
    pub heads: u8,
    /// Sectors per track, 0 to take it from the disk
    pub sectors: u8,
    /// Encoding name, or `auto` to probe
    pub encoding: String,
    /// Backend name, or `auto` for the first one present
    pub hardware: String,
    pub device_path: Option<String>,
    pub drive_number: u8,
    pub retries: u8,
    pub revolutions: u8,
    pub weak_bits: bool,
    pub pll_phase_gain: f64,
    pub pll_freq_gain: f64,
    pub pll_window_tolerance: f64,
    pub pll_preset: String,
    pub verify_after_write: bool,
    pub write_retries: u8,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            input_path: None,
            output_path: None,
            format: "auto".into(),
            cylinders: 80,
            heads: 2,
            sectors: 0,
            encoding: "auto".into(),
            hardware: "auto".into(),
            device_path: None,
            drive_number: 0,
            retries: 3,
            revolutions: 3,
            weak_bits: true,
            pll_phase_gain: 0.10,
            pll_freq_gain: 0.05,
            pll_window_tolerance: 0.40,
            pll_preset: "default".into(),
            verify_after_write: true,
            write_retries: 3,
            verbose: false,
            quiet: false,
        }
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FloppyError::invalid_arg(format!("{}: '{}' is not a number", name, value)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FloppyError::invalid_arg(format!("{}: '{}' is not a boolean", name, value))),
    }
}

fn in_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, range: &RangeInclusive<T>) -> Result<T> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(FloppyError::invalid_arg(format!(
            "{} {} out of range {}..={}",
            name,
            value,
            range.start(),
            range.end()
        )))
    }
}

fn path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

impl Params {
    /// Every accepted name
    pub const NAMES: [&'static str; 21] = [
        "inputPath",
        "outputPath",
        "format",
        "cylinders",
        "heads",
        "sectors",
        "encoding",
        "hardware",
        "devicePath",
        "driveNumber",
        "retries",
        "revolutions",
        "weakBits",
        "pllPhaseGain",
        "pllFreqGain",
        "pllWindowTolerance",
        "pllPreset",
        "verifyAfterWrite",
        "writeRetries",
        "verbose",
        "quiet",
    ];

    /// Defaults for a platform
    pub fn for_profile(profile: &PlatformProfile) -> Self {
        Self {
            cylinders: profile.geometry.cylinders,
            heads: profile.geometry.heads,
            sectors: profile.geometry.sectors_per_track,
            encoding: match profile.encoding {
                Encoding::Unknown => "auto".into(),
                e => e.name().to_string(),
            },
            revolutions: profile.revolutions,
            pll_preset: profile.pll_preset.to_string(),
            ..Self::default()
        }
    }

    /// Parse and store one value by its camelCase name
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "inputPath" => self.input_path = path(value),
            "outputPath" => self.output_path = path(value),
            "format" => self.format = value.trim().to_ascii_lowercase(),
            "cylinders" => self.cylinders = in_range(name, parse_num(name, value)?, &CYLINDERS)?,
            "heads" => self.heads = in_range(name, parse_num(name, value)?, &HEADS)?,
            "sectors" => self.sectors = in_range(name, parse_num(name, value)?, &SECTORS)?,
            "encoding" => {
                let value = value.trim().to_ascii_lowercase();
                if value != "auto" && Encoding::from_name(&value).is_none() {
                    return Err(FloppyError::invalid_arg(format!("unknown encoding '{}'", value)));
                }
                self.encoding = value;
            }
            "hardware" => self.hardware = value.trim().to_ascii_lowercase(),
            "devicePath" => self.device_path = path(value).map(|p| p.to_string_lossy().into_owned()),
            "driveNumber" => self.drive_number = in_range(name, parse_num(name, value)?, &DRIVE)?,
            "retries" => self.retries = in_range(name, parse_num(name, value)?, &RETRIES)?,
            "revolutions" => self.revolutions = in_range(name, parse_num(name, value)?, &REVOLUTIONS)?,
            "weakBits" => self.weak_bits = parse_bool(name, value)?,
            "pllPhaseGain" => self.pll_phase_gain = in_range(name, parse_num(name, value)?, &GAIN)?,
            "pllFreqGain" => self.pll_freq_gain = in_range(name, parse_num(name, value)?, &GAIN)?,
            "pllWindowTolerance" => {
                self.pll_window_tolerance = in_range(name, parse_num(name, value)?, &WINDOW)?
            }
            "pllPreset" => {
                let value = value.trim().to_ascii_lowercase();
                PllConfig::preset(&value)?;
                self.pll_preset = value;
            }
            "verifyAfterWrite" => self.verify_after_write = parse_bool(name, value)?,
            "writeRetries" => self.write_retries = in_range(name, parse_num(name, value)?, &WRITE_RETRIES)?,
            "verbose" => self.verbose = parse_bool(name, value)?,
            "quiet" => self.quiet = parse_bool(name, value)?,
            _ => return Err(FloppyError::invalid_arg(format!("unknown parameter '{}'", name))),
        }
        Ok(())
    }

    /// Current value of a parameter as text
    pub fn get(&self, name: &str) -> Option<String> {
        let opt = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        Some(match name {
            "inputPath" => opt(&self.input_path),
            "outputPath" => opt(&self.output_path),
            "format" => self.format.clone(),
            "cylinders" => self.cylinders.to_string(),
            "heads" => self.heads.to_string(),
            "sectors" => self.sectors.to_string(),
            "encoding" => self.encoding.clone(),
            "hardware" => self.hardware.clone(),
            "devicePath" => self.device_path.clone().unwrap_or_default(),
            "driveNumber" => self.drive_number.to_string(),
            "retries" => self.retries.to_string(),
            "revolutions" => self.revolutions.to_string(),
            "weakBits" => self.weak_bits.to_string(),
            "pllPhaseGain" => self.pll_phase_gain.to_string(),
            "pllFreqGain" => self.pll_freq_gain.to_string(),
            "pllWindowTolerance" => self.pll_window_tolerance.to_string(),
            "pllPreset" => self.pll_preset.clone(),
            "verifyAfterWrite" => self.verify_after_write.to_string(),
            "writeRetries" => self.write_retries.to_string(),
            "verbose" => self.verbose.to_string(),
            "quiet" => self.quiet.to_string(),
            _ => return None,
        })
    }

    /// Check every range, for a set that did not come through `set`
    pub fn validate(&self) -> Result<()> {
        in_range("cylinders", self.cylinders, &CYLINDERS)?;
        in_range("heads", self.heads, &HEADS)?;
        in_range("sectors", self.sectors, &SECTORS)?;
        in_range("retries", self.retries, &RETRIES)?;
        in_range("revolutions", self.revolutions, &REVOLUTIONS)?;
        in_range("pllPhaseGain", self.pll_phase_gain, &GAIN)?;
        in_range("pllFreqGain", self.pll_freq_gain, &GAIN)?;
        in_range("pllWindowTolerance", self.pll_window_tolerance, &WINDOW)?;
        in_range("writeRetries", self.write_retries, &WRITE_RETRIES)?;
        in_range("driveNumber", self.drive_number, &DRIVE)?;
        self.encoding()?;
        PllConfig::preset(&self.pll_preset)?;
        if self.verbose && self.quiet {
            return Err(FloppyError::invalid_arg("verbose and quiet are exclusive"));
        }
        Ok(())
    }

    /// Requested encoding, `None` for `auto`
    pub fn encoding(&self) -> Result<Option<Encoding>> {
        if self.encoding.eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        match Encoding::from_name(&self.encoding) {
            Some(Encoding::Unknown) => Ok(None),
            Some(e) => Ok(Some(e)),
            None => Err(FloppyError::invalid_arg(format!("unknown encoding '{}'", self.encoding))),
        }
    }

    /// Container hint, `None` for `auto`
    pub fn format_hint(&self) -> Option<&str> {
        (!self.format.eq_ignore_ascii_case("auto")).then_some(self.format.as_str())
    }

    /// PLL settings: the preset, with any gain or window that was moved
    /// off its default taking precedence
    pub fn pll_config(&self) -> Result<PllConfig> {
        let base = Self::default();
        let mut pll = PllConfig::preset(&self.pll_preset)?;
        if self.pll_phase_gain != base.pll_phase_gain {
            pll.phase_gain = self.pll_phase_gain;
        }
        if self.pll_freq_gain != base.pll_freq_gain {
            pll.freq_gain = self.pll_freq_gain;
        }
        if self.pll_window_tolerance != base.pll_window_tolerance {
            pll.tolerance = self.pll_window_tolerance;
            pll.search_tolerance = pll.search_tolerance.max(pll.tolerance);
        }
        Ok(pll)
    }

    /// Recovery settings for a read
    pub fn recovery_config(&self, profile: Option<&PlatformProfile>) -> Result<RecoveryConfig> {
        let mut config = profile.map(RecoveryConfig::for_profile).unwrap_or_default();
        config.retries = self.retries;
        config.revolutions = self.revolutions;
        config.weak_bits = self.weak_bits;
        if let Some(encoding) = self.encoding()? {
            config.encoding = Some(encoding);
        }
        let pll = self.pll_config()?;
        if pll != PllConfig::default() {
            config.pll = pll;
        }
        Ok(config)
    }

    /// Settings for a write or verify pass
    pub fn write_config(&self, profile: Option<&PlatformProfile>) -> Result<WriteConfig> {
        Ok(WriteConfig {
            verify: self.verify_after_write,
            retries: self.write_retries,
            revolutions: self.revolutions.min(2),
            precomp: None,
            recovery: self.recovery_config(profile)?,
        })
    }

    /// Log level the console should run at
    pub fn log_level(&self) -> log::LevelFilter {
        if self.verbose {
            log::LevelFilter::Debug
        } else if self.quiet {
            log::LevelFilter::Error
        } else {
            log::LevelFilter::Warn
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::profile::profile;

    #[test]
    fn test_defaults_are_valid() {
        let params = Params::default();
        params.validate().unwrap();
        assert_eq!(params.encoding().unwrap(), None);
        assert_eq!(params.format_hint(), None);
        assert_eq!(params.log_level(), log::LevelFilter::Warn);
    }

    #[test]
    fn test_set_and_get() {
        let mut params = Params::default();
        params.set("cylinders", "40").unwrap();
        params.set("weakBits", "off").unwrap();
        params.set("encoding", "MFM").unwrap();
        params.set("inputPath", "/tmp/disk.scp").unwrap();
        assert_eq!(params.cylinders, 40);
        assert!(!params.weak_bits);
        assert_eq!(params.encoding().unwrap(), Some(Encoding::Mfm));
        assert_eq!(params.get("inputPath").as_deref(), Some("/tmp/disk.scp"));
        for name in Params::NAMES {
            assert!(params.get(name).is_some(), "{}", name);
        }
        assert_eq!(params.get("bogus"), None);
    }

    #[test]
    fn test_ranges_enforced() {
        let mut params = Params::default();
        for (name, value) in [
            ("cylinders", "0"),
            ("cylinders", "87"),
            ("heads", "3"),
            ("revolutions", "6"),
            ("retries", "51"),
            ("pllWindowTolerance", "0.6"),
            ("pllPhaseGain", "-0.1"),
            ("driveNumber", "4"),
            ("writeRetries", "11"),
            ("verbose", "maybe"),
            ("encoding", "zigzag"),
            ("pllPreset", "fast"),
            ("noSuchThing", "1"),
        ] {
            let err = params.set(name, value).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{}={}", name, value);
        }
        assert_eq!(params, Params::default());

        params.revolutions = 9;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_camel_case_json() {
        let mut params = Params::default();
        params.set("pllPreset", "amiga").unwrap();
        let json = serde_json::to_value(&params).unwrap();
        for name in Params::NAMES {
            assert!(json.get(name).is_some(), "{}", name);
        }
        let back: Params = serde_json::from_str(r#"{"pllPreset":"amiga","retries":7}"#).unwrap();
        assert_eq!(back.retries, 7);
        assert_eq!(back.cylinders, 80);
        assert_eq!(back.pll_preset, "amiga");
    }

    #[test]
    fn test_pll_overrides() {
        let mut params = Params::default();
        params.set("pllPreset", "amiga").unwrap();
        let amiga = PllConfig::preset("amiga").unwrap();
        assert_eq!(params.pll_config().unwrap(), amiga);
        params.set("pllWindowTolerance", "0.45").unwrap();
        let pll = params.pll_config().unwrap();
        assert_eq!(pll.tolerance, 0.45);
        assert_eq!(pll.phase_gain, amiga.phase_gain);
    }

    #[test]
    fn test_configs_follow_params() {
        let p = profile("amiga-dd").unwrap();
        let mut params = Params::for_profile(p);
        params.set("retries", "7").unwrap();
        params.set("verifyAfterWrite", "no").unwrap();
        let recovery = params.recovery_config(Some(p)).unwrap();
        assert_eq!(recovery.retries, 7);
        assert_eq!(recovery.encoding, Some(Encoding::AmigaMfm));
        let write = params.write_config(Some(p)).unwrap();
        assert!(!write.verify);
        assert_eq!(write.retries, 3);
    }
}
