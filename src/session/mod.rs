//! Sessions: one recorded operation
//!
//! A session captures what was asked for (operation, parameters, device,
//! profile) and what happened (per-track results and the recovery
//! overrides that were needed) so a read can be repeated with the same
//! settings. Sessions given a directory save themselves there as JSON
//! whenever they change.

pub mod cancel;
pub mod params;
pub mod progress;

use crate::disk::{Disk, TrackOverride, TrackStatus};
use crate::error::{FloppyError, Result};
use crate::hw::DeviceInfo;
use crate::profile::{profile, PlatformProfile};
use crate::writer::Report;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use cancel::CancelToken;
pub use params::Params;
pub use progress::{Outcome, Progress, ProgressEvent, ProgressQueue};

/// Kind of operation a session records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Verify,
    Convert,
    Analyze,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Verify => "verify",
            Operation::Convert => "convert",
            Operation::Analyze => "analyze",
        };
        write!(f, "{}", s)
    }
}

/// Final state of one track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResult {
    pub cylinder: u8,
    pub head: u8,
    pub status: TrackStatus,
    pub good: usize,
    pub total: usize,
}

/// What an operation produced
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResults {
    pub outcome: Option<Outcome>,
    pub tracks: Vec<TrackResult>,
    /// Write or verify summary
    pub report: Option<Report>,
    /// Error text when the operation failed
    pub error: Option<String>,
}

/// A recorded operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub operation: Operation,
    pub hardware: Option<DeviceInfo>,
    /// Platform profile name
    pub profile: Option<String>,
    pub params: Params,
    pub overrides: Vec<TrackOverride>,
    pub results: SessionResults,
    #[serde(skip)]
    dir: Option<PathBuf>,
}

impl Session {
    /// Start recording an operation
    pub fn new(operation: Operation, params: Params) -> Self {
        let created_at = Utc::now();
        Self {
            id: format!("{}-{}", created_at.format("%Y%m%d-%H%M%S%3f"), operation),
            created_at,
            operation,
            hardware: None,
            profile: None,
            params,
            overrides: Vec::new(),
            results: SessionResults::default(),
            dir: None,
        }
    }

    /// Save to `dir` now and after every later change
    pub fn with_dir<P: AsRef<Path>>(mut self, dir: P) -> Result<Self> {
        self.dir = Some(dir.as_ref().to_path_buf());
        self.autosave()?;
        Ok(self)
    }

    /// Record the platform profile in use
    pub fn with_profile(mut self, profile: Option<&PlatformProfile>) -> Self {
        self.profile = profile.map(|p| p.name.to_string());
        self
    }

    /// Record the device in use
    pub fn with_hardware(mut self, info: Option<DeviceInfo>) -> Self {
        self.hardware = info;
        self
    }

    /// Platform profile the session was recorded with
    pub fn platform_profile(&self) -> Result<Option<&'static PlatformProfile>> {
        self.profile.as_deref().map(profile).transpose()
    }

    /// Where the session lives on disk, if it has a directory
    pub fn file_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("session-{}.json", self.id)))
    }

    /// Write the session as JSON into `dir`
    pub fn save_to<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("session-{}.json", self.id));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        debug!("session {} saved to {}", self.id, path.display());
        Ok(path)
    }

    fn autosave(&self) -> Result<()> {
        if let Some(dir) = &self.dir {
            self.save_to(dir)?;
        }
        Ok(())
    }

    /// Read a saved session; it keeps saving next to where it was found
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut session: Session = serde_json::from_slice(&std::fs::read(path)?)?;
        session.params.validate()?;
        session.platform_profile()?;
        session.dir = path.parent().map(Path::to_path_buf);
        info!("session {} loaded ({} overrides)", session.id, session.overrides.len());
        Ok(session)
    }

    /// Take per-track results and recovery overrides from a disk
    pub fn record_disk(&mut self, disk: &Disk) -> Result<()> {
        self.results.tracks = disk
            .tracks()
            .map(|t| TrackResult {
                cylinder: t.cylinder,
                head: t.head,
                status: t.status,
                good: t.good_sectors(),
                total: t.sector_count(),
            })
            .collect();
        self.overrides = disk.all_overrides().cloned().collect();
        self.autosave()
    }

    /// Record a write or verify summary
    pub fn record_report(&mut self, report: Report) -> Result<()> {
        self.results.report = Some(report);
        self.autosave()
    }

    /// Close the session with how the operation ended
    pub fn finish<T>(&mut self, result: &Result<T>, outcome: Outcome) -> Result<()> {
        self.results.outcome = Some(outcome);
        self.results.error = match result {
            Ok(_) => None,
            Err(e) => Some(format!("{}: {}", e.kind().code(), e)),
        };
        info!("session {} finished: {:?}", self.id, outcome);
        self.autosave()
    }

    /// Overrides recorded for one track, oldest first
    pub fn overrides_for(&self, cylinder: u8, head: u8) -> impl Iterator<Item = &TrackOverride> {
        self.overrides
            .iter()
            .filter(move |o| o.cylinder == cylinder && o.head == head)
    }

    /// Apply recorded overrides to a disk about to be re-read
    pub fn replay_into(&self, disk: &mut Disk) {
        for o in &self.overrides {
            disk.push_override(o.clone());
        }
    }
}

/// Outcome matching an operation's result
pub fn outcome_of<T>(result: &Result<T>, success: Outcome) -> Outcome {
    match result {
        Ok(_) => success,
        Err(FloppyError::Cancelled) => Outcome::Cancelled,
        Err(_) => Outcome::Failed,
    }
}
