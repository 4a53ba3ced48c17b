//! Runtime configuration.
//!
//! Every field has a default matching the stock tool, so an empty JSON
//! object is a valid config file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::geometry::{Geometry, GeometryCandidates};

/// Well-known base directory for session mount points.
pub const DEFAULT_MOUNT_BASE: &str = "/tmp/littlefs_mounts";

/// Directory name used under the downloads folder for extraction runs.
pub const EXPORT_DIR_NAME: &str = "littlefs_export";

/// Name of the littlefs-fuse binary.
pub const DEFAULT_DRIVER_PROGRAM: &str = "lfs";

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_UNMOUNT_GRACE_MS: u64 = 2_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_FILE_READ_TIMEOUT_MS: u64 = 30_000;

/// Time budgets for every external interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long one geometry candidate may take to become a readable mount.
    pub probe_ms: u64,
    /// Sleep between liveness/mount checks while waiting.
    pub poll_interval_ms: u64,
    /// How long a driver may take to exit after a clean unmount request.
    pub unmount_grace_ms: u64,
    /// Upper bound for one-shot commands (`--stat`, `fusermount`, `umount`).
    pub command_ms: u64,
    /// Upper bound for copying a single file during extraction.
    pub file_read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_ms: DEFAULT_PROBE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            unmount_grace_ms: DEFAULT_UNMOUNT_GRACE_MS,
            command_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            file_read_ms: DEFAULT_FILE_READ_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn unmount_grace(&self) -> Duration {
        Duration::from_millis(self.unmount_grace_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn file_read(&self) -> Duration {
        Duration::from_millis(self.file_read_ms)
    }
}

/// Configuration shared by the prober, session manager and extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Directory holding one subdirectory per mount session.
    pub mount_base: PathBuf,
    /// Directory holding one subdirectory per extraction run.
    /// Resolved from the user's downloads folder when unset.
    pub export_base: Option<PathBuf>,
    /// Mount driver executable.
    pub driver_program: String,
    /// Ask the driver for a read-only mount.
    pub read_only: bool,
    /// Ordered geometry candidates; the first one that mounts wins.
    pub candidates: Vec<Geometry>,
    pub timeouts: TimeoutConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            mount_base: PathBuf::from(DEFAULT_MOUNT_BASE),
            export_base: None,
            driver_program: DEFAULT_DRIVER_PROGRAM.to_string(),
            read_only: true,
            candidates: GeometryCandidates::default_set(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl BrowserConfig {
    /// Creates a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).config_read_context(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configs the prober could never succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.candidates.is_empty() {
            return Err(Error::InvalidGeometry {
                value: "[]".to_string(),
                message: "at least one geometry candidate is required".to_string(),
            });
        }
        for candidate in &self.candidates {
            candidate.validate()?;
        }
        Ok(())
    }

    /// Sets the mount base directory.
    pub fn with_mount_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_base = path.into();
        self
    }

    /// Sets the extraction base directory.
    pub fn with_export_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.export_base = Some(path.into());
        self
    }

    /// Sets the mount driver executable.
    pub fn with_driver_program(mut self, program: impl Into<String>) -> Self {
        self.driver_program = program.into();
        self
    }

    /// Replaces the candidate list.
    pub fn with_candidates(mut self, candidates: Vec<Geometry>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Restricts probing to one user-supplied geometry.
    pub fn with_geometry(self, geometry: Geometry) -> Self {
        self.with_candidates(vec![geometry])
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Returns the extraction base, falling back to the downloads folder.
    pub fn resolved_export_base(&self) -> Result<PathBuf> {
        if let Some(base) = &self.export_base {
            return Ok(base.clone());
        }
        default_export_base()
    }
}

/// Returns the default extraction base.
///
/// Prefers the XDG downloads folder and falls back to `~/Downloads`.
pub fn default_export_base() -> Result<PathBuf> {
    let downloads = match dirs::download_dir() {
        Some(dir) => dir,
        None => dirs::home_dir()
            .ok_or(Error::HomeDirNotFound)?
            .join("Downloads"),
    };
    Ok(downloads.join(EXPORT_DIR_NAME))
}
