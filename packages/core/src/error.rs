//! Unified error types for the littlefs-browser-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The device node does not exist or cannot be resolved.
    #[snafu(display("device {} not found", device.display()))]
    DeviceNotFound { device: PathBuf },

    /// The device already has an active session.
    ///
    /// The session manager turns this into a success carrying the existing
    /// session; it only surfaces from lower-level helpers.
    #[snafu(display("device {} is already mounted at {}", device.display(), mount_point.display()))]
    AlreadyMounted {
        device: PathBuf,
        mount_point: PathBuf,
    },

    /// The device has no active session.
    #[snafu(display("device {} is not mounted", device.display()))]
    NotMounted { device: PathBuf },

    /// Every geometry candidate was tried and none produced a readable root.
    #[snafu(display(
        "could not detect LittleFS geometry for {} after {attempts} attempt(s): {last_error}",
        device.display()
    ))]
    GeometryProbeFailed {
        device: PathBuf,
        attempts: usize,
        last_error: String,
    },

    /// The mount driver binary could not be started at all.
    #[snafu(display("failed to spawn mount driver '{program}'"))]
    DriverSpawnFailed {
        program: String,
        source: std::io::Error,
    },

    /// A driver interaction did not finish within its time budget.
    #[snafu(display("'{operation}' timed out after {timeout:?}"))]
    DriverTimeout {
        operation: String,
        timeout: Duration,
    },

    /// Both the clean and the forced unmount failed.
    #[snafu(display("failed to unmount {}: {message}", path.display()))]
    UnmountFailed { path: PathBuf, message: String },

    /// A driver or unmount call was refused for lack of privilege.
    #[snafu(display("permission denied during {operation}: {message}"))]
    PermissionDenied { operation: String, message: String },

    /// User cancelled authentication dialog.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    /// The requested path does not exist under the mount root.
    #[snafu(display("path '{path}' not found"))]
    PathNotFound { path: String },

    /// A directory operation was requested on a file.
    #[snafu(display("'{path}' is not a directory"))]
    NotADirectory { path: String },

    /// A file operation was requested on a directory.
    #[snafu(display("'{path}' is not a file"))]
    NotAFile { path: String },

    /// The requested path escapes the mount root.
    #[snafu(display("invalid path '{path}'"))]
    InvalidPath { path: String },

    /// The mounted root could not be listed.
    #[snafu(display("mounted root {} is not readable", path.display()))]
    UnreadableRoot {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A directory under the mount root could not be read.
    #[snafu(display("failed to read {}", path.display()))]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Extraction stopped on an unreadable or unwritable file.
    #[snafu(display(
        "extraction failed at {} after copying {files_copied} file(s), {bytes_copied} byte(s)",
        path.display()
    ))]
    ExtractionIo {
        path: PathBuf,
        files_copied: u64,
        bytes_copied: u64,
        source: std::io::Error,
    },

    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The mount base directory could not be scanned.
    #[snafu(display("failed to read mount base {}", path.display()))]
    MountBaseRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file could not be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for [`crate::config::BrowserConfig`].
    #[snafu(display("failed to parse config at {}: {message}", path.display()))]
    ConfigParse { path: PathBuf, message: String },

    /// A geometry string or value is not usable.
    #[snafu(display("invalid geometry '{value}': {message}"))]
    InvalidGeometry { value: String, message: String },

    /// Home directory not found.
    #[snafu(display("Could not determine home directory"))]
    HomeDirNotFound,

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Stable, machine-readable error kind exposed to boundary layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceNotFound,
    AlreadyMounted,
    NotMounted,
    GeometryProbeFailed,
    DriverSpawnFailed,
    DriverTimeout,
    UnmountFailed,
    PermissionDenied,
    AuthenticationCancelled,
    PathNotFound,
    NotADirectory,
    NotAFile,
    InvalidPath,
    ExtractionIoError,
    Io,
    Command,
    Config,
    /// Malformed, unsigned or replayed daemon request.
    Protocol,
    Internal,
}

impl Error {
    /// Returns the stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            Error::AlreadyMounted { .. } => ErrorKind::AlreadyMounted,
            Error::NotMounted { .. } => ErrorKind::NotMounted,
            Error::GeometryProbeFailed { .. } => ErrorKind::GeometryProbeFailed,
            Error::DriverSpawnFailed { .. } => ErrorKind::DriverSpawnFailed,
            Error::DriverTimeout { .. } => ErrorKind::DriverTimeout,
            Error::UnmountFailed { .. } => ErrorKind::UnmountFailed,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::AuthenticationCancelled => ErrorKind::AuthenticationCancelled,
            Error::PathNotFound { .. } => ErrorKind::PathNotFound,
            Error::NotADirectory { .. } => ErrorKind::NotADirectory,
            Error::NotAFile { .. } => ErrorKind::NotAFile,
            Error::InvalidPath { .. } => ErrorKind::InvalidPath,
            Error::ExtractionIo { .. } => ErrorKind::ExtractionIoError,
            Error::UnreadableRoot { .. } | Error::ReadDir { .. } => ErrorKind::Io,
            Error::CommandExecution { .. }
            | Error::CommandExit { .. }
            | Error::LsblkParse { .. } => ErrorKind::Command,
            Error::ConfigRead { .. }
            | Error::ConfigParse { .. }
            | Error::InvalidGeometry { .. }
            | Error::HomeDirNotFound => ErrorKind::Config,
            Error::MountPointCreation { .. }
            | Error::MountBaseRead { .. }
            | Error::Generic { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying with elevated privileges may help.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::PermissionDenied { .. } | Error::AuthenticationCancelled => true,
            Error::MountPointCreation { source, .. } | Error::MountBaseRead { source, .. } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}

/// Checks if command output indicates a privilege problem.
pub(crate) fn is_permission_error(stderr: &str) -> bool {
    let indicators = [
        "Permission denied",
        "permission denied",
        "Operation not permitted",
        "must be superuser",
        "only root can",
    ];

    indicators
        .iter()
        .any(|indicator| stderr.contains(indicator))
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount base scanning errors.
    fn mount_base_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn mount_base_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountBaseReadSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}
