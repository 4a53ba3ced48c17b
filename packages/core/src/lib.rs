//! littlefs-browser-core: Core library for browsing LittleFS images.
//!
//! Mounts raw block devices holding a LittleFS filesystem through a
//! userspace FUSE driver (`lfs`), guessing the filesystem geometry, and
//! exposes the mounted tree read-only for listing and bulk extraction.
//!
//! # Modules
//!
//! - [`geometry`]: Geometry triples and the ordered candidate set
//! - [`probe`]: Geometry probing by trial mount (and `--stat` detection)
//! - [`session`]: Mount session manager, the single owner of driver processes
//! - [`walker`]: Directory listing and tree extraction
//! - [`reconcile`]: Stale mount point reclamation
//! - [`driver`]: Driver capability traits and the `lfs` implementation
//! - [`mount`]: Mount point lifecycle and escalating unmount
//! - [`registry`]: Mount point allocation under the shared base directory
//! - [`disk`]: Block device enumeration using `lsblk`
//! - [`executor`]: Command execution with optional privilege escalation
//! - [`protocol`]: Signed daemon protocol types
//! - [`config`]: Configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use littlefs_browser_core::{BrowserConfig, SessionManager, walker};
//! use littlefs_browser_core::executor::ExecutionContext;
//!
//! let manager = SessionManager::with_lfs(BrowserConfig::default(), ExecutionContext::new());
//!
//! // Reclaim leftovers from a previous run
//! let report = manager.sweep().unwrap();
//! println!("reclaimed {} stale mount point(s)", report.reclaimed_count());
//!
//! let device = Path::new("/dev/sdb1");
//! let session = manager.mount(device).unwrap();
//! println!("mounted with geometry {}", session.geometry);
//!
//! for node in manager.list(device, "/").unwrap() {
//!     let size = node.size.map(walker::format_size).unwrap_or_default();
//!     println!("{:<30} {}", node.name, size);
//! }
//!
//! manager.unmount(device).unwrap();
//! ```

pub mod config;
pub mod disk;
pub mod driver;
pub mod error;
pub mod executor;
pub mod geometry;
pub mod mount;
pub mod probe;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod walker;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{BrowserConfig, TimeoutConfig};
pub use disk::BlockDevice;
pub use error::{Error, ErrorKind, Result};
pub use geometry::{Geometry, GeometryCandidates};
pub use probe::Detection;
pub use reconcile::SweepReport;
pub use session::{DeviceStatus, MountSession, SessionManager};
pub use walker::{ExtractionResult, FileKind, FileNode};
