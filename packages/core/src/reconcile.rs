//! Stale mount reconciliation.
//!
//! A crashed process or an unplugged device leaves directories (and
//! possibly dead FUSE attachments) under the mount base. Sweeping reclaims
//! every entry that no live session or in-flight probe has reserved.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::driver::MountDriver;
use crate::error::{ErrorKind, Result};
use crate::mount;
use crate::registry::MountRegistry;

/// An entry the sweep could not reclaim.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
    /// Retrying with elevated privileges may succeed.
    pub needs_privilege: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub reclaimed: Vec<PathBuf>,
    pub failed: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed.len()
    }
}

/// Reclaims unreserved mount points under the registry's base.
///
/// Attached entries are unmounted (clean, then forced) before their
/// directory is removed. Per-entry failures are reported, not returned;
/// only an unreadable base directory fails the sweep.
pub fn sweep(
    registry: &MountRegistry,
    driver: &dyn MountDriver,
    timeouts: &TimeoutConfig,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for path in registry.entries()? {
        if registry.is_reserved(&path) {
            debug!(path = %path.display(), "in use, skipping");
            continue;
        }
        // Stale FUSE mounts fail stat with ENOTCONN, so only skip
        // entries that are plainly regular files.
        if path.is_file() {
            debug!(path = %path.display(), "not a mount point, skipping");
            continue;
        }

        match mount::release_mount(driver, &path, None, timeouts) {
            Ok(()) => {
                info!(path = %path.display(), "reclaimed stale mount point");
                report.reclaimed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to reclaim mount point");
                report.failed.push(SweepFailure {
                    kind: e.kind(),
                    needs_privilege: e.is_permission_denied(),
                    message: e.to_string(),
                    path,
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDriver, fast_timeouts};
    use crate::geometry::Geometry;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup() -> (TempDir, MountRegistry, FakeDriver) {
        let dir = TempDir::new().unwrap();
        let registry = MountRegistry::new(dir.path().join("mounts"));
        registry.ensure_base().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        (dir, registry, driver)
    }

    #[test]
    fn test_reclaims_orphans() {
        let (_dir, registry, driver) = setup();
        driver.add_source_file("data.bin", b"xyz");

        let plain = registry.base().join("sdb-00000001");
        let attached = registry.base().join("sdc-00000002");
        fs::create_dir(&plain).unwrap();
        fs::create_dir(&attached).unwrap();
        driver.attach_orphan(&attached);
        assert!(attached.join("data.bin").exists());

        let report = sweep(&registry, &driver, &fast_timeouts()).unwrap();
        assert_eq!(report.reclaimed_count(), 2);
        assert!(report.failed.is_empty());
        assert!(!plain.exists());
        assert!(!attached.exists());
        assert_eq!(driver.mounted_count(), 0);
        assert_eq!(driver.clean_unmounts(), 1);

        // Nothing left the second time round
        let again = sweep(&registry, &driver, &fast_timeouts()).unwrap();
        assert_eq!(again.reclaimed_count(), 0);
    }

    #[test]
    fn test_skips_reserved_and_files() {
        let (_dir, registry, driver) = setup();
        let live = registry.allocate(Path::new("/dev/sdd")).unwrap();
        let stray = registry.base().join("notes.txt");
        fs::write(&stray, b"keep").unwrap();

        let report = sweep(&registry, &driver, &fast_timeouts()).unwrap();
        assert_eq!(report.reclaimed_count(), 0);
        assert!(live.exists());
        assert!(stray.exists());
    }

    #[test]
    fn test_missing_base_is_empty_sweep() {
        let dir = TempDir::new().unwrap();
        let registry = MountRegistry::new(dir.path().join("absent"));
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        let report = sweep(&registry, &driver, &fast_timeouts()).unwrap();
        assert_eq!(report.reclaimed_count(), 0);
    }

    #[test]
    fn test_reports_privileged_failures() {
        let (_dir, registry, driver) = setup();
        let stuck = registry.base().join("sde-00000003");
        fs::create_dir(&stuck).unwrap();
        driver.attach_orphan(&stuck);
        driver.deny_unmount(true);

        let report = sweep(&registry, &driver, &fast_timeouts()).unwrap();
        assert_eq!(report.reclaimed_count(), 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, stuck);
        assert_eq!(report.failed[0].kind, ErrorKind::PermissionDenied);
        assert!(report.failed[0].needs_privilege);
        assert!(stuck.exists());
    }
}
