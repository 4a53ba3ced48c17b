//! Mount point operations.
//!
//! This module handles detecting whether a directory has a filesystem
//! attached, and the two-tier teardown shared by failed probe attempts,
//! explicit unmounts and process shutdown.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::stat;
use tracing::{debug, warn};

use crate::config::TimeoutConfig;
use crate::driver::{DriverChild, MountDriver};
use crate::error::{Error, IoResultExt, Result};

/// Returns true if a filesystem is attached at `path`.
///
/// A directory is a mount point when its device id differs from its
/// parent's. A FUSE mount whose driver died answers `ENOTCONN`, which also
/// counts as mounted since it still needs an unmount.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let own = match stat::stat(path) {
        Ok(st) => st,
        Err(Errno::ENOTCONN) => return Ok(true),
        Err(Errno::ENOENT) => return Ok(false),
        Err(e) => return Err(stat_error(path, e)),
    };

    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let parent_st = stat::stat(parent).map_err(|e| stat_error(parent, e))?;

    Ok(own.st_dev != parent_st.st_dev)
}

/// A root-owned FUSE mount without `allow_other` answers `EACCES`.
fn stat_error(path: &Path, errno: Errno) -> Error {
    match errno {
        Errno::EACCES | Errno::EPERM => Error::PermissionDenied {
            operation: format!("stat {}", path.display()),
            message: errno.desc().to_string(),
        },
        _ => Error::MountBaseRead {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        },
    }
}

/// Creates a fresh, empty mount point directory.
///
/// Fails with [`io::ErrorKind::AlreadyExists`] in the source if the path is
/// taken, so callers can pick another name.
pub fn create_mount_point(path: &Path) -> Result<()> {
    fs::create_dir(path).mount_point_context(path)
}

/// Removes an (unmounted) mount point directory.
///
/// Only empty directories are removed; a non-empty one means something is
/// still attached and is reported instead of deleted.
pub fn remove_mount_point(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(Error::PermissionDenied {
            operation: format!("remove {}", path.display()),
            message: e.to_string(),
        }),
        Err(e) => Err(Error::UnmountFailed {
            path: path.to_path_buf(),
            message: format!("could not remove mount point: {e}"),
        }),
    }
}

/// Waits up to `grace` for the driver to exit. Returns true if it did.
pub fn wait_for_exit(
    child: &mut dyn DriverChild,
    grace: Duration,
    poll: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + grace;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(poll);
    }
}

/// Stops a driver process: SIGTERM, then SIGKILL after the grace period.
pub fn stop_driver(child: &mut dyn DriverChild, timeouts: &TimeoutConfig) -> Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    child.terminate()?;
    if wait_for_exit(child, timeouts.unmount_grace(), timeouts.poll_interval())? {
        return Ok(());
    }
    warn!(pid = child.id(), "driver ignored SIGTERM, killing");
    child.kill()
}

/// Unmounts `mount_point`, stops its driver and removes the directory.
///
/// Sequence: clean unmount, then forced/lazy unmount if that fails; the
/// driver gets a grace period to exit before SIGTERM/SIGKILL. When nothing
/// is attached (driver already gone, or it never attached) no unmount is
/// attempted and the directory is removed directly. If the attachment
/// cannot be determined it is treated as attached.
///
/// The driver is stopped even when unmounting fails.
pub fn release_mount(
    driver: &dyn MountDriver,
    mount_point: &Path,
    child: Option<&mut dyn DriverChild>,
    timeouts: &TimeoutConfig,
) -> Result<()> {
    let attached = match driver.is_mounted(mount_point) {
        Ok(attached) => attached,
        Err(e) => {
            warn!(
                mount_point = %mount_point.display(),
                error = %e,
                "cannot tell whether mounted, unmounting anyway"
            );
            true
        }
    };

    let detached = if attached {
        detach(driver, mount_point)
    } else {
        Ok(())
    };

    let stopped = match child {
        Some(c) => {
            let exited = attached
                && detached.is_ok()
                && wait_for_exit(c, timeouts.unmount_grace(), timeouts.poll_interval())
                    .unwrap_or(false);
            if exited { Ok(()) } else { stop_driver(c, timeouts) }
        }
        None => Ok(()),
    };

    match detached {
        // A terminated FUSE driver may detach on its own.
        Err(e) if still_attached(driver, mount_point) => return Err(e),
        _ => {}
    }
    stopped?;
    remove_mount_point(mount_point)
}

/// Clean unmount, falling back to the forced tier.
fn detach(driver: &dyn MountDriver, mount_point: &Path) -> Result<()> {
    let clean_err = match driver.unmount(mount_point) {
        Ok(()) => {
            debug!(mount_point = %mount_point.display(), "clean unmount succeeded");
            return Ok(());
        }
        Err(e) => e,
    };
    warn!(
        mount_point = %mount_point.display(),
        error = %clean_err,
        "clean unmount failed, forcing"
    );

    let force_err = match driver.force_unmount(mount_point) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if clean_err.is_permission_denied() || force_err.is_permission_denied() {
        return Err(Error::PermissionDenied {
            operation: format!("unmount {}", mount_point.display()),
            message: force_err.to_string(),
        });
    }
    Err(Error::UnmountFailed {
        path: mount_point.to_path_buf(),
        message: format!("clean: {clean_err}; forced: {force_err}"),
    })
}

/// Re-checks the attachment after a failed detach; unknown counts as attached.
fn still_attached(driver: &dyn MountDriver, mount_point: &Path) -> bool {
    driver.is_mounted(mount_point).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::testing::{FakeDriver, fast_timeouts};
    use tempfile::TempDir;

    #[test]
    fn test_plain_directory_is_not_a_mount_point() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("plain");
        fs::create_dir(&sub).unwrap();
        assert!(!is_mount_point(&sub).unwrap());
        assert!(!is_mount_point(&dir.path().join("missing")).unwrap());
    }

    #[test]
    fn test_stat_errors_classify_permission() {
        let path = Path::new("/mnt/littlefs/sdb-00");
        assert!(stat_error(path, Errno::EACCES).is_permission_denied());
        assert!(stat_error(path, Errno::EPERM).is_permission_denied());
        assert!(matches!(
            stat_error(path, Errno::EIO),
            Error::MountBaseRead { .. }
        ));
    }

    #[test]
    fn test_create_mount_point_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let mp = dir.path().join("sdb-00000000");
        create_mount_point(&mp).unwrap();
        match create_mount_point(&mp) {
            Err(Error::MountPointCreation { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_remove_mount_point_keeps_non_empty_dir() {
        let dir = TempDir::new().unwrap();
        let mp = dir.path().join("busy");
        fs::create_dir(&mp).unwrap();
        fs::write(mp.join("file"), b"x").unwrap();

        assert!(matches!(
            remove_mount_point(&mp),
            Err(Error::UnmountFailed { .. })
        ));
        assert!(mp.join("file").exists());

        // Already gone is fine
        remove_mount_point(&dir.path().join("gone")).unwrap();
    }

    #[test]
    fn test_release_running_mount() {
        let base = TempDir::new().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        driver.add_source_file("boot.cfg", b"cfg");
        let mp = base.path().join("sdb-1");
        create_mount_point(&mp).unwrap();
        let mut child = driver
            .spawn(Path::new("/dev/sdb"), Geometry::new(4096, 16, 16), &mp)
            .unwrap();
        assert!(mp.join("boot.cfg").exists());

        release_mount(&driver, &mp, Some(child.as_mut()), &fast_timeouts()).unwrap();

        assert!(!mp.exists());
        assert_eq!(driver.live_processes(), 0);
        assert_eq!(driver.clean_unmounts(), 1);
        assert_eq!(driver.forced_unmounts(), 0);
    }

    #[test]
    fn test_release_escalates_to_forced_unmount() {
        let base = TempDir::new().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        driver.fail_clean_unmount(true);
        let mp = base.path().join("sdb-2");
        create_mount_point(&mp).unwrap();
        let mut child = driver
            .spawn(Path::new("/dev/sdb"), Geometry::new(4096, 16, 16), &mp)
            .unwrap();

        release_mount(&driver, &mp, Some(child.as_mut()), &fast_timeouts()).unwrap();

        assert!(!mp.exists());
        assert_eq!(driver.forced_unmounts(), 1);
        assert_eq!(driver.live_processes(), 0);
    }

    #[test]
    fn test_release_after_driver_exited() {
        let base = TempDir::new().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        let mp = base.path().join("sdb-3");
        create_mount_point(&mp).unwrap();
        let mut child = driver
            .spawn(Path::new("/dev/sdb"), Geometry::new(4096, 16, 16), &mp)
            .unwrap();

        // Device pulled: the driver dies and leaves a stale attachment
        driver.crash(&mp);
        assert!(child.try_wait().unwrap().is_some());

        release_mount(&driver, &mp, Some(child.as_mut()), &fast_timeouts()).unwrap();
        assert!(!mp.exists());
        assert_eq!(driver.clean_unmounts(), 1);
    }

    #[test]
    fn test_release_never_attached() {
        let base = TempDir::new().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        let mp = base.path().join("sdb-5");
        create_mount_point(&mp).unwrap();
        // Wrong geometry: the driver exits without attaching
        let mut child = driver
            .spawn(Path::new("/dev/sdb"), Geometry::new(512, 16, 16), &mp)
            .unwrap();

        release_mount(&driver, &mp, Some(child.as_mut()), &fast_timeouts()).unwrap();
        assert!(!mp.exists());
        assert_eq!(driver.clean_unmounts(), 0);
        assert_eq!(driver.forced_unmounts(), 0);
    }

    #[test]
    fn test_release_reports_permission_failure() {
        let base = TempDir::new().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        let mp = base.path().join("sdb-4");
        create_mount_point(&mp).unwrap();
        let mut child = driver
            .spawn(Path::new("/dev/sdb"), Geometry::new(4096, 16, 16), &mp)
            .unwrap();
        driver.deny_unmount(true);

        let err = release_mount(&driver, &mp, Some(child.as_mut()), &fast_timeouts()).unwrap_err();
        assert!(err.is_permission_denied());
        assert!(mp.exists());
    }

    #[test]
    fn test_release_when_attachment_check_fails() {
        let base = TempDir::new().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        driver.add_source_file("boot.cfg", b"cfg");
        let mp = base.path().join("sdb-6");
        create_mount_point(&mp).unwrap();
        let mut child = driver
            .spawn(Path::new("/dev/sdb"), Geometry::new(4096, 16, 16), &mp)
            .unwrap();
        driver.hide_attachment(true);

        release_mount(&driver, &mp, Some(child.as_mut()), &fast_timeouts()).unwrap();

        assert!(!mp.exists());
        assert_eq!(driver.clean_unmounts(), 1);
        assert_eq!(driver.live_processes(), 0);
    }

    #[test]
    fn test_release_stops_driver_even_when_unmount_fails() {
        let base = TempDir::new().unwrap();
        let driver = FakeDriver::new(Geometry::new(4096, 16, 16));
        let mp = base.path().join("sdb-7");
        create_mount_point(&mp).unwrap();
        let mut child = driver
            .spawn(Path::new("/dev/sdb"), Geometry::new(4096, 16, 16), &mp)
            .unwrap();
        driver.hide_attachment(true);
        driver.deny_unmount(true);

        let err = release_mount(&driver, &mp, Some(child.as_mut()), &fast_timeouts()).unwrap_err();

        assert!(err.is_permission_denied(), "{err}");
        assert_eq!(driver.forced_unmounts(), 1);
        assert_eq!(driver.live_processes(), 0);
    }
}
