//! Geometry prober.
//!
//! Tries each geometry candidate in order against a device until the
//! driver produces a readable root. Every failed attempt is torn down
//! completely (driver stopped, mount point detached and removed) before
//! the next candidate starts.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::driver::{DriverChild, MountDriver};
use crate::error::{Error, Result, is_permission_error};
use crate::geometry::Geometry;
use crate::mount;
use crate::registry::MountRegistry;

/// A verified mount produced by [`Prober::probe`].
pub struct ProbeSuccess {
    pub geometry: Geometry,
    pub mount_point: PathBuf,
    pub child: Box<dyn DriverChild>,
    /// Number of candidates tried, including the winning one.
    pub attempts: usize,
}

/// Result of a `--stat` detection run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Detection {
    pub geometry: Geometry,
    /// Raw filesystem info printed by the driver.
    pub info: String,
}

pub struct Prober<'a> {
    driver: &'a dyn MountDriver,
    registry: &'a MountRegistry,
    config: &'a BrowserConfig,
}

/// Errors that would repeat for every candidate, so probing stops early.
fn is_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::DriverSpawnFailed { .. }
            | Error::PermissionDenied { .. }
            | Error::AuthenticationCancelled
    ) || error.is_permission_denied()
}

impl<'a> Prober<'a> {
    pub fn new(
        driver: &'a dyn MountDriver,
        registry: &'a MountRegistry,
        config: &'a BrowserConfig,
    ) -> Self {
        Self {
            driver,
            registry,
            config,
        }
    }

    /// Mounts `device` with the first geometry that yields a readable root.
    ///
    /// Per-candidate failures are absorbed; only exhaustion surfaces, as
    /// [`Error::GeometryProbeFailed`]. On any error no mount point
    /// directory or driver process created here is left behind.
    pub fn probe(&self, device: &Path) -> Result<ProbeSuccess> {
        let candidates = &self.config.candidates;
        let mut last_error = String::from("no geometry candidates configured");

        for (index, &geometry) in candidates.iter().enumerate() {
            let attempt = index + 1;
            debug!(device = %device.display(), %geometry, attempt, "trying geometry");

            match self.attempt(device, geometry) {
                Ok((mount_point, child)) => {
                    info!(
                        device = %device.display(),
                        %geometry,
                        mount_point = %mount_point.display(),
                        attempt,
                        "mounted"
                    );
                    return Ok(ProbeSuccess {
                        geometry,
                        mount_point,
                        child,
                        attempts: attempt,
                    });
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    debug!(device = %device.display(), %geometry, error = %e, "geometry rejected");
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::GeometryProbeFailed {
            device: device.to_path_buf(),
            attempts: candidates.len(),
            last_error,
        })
    }

    /// One candidate: fresh mount point, spawn, verify, teardown on failure.
    fn attempt(
        &self,
        device: &Path,
        geometry: Geometry,
    ) -> Result<(PathBuf, Box<dyn DriverChild>)> {
        let mount_point = self.registry.allocate(device)?;

        let mut child = match self.driver.spawn(device, geometry, &mount_point) {
            Ok(child) => child,
            Err(e) => {
                self.discard(&mount_point, None);
                return Err(e);
            }
        };

        match self.verify(device, geometry, child.as_mut(), &mount_point) {
            Ok(()) => Ok((mount_point, child)),
            Err(e) => {
                self.discard(&mount_point, Some(child.as_mut()));
                Err(e)
            }
        }
    }

    /// Waits until the driver has attached a sane root, exits, or times out.
    fn verify(
        &self,
        device: &Path,
        geometry: Geometry,
        child: &mut dyn DriverChild,
        mount_point: &Path,
    ) -> Result<()> {
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.probe();

        loop {
            if let Some(exit) = child.try_wait()? {
                let stderr = child.stderr();
                if is_permission_error(&stderr) {
                    return Err(Error::PermissionDenied {
                        operation: format!("mount {}", device.display()),
                        message: stderr,
                    });
                }
                return Err(Error::CommandExit {
                    command: format!("{} {}", self.config.driver_program, geometry),
                    code: exit.code.unwrap_or(-1),
                    stderr,
                });
            }

            if self.driver.is_mounted(mount_point)? {
                return check_root(mount_point);
            }

            if Instant::now() >= deadline {
                return Err(Error::DriverTimeout {
                    operation: format!("mount {} with {}", device.display(), geometry),
                    timeout: timeouts.probe(),
                });
            }
            thread::sleep(timeouts.poll_interval());
        }
    }

    /// Tears down a failed attempt and gives its name back.
    fn discard(&self, mount_point: &Path, child: Option<&mut dyn DriverChild>) {
        if let Err(e) =
            mount::release_mount(self.driver, mount_point, child, &self.config.timeouts)
        {
            // Left for the stale mount sweep.
            warn!(mount_point = %mount_point.display(), error = %e, "failed to clean up probe attempt");
        }
        self.registry.release(mount_point);
    }

    /// Finds the geometry via the driver's `--stat` mode without mounting.
    pub fn detect(&self, device: &Path) -> Result<Detection> {
        let candidates = &self.config.candidates;
        let mut last_error = String::from("no filesystem info reported");

        for &geometry in candidates {
            match self.driver.stat(device, geometry) {
                Ok(Some(info)) => {
                    info!(device = %device.display(), %geometry, "detected geometry");
                    return Ok(Detection { geometry, info });
                }
                Ok(None) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(Error::GeometryProbeFailed {
            device: device.to_path_buf(),
            attempts: candidates.len(),
            last_error,
        })
    }
}

/// Confirms the mounted root can be listed and every entry stat'ed.
///
/// A geometry mismatch that still mounts shows up here as I/O errors.
fn check_root(mount_point: &Path) -> Result<()> {
    let unreadable = |source: std::io::Error| Error::UnreadableRoot {
        path: mount_point.to_path_buf(),
        source,
    };

    for entry in fs::read_dir(mount_point).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        entry.metadata().map_err(unreadable)?;
    }
    Ok(())
}
