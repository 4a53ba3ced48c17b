//! Mount session manager.
//!
//! Owns the mapping from device identity to active mount, serializes
//! mount/unmount per device and is the only component that spawns, signals
//! or unmounts driver processes. Nothing here is persisted: after a restart
//! orphaned mounts are reclaimed by [`crate::reconcile`], not rebuilt.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::disk::{self, BlockDevice};
use crate::driver::{DriverChild, LfsDriver, MountDriver};
use crate::error::{Error, Result};
use crate::executor::ExecutionContext;
use crate::geometry::Geometry;
use crate::mount;
use crate::probe::{Detection, Prober};
use crate::reconcile::{self, SweepReport};
use crate::registry::MountRegistry;
use crate::walker::{self, ExtractionResult, FileNode};

/// One active mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSession {
    /// Device identity (canonical device path).
    pub device: PathBuf,
    pub geometry: Geometry,
    pub mount_point: PathBuf,
    pub driver_pid: u32,
    pub created_at: DateTime<Utc>,
}

/// A device from the enumeration together with its session state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub device: BlockDevice,
    pub mounted: bool,
    pub mount_point: Option<PathBuf>,
}

struct ActiveMount {
    session: MountSession,
    child: Arc<Mutex<Box<dyn DriverChild>>>,
}

/// Session manager for LittleFS mounts.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use littlefs_browser_core::{BrowserConfig, SessionManager};
/// use littlefs_browser_core::executor::ExecutionContext;
///
/// let manager = SessionManager::with_lfs(BrowserConfig::default(), ExecutionContext::with_sudo());
/// manager.sweep().unwrap();
///
/// let session = manager.mount(Path::new("/dev/sdb1")).unwrap();
/// for node in manager.list(Path::new("/dev/sdb1"), "/").unwrap() {
///     println!("{} {:?}", node.name, node.kind);
/// }
/// let result = manager.extract_all(&session.device).unwrap();
/// println!("copied {} files to {}", result.files_copied, result.destination.display());
/// manager.unmount(Path::new("/dev/sdb1")).unwrap();
/// ```
pub struct SessionManager {
    config: BrowserConfig,
    driver: Arc<dyn MountDriver>,
    registry: MountRegistry,
    sessions: Mutex<HashMap<PathBuf, ActiveMount>>,
    device_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves the identity used to key sessions.
///
/// Symlinks such as `/dev/disk/by-id/...` collapse onto the device node. A
/// device that has disappeared resolves through its parent directory.
fn device_key(device: &Path) -> PathBuf {
    if let Ok(path) = fs::canonicalize(device) {
        return path;
    }
    match (device.parent(), device.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| device.to_path_buf()),
        _ => device.to_path_buf(),
    }
}

impl SessionManager {
    pub fn new(config: BrowserConfig, driver: Arc<dyn MountDriver>) -> Self {
        let registry = MountRegistry::new(&config.mount_base);
        Self {
            config,
            driver,
            registry,
            sessions: Mutex::new(HashMap::new()),
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a manager driving the real `lfs` binary.
    pub fn with_lfs(config: BrowserConfig, ctx: ExecutionContext) -> Self {
        let driver = LfsDriver::new(&config, ctx);
        Self::new(config, Arc::new(driver))
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn registry(&self) -> &MountRegistry {
        &self.registry
    }

    /// Runs `f` holding the lock for `key`. The lock entry is dropped once
    /// no other caller holds or waits on it.
    fn with_device_lock<T>(&self, key: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let handle = Arc::clone(lock(&self.device_locks).entry(key.to_path_buf()).or_default());
        let outcome = {
            let _guard = lock(&handle);
            f()
        };

        let mut locks = lock(&self.device_locks);
        drop(handle);
        if locks.get(key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(key);
        }
        outcome
    }

    fn existing_device(device: &Path) -> Result<PathBuf> {
        if !device.exists() {
            return Err(Error::DeviceNotFound {
                device: device.to_path_buf(),
            });
        }
        Ok(device_key(device))
    }

    /// Fails with [`Error::AlreadyMounted`] if `key` has a session.
    fn ensure_vacant(&self, key: &Path) -> Result<()> {
        match lock(&self.sessions).get(key) {
            Some(active) => Err(Error::AlreadyMounted {
                device: key.to_path_buf(),
                mount_point: active.session.mount_point.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Mounts `device`, probing for its geometry.
    ///
    /// Idempotent: if the device already has a session, that session is
    /// returned and no driver is spawned. Concurrent calls for the same
    /// device are serialized; different devices proceed in parallel.
    pub fn mount(&self, device: &Path) -> Result<MountSession> {
        let key = Self::existing_device(device)?;
        self.with_device_lock(&key, || self.mount_locked(&key))
    }

    fn mount_locked(&self, key: &Path) -> Result<MountSession> {
        if let Some(session) = self.get_session(key) {
            debug!(device = %key.display(), "already mounted, reusing session");
            return Ok(session);
        }

        let prober = Prober::new(self.driver.as_ref(), &self.registry, &self.config);
        let success = prober.probe(key)?;

        let session = MountSession {
            device: key.to_path_buf(),
            geometry: success.geometry,
            mount_point: success.mount_point,
            driver_pid: success.child.id(),
            created_at: Utc::now(),
        };
        lock(&self.sessions).insert(
            key.to_path_buf(),
            ActiveMount {
                session: session.clone(),
                child: Arc::new(Mutex::new(success.child)),
            },
        );

        info!(
            device = %session.device.display(),
            mount_point = %session.mount_point.display(),
            geometry = %session.geometry,
            "session created"
        );
        Ok(session)
    }

    /// Unmounts `device` and removes its mount point.
    ///
    /// Fails with [`Error::NotMounted`] if there is no session. If both
    /// unmount tiers fail the session is kept so the caller can retry.
    pub fn unmount(&self, device: &Path) -> Result<()> {
        let key = device_key(device);
        self.with_device_lock(&key, || self.unmount_locked(device, &key))
    }

    fn unmount_locked(&self, device: &Path, key: &Path) -> Result<()> {
        let (mount_point, child) = match lock(&self.sessions).get(key) {
            Some(active) => (
                active.session.mount_point.clone(),
                Arc::clone(&active.child),
            ),
            None => {
                return Err(Error::NotMounted {
                    device: device.to_path_buf(),
                });
            }
        };

        {
            let mut child = lock(&child);
            if let Some(exit) = child.try_wait()? {
                debug!(device = %key.display(), code = ?exit.code, "driver already exited");
            }
            mount::release_mount(
                self.driver.as_ref(),
                &mount_point,
                Some(&mut **child),
                &self.config.timeouts,
            )?;
        }

        lock(&self.sessions).remove(key);
        self.registry.release(&mount_point);
        info!(device = %key.display(), mount_point = %mount_point.display(), "session removed");
        Ok(())
    }

    /// Returns the active session for `device`, if any.
    pub fn get_session(&self, device: &Path) -> Option<MountSession> {
        let key = device_key(device);
        lock(&self.sessions)
            .get(&key)
            .map(|active| active.session.clone())
    }

    /// Returns every active session, ordered by device.
    pub fn list_active(&self) -> Vec<MountSession> {
        let mut sessions: Vec<MountSession> = lock(&self.sessions)
            .values()
            .map(|active| active.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.device.cmp(&b.device));
        sessions
    }

    pub fn is_mounted(&self, device: &Path) -> bool {
        self.get_session(device).is_some()
    }

    /// Detects the geometry of an unmounted device without mounting it.
    pub fn detect(&self, device: &Path) -> Result<Detection> {
        let key = Self::existing_device(device)?;
        self.with_device_lock(&key, || {
            self.ensure_vacant(&key)?;
            Prober::new(self.driver.as_ref(), &self.registry, &self.config).detect(&key)
        })
    }

    fn session_or_not_mounted(&self, device: &Path) -> Result<MountSession> {
        self.get_session(device).ok_or_else(|| Error::NotMounted {
            device: device.to_path_buf(),
        })
    }

    /// Lists the direct children of `path` on a mounted device.
    pub fn list(&self, device: &Path, path: &str) -> Result<Vec<FileNode>> {
        let session = self.session_or_not_mounted(device)?;
        walker::list(&session, path)
    }

    /// Resolves a file on a mounted device to a host path for download.
    pub fn resolve_file(&self, device: &Path, path: &str) -> Result<PathBuf> {
        let session = self.session_or_not_mounted(device)?;
        walker::resolve_file(&session.mount_point, path)
    }

    /// Copies the whole tree of a mounted device into a new export run directory.
    pub fn extract_all(&self, device: &Path) -> Result<ExtractionResult> {
        let session = self.session_or_not_mounted(device)?;
        let export_base = self.config.resolved_export_base()?;
        walker::extract_all(&session, &export_base, self.config.timeouts.file_read())
    }

    /// Reclaims mount points not owned by any session or in-flight probe.
    pub fn sweep(&self) -> Result<SweepReport> {
        reconcile::sweep(&self.registry, self.driver.as_ref(), &self.config.timeouts)
    }

    /// Enumerates block devices that could hold a LittleFS image,
    /// with their session state.
    pub fn device_statuses(&self) -> Result<Vec<DeviceStatus>> {
        let devices = disk::list_block_devices()?;
        let candidates = disk::filter_candidate_devices(devices, self.registry.base());
        Ok(self.annotate(candidates))
    }

    /// Pairs enumerated devices with their session state.
    pub fn annotate(&self, devices: Vec<BlockDevice>) -> Vec<DeviceStatus> {
        devices
            .into_iter()
            .map(|device| {
                let session = self.get_session(&device.path);
                DeviceStatus {
                    mounted: session.is_some(),
                    mount_point: session.map(|s| s.mount_point),
                    device,
                }
            })
            .collect()
    }

    /// Unmounts every session, best effort. Returns the failures.
    pub fn shutdown(&self) -> Vec<(PathBuf, Error)> {
        let mut failures = Vec::new();
        for session in self.list_active() {
            if let Err(e) = self.unmount(&session.device) {
                warn!(device = %session.device.display(), error = %e, "failed to unmount on shutdown");
                failures.push((session.device, e));
            }
        }
        failures
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !lock(&self.sessions).is_empty() {
            let _ = self.shutdown();
        }
    }
}
