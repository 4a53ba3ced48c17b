//! In-process fake of the mount driver.
//!
//! "Mounting" copies a source tree into the mount point and unmounting
//! empties it again, so listing and extraction run against real files
//! without FUSE or root.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::{BrowserConfig, TimeoutConfig};
use crate::driver::{DriverChild, DriverExit, MountDriver};
use crate::error::{Error, Result};
use crate::geometry::Geometry;

/// Timeouts short enough for tests.
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        probe_ms: 300,
        poll_interval_ms: 5,
        unmount_grace_ms: 100,
        command_ms: 300,
        file_read_ms: 2_000,
    }
}

/// Config rooted in isolated temporary directories.
pub fn test_config(mount_base: &Path, export_base: &Path) -> BrowserConfig {
    BrowserConfig::new()
        .with_mount_base(mount_base)
        .with_export_base(export_base)
        .with_timeouts(fast_timeouts())
}

/// Creates an empty file standing in for a block device node.
pub fn fake_device(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"").unwrap();
    path
}

#[derive(Default)]
struct State {
    mounted: HashSet<PathBuf>,
    /// pid -> mount point of processes still running.
    running: HashMap<u32, PathBuf>,
    attempts: Vec<(PathBuf, Geometry)>,
    stat_attempts: Vec<(PathBuf, Geometry)>,
    clean_unmounts: usize,
    forced_unmounts: usize,
}

struct Inner {
    state: Mutex<State>,
    default_geometry: Option<Geometry>,
    per_device: Mutex<HashMap<PathBuf, Option<Geometry>>>,
    source: TempDir,
    next_pid: AtomicU32,
    spawn_delay: Mutex<Duration>,
    spawn_missing: AtomicBool,
    stuck: AtomicBool,
    fail_clean: AtomicBool,
    deny: AtomicBool,
    hide_attachment: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepted(&self, device: &Path) -> Option<Geometry> {
        self.per_device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .copied()
            .unwrap_or(self.default_geometry)
    }

    /// Detaches the mount and ends every driver process serving it.
    fn detach(&self, state: &mut State, mount_point: &Path) {
        state.mounted.remove(mount_point);
        state.running.retain(|_, mp| mp != mount_point);
        clear_dir(mount_point);
    }
}

/// Fake [`MountDriver`] accepting a single geometry (configurable per device).
#[derive(Clone)]
pub struct FakeDriver {
    inner: Arc<Inner>,
}

impl FakeDriver {
    pub fn new(accepted: Geometry) -> Self {
        Self::build(Some(accepted))
    }

    /// A driver for which no geometry ever works.
    pub fn rejecting() -> Self {
        Self::build(None)
    }

    fn build(default_geometry: Option<Geometry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                default_geometry,
                per_device: Mutex::new(HashMap::new()),
                source: TempDir::new().unwrap(),
                next_pid: AtomicU32::new(1000),
                spawn_delay: Mutex::new(Duration::ZERO),
                spawn_missing: AtomicBool::new(false),
                stuck: AtomicBool::new(false),
                fail_clean: AtomicBool::new(false),
                deny: AtomicBool::new(false),
                hide_attachment: AtomicBool::new(false),
            }),
        }
    }

    /// Overrides the accepted geometry for one device.
    pub fn accept_for(&self, device: &Path, geometry: Option<Geometry>) {
        self.inner
            .per_device
            .lock()
            .unwrap()
            .insert(device.to_path_buf(), geometry);
    }

    /// Root of the tree every successful mount exposes.
    pub fn source(&self) -> &Path {
        self.inner.source.path()
    }

    pub fn add_source_file(&self, rel: &str, contents: &[u8]) {
        let path = self.source().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    pub fn add_source_dir(&self, rel: &str) {
        fs::create_dir_all(self.source().join(rel)).unwrap();
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.inner.spawn_delay.lock().unwrap() = delay;
    }

    /// Makes spawning fail as if the binary were not installed.
    pub fn set_missing_binary(&self, missing: bool) {
        self.inner.spawn_missing.store(missing, Ordering::SeqCst);
    }

    /// Driver processes start but never attach.
    pub fn set_stuck(&self, stuck: bool) {
        self.inner.stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn fail_clean_unmount(&self, fail: bool) {
        self.inner.fail_clean.store(fail, Ordering::SeqCst);
    }

    /// Both unmount tiers fail with a permission error.
    pub fn deny_unmount(&self, deny: bool) {
        self.inner.deny.store(deny, Ordering::SeqCst);
    }

    /// Attached mount points refuse `stat` to the caller, as a root-owned
    /// FUSE mount does without `allow_other`.
    pub fn hide_attachment(&self, hide: bool) {
        self.inner.hide_attachment.store(hide, Ordering::SeqCst);
    }

    /// Simulates the device disappearing: the driver dies and the
    /// mount point is left as a dead attachment.
    pub fn crash(&self, mount_point: &Path) {
        let mut state = self.inner.state();
        state.running.retain(|_, mp| mp != mount_point);
        clear_dir(mount_point);
    }

    /// Attaches a mount with no owning process, as left behind by a crash.
    pub fn attach_orphan(&self, mount_point: &Path) {
        copy_tree(self.source(), mount_point);
        self.inner.state().mounted.insert(mount_point.to_path_buf());
    }

    pub fn spawned(&self) -> usize {
        self.inner.state().attempts.len()
    }

    pub fn attempts(&self) -> Vec<Geometry> {
        self.inner.state().attempts.iter().map(|(_, g)| *g).collect()
    }

    pub fn attempts_for(&self, device: &Path) -> usize {
        self.inner
            .state()
            .attempts
            .iter()
            .filter(|(d, _)| d == device)
            .count()
    }

    pub fn stat_attempts(&self) -> Vec<Geometry> {
        self.inner
            .state()
            .stat_attempts
            .iter()
            .map(|(_, g)| *g)
            .collect()
    }

    pub fn live_processes(&self) -> usize {
        self.inner.state().running.len()
    }

    pub fn mounted_count(&self) -> usize {
        self.inner.state().mounted.len()
    }

    pub fn clean_unmounts(&self) -> usize {
        self.inner.state().clean_unmounts
    }

    pub fn forced_unmounts(&self) -> usize {
        self.inner.state().forced_unmounts
    }

    fn permission_error(&self, operation: &str) -> Error {
        Error::PermissionDenied {
            operation: operation.to_string(),
            message: "Operation not permitted".to_string(),
        }
    }
}

impl MountDriver for FakeDriver {
    fn spawn(
        &self,
        device: &Path,
        geometry: Geometry,
        mount_point: &Path,
    ) -> Result<Box<dyn DriverChild>> {
        if self.inner.spawn_missing.load(Ordering::SeqCst) {
            return Err(Error::DriverSpawnFailed {
                program: "lfs".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let delay = *self.inner.spawn_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state();
        state.attempts.push((device.to_path_buf(), geometry));

        if self.inner.accepted(device) != Some(geometry) {
            return Ok(Box::new(FakeChild {
                pid,
                inner: Arc::clone(&self.inner),
                stderr: "lfs: mount failed: Corrupted".to_string(),
            }));
        }

        state.running.insert(pid, mount_point.to_path_buf());
        if !self.inner.stuck.load(Ordering::SeqCst) {
            copy_tree(self.source(), mount_point);
            state.mounted.insert(mount_point.to_path_buf());
        }

        Ok(Box::new(FakeChild {
            pid,
            inner: Arc::clone(&self.inner),
            stderr: String::new(),
        }))
    }

    fn stat(&self, device: &Path, geometry: Geometry) -> Result<Option<String>> {
        if self.inner.spawn_missing.load(Ordering::SeqCst) {
            return Err(Error::DriverSpawnFailed {
                program: "lfs".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        self.inner
            .state()
            .stat_attempts
            .push((device.to_path_buf(), geometry));

        if self.inner.accepted(device) == Some(geometry) {
            Ok(Some(format!(
                "disk_version: 2.0\nblock_size: {}\nblock_count: 256\n",
                geometry.block_size
            )))
        } else {
            Ok(None)
        }
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let mut state = self.inner.state();
        state.clean_unmounts += 1;
        if self.inner.deny.load(Ordering::SeqCst) {
            return Err(self.permission_error("fusermount -u"));
        }
        if self.inner.fail_clean.load(Ordering::SeqCst) {
            return Err(Error::CommandExit {
                command: "fusermount -u".to_string(),
                code: 1,
                stderr: "Device or resource busy".to_string(),
            });
        }
        if !state.mounted.contains(mount_point) {
            return Err(Error::CommandExit {
                command: "fusermount -u".to_string(),
                code: 1,
                stderr: "entry not found in /etc/mtab".to_string(),
            });
        }
        self.inner.detach(&mut state, mount_point);
        Ok(())
    }

    fn force_unmount(&self, mount_point: &Path) -> Result<()> {
        let mut state = self.inner.state();
        state.forced_unmounts += 1;
        if self.inner.deny.load(Ordering::SeqCst) {
            return Err(self.permission_error("umount -l"));
        }
        if !state.mounted.contains(mount_point) {
            return Err(Error::CommandExit {
                command: "umount -l".to_string(),
                code: 32,
                stderr: "not mounted".to_string(),
            });
        }
        self.inner.detach(&mut state, mount_point);
        Ok(())
    }

    fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        let mounted = self.inner.state().mounted.contains(mount_point);
        if mounted && self.inner.hide_attachment.load(Ordering::SeqCst) {
            return Err(self.permission_error("stat"));
        }
        Ok(mounted)
    }
}

struct FakeChild {
    pid: u32,
    inner: Arc<Inner>,
    stderr: String,
}

impl DriverChild for FakeChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> Result<Option<DriverExit>> {
        if self.inner.state().running.contains_key(&self.pid) {
            return Ok(None);
        }
        let code = if self.stderr.is_empty() { 0 } else { 1 };
        Ok(Some(DriverExit { code: Some(code) }))
    }

    fn terminate(&mut self) -> Result<()> {
        let mut state = self.inner.state();
        if let Some(mount_point) = state.running.remove(&self.pid) {
            // Without privilege the dying driver cannot detach either.
            if !self.inner.deny.load(Ordering::SeqCst) && state.mounted.contains(&mount_point) {
                self.inner.detach(&mut state, &mount_point);
            }
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.inner.state().running.remove(&self.pid);
        Ok(())
    }

    fn stderr(&self) -> String {
        self.stderr.clone()
    }
}

fn clear_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let _ = fs::remove_dir_all(&path);
        } else {
            let _ = fs::remove_file(&path);
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}
