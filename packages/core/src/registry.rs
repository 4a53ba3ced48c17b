//! Mount point registry.
//!
//! All sessions share one base directory. The registry hands out
//! collision-free subdirectories and remembers which of them are in use,
//! either by an in-flight probe attempt or by an active session, so the
//! stale mount sweep never touches a live mount point.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;

use crate::error::{Error, IoResultExt, Result};
use crate::mount;

/// Random bytes appended to each mount point name.
const SUFFIX_BYTES: usize = 4;

/// Attempts before giving up on finding a free name.
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Owner of the mount base directory.
#[derive(Debug)]
pub struct MountRegistry {
    base: PathBuf,
    reserved: Mutex<HashSet<PathBuf>>,
}

impl MountRegistry {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn reserved(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the base directory if needed.
    pub fn ensure_base(&self) -> Result<()> {
        fs::create_dir_all(&self.base).mount_point_context(&self.base)
    }

    /// Creates and reserves a fresh mount point for `device`.
    ///
    /// The name is `<device name>-<random hex>`; device names repeat across
    /// plug cycles, the suffix does not.
    pub fn allocate(&self, device: &Path) -> Result<PathBuf> {
        self.ensure_base()?;
        let stem = device_stem(device);

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let path = self.base.join(format!("{}-{}", stem, random_suffix()));

            // Reserve first so a concurrent sweep never sees it unowned.
            if !self.reserved().insert(path.clone()) {
                continue;
            }
            match mount::create_mount_point(&path) {
                Ok(()) => return Ok(path),
                Err(Error::MountPointCreation { source, .. })
                    if source.kind() == io::ErrorKind::AlreadyExists =>
                {
                    self.reserved().remove(&path);
                }
                Err(e) => {
                    self.reserved().remove(&path);
                    return Err(e);
                }
            }
        }

        Err(Error::MountPointCreation {
            path: self.base.clone(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "no free mount point name available",
            ),
        })
    }

    /// Drops the reservation for a mount point.
    pub fn release(&self, mount_point: &Path) {
        self.reserved().remove(mount_point);
    }

    pub fn is_reserved(&self, mount_point: &Path) -> bool {
        self.reserved().contains(mount_point)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved().len()
    }

    /// Lists every entry currently under the base directory.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.base) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).mount_base_context(&self.base),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            entries.push(entry.mount_base_context(&self.base)?.path());
        }
        entries.sort();
        Ok(entries)
    }
}

/// Sanitized file name of a device path, e.g. `/dev/sdb1` -> `sdb1`.
fn device_stem(device: &Path) -> String {
    let name = device
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "device".to_string());
    sanitize_mount_name(&name)
}

/// Sanitize a string for use as a mount point directory name.
///
/// Replaces problematic characters with underscores.
pub(crate) fn sanitize_mount_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; SUFFIX_BYTES];
    rng.fill(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_unique_mount_points() {
        let dir = TempDir::new().unwrap();
        let registry = MountRegistry::new(dir.path().join("mounts"));

        let first = registry.allocate(Path::new("/dev/sdb1")).unwrap();
        let second = registry.allocate(Path::new("/dev/sdb1")).unwrap();

        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
        assert!(registry.is_reserved(&first));
        assert!(registry.is_reserved(&second));

        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("sdb1-"));
        assert_eq!(name.len(), "sdb1-".len() + SUFFIX_BYTES * 2);
    }

    #[test]
    fn test_release_and_entries() {
        let dir = TempDir::new().unwrap();
        let registry = MountRegistry::new(dir.path());

        let mp = registry.allocate(Path::new("/dev/mmcblk0p1")).unwrap();
        assert_eq!(registry.entries().unwrap(), vec![mp.clone()]);
        assert_eq!(registry.reserved_count(), 1);

        registry.release(&mp);
        assert!(!registry.is_reserved(&mp));
        // Releasing only drops the reservation, not the directory
        assert!(mp.exists());
    }

    #[test]
    fn test_entries_of_missing_base() {
        let dir = TempDir::new().unwrap();
        let registry = MountRegistry::new(dir.path().join("never-created"));
        assert!(registry.entries().unwrap().is_empty());
    }

    #[test]
    fn test_sanitize_mount_name() {
        assert_eq!(sanitize_mount_name("sdb1"), "sdb1");
        assert_eq!(sanitize_mount_name("card image.bin"), "card_image_bin");
        assert_eq!(device_stem(Path::new("/dev/disk/by-id/usb-SD:0")), "usb-SD_0");
    }
}
