//! Read-only traversal of a mounted LittleFS tree.
//!
//! Paths handed in by callers are relative to the mount root (a leading
//! `/` is allowed) and may never climb out of it.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::registry::sanitize_mount_name;
use crate::session::MountSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNode {
    pub name: String,
    pub kind: FileKind,
    /// Byte size; `None` for directories.
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Path relative to the mount root, `/`-separated.
    pub path: String,
}

impl FileNode {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Outcome of a full extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    pub destination: PathBuf,
    pub files_copied: u64,
    pub bytes_copied: u64,
}

/// Normalizes a caller path into a relative path under the root.
fn relative_path(path: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::RootDir if relative.as_os_str().is_empty() => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                });
            }
        }
    }
    Ok(relative)
}

fn display_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn metadata_or_not_found(host: &Path, path: &str) -> Result<fs::Metadata> {
    match fs::metadata(host) {
        Ok(metadata) => Ok(metadata),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::PathNotFound {
            path: path.to_string(),
        }),
        Err(source) => Err(Error::ReadDir {
            path: host.to_path_buf(),
            source,
        }),
    }
}

/// Lists the direct children of `path` on a mounted session.
///
/// Directories come first, then files, each group ordered by name
/// case-insensitively.
pub fn list(session: &MountSession, path: &str) -> Result<Vec<FileNode>> {
    list_dir(&session.mount_point, path)
}

/// [`list`] against a bare mount root.
pub fn list_dir(root: &Path, path: &str) -> Result<Vec<FileNode>> {
    let relative = relative_path(path)?;
    let host = root.join(&relative);

    if !metadata_or_not_found(&host, path)?.is_dir() {
        return Err(Error::NotADirectory {
            path: path.to_string(),
        });
    }

    let read_err = |source: io::Error| Error::ReadDir {
        path: host.clone(),
        source,
    };

    let mut nodes = Vec::new();
    for entry in fs::read_dir(&host).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let metadata = entry.metadata().map_err(read_err)?;
        let name = entry.file_name().to_string_lossy().to_string();
        let kind = if metadata.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };

        nodes.push(FileNode {
            path: display_path(&relative.join(&name)),
            size: (kind == FileKind::File).then(|| metadata.len()),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            name,
            kind,
        });
    }

    nodes.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(nodes)
}

/// Resolves a file under `root` to its host path.
pub fn resolve_file(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = relative_path(path)?;
    let host = root.join(&relative);

    if !metadata_or_not_found(&host, path)?.is_file() {
        return Err(Error::NotAFile {
            path: path.to_string(),
        });
    }
    Ok(host)
}

/// Copies the whole tree of `session` into a new run directory under `export_base`.
///
/// Stops at the first file that cannot be read or written; the error
/// carries the progress made so far and the partial copy stays on disk.
pub fn extract_all(
    session: &MountSession,
    export_base: &Path,
    file_timeout: Duration,
) -> Result<ExtractionResult> {
    let destination = create_run_dir(export_base, &session.device)?;
    info!(
        device = %session.device.display(),
        destination = %destination.display(),
        "extracting"
    );
    extract_tree(&session.mount_point, &destination, file_timeout)
}

/// Copies everything under `root` into the existing directory `destination`.
pub fn extract_tree(
    root: &Path,
    destination: &Path,
    file_timeout: Duration,
) -> Result<ExtractionResult> {
    let mut result = ExtractionResult {
        destination: destination.to_path_buf(),
        files_copied: 0,
        bytes_copied: 0,
    };

    let fail = |result: &ExtractionResult, path: &Path, source: io::Error| Error::ExtractionIo {
        path: path.to_path_buf(),
        files_copied: result.files_copied,
        bytes_copied: result.bytes_copied,
        source,
    };

    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let source_dir = root.join(&relative);
        let read_dir = fs::read_dir(&source_dir).map_err(|e| fail(&result, &source_dir, e))?;

        for entry in read_dir {
            let entry = entry.map_err(|e| fail(&result, &source_dir, e))?;
            let source = entry.path();
            let child = relative.join(entry.file_name());
            let target = destination.join(&child);
            let file_type = entry.file_type().map_err(|e| fail(&result, &source, e))?;

            if file_type.is_dir() {
                fs::create_dir_all(&target).map_err(|e| fail(&result, &target, e))?;
                pending.push(child);
            } else {
                let bytes = copy_file(&source, &target, file_timeout)
                    .map_err(|e| fail(&result, &source, e))?;
                debug!(file = %child.display(), bytes, "copied");
                result.files_copied += 1;
                result.bytes_copied += bytes;
            }
        }
    }

    info!(
        files = result.files_copied,
        bytes = result.bytes_copied,
        destination = %destination.display(),
        "extraction complete"
    );
    Ok(result)
}

/// Copies one file, preserving its modification time.
///
/// A read that hangs past `timeout` (a wedged driver) fails with
/// `TimedOut`; the copy thread is left to finish on its own.
fn copy_file(source: &Path, target: &Path, timeout: Duration) -> io::Result<u64> {
    let (tx, rx) = mpsc::channel();
    let (src, dst) = (source.to_path_buf(), target.to_path_buf());

    thread::spawn(move || {
        let outcome = fs::copy(&src, &dst).and_then(|bytes| {
            let modified = fs::metadata(&src)?.modified()?;
            set_modified(&dst, modified)?;
            Ok(bytes)
        });
        let _ = tx.send(outcome);
    });

    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("reading {} timed out after {:?}", source.display(), timeout),
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(io::Error::other("copy thread exited")),
    }
}

fn set_modified(path: &Path, modified: SystemTime) -> io::Result<()> {
    File::options().write(true).open(path)?.set_modified(modified)
}

/// Creates `<device>-<timestamp>` under `export_base`, adding a numeric
/// suffix if that name is taken.
fn create_run_dir(export_base: &Path, device: &Path) -> Result<PathBuf> {
    let creation_err = |path: &Path, source: io::Error| Error::ExtractionIo {
        path: path.to_path_buf(),
        files_copied: 0,
        bytes_copied: 0,
        source,
    };

    fs::create_dir_all(export_base).map_err(|e| creation_err(export_base, e))?;

    let stem = device
        .file_name()
        .map(|n| sanitize_mount_name(&n.to_string_lossy()))
        .unwrap_or_else(|| "device".to_string());
    let base_name = format!("{}-{}", stem, Local::now().format("%Y%m%d-%H%M%S"));

    let mut counter = 0u32;
    loop {
        let name = if counter == 0 {
            base_name.clone()
        } else {
            format!("{base_name}-{counter}")
        };
        let path = export_base.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(creation_err(&path, e)),
        }
    }
}

/// Formats a byte count for display, e.g. `1.5 KB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}
