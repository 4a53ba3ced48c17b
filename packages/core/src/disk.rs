//! Block device enumeration using lsblk.
//!
//! Lists whole disks and partitions that could hold a LittleFS image. The
//! result is re-queried on every call and never cached.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// A disk or partition reported by lsblk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// Device name (e.g., "sdb", "mmcblk0p1").
    pub name: String,
    /// Full device path (e.g., "/dev/sdb").
    pub path: PathBuf,
    /// Volume label, if set.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// lsblk type, "disk" or "part".
    pub device_type: String,
    /// Current host mount point, if mounted.
    pub mountpoint: Option<String>,
}

impl BlockDevice {
    /// Label for display, falling back to "Unlabeled".
    pub fn display_label(&self) -> &str {
        self.label
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or("Unlabeled")
    }

    /// Returns true if this device is currently mounted on the host.
    pub fn is_mounted(&self) -> bool {
        self.mountpoint.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Raw JSON structure from lsblk output.
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

/// Lists all disks and partitions on the system.
///
/// Calls `lsblk --json --bytes` and parses the output.
pub fn list_block_devices() -> Result<Vec<BlockDevice>> {
    let output = Command::new("lsblk")
        .args([
            "--json",
            "--bytes",
            "--output",
            "NAME,LABEL,SIZE,TYPE,MOUNTPOINT",
        ])
        .output()
        .command_context("lsblk")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(Error::CommandExit {
            command: "lsblk".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    parse_lsblk(&String::from_utf8_lossy(&output.stdout))
}

fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let lsblk_output: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut devices = Vec::new();
    collect_devices(&lsblk_output.blockdevices, &mut devices);
    Ok(devices)
}

/// Recursively collect disks and their partitions.
fn collect_devices(lsblk_devices: &[LsblkDevice], devices: &mut Vec<BlockDevice>) {
    for dev in lsblk_devices {
        if let Some(device_type @ ("disk" | "part")) = dev.device_type.as_deref() {
            devices.push(BlockDevice {
                name: dev.name.clone(),
                path: PathBuf::from(format!("/dev/{}", dev.name)),
                label: dev.label.clone(),
                size: dev.size.unwrap_or(0),
                device_type: device_type.to_string(),
                mountpoint: dev.mountpoint.clone(),
            });
        }

        if let Some(children) = &dev.children {
            collect_devices(children, devices);
        }
    }
}

/// Keeps devices that are unmounted, or mounted under `mount_base` by us.
pub fn filter_candidate_devices(devices: Vec<BlockDevice>, mount_base: &Path) -> Vec<BlockDevice> {
    devices
        .into_iter()
        .filter(|d| match d.mountpoint.as_deref() {
            None | Some("") => true,
            Some(mountpoint) => Path::new(mountpoint).starts_with(mount_base),
        })
        .collect()
}
