//! Mount driver capability interface.
//!
//! The LittleFS implementation itself lives in an external FUSE binary
//! (`lfs` from littlefs-fuse). The core only ever talks to it through the
//! [`MountDriver`] trait: spawn with a geometry, ask it to `--stat` a
//! device, and unmount in two tiers. Tests substitute a fake driver.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::config::BrowserConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecutionContext, PrivilegeEscalation, check_output};
use crate::geometry::Geometry;
use crate::mount;

/// Strings `lfs --stat` prints only when it parsed a superblock.
const STAT_MARKERS: [&str; 2] = ["disk_version", "block_count"];

/// How a driver process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverExit {
    /// Exit code, or None if killed by a signal.
    pub code: Option<i32>,
}

impl DriverExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running mount driver process.
pub trait DriverChild: Send {
    /// OS process id.
    fn id(&self) -> u32;

    /// Returns the exit status if the process has ended, without blocking.
    fn try_wait(&mut self) -> Result<Option<DriverExit>>;

    /// Asks the process to stop (SIGTERM). A no-op if it already exited.
    fn terminate(&mut self) -> Result<()>;

    /// Kills the process and reaps it.
    fn kill(&mut self) -> Result<()>;

    /// Returns everything the process wrote to stderr so far.
    fn stderr(&self) -> String;
}

/// Spawns mount drivers and performs the unmount primitives.
pub trait MountDriver: Send + Sync {
    /// Starts the driver for `device` with `geometry`, attaching at `mount_point`.
    ///
    /// Returns as soon as the process is running; the caller verifies the mount.
    fn spawn(
        &self,
        device: &Path,
        geometry: Geometry,
        mount_point: &Path,
    ) -> Result<Box<dyn DriverChild>>;

    /// Reads filesystem info without mounting.
    ///
    /// `Ok(None)` means the geometry did not yield a valid superblock.
    fn stat(&self, device: &Path, geometry: Geometry) -> Result<Option<String>>;

    /// Clean unmount request.
    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Forced/lazy unmount, used when the clean request fails.
    fn force_unmount(&self, mount_point: &Path) -> Result<()>;

    /// Returns true if something is attached at `mount_point`.
    fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        mount::is_mount_point(mount_point)
    }
}

/// [`DriverChild`] backed by a [`std::process::Child`].
pub struct StdDriverChild {
    child: Child,
    stderr: Arc<Mutex<Vec<u8>>>,
    /// Context and timeout for signalling through sudo/pkexec.
    escalated: Option<(ExecutionContext, Duration)>,
}

/// Command that delivers `signal` to a driver started under `escalation`,
/// or `None` when signalling the child pid directly reaches the driver.
///
/// sudo forks the driver and relays SIGTERM, but SIGKILL only ends sudo
/// itself, so it is sent to sudo's children. pkexec execs the driver as
/// root, out of reach of an unprivileged signal.
fn escalated_signal(
    escalation: PrivilegeEscalation,
    pid: u32,
    signal: Signal,
) -> Option<(&'static str, Vec<String>)> {
    let flag = format!("-{}", signal.as_str().trim_start_matches("SIG"));
    match escalation {
        PrivilegeEscalation::None => None,
        PrivilegeEscalation::Sudo if signal == Signal::SIGTERM => None,
        PrivilegeEscalation::Sudo => Some(("pkill", vec![flag, "-P".to_string(), pid.to_string()])),
        PrivilegeEscalation::Pkexec => Some(("kill", vec![flag, pid.to_string()])),
    }
}

impl StdDriverChild {
    /// Wraps a child, draining its stderr pipe in the background.
    pub fn new(mut child: Child) -> Self {
        let stderr = Arc::new(Mutex::new(Vec::new()));
        if let Some(mut pipe) = child.stderr.take() {
            let sink = Arc::clone(&stderr);
            thread::spawn(move || {
                let mut chunk = [0u8; 1024];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&chunk[..n]),
                    }
                }
            });
        }
        Self {
            child,
            stderr,
            escalated: None,
        }
    }

    /// Wraps a child started through `ctx`, so signals follow the wrapper.
    pub fn escalated(child: Child, ctx: ExecutionContext, timeout: Duration) -> Self {
        let mut wrapped = Self::new(child);
        if ctx.escalation() != PrivilegeEscalation::None {
            wrapped.escalated = Some((ctx, timeout));
        }
        wrapped
    }

    /// Sends `signal` through the privilege wrapper. Returns false if the
    /// child pid can be signalled directly instead.
    fn signal_escalated(&self, signal: Signal) -> Result<bool> {
        let Some((ctx, timeout)) = &self.escalated else {
            return Ok(false);
        };
        let Some((program, args)) = escalated_signal(ctx.escalation(), self.child.id(), signal)
        else {
            return Ok(false);
        };

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = ctx.run_with_timeout(program, &args, *timeout)?;
        // Exit 1: no matching process, the driver is already gone.
        if output.status.code() == Some(1) {
            return Ok(true);
        }
        check_output(&ctx.display_command(program, &args), output)?;
        Ok(true)
    }
}

impl DriverChild for StdDriverChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<DriverExit>> {
        let status = self.child.try_wait().map_err(|e| Error::CommandExecution {
            command: format!("wait for driver pid {}", self.child.id()),
            source: e,
        })?;
        Ok(status.map(|s| DriverExit { code: s.code() }))
    }

    fn terminate(&mut self) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        if self.signal_escalated(Signal::SIGTERM)? {
            return Ok(());
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => Err(Error::PermissionDenied {
                operation: format!("signal driver pid {pid}"),
                message: Errno::EPERM.desc().to_string(),
            }),
            Err(e) => Err(Error::CommandExecution {
                command: format!("kill -TERM {pid}"),
                source: e.into(),
            }),
        }
    }

    fn kill(&mut self) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = self.child.id();
        let delivered = match self.signal_escalated(Signal::SIGKILL) {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(pid, error = %e, "escalated kill failed, killing wrapper");
                false
            }
        };
        if !delivered {
            self.child.kill().map_err(|e| Error::CommandExecution {
                command: format!("kill -KILL {pid}"),
                source: e,
            })?;
        }
        self.child.wait().map_err(|e| Error::CommandExecution {
            command: format!("wait for driver pid {pid}"),
            source: e,
        })?;
        Ok(())
    }

    fn stderr(&self) -> String {
        let buf = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}

/// Driver backed by the littlefs-fuse `lfs` binary, `fusermount` and `umount`.
#[derive(Debug, Clone)]
pub struct LfsDriver {
    program: String,
    read_only: bool,
    ctx: ExecutionContext,
    command_timeout: Duration,
}

impl LfsDriver {
    pub fn new(config: &BrowserConfig, ctx: ExecutionContext) -> Self {
        Self {
            program: config.driver_program.clone(),
            read_only: config.read_only,
            ctx,
            command_timeout: config.timeouts.command(),
        }
    }

    /// Arguments for a foreground mount of `device` at `mount_point`.
    fn mount_args(&self, device: &Path, geometry: Geometry, mount_point: &Path) -> Vec<String> {
        let mut args: Vec<String> = geometry.driver_args().into();
        // Stay in the foreground so the process lives exactly as long as the mount.
        args.push("-f".to_string());
        let mut options = Vec::new();
        if self.read_only {
            options.push("ro");
        }
        // A root-run driver must let the unprivileged caller read the mount.
        if self.ctx.escalation() != PrivilegeEscalation::None {
            options.push("allow_other");
        }
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.join(","));
        }
        args.push(device.display().to_string());
        args.push(mount_point.display().to_string());
        args
    }
}

impl MountDriver for LfsDriver {
    fn spawn(
        &self,
        device: &Path,
        geometry: Geometry,
        mount_point: &Path,
    ) -> Result<Box<dyn DriverChild>> {
        let args = self.mount_args(device, geometry, mount_point);
        debug!(program = %self.program, ?args, "spawning mount driver");

        let child = self
            .ctx
            .command(&self.program, &args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    Error::PermissionDenied {
                        operation: format!("spawn {}", self.program),
                        message: e.to_string(),
                    }
                } else {
                    Error::DriverSpawnFailed {
                        program: self.program.clone(),
                        source: e,
                    }
                }
            })?;

        Ok(Box::new(StdDriverChild::escalated(
            child,
            self.ctx.clone(),
            self.command_timeout,
        )))
    }

    fn stat(&self, device: &Path, geometry: Geometry) -> Result<Option<String>> {
        let device = device.display().to_string();
        let geometry_args = geometry.driver_args();
        let mut args: Vec<&str> = vec!["--stat"];
        args.extend(geometry_args.iter().map(String::as_str));
        args.push(&device);

        let output = self
            .ctx
            .run_with_timeout(&self.program, &args, self.command_timeout)
            .map_err(|e| match e {
                Error::CommandExecution { source, .. }
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    Error::DriverSpawnFailed {
                        program: self.program.clone(),
                        source,
                    }
                }
                other => other,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if STAT_MARKERS.iter().any(|marker| stdout.contains(marker)) {
            return Ok(Some(stdout));
        }

        // A refused open surfaces the same way for every candidate, so report it.
        let command = self.ctx.display_command(&self.program, &args);
        match check_output(&command, output) {
            Err(e @ (Error::PermissionDenied { .. } | Error::AuthenticationCancelled)) => Err(e),
            _ => Ok(None),
        }
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let target = mount_point.display().to_string();
        self.ctx
            .run_checked("fusermount", &["-u", &target], self.command_timeout)?;
        Ok(())
    }

    fn force_unmount(&self, mount_point: &Path) -> Result<()> {
        let target = mount_point.display().to_string();
        match self
            .ctx
            .run_checked("umount", &["-l", &target], self.command_timeout)
        {
            Ok(_) => Ok(()),
            Err(umount_err) => {
                debug!(error = %umount_err, mount_point = %target, "umount -l failed, trying fusermount -uz");
                self.ctx
                    .run_checked("fusermount", &["-uz", &target], self.command_timeout)
                    .map(|_| ())
            }
        }
    }
}
