//! Daemon mode: owns the mount sessions and serves signed requests.
//!
//! The daemon is launched (often via pkexec or sudo) by whatever front end
//! browses the images. It accepts signed commands via stdin and writes one
//! JSON response per request to stdout.
//!
//! ## Security Model
//!
//! 1. On startup, generates a random secret and sends it to parent via handshake
//! 2. All requests must include a valid HMAC-SHA256 signature
//! 3. Request IDs must be monotonically increasing (anti-replay)
//! 4. Uses PR_SET_PDEATHSIG to terminate when parent dies

use std::io::{self, BufRead, Write};
use std::path::Path;

use littlefs_browser_core::protocol::{
    DaemonCommand, DaemonHandshake, DaemonRequest, DaemonResponse, ErrorBody, SECRET_LENGTH,
    generate_secret, verify_hmac,
};
use littlefs_browser_core::{Error, ErrorKind, Result, SessionManager};
use serde::Serialize;
use tracing::{info, warn};

/// Runs the daemon, reading requests from stdin and writing responses to stdout.
pub fn run_daemon(manager: SessionManager) -> io::Result<()> {
    // Set up parent death signal to prevent orphan processes.
    // When parent dies, this process receives SIGTERM.
    #[cfg(target_os = "linux")]
    {
        use nix::libc;
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        }
    }

    // Leftovers from a crashed run must go before new mounts are made.
    match manager.sweep() {
        Ok(report) => info!(
            reclaimed = report.reclaimed_count(),
            failed = report.failed.len(),
            "startup sweep finished"
        ),
        Err(e) => warn!(error = %e, "startup sweep failed"),
    }

    let mut daemon = Daemon::new(manager, generate_secret());

    let mut stdout = io::stdout();
    write_line(&mut stdout, &daemon.handshake())?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let Some(reply) = daemon.handle_line(&line) else {
            continue;
        };
        write_line(&mut stdout, &reply.response)?;
        if reply.stop {
            return Ok(());
        }
    }

    // Parent closed stdin without asking for a shutdown.
    daemon.shutdown();
    Ok(())
}

fn write_line<T: Serialize>(stdout: &mut io::Stdout, value: &T) -> io::Result<()> {
    let json = serde_json::to_string(value).map_err(io::Error::other)?;
    writeln!(stdout, "{}", json)?;
    stdout.flush()?;
    Ok(())
}

/// Response to one request, and whether the daemon should exit after it.
pub struct Reply {
    pub response: DaemonResponse,
    pub stop: bool,
}

/// Request verification and dispatch, independent of stdio.
pub struct Daemon {
    manager: SessionManager,
    secret: [u8; SECRET_LENGTH],
    last_id: u64,
}

impl Daemon {
    pub fn new(manager: SessionManager, secret: [u8; SECRET_LENGTH]) -> Self {
        Self {
            manager,
            secret,
            last_id: 0,
        }
    }

    pub fn handshake(&self) -> DaemonHandshake {
        DaemonHandshake {
            secret: hex::encode(self.secret),
        }
    }

    /// Verifies and executes one request line.
    ///
    /// Returns `None` for lines that cannot be parsed, since there is no
    /// ID to answer to.
    pub fn handle_line(&mut self, line: &str) -> Option<Reply> {
        let request: DaemonRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                return None;
            }
        };
        let id = request.id;

        // Verify request ID is monotonically increasing (anti-replay)
        if id <= self.last_id {
            return Some(Reply {
                response: protocol_error(
                    id,
                    format!("replayed request: ID {} <= last ID {}", id, self.last_id),
                ),
                stop: false,
            });
        }

        // Verify HMAC signature
        let authentic = serde_json::to_string(&request.cmd)
            .is_ok_and(|payload| verify_hmac(&self.secret, id, &payload, &request.hmac));
        if !authentic {
            return Some(Reply {
                response: protocol_error(id, "HMAC authentication failed"),
                stop: false,
            });
        }

        // Update last ID after successful verification
        self.last_id = id;

        let stop = request.cmd == DaemonCommand::Shutdown;
        let response = match self.dispatch(request.cmd) {
            Ok(data) => DaemonResponse::ok(id, data),
            Err(e) => {
                warn!(id, error = %e, "request failed");
                DaemonResponse::err(id, ErrorBody::from(&e))
            }
        };
        Some(Reply { response, stop })
    }

    fn dispatch(&mut self, cmd: DaemonCommand) -> Result<Option<serde_json::Value>> {
        match cmd {
            DaemonCommand::Devices => to_data(&self.manager.device_statuses()?),
            DaemonCommand::Detect { device } => to_data(&self.manager.detect(Path::new(&device))?),
            DaemonCommand::Mount { device } => to_data(&self.manager.mount(Path::new(&device))?),
            DaemonCommand::Unmount { device } => {
                self.manager.unmount(Path::new(&device))?;
                Ok(None)
            }
            DaemonCommand::Sessions => to_data(&self.manager.list_active()),
            DaemonCommand::List { device, path } => {
                to_data(&self.manager.list(Path::new(&device), &path)?)
            }
            DaemonCommand::Extract { device } => {
                to_data(&self.manager.extract_all(Path::new(&device))?)
            }
            DaemonCommand::Sweep => to_data(&self.manager.sweep()?),
            DaemonCommand::Shutdown => {
                let failed: Vec<String> = self
                    .shutdown()
                    .into_iter()
                    .map(|(device, e)| format!("{}: {}", device.display(), e))
                    .collect();
                to_data(&serde_json::json!({ "failed": failed }))
            }
        }
    }

    fn shutdown(&self) -> Vec<(std::path::PathBuf, Error)> {
        let failures = self.manager.shutdown();
        info!(failed = failures.len(), "daemon shutting down");
        failures
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Option<serde_json::Value>> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| Error::Generic {
            message: "failed to serialize response".to_string(),
            source: Some(Box::new(e)),
        })
}

fn protocol_error(id: u64, message: impl Into<String>) -> DaemonResponse {
    DaemonResponse::err(
        id,
        ErrorBody {
            kind: ErrorKind::Protocol,
            message: message.into(),
        },
    )
}
