//! Command execution abstraction with privilege escalation support.
//!
//! Mounting a raw block device through FUSE usually needs root, so every
//! driver and unmount command is built through an [`ExecutionContext`] that
//! can wrap it in `pkexec` (GUI) or `sudo` (TTY). All one-shot commands run
//! with a deadline so a wedged device cannot hang the caller.

use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result, is_permission_error};

/// Exit code pkexec uses when the authentication dialog is dismissed.
const PKEXEC_CANCELLED: i32 = 126;

/// Poll interval while waiting for a one-shot command.
const COMMAND_POLL: Duration = Duration::from_millis(10);

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    fn wrapper(&self) -> Option<&'static str> {
        match self {
            PrivilegeEscalation::None => None,
            PrivilegeEscalation::Pkexec => Some("pkexec"),
            PrivilegeEscalation::Sudo => Some("sudo"),
        }
    }
}

/// Execution context for running system commands.
///
/// # Example
///
/// ```
/// use littlefs_browser_core::executor::{ExecutionContext, PrivilegeEscalation};
///
/// // Default: no privilege escalation
/// let ctx = ExecutionContext::default();
/// assert_eq!(ctx.escalation(), PrivilegeEscalation::None);
///
/// // For terminal applications
/// let tty_ctx = ExecutionContext::with_sudo();
/// assert_eq!(tty_ctx.display_command("fusermount", &["-u", "/tmp/m"]), "sudo fusermount -u /tmp/m");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    escalation: PrivilegeEscalation,
}

impl ExecutionContext {
    /// Creates a new execution context with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an execution context that uses `pkexec` for privileged commands.
    pub fn with_pkexec() -> Self {
        Self {
            escalation: PrivilegeEscalation::Pkexec,
        }
    }

    /// Creates an execution context that uses `sudo` for privileged commands.
    pub fn with_sudo() -> Self {
        Self {
            escalation: PrivilegeEscalation::Sudo,
        }
    }

    /// Creates an execution context with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self { escalation }
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Builds a command, wrapped with the escalation tool if configured.
    pub fn command<S: AsRef<std::ffi::OsStr>>(&self, program: &str, args: &[S]) -> Command {
        match self.escalation.wrapper() {
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(program).args(args);
                cmd
            }
        }
    }

    /// Renders a command line for logs and error messages.
    pub fn display_command(&self, program: &str, args: &[&str]) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(wrapper) = self.escalation.wrapper() {
            parts.push(wrapper);
        }
        parts.push(program);
        parts.extend(args);
        parts.join(" ")
    }

    /// Runs a command to completion, killing it once `timeout` elapses.
    pub fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        let display = self.display_command(program, args);
        let child = self
            .command(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::CommandExecution {
                command: display.clone(),
                source: e,
            })?;

        wait_with_deadline(child, timeout, &display)
    }

    /// Runs a command that must succeed, mapping failures onto the error taxonomy.
    pub fn run_checked(&self, program: &str, args: &[&str], timeout: Duration) -> Result<Output> {
        let output = self.run_with_timeout(program, args, timeout)?;
        check_output(&self.display_command(program, args), output)
    }
}

/// Turns a failed exit status into a typed error.
///
/// pkexec's 126 becomes [`Error::AuthenticationCancelled`] and permission
/// diagnostics on stderr become [`Error::PermissionDenied`].
pub fn check_output(command: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let code = output.status.code().unwrap_or(-1);

    if code == PKEXEC_CANCELLED && command.starts_with("pkexec ") {
        return Err(Error::AuthenticationCancelled);
    }
    if is_permission_error(&stderr) {
        return Err(Error::PermissionDenied {
            operation: command.to_string(),
            message: stderr,
        });
    }

    Err(Error::CommandExit {
        command: command.to_string(),
        code,
        stderr,
    })
}

/// Waits for a spawned child with piped output, enforcing a deadline.
fn wait_with_deadline(mut child: Child, timeout: Duration, display: &str) -> Result<Output> {
    // Drain both pipes on helper threads so a chatty command cannot block
    // on a full pipe while we poll.
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::DriverTimeout {
                    operation: display.to_string(),
                    timeout,
                });
            }
            Ok(None) => thread::sleep(COMMAND_POLL),
            Err(e) => {
                return Err(Error::CommandExecution {
                    command: display.to_string(),
                    source: e,
                });
            }
        }
    };

    Ok(Output {
        status,
        stdout: stdout.map(join_reader).unwrap_or_default(),
        stderr: stderr.map(join_reader).unwrap_or_default(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}
