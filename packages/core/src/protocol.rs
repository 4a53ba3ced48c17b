//! Protocol types for the browser daemon.
//!
//! The daemon (`littlefs-browser-cli daemon`) owns the mount sessions and
//! is typically started through `pkexec` or `sudo`. Requests and responses
//! are newline-delimited JSON on its stdin/stdout.
//!
//! ## Security Model
//!
//! The protocol uses HMAC-SHA256 signing to prevent unauthorized command injection:
//! 1. Daemon generates a random 32-byte secret on startup and sends it to parent
//! 2. Each request includes an HMAC signature: `HMAC-SHA256(secret, id || cmd_json)`
//! 3. Daemon verifies signature and rejects requests with invalid signatures
//! 4. Request IDs must be monotonically increasing to prevent replay attacks

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, ErrorKind};

type HmacSha256 = Hmac<Sha256>;

/// Secret length in bytes.
pub const SECRET_LENGTH: usize = 32;

/// Generates a random secret for HMAC signing.
pub fn generate_secret() -> [u8; SECRET_LENGTH] {
    let mut rng = rand::rng();
    let mut secret = [0u8; SECRET_LENGTH];
    rng.fill(&mut secret);
    secret
}

/// Computes HMAC-SHA256 signature for a request.
pub fn compute_hmac(secret: &[u8], id: u64, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(&id.to_le_bytes());
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    hex::encode(result.into_bytes())
}

/// Verifies HMAC-SHA256 signature for a request.
pub fn verify_hmac(secret: &[u8], id: u64, payload: &str, signature: &str) -> bool {
    let expected = compute_hmac(secret, id, payload);
    // Constant-time comparison to prevent timing attacks
    constant_time_eq(&expected, signature)
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Initial handshake message sent by daemon to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonHandshake {
    /// Hex-encoded secret for HMAC signing.
    pub secret: String,
}

/// Request sent to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    /// Request ID (must be monotonically increasing).
    pub id: u64,
    /// HMAC-SHA256 signature of (id || cmd_json).
    pub hmac: String,
    /// The actual command.
    #[serde(flatten)]
    pub cmd: DaemonCommand,
}

impl DaemonRequest {
    /// Builds a signed request.
    pub fn signed(secret: &[u8], id: u64, cmd: DaemonCommand) -> serde_json::Result<Self> {
        let payload = serde_json::to_string(&cmd)?;
        Ok(Self {
            id,
            hmac: compute_hmac(secret, id, &payload),
            cmd,
        })
    }
}

/// Command types for the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonCommand {
    /// Enumerate candidate block devices.
    Devices,
    /// Detect the geometry of an unmounted device without mounting it.
    Detect { device: String },
    /// Mount a device (idempotent).
    Mount { device: String },
    /// Unmount a device.
    Unmount { device: String },
    /// List active sessions.
    Sessions,
    /// List a directory on a mounted device.
    List {
        device: String,
        /// Path relative to the mount root; defaults to the root.
        #[serde(default)]
        path: String,
    },
    /// Copy the whole tree of a mounted device to the export directory.
    Extract { device: String },
    /// Reclaim stale mount points.
    Sweep,
    /// Unmount everything and shut the daemon down.
    Shutdown,
}

/// Machine-readable failure carried by a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// Request ID this response corresponds to.
    pub id: u64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Command result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error if success is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl DaemonResponse {
    pub fn ok(id: u64, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    pub fn err(id: u64, error: ErrorBody) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }
}
