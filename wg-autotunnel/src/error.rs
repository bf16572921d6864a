// Error taxonomy

//! Error types
//!
//! Backend failures are surfaced to callers on the error channel; probe and
//! reconciliation failures are only ever logged.

use crate::types::TunnelId;
use thiserror::Error;

/// The backend rejected an operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The tunnel configuration was rejected
    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    /// The operating system refused the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The kernel backend needs root and did not get it
    #[error("kernel backend requires root privileges")]
    RootDenied,

    /// The interface is already held by something else
    #[error("tunnel slot already taken: {0}")]
    SlotTaken(String),

    /// A backend command failed for another reason
    #[error("backend command failed: {0}")]
    Command(String),

    /// No runtime handle for the tunnel
    #[error("tunnel '{0}' is not running")]
    NotRunning(String),

    /// Applying the kill-switch ruleset failed
    #[error("firewall update failed: {0}")]
    Firewall(String),
}

impl BackendError {
    /// Classify a failed wg-quick/awg-quick invocation from its stderr
    pub fn from_quick_stderr(stderr: &str) -> Self {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("must be run as root") || lower.contains("operation not permitted") {
            BackendError::RootDenied
        } else if lower.contains("already exists") {
            BackendError::SlotTaken(stderr.trim().to_string())
        } else if lower.contains("permission denied") {
            BackendError::PermissionDenied(stderr.trim().to_string())
        } else if lower.contains("line unrecognized") || lower.contains("invalid") {
            BackendError::InvalidConfig(stderr.trim().to_string())
        } else {
            BackendError::Command(stderr.trim().to_string())
        }
    }
}

/// Failure of a registry or controller operation
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The backend cannot be switched while tunnels are running
    #[error("cannot switch backend while {0} tunnel(s) are running")]
    BackendBusy(usize),

    #[error("unknown tunnel {0}")]
    UnknownTunnel(TunnelId),

    /// The tunnel vanished from the store while running
    #[error("tunnel {0} was removed from the store while active")]
    ConfigReconciliationSkipped(TunnelId),
}

/// A single reachability check failed
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no reply from {target}")]
    PingProbeFailure { target: String },

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
}
