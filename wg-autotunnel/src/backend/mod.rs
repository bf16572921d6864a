// Backend adapters for WireGuard implementations

//! WireGuard backends
//!
//! The tunnel controllers drive a [`BackendAdapter`] without knowing which
//! WireGuard implementation sits behind it. Two adapters exist: the kernel
//! module driven through `wg-quick` and the AmneziaWG userspace
//! implementation driven through `awg-quick`. The adapter in use is held in
//! a process-wide [`BackendSlot`].

pub mod firewall;
pub mod kernel;
mod quick;
pub mod userspace;

use crate::error::BackendError;
use crate::types::{BackendMode, BackendState, TunnelConfig, TunnelId, TunnelStatistics};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

pub use kernel::KernelBackend;
pub use userspace::UserspaceBackend;

/// Maximum Linux interface name length
const IFNAMSIZ: usize = 15;

/// Handle to a tunnel brought up by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub tunnel_id: TunnelId,
    pub tunnel_name: String,
    pub interface: String,
}

/// Capability interface implemented by every WireGuard backend
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which implementation this is
    fn mode(&self) -> BackendMode;

    /// Bring the tunnel up
    async fn up(&self, config: &TunnelConfig) -> Result<RuntimeHandle, BackendError>;

    /// Bring the tunnel down
    async fn down(&self, handle: &RuntimeHandle) -> Result<(), BackendError>;

    /// Read per-peer statistics
    async fn statistics(&self, handle: &RuntimeHandle) -> Result<TunnelStatistics, BackendError>;

    /// Current kill-switch state
    fn backend_state(&self) -> BackendState;

    /// Change the kill-switch state; `allowed_ips` are CIDRs reachable outside the tunnel
    async fn set_backend_state(
        &self,
        state: BackendState,
        allowed_ips: &[String],
    ) -> Result<(), BackendError>;

    /// Interface names of the tunnels this backend currently runs
    async fn running_tunnel_names(&self) -> Result<Vec<String>, BackendError>;
}

/// Process-wide holder of the selected backend
pub struct BackendSlot {
    current: RwLock<Arc<dyn BackendAdapter>>,
}

impl BackendSlot {
    pub fn new(adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            current: RwLock::new(adapter),
        }
    }

    /// Adapter in use
    pub fn current(&self) -> Arc<dyn BackendAdapter> {
        self.current.read().clone()
    }

    pub fn mode(&self) -> BackendMode {
        self.current.read().mode()
    }

    /// Swap the adapter. Callers must make sure no tunnel is running.
    pub(crate) fn replace(&self, adapter: Arc<dyn BackendAdapter>) {
        *self.current.write() = adapter;
    }
}

/// Build the adapter for a backend mode
pub fn create_backend(mode: BackendMode, run_dir: &Path) -> Arc<dyn BackendAdapter> {
    match mode {
        BackendMode::Kernel => Arc::new(KernelBackend::new(run_dir.to_path_buf())),
        BackendMode::Userspace => Arc::new(UserspaceBackend::new(run_dir.to_path_buf())),
    }
}

/// Validates that a name is safe to use in shell commands and system calls.
/// Only allows alphanumeric characters, hyphens, and underscores.
pub fn validate_interface_name(name: &str) -> Result<(), BackendError> {
    if name.is_empty() {
        return Err(BackendError::InvalidConfig(
            "Interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > IFNAMSIZ {
        return Err(BackendError::InvalidConfig(format!(
            "Interface name '{}' is longer than {} characters",
            name, IFNAMSIZ
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BackendError::InvalidConfig(format!(
            "Interface name contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            name
        )));
    }

    Ok(())
}

/// Interface name a tunnel runs under: the sanitized name, cut to fit, with
/// `-<id>` appended. Ids contain no `-`, so two tunnels never share a name.
pub fn interface_name(tunnel: &TunnelConfig) -> String {
    let suffix = format!("-{}", tunnel.id);
    let sanitized: String = tunnel
        .name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(IFNAMSIZ - suffix.len())
        .collect();

    if sanitized.is_empty() {
        format!("wgat{}", tunnel.id)
    } else {
        sanitized + &suffix
    }
}
