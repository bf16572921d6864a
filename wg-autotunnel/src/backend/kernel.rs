// Kernel WireGuard backend

//! In-kernel WireGuard driven through `wg-quick`
//!
//! Requires root; a refusal from the kernel surfaces as
//! [`BackendError::RootDenied`].

use super::firewall::Firewall;
use super::quick::QuickDriver;
use super::{interface_name, BackendAdapter, RuntimeHandle};
use crate::error::BackendError;
use crate::types::{BackendMode, BackendState, TunnelConfig, TunnelStatistics};
use async_trait::async_trait;
use std::path::PathBuf;
use wireguard_control::Backend;

/// Kernel-mode adapter
pub struct KernelBackend {
    driver: QuickDriver,
    firewall: Firewall,
}

impl KernelBackend {
    pub fn new(run_dir: PathBuf) -> Self {
        Self {
            driver: QuickDriver::new("wg-quick", Vec::new(), run_dir, Backend::Kernel),
            firewall: Firewall::new(),
        }
    }
}

#[async_trait]
impl BackendAdapter for KernelBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Kernel
    }

    async fn up(&self, config: &TunnelConfig) -> Result<RuntimeHandle, BackendError> {
        let interface = interface_name(config);
        // Register the interface first so an active kill switch lets the handshake out
        self.firewall.set_interface(&interface, true).await?;
        if let Err(e) = self.driver.bring_up(&interface, &config.wg_quick).await {
            if let Err(fw) = self.firewall.set_interface(&interface, false).await {
                log::warn!("Failed to drop firewall exception for {}: {}", interface, fw);
            }
            return Err(e);
        }

        Ok(RuntimeHandle {
            tunnel_id: config.id,
            tunnel_name: config.name.clone(),
            interface,
        })
    }

    async fn down(&self, handle: &RuntimeHandle) -> Result<(), BackendError> {
        self.driver.bring_down(&handle.interface).await?;
        self.firewall.set_interface(&handle.interface, false).await
    }

    async fn statistics(&self, handle: &RuntimeHandle) -> Result<TunnelStatistics, BackendError> {
        self.driver.statistics(&handle.interface).await
    }

    fn backend_state(&self) -> BackendState {
        self.firewall.state()
    }

    async fn set_backend_state(
        &self,
        state: BackendState,
        allowed_ips: &[String],
    ) -> Result<(), BackendError> {
        self.firewall.set_state(state, allowed_ips).await
    }

    async fn running_tunnel_names(&self) -> Result<Vec<String>, BackendError> {
        self.driver.interfaces().await
    }
}
