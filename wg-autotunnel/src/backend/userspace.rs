// Userspace AmneziaWG backend

//! AmneziaWG userspace implementation driven through `awg-quick`
//!
//! Uses the AmneziaWG text of a tunnel when it has one and falls back to the
//! plain WireGuard text otherwise.

use super::firewall::Firewall;
use super::quick::QuickDriver;
use super::{interface_name, BackendAdapter, RuntimeHandle};
use crate::error::BackendError;
use crate::types::{BackendMode, BackendState, TunnelConfig, TunnelStatistics};
use async_trait::async_trait;
use std::path::PathBuf;
use wireguard_control::Backend;

/// Userspace implementation spawned by awg-quick
const USERSPACE_IMPLEMENTATION: &str = "amneziawg-go";

/// Userspace-mode adapter
pub struct UserspaceBackend {
    driver: QuickDriver,
    firewall: Firewall,
}

impl UserspaceBackend {
    pub fn new(run_dir: PathBuf) -> Self {
        Self {
            driver: QuickDriver::new(
                "awg-quick",
                vec![("WG_QUICK_USERSPACE_IMPLEMENTATION", USERSPACE_IMPLEMENTATION)],
                run_dir,
                Backend::Userspace,
            ),
            firewall: Firewall::new(),
        }
    }
}

/// Config text handed to awg-quick
fn config_text(config: &TunnelConfig) -> &str {
    if config.am_quick.trim().is_empty() {
        &config.wg_quick
    } else {
        &config.am_quick
    }
}

#[async_trait]
impl BackendAdapter for UserspaceBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Userspace
    }

    async fn up(&self, config: &TunnelConfig) -> Result<RuntimeHandle, BackendError> {
        let interface = interface_name(config);
        self.firewall.set_interface(&interface, true).await?;
        if let Err(e) = self.driver.bring_up(&interface, config_text(config)).await {
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
