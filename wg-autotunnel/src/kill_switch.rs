// Kill switch controller

//! Kill switch
//!
//! Holds the backend state of the active adapter. Besides plain toggling it
//! handles one transient exception: a peer endpoint given as a hostname
//! cannot be resolved while everything outside the tunnel is blocked, so the
//! kill switch is lowered to `ServiceActive` while such a tunnel starts and
//! raised again once it stops. When an auto-tunnel session is running the
//! restoration is left to the orchestrator's own policy evaluation.

use crate::backend::BackendSlot;
use crate::error::BackendError;
use crate::types::{BackendState, TunnelConfig};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::watch;

/// Private and link-local ranges reachable when LAN bypass is enabled
const LAN_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "fc00::/7",
    "fe80::/10",
];

/// Networks exempted from the kill switch when LAN bypass is on: the private
/// ranges plus every subnet attached to a local interface.
pub fn lan_bypass_networks() -> Vec<String> {
    let mut networks: Vec<String> = LAN_RANGES.iter().map(|r| r.to_string()).collect();

    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                if iface.is_loopback() {
                    continue;
                }
                if let if_addrs::IfAddr::V4(v4) = &iface.addr {
                    let Some(net) = local_subnet(v4.ip, v4.netmask) else {
                        continue;
                    };
                    let cidr = net.to_string();
                    if !networks.contains(&cidr) {
                        networks.push(cidr);
                    }
                }
            }
        }
        Err(e) => log::warn!("Failed to list local interfaces for LAN bypass: {}", e),
    }

    networks
}

/// Subnet an interface address sits in. Point-to-point addresses (tunnels)
/// and default-route masks are not a LAN.
fn local_subnet(ip: Ipv4Addr, netmask: Ipv4Addr) -> Option<Ipv4Net> {
    let net = Ipv4Net::with_netmask(ip, netmask).ok()?.trunc();
    match net.prefix_len() {
        0 | 32 => None,
        _ => Some(net),
    }
}

/// Kill-switch state waiting to be restored after a hostname exception
#[derive(Debug, Clone)]
struct PendingRestore {
    allowed_ips: Vec<String>,
}

/// Owner of the backend (kill-switch) state
pub struct KillSwitchController {
    backend: Arc<BackendSlot>,
    auto_tunnel_active: watch::Receiver<bool>,
    allowed_ips: Mutex<Vec<String>>,
    pending: Mutex<Option<PendingRestore>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl KillSwitchController {
    pub fn new(backend: Arc<BackendSlot>, auto_tunnel_active: watch::Receiver<bool>) -> Self {
        Self {
            backend,
            auto_tunnel_active,
            allowed_ips: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend_state(&self) -> BackendState {
        self.backend.current().backend_state()
    }

    /// Allowed-IP list of the last applied state
    pub fn allowed_ips(&self) -> Vec<String> {
        self.allowed_ips.lock().clone()
    }

    /// Explicitly set the backend state
    pub async fn set_backend_state(
        &self,
        state: BackendState,
        allowed_ips: Vec<String>,
    ) -> Result<(), BackendError> {
        let _guard = self.op_lock.lock().await;
        self.apply(state, allowed_ips).await
    }

    async fn apply(&self, state: BackendState, allowed_ips: Vec<String>) -> Result<(), BackendError> {
        self.backend
            .current()
            .set_backend_state(state, &allowed_ips)
            .await?;
        *self.allowed_ips.lock() = allowed_ips;
        Ok(())
    }

    /// Turn the kill switch on or off, honoring LAN bypass
    pub async fn toggle(&self, enabled: bool, lan_bypass: bool) -> Result<(), BackendError> {
        if enabled {
            let allowed = if lan_bypass {
                lan_bypass_networks()
            } else {
                Vec::new()
            };
            self.set_backend_state(BackendState::KillSwitchActive, allowed)
                .await
        } else {
            self.set_backend_state(BackendState::Inactive, Vec::new())
                .await
        }
    }

    /// Follow the kill-switch setting outside an auto-tunnel session.
    ///
    /// Enabling raises `KillSwitchActive` (or refreshes its LAN list) unless a
    /// hostname exception is in flight. Disabling lowers an active kill switch
    /// and forgets any pending restore.
    pub async fn follow_setting(&self, enabled: bool, lan_bypass: bool) -> Result<(), BackendError> {
        let _guard = self.op_lock.lock().await;
        let state = self.backend_state();

        if !enabled {
            let had_pending = self.pending.lock().take().is_some();
            if state != BackendState::KillSwitchActive && !had_pending {
                return Ok(());
            }
            log::info!("Kill switch disabled in settings");
            return self.apply(BackendState::Inactive, Vec::new()).await;
        }

        let allowed = if lan_bypass {
            lan_bypass_networks()
        } else {
            Vec::new()
        };
        {
            let mut pending = self.pending.lock();
            if let Some(pending) = pending.as_mut() {
                // Raised with the new list once the tunnel stops
                pending.allowed_ips = allowed;
                return Ok(());
            }
        }
        let unchanged = state == BackendState::KillSwitchActive && *self.allowed_ips.lock() == allowed;
        if unchanged {
            return Ok(());
        }
        log::info!("Kill switch enabled in settings");
        self.apply(BackendState::KillSwitchActive, allowed).await
    }

    /// Bring the backend to the state the orchestrator's policy wants.
    /// Any pending hostname-exception restore is dropped: the policy wins.
    pub async fn apply_policy(&self, target: BackendState, lan_bypass: bool) -> Result<(), BackendError> {
        let _guard = self.op_lock.lock().await;
        let handed_over = self.pending.lock().take().is_some();
        if handed_over {
            log::debug!("Kill switch restore handed over to auto-tunnel policy");
        }

        let allowed = if target == BackendState::KillSwitchActive && lan_bypass {
            lan_bypass_networks()
        } else {
            Vec::new()
        };
        let unchanged = self.backend_state() == target && *self.allowed_ips.lock() == allowed;
        if unchanged {
            return Ok(());
        }
        log::info!("Applying kill switch policy: {}", target);
        self.apply(target, allowed).await
    }

    /// Lower an active kill switch if the tunnel needs DNS to reach its peers
    pub async fn prepare_for_start(&self, tunnel: &TunnelConfig) {
        let _guard = self.op_lock.lock().await;
        if self.backend_state() != BackendState::KillSwitchActive || !tunnel.has_hostname_endpoint() {
            return;
        }

        let previous = PendingRestore {
            allowed_ips: self.allowed_ips.lock().clone(),
        };
        log::info!(
            "Tunnel '{}' has a hostname endpoint, lowering kill switch while it resolves",
            tunnel.name
        );
        match self.apply(BackendState::ServiceActive, Vec::new()).await {
            Ok(()) => {
                let mut pending = self.pending.lock();
                if pending.is_none() {
                    *pending = Some(previous);
                }
            }
            Err(e) => log::error!("Failed to lower kill switch for '{}': {}", tunnel.name, e),
        }
    }

    /// Restore the kill switch lowered by [`prepare_for_start`](Self::prepare_for_start)
    pub async fn on_tunnel_stopped(&self) {
        let _guard = self.op_lock.lock().await;
        let pending = self.pending.lock().take();
        let Some(previous) = pending else {
            return;
        };

        let auto_tunnel_active = *self.auto_tunnel_active.borrow();
        if auto_tunnel_active {
            log::info!("Auto-tunnel is active, leaving kill switch restore to its policy");
            return;
        }

        log::info!("Restoring kill switch");
        if let Err(e) = self
            .apply(BackendState::KillSwitchActive, previous.allowed_ips)
            .await
        {
            log::error!("Failed to restore kill switch, leaving service mode: {}", e);
            if let Err(e) = self.apply(BackendState::ServiceActive, Vec::new()).await {
                log::error!("Failed to fall back to service mode: {}", e);
            }
        }
    }

    /// True while a hostname exception is waiting to be restored
    pub fn has_pending_restore(&self) -> bool {
        self.pending.lock().is_some()
    }
}
