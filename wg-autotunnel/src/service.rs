// Engine assembly

//! Tunnel service
//!
//! Wires the stores, the backend slot, the kill switch, the registry and the
//! orchestrator together, and owns the operations that span several of them:
//! restoring tunnels at startup, switching backends, and shutdown.

use crate::backend::{BackendAdapter, BackendSlot};
use crate::error::{BackendError, TunnelError};
use crate::kill_switch::KillSwitchController;
use crate::orchestrator::AutoTunnelOrchestrator;
use crate::ping::ReachabilityProbe;
use crate::process_host::ProcessHost;
use crate::registry::TunnelRegistry;
use crate::store::{SettingsStore, TunnelStore};
use crate::tunnel::{Timing, TunnelContext};
use crate::types::{BackendMode, BackendState, NetworkSnapshot, StopReason, TunnelId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Builds the adapter for a backend mode
pub type BackendFactory = Box<dyn Fn(BackendMode) -> Arc<dyn BackendAdapter> + Send + Sync>;

/// Collaborators the service is built from
pub struct ServiceDeps {
    pub settings: Arc<dyn SettingsStore>,
    pub tunnels: Arc<dyn TunnelStore>,
    pub network: watch::Receiver<NetworkSnapshot>,
    pub host: Arc<dyn ProcessHost>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub backends: BackendFactory,
    pub timing: Timing,
}

pub struct TunnelService {
    settings: Arc<dyn SettingsStore>,
    tunnels: Arc<dyn TunnelStore>,
    backends: BackendFactory,
    slot: Arc<BackendSlot>,
    kill_switch: Arc<KillSwitchController>,
    registry: Arc<TunnelRegistry>,
    orchestrator: Arc<AutoTunnelOrchestrator>,
    shutdown: watch::Sender<bool>,
    orchestrator_task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelService {
    pub fn new(deps: ServiceDeps) -> Self {
        let ServiceDeps {
            settings,
            tunnels,
            network,
            host,
            probe,
            backends,
            timing,
        } = deps;

        let mode = settings.get().backend;
        log::info!("Using {} backend", mode);
        let slot = Arc::new(BackendSlot::new(backends(mode)));

        let (auto_tunnel_tx, auto_tunnel_rx) = watch::channel(false);
        let kill_switch = Arc::new(KillSwitchController::new(slot.clone(), auto_tunnel_rx));

        let ctx = Arc::new(TunnelContext::new(
            slot.clone(),
            kill_switch.clone(),
            host,
            tunnels.clone(),
            network.clone(),
            probe,
            timing,
        ));
        let registry = Arc::new(TunnelRegistry::new(ctx, settings.clone()));
        let orchestrator = Arc::new(AutoTunnelOrchestrator::new(
            settings.clone(),
            tunnels.clone(),
            registry.clone(),
            kill_switch.clone(),
            network,
            auto_tunnel_tx,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            settings,
            tunnels,
            backends,
            slot,
            kill_switch,
            registry,
            orchestrator,
            shutdown,
            orchestrator_task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn kill_switch(&self) -> &Arc<KillSwitchController> {
        &self.kill_switch
    }

    pub fn orchestrator(&self) -> &Arc<AutoTunnelOrchestrator> {
        &self.orchestrator
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.slot.mode()
    }

    /// Spawn the orchestrator loop (once)
    pub fn start_orchestrator(&self) {
        let mut task = self.orchestrator_task.lock();
        if task.is_none() {
            let orchestrator = self.orchestrator.clone();
            *task = Some(tokio::spawn(orchestrator.run(self.shutdown.subscribe())));
        }
    }

    /// Start a stored tunnel by id
    pub async fn start_tunnel(&self, id: TunnelId) -> Result<(), TunnelError> {
        let tunnel = self
            .tunnels
            .get_all()
            .into_iter()
            .find(|t| t.id == id)
            .ok_or(TunnelError::UnknownTunnel(id))?;
        self.registry.start(tunnel).await
    }

    pub async fn stop_tunnel(&self, id: TunnelId) -> Result<(), TunnelError> {
        self.registry.stop(id, StopReason::User).await
    }

    pub fn backend_state(&self) -> BackendState {
        self.kill_switch.backend_state()
    }

    pub async fn set_backend_state(
        &self,
        state: BackendState,
        allowed_ips: Vec<String>,
    ) -> Result<(), BackendError> {
        self.kill_switch.set_backend_state(state, allowed_ips).await
    }

    /// Bring back what was running before the daemon went down.
    ///
    /// With auto-tunneling on, the orchestrator's first evaluation decides
    /// instead.
    pub async fn restore_previous_state(&self) {
        let settings = self.settings.get();

        if settings.kill_switch_enabled {
            self.follow_kill_switch_setting().await;
        }

        if !settings.restore_on_boot {
            return;
        }
        if settings.auto_tunnel_enabled {
            log::info!("Auto-tunnel enabled, leaving restore to the orchestrator");
            return;
        }

        let mut active = self.tunnels.get_active();
        // Primary first, so single-tunnel mode restores it
        active.sort_by_key(|t| (!t.is_primary, t.id));
        if !settings.multi_tunnel_enabled {
            active.truncate(1);
        }

        for tunnel in active {
            log::info!("Restoring tunnel '{}'", tunnel.name);
            if let Err(e) = self.registry.start(tunnel).await {
                log::error!("Failed to restore tunnel: {}", e);
            }
        }
    }

    /// Apply `settings.kill_switch_enabled` while no auto-tunnel session owns
    /// the kill switch
    pub async fn follow_kill_switch_setting(&self) {
        let settings = self.settings.get();
        if settings.auto_tunnel_enabled {
            return;
        }
        if let Err(e) = self
            .kill_switch
            .follow_setting(settings.kill_switch_enabled, settings.lan_bypass_enabled)
            .await
        {
            log::error!("Failed to apply kill switch setting: {}", e);
        }
    }

    /// Switch the WireGuard implementation. Refused while any tunnel runs.
    pub async fn switch_backend(&self, mode: BackendMode) -> Result<(), TunnelError> {
        if self.slot.mode() == mode {
            return Ok(());
        }

        let state = self.kill_switch.backend_state();
        let allowed_ips = self.kill_switch.allowed_ips();
        self.registry.replace_backend((self.backends)(mode)).await?;

        // Carry the kill switch over to the new adapter
        if state != BackendState::Inactive {
            self.kill_switch.set_backend_state(state, allowed_ips).await?;
        }
        Ok(())
    }

    /// Apply `settings.backend` if it differs from the adapter in use
    pub async fn follow_backend_setting(&self) {
        let wanted = self.settings.get().backend;
        if wanted == self.slot.mode() {
            return;
        }
        match self.switch_backend(wanted).await {
            Ok(()) => {}
            Err(TunnelError::BackendBusy(running)) => log::info!(
                "Backend change to {} deferred until {} tunnel(s) stop",
                wanted,
                running
            ),
            Err(e) => log::error!("Failed to switch backend to {}: {}", wanted, e),
        }
    }

    /// Stop the orchestrator, then every tunnel. The persisted active flags
    /// are kept for the next [`restore_previous_state`](Self::restore_previous_state).
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.orchestrator_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Orchestrator task failed: {}", e);
            }
        }

        self.registry.stop_all(StopReason::Shutdown).await;
        log::info!("All tunnels stopped");
    }
}
