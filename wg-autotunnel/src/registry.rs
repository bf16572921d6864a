// Registry of tunnel controllers

//! Tunnel registry
//!
//! Entry point for every start, stop and bounce. Operations go through one
//! async lock, so two requests for the same tunnel never interleave. Unless
//! multi-tunnel mode is enabled, starting a tunnel first stops whichever
//! tunnel is running.

use crate::backend::BackendAdapter;
use crate::error::TunnelError;
use crate::store::SettingsStore;
use crate::tunnel::{ActiveTunnels, TunnelContext, TunnelController, TunnelFailure};
use crate::types::{StopReason, TunnelConfig, TunnelId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub struct TunnelRegistry {
    ctx: Arc<TunnelContext>,
    settings: Arc<dyn SettingsStore>,
    controllers: Mutex<HashMap<TunnelId, Arc<TunnelController>>>,
    ops: tokio::sync::Mutex<()>,
}

impl TunnelRegistry {
    pub fn new(ctx: Arc<TunnelContext>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            ctx,
            settings,
            controllers: Mutex::new(HashMap::new()),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    /// Runtime state of every started tunnel
    pub fn active_tunnels(&self) -> watch::Receiver<ActiveTunnels> {
        self.ctx.active_tunnels()
    }

    /// Backend failures of any tunnel
    pub fn errors(&self) -> broadcast::Receiver<TunnelFailure> {
        self.ctx.errors()
    }

    fn controller(&self, id: TunnelId) -> Option<Arc<TunnelController>> {
        self.controllers.lock().get(&id).cloned()
    }

    fn running_controllers(&self) -> Vec<Arc<TunnelController>> {
        self.controllers
            .lock()
            .values()
            .filter(|c| c.is_running())
            .cloned()
            .collect()
    }

    /// Configurations of the running tunnels, by id
    pub fn running(&self) -> Vec<TunnelConfig> {
        let mut running: Vec<TunnelConfig> = self
            .running_controllers()
            .iter()
            .map(|c| c.config())
            .collect();
        running.sort_by_key(|t| t.id);
        running
    }

    pub fn running_count(&self) -> usize {
        self.running_controllers().len()
    }

    pub fn is_running(&self, id: TunnelId) -> bool {
        self.controller(id).is_some_and(|c| c.is_running())
    }

    /// Start a tunnel. A tunnel that is already running is left alone.
    pub async fn start(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let _ops = self.ops.lock().await;
        if self.is_running(config.id) {
            log::debug!("Tunnel '{}' already running", config.name);
            return Ok(());
        }

        if !self.settings.get().multi_tunnel_enabled {
            for other in self.running_controllers() {
                log::info!(
                    "Stopping '{}' before starting '{}'",
                    other.config().name,
                    config.name
                );
                if let Err(e) = other.stop(StopReason::User).await {
                    log::warn!("Failed to stop tunnel {}: {}", other.id(), e);
                }
                self.controllers.lock().remove(&other.id());
            }
        }

        let id = config.id;
        let controller = TunnelController::new(Arc::clone(&self.ctx), config);
        self.controllers.lock().insert(id, Arc::clone(&controller));
        let result = controller.start().await;
        if !controller.is_running() {
            self.controllers.lock().remove(&id);
        }
        result
    }

    /// Stop a tunnel. Stopping a tunnel that is not running is a no-op.
    pub async fn stop(&self, id: TunnelId, reason: StopReason) -> Result<(), TunnelError> {
        let _ops = self.ops.lock().await;
        let controller = self.controllers.lock().remove(&id);
        match controller {
            Some(controller) => controller.stop(reason).await,
            None => Ok(()),
        }
    }

    /// Restart a running tunnel in place
    pub async fn bounce(&self, id: TunnelId, reason: StopReason) -> Result<(), TunnelError> {
        match self.controller(id) {
            Some(controller) => controller.bounce(reason).await,
            None => {
                log::debug!("Tunnel {} not running, nothing to restart", id);
                Ok(())
            }
        }
    }

    /// Stop `from`, then start `to`
    pub async fn switch(
        &self,
        from: TunnelId,
        to: TunnelConfig,
        reason: StopReason,
    ) -> Result<(), TunnelError> {
        if let Err(e) = self.stop(from, reason).await {
            log::warn!("Failed to stop tunnel {} while switching: {}", from, e);
        }
        self.start(to).await
    }

    pub async fn stop_all(&self, reason: StopReason) {
        let _ops = self.ops.lock().await;
        let controllers: Vec<_> = self.controllers.lock().drain().map(|(_, c)| c).collect();
        for controller in controllers {
            if let Err(e) = controller.stop(reason).await {
                log::warn!("Failed to stop tunnel {}: {}", controller.id(), e);
            }
        }
    }

    /// Put another adapter in the backend slot. Refused while tunnels run.
    pub async fn replace_backend(&self, adapter: Arc<dyn BackendAdapter>) -> Result<(), TunnelError> {
        let _ops = self.ops.lock().await;
        let running = self.running_count();
        if running > 0 {
            return Err(TunnelError::BackendBusy(running));
        }
        log::info!(
            "Switching backend from {} to {}",
            self.ctx.backend.mode(),
            adapter.mode()
        );
        self.ctx.backend.replace(adapter);
        Ok(())
    }
}
