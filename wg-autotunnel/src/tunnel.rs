// Per-tunnel lifecycle controller

//! Tunnel lifecycle
//!
//! A [`TunnelController`] owns one running tunnel: its configuration
//! snapshot, its backend handle and the group of background jobs supervising
//! it (statistics polling, configuration reconciliation, ping watchdog and
//! the network availability feed the watchdog reads). Cancelling the group
//! cancels every job; jobs never outlive the tunnel.

use crate::backend::{interface_name, BackendAdapter, BackendSlot, RuntimeHandle};
use crate::error::{BackendError, TunnelError};
use crate::kill_switch::KillSwitchController;
use crate::ping::{PingTarget, PingWatchdog, ReachabilityProbe, DEFAULT_PROBE_TIMEOUT};
use crate::process_host::ProcessHost;
use crate::store::TunnelStore;
use crate::types::{
    NetworkSnapshot, StopReason, TunnelConfig, TunnelId, TunnelStatistics, TunnelStatus,
    VpnRuntimeState,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

/// Runtime state of every started tunnel, keyed by id
pub type ActiveTunnels = BTreeMap<TunnelId, VpnRuntimeState>;

/// Capacity of the error fan-out channel
const ERROR_CHANNEL_CAPACITY: usize = 32;

/// A backend failure, as delivered to error subscribers
#[derive(Debug, Clone)]
pub struct TunnelFailure {
    pub tunnel: TunnelConfig,
    pub error: BackendError,
}

/// Job timings
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Delay before the first statistics read
    pub statistics_delay: Duration,
    pub statistics_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            statistics_delay: Duration::from_secs(1),
            statistics_interval: Duration::from_secs(1),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Everything a controller needs besides its own tunnel
pub struct TunnelContext {
    pub backend: Arc<BackendSlot>,
    pub kill_switch: Arc<KillSwitchController>,
    pub host: Arc<dyn ProcessHost>,
    pub tunnels: Arc<dyn TunnelStore>,
    pub network: watch::Receiver<NetworkSnapshot>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub timing: Timing,
    active: watch::Sender<ActiveTunnels>,
    errors: broadcast::Sender<TunnelFailure>,
}

impl TunnelContext {
    pub fn new(
        backend: Arc<BackendSlot>,
        kill_switch: Arc<KillSwitchController>,
        host: Arc<dyn ProcessHost>,
        tunnels: Arc<dyn TunnelStore>,
        network: watch::Receiver<NetworkSnapshot>,
        probe: Arc<dyn ReachabilityProbe>,
        timing: Timing,
    ) -> Self {
        let (active, _) = watch::channel(ActiveTunnels::new());
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            backend,
            kill_switch,
            host,
            tunnels,
            network,
            probe,
            timing,
            active,
            errors,
        }
    }

    pub fn active_tunnels(&self) -> watch::Receiver<ActiveTunnels> {
        self.active.subscribe()
    }

    pub fn errors(&self) -> broadcast::Receiver<TunnelFailure> {
        self.errors.subscribe()
    }

    pub(crate) fn report(&self, tunnel: TunnelConfig, error: BackendError) {
        // No subscriber is fine, the failure has been logged
        let _ = self.errors.send(TunnelFailure { tunnel, error });
    }
}

/// Background jobs of a running tunnel
struct JobGroup {
    core: JoinSet<()>,
    ping: Option<JoinSet<()>>,
}

impl JobGroup {
    async fn shutdown(mut self) {
        if let Some(mut ping) = self.ping.take() {
            ping.shutdown().await;
        }
        self.core.shutdown().await;
    }
}

/// Lifecycle controller for one tunnel
pub struct TunnelController {
    ctx: Arc<TunnelContext>,
    id: TunnelId,
    backend: Arc<dyn BackendAdapter>,
    /// Only written by reconciliation
    config: RwLock<TunnelConfig>,
    status: Mutex<TunnelStatus>,
    handle: Mutex<Option<RuntimeHandle>>,
    lifecycle: tokio::sync::Mutex<()>,
    jobs: Mutex<Option<JobGroup>>,
    ping_job_starts: AtomicUsize,
}

impl TunnelController {
    /// Controller bound to the backend currently in the slot
    pub fn new(ctx: Arc<TunnelContext>, config: TunnelConfig) -> Arc<Self> {
        let backend = ctx.backend.current();
        Arc::new(Self {
            id: config.id,
            backend,
            ctx,
            config: RwLock::new(config),
            status: Mutex::new(TunnelStatus::Down),
            handle: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            jobs: Mutex::new(None),
            ping_job_starts: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn config(&self) -> TunnelConfig {
        self.config.read().clone()
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() != TunnelStatus::Down
    }

    /// How many times the ping jobs were (re)started
    pub fn ping_job_starts(&self) -> usize {
        self.ping_job_starts.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: TunnelStatus) {
        *self.status.lock() = status;
        let config = self.config();
        let id = self.id;
        self.ctx.active.send_modify(|active| match status {
            TunnelStatus::Down => {
                active.remove(&id);
            }
            _ => {
                let entry = active
                    .entry(id)
                    .or_insert_with(|| VpnRuntimeState::starting(config.clone()));
                entry.status = status;
                entry.config = config;
            }
        });
    }

    fn publish_statistics(&self, statistics: TunnelStatistics) {
        let id = self.id;
        self.ctx.active.send_if_modified(|active| match active.get_mut(&id) {
            Some(entry) if entry.statistics.as_ref() != Some(&statistics) => {
                entry.statistics = Some(statistics);
                true
            }
            _ => false,
        });
    }

    fn publish_config(&self, config: &TunnelConfig) {
        let id = self.id;
        self.ctx.active.send_if_modified(|active| match active.get_mut(&id) {
            Some(entry) if entry.config != *config => {
                entry.config = config.clone();
                true
            }
            _ => false,
        });
    }

    /// Bring the tunnel up and start its jobs. No-op unless stopped.
    pub async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() != TunnelStatus::Down {
            log::debug!("Tunnel {} already running, ignoring start", self.id);
            return Ok(());
        }

        let config = self.config();
        let interface = interface_name(&config);
        let already_up = match self.backend.running_tunnel_names().await {
            Ok(names) => names.contains(&interface),
            Err(e) => {
                log::debug!("Could not list running tunnels: {}", e);
                false
            }
        };
        if already_up {
            // Left behind by a previous run: take it over instead of failing on it
            log::info!(
                "Interface '{}' is already up, adopting it for '{}'",
                interface,
                config.name
            );
            if let Err(e) = self.ctx.tunnels.set_active(self.id, true).await {
                log::warn!("Failed to persist active flag for '{}': {:#}", config.name, e);
            }
            self.ctx.host.start_foreground();
            *self.handle.lock() = Some(RuntimeHandle {
                tunnel_id: self.id,
                tunnel_name: config.name.clone(),
                interface,
            });
            self.set_status(TunnelStatus::Up);
            self.spawn_jobs();
            return Ok(());
        }

        log::info!("Starting tunnel '{}' on {} backend", config.name, self.backend.mode());
        self.set_status(TunnelStatus::Starting);
        if let Err(e) = self.ctx.tunnels.set_active(self.id, true).await {
            log::warn!("Failed to persist active flag for '{}': {:#}", config.name, e);
        }
        self.ctx.host.start_foreground();
        self.ctx.kill_switch.prepare_for_start(&config).await;

        match self.backend.up(&config).await {
            Ok(handle) => {
                log::info!("Tunnel '{}' is up on {}", config.name, handle.interface);
                *self.handle.lock() = Some(handle);
                self.set_status(TunnelStatus::Up);
                self.spawn_jobs();
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start tunnel '{}': {}", config.name, e);
                self.set_status(TunnelStatus::Down);
                if let Err(e) = self.ctx.tunnels.set_active(self.id, false).await {
                    log::warn!("Failed to persist active flag for '{}': {:#}", config.name, e);
                }
                self.ctx.host.stop_foreground();
                self.ctx.kill_switch.on_tunnel_stopped().await;
                self.ctx.report(config, e.clone());
                Err(e.into())
            }
        }
    }

    /// Cancel the jobs and bring the tunnel down. No-op when stopped.
    pub async fn stop(self: &Arc<Self>, reason: StopReason) -> Result<(), TunnelError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() == TunnelStatus::Down {
            return Ok(());
        }

        let config = self.config();
        log::info!("Stopping tunnel '{}' ({:?})", config.name, reason);

        let jobs = self.jobs.lock().take();
        if let Some(jobs) = jobs {
            jobs.shutdown().await;
        }

        let handle = self.handle.lock().take();
        let result = match handle {
            Some(handle) => self.backend.down(&handle).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            log::error!("Failed to bring down '{}': {}", config.name, e);
            self.ctx.report(config.clone(), e.clone());
        }

        if reason != StopReason::Shutdown {
            if let Err(e) = self.ctx.tunnels.set_active(self.id, false).await {
                log::warn!("Failed to persist active flag for '{}': {:#}", config.name, e);
            }
        }
        self.ctx.host.stop_foreground();
        self.set_status(TunnelStatus::Down);
        self.ctx.kill_switch.on_tunnel_stopped().await;

        result.map_err(Into::into)
    }

    /// Bring the tunnel down and up again with its current configuration.
    /// Jobs keep running. No-op unless the tunnel is up.
    pub async fn bounce(self: &Arc<Self>, reason: StopReason) -> Result<(), TunnelError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() != TunnelStatus::Up {
            log::debug!("Tunnel {} is not up, ignoring bounce", self.id);
            return Ok(());
        }

        let config = self.config();
        log::info!("Restarting tunnel '{}' ({:?})", config.name, reason);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = self.backend.down(&handle).await {
                log::warn!("Failed to bring down '{}' for restart: {}", config.name, e);
            }
        }

        self.ctx.kill_switch.prepare_for_start(&config).await;
        match self.backend.up(&config).await {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to restart tunnel '{}': {}", config.name, e);
                self.ctx.report(config, e.clone());
                // The caller may be one of our own jobs, so the full stop
                // (which cancels them) runs on its own task.
                let controller = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = controller.stop(reason).await;
                });
                Err(e.into())
            }
        }
    }

    fn spawn_jobs(self: &Arc<Self>) {
        let mut core = JoinSet::new();
        core.spawn(Arc::clone(self).statistics_job());
        core.spawn(Arc::clone(self).config_job());

        let ping = if self.config.read().is_ping_enabled {
            Some(self.spawn_ping_jobs())
        } else {
            None
        };

        *self.jobs.lock() = Some(JobGroup { core, ping });
    }

    fn spawn_ping_jobs(self: &Arc<Self>) -> JoinSet<()> {
        self.ping_job_starts.fetch_add(1, Ordering::SeqCst);

        let (available_tx, available_rx) = watch::channel(self.ctx.network.borrow().is_connected());
        let target: Arc<dyn PingTarget> = Arc::new(Watched(Arc::clone(self)));
        let watchdog = PingWatchdog::new(
            target,
            Arc::clone(&self.ctx.probe),
            available_rx,
            self.ctx.timing.probe_timeout,
        );

        let mut jobs = JoinSet::new();
        jobs.spawn(network_availability_job(self.ctx.network.clone(), available_tx));
        jobs.spawn(watchdog.run());
        jobs
    }

    /// Replace the ping jobs after a ping setting changed
    async fn restart_ping_jobs(self: &Arc<Self>) {
        let previous = match self.jobs.lock().as_mut() {
            Some(group) => group.ping.take(),
            None => return,
        };
        if let Some(mut previous) = previous {
            previous.shutdown().await;
        }

        if !self.config.read().is_ping_enabled {
            log::info!("Ping watchdog disabled for tunnel {}", self.id);
            return;
        }

        let replacement = self.spawn_ping_jobs();
        if let Some(group) = self.jobs.lock().as_mut() {
            group.ping = Some(replacement);
        }
    }

    async fn statistics_job(self: Arc<Self>) {
        tokio::time::sleep(self.ctx.timing.statistics_delay).await;
        let mut ticker = tokio::time::interval(self.ctx.timing.statistics_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let handle = self.handle.lock().clone();
            // Mid-bounce there is no handle, keep the previous value
            let Some(handle) = handle else {
                continue;
            };
            match self.backend.statistics(&handle).await {
                Ok(statistics) => self.publish_statistics(statistics),
                Err(e) => log::debug!("Statistics for '{}' unavailable: {}", handle.tunnel_name, e),
            }
        }
    }

    async fn config_job(self: Arc<Self>) {
        let mut catalog = self.ctx.tunnels.subscribe();
        loop {
            let latest = catalog
                .borrow_and_update()
                .iter()
                .find(|t| t.id == self.id)
                .cloned();

            match latest {
                Some(latest) => self.reconcile(latest).await,
                None => {
                    log::warn!("{}", TunnelError::ConfigReconciliationSkipped(self.id));
                    let controller = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _ = controller.stop(StopReason::ConfigChanged).await;
                    });
                    return;
                }
            }

            if catalog.changed().await.is_err() {
                return;
            }
        }
    }

    /// Apply a stored configuration to the running tunnel
    async fn reconcile(self: &Arc<Self>, latest: TunnelConfig) {
        let (quick_changed, ping_changed) = {
            let mut current = self.config.write();
            let quick_changed = current.quick_config_differs(&latest);
            let ping_changed = current.ping_config_differs(&latest);
            if *current != latest {
                *current = latest.clone();
            }
            (quick_changed, ping_changed)
        };
        self.publish_config(&latest);

        if quick_changed {
            log::info!("Configuration of '{}' changed, restarting", latest.name);
            if let Err(e) = self.bounce(StopReason::ConfigChanged).await {
                log::warn!("Restart of '{}' after config change failed: {}", latest.name, e);
            }
        }
        if ping_changed {
            log::info!("Ping settings of '{}' changed", latest.name);
            self.restart_ping_jobs().await;
        }
    }
}

/// The watchdog's view of a controller
struct Watched(Arc<TunnelController>);

#[async_trait]
impl PingTarget for Watched {
    fn config(&self) -> TunnelConfig {
        self.0.config()
    }

    fn is_running(&self) -> bool {
        self.0.is_running()
    }

    async fn bounce(&self, reason: StopReason) {
        if let Err(e) = self.0.bounce(reason).await {
            log::warn!("Restart of tunnel {} failed: {}", self.0.id, e);
        }
    }
}

/// Feed "is the device connected" into the watchdog's availability flag
async fn network_availability_job(
    mut network: watch::Receiver<NetworkSnapshot>,
    available: watch::Sender<bool>,
) {
    loop {
        let connected = network.borrow_and_update().is_connected();
        available.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if network.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TunnelStore;
    use crate::testing::{tunnel, BackendCall, Harness};
    use crate::types::{AppSettings, BackendState};

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn harness_with(config: TunnelConfig) -> Harness {
        Harness::new(AppSettings::default(), vec![config])
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let h = harness_with(tunnel(1, "home"));
        let active = h.ctx.active_tunnels();
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));

        ctl.start().await.unwrap();
        assert_eq!(ctl.status(), TunnelStatus::Up);
        assert_eq!(active.borrow()[&1].status, TunnelStatus::Up);
        assert!(h.store.get_all()[0].is_active);
        assert_eq!(h.host.foreground_count(), 1);

        ctl.stop(StopReason::User).await.unwrap();
        assert_eq!(ctl.status(), TunnelStatus::Down);
        assert!(active.borrow().is_empty());
        assert!(!h.store.get_all()[0].is_active);
        assert_eq!(h.host.foreground_count(), 0);
        assert_eq!(h.fake.downs(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let h = harness_with(tunnel(1, "home"));
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));

        ctl.stop(StopReason::User).await.unwrap();
        ctl.start().await.unwrap();
        ctl.stop(StopReason::User).await.unwrap();
        ctl.stop(StopReason::User).await.unwrap();
        assert_eq!(h.fake.downs(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_noop() {
        let h = harness_with(tunnel(1, "home"));
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));

        ctl.start().await.unwrap();
        ctl.start().await.unwrap();
        assert_eq!(h.fake.ups(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_adopts_interface_already_up() {
        let config = tunnel(1, "home");
        let h = harness_with(config.clone());
        let active = h.ctx.active_tunnels();
        h.fake.add_running(&interface_name(&config));
        let ctl = TunnelController::new(h.ctx.clone(), config);

        ctl.start().await.unwrap();
        assert_eq!(h.fake.ups(1), 0);
        assert_eq!(ctl.status(), TunnelStatus::Up);
        assert_eq!(active.borrow()[&1].status, TunnelStatus::Up);
        assert!(h.store.get_all()[0].is_active);

        // Supervised like any other tunnel
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(active.borrow()[&1].statistics.is_some());

        ctl.stop(StopReason::User).await.unwrap();
        assert_eq!(h.fake.downs(1), 1);
        assert!(h.fake.running().is_empty());
        assert_eq!(h.host.foreground_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_active_flag() {
        let h = harness_with(tunnel(1, "home"));
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));
        ctl.start().await.unwrap();

        ctl.stop(StopReason::Shutdown).await.unwrap();
        assert_eq!(ctl.status(), TunnelStatus::Down);
        assert_eq!(h.fake.downs(1), 1);
        assert!(h.store.get_all()[0].is_active);
    }

    fn hostname_tunnel() -> TunnelConfig {
        TunnelConfig::new(
            1,
            "home",
            "[Interface]\nPrivateKey = home\n\n[Peer]\nEndpoint = vpn.example.com:51820\n",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_hostname_endpoint_lowers_kill_switch_until_stop() {
        let config = hostname_tunnel();
        let h = harness_with(config.clone());
        let lan = vec!["192.168.0.0/16".to_string()];
        h.kill_switch
            .set_backend_state(BackendState::KillSwitchActive, lan.clone())
            .await
            .unwrap();
        let ctl = TunnelController::new(h.ctx.clone(), config);

        ctl.start().await.unwrap();
        assert_eq!(h.kill_switch.backend_state(), BackendState::ServiceActive);
        // Lowered before the backend was asked to resolve and connect
        let calls = h.fake.calls();
        let lowered = calls
            .iter()
            .position(|c| *c == BackendCall::SetState(BackendState::ServiceActive, Vec::new()))
            .unwrap();
        let up = calls.iter().position(|c| *c == BackendCall::Up(1)).unwrap();
        assert!(lowered < up);

        ctl.stop(StopReason::User).await.unwrap();
        assert_eq!(h.kill_switch.backend_state(), BackendState::KillSwitchActive);
        assert_eq!(h.kill_switch.allowed_ips(), lan);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hostname_restore_deferred_while_auto_tunnel_active() {
        let config = hostname_tunnel();
        let h = harness_with(config.clone());
        h.auto_tunnel.send_replace(true);
        h.kill_switch
            .set_backend_state(BackendState::KillSwitchActive, Vec::new())
            .await
            .unwrap();
        let ctl = TunnelController::new(h.ctx.clone(), config);

        ctl.start().await.unwrap();
        assert_eq!(h.kill_switch.backend_state(), BackendState::ServiceActive);

        ctl.stop(StopReason::User).await.unwrap();
        assert_eq!(h.kill_switch.backend_state(), BackendState::ServiceActive);
        assert!(!h.kill_switch.has_pending_restore());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_cleans_up_and_reports() {
        let h = harness_with(tunnel(1, "home"));
        let mut errors = h.ctx.errors();
        let active = h.ctx.active_tunnels();
        h.fake.fail_next_up(BackendError::RootDenied);
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));

        let err = ctl.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::Backend(BackendError::RootDenied)));
        assert_eq!(ctl.status(), TunnelStatus::Down);
        assert!(active.borrow().is_empty());
        assert!(!h.store.get_all()[0].is_active);
        assert_eq!(h.host.foreground_count(), 0);

        let failure = errors.try_recv().unwrap();
        assert_eq!(failure.tunnel.id, 1);
        assert_eq!(failure.error, BackendError::RootDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_polling() {
        let h = harness_with(tunnel(1, "home"));
        let active = h.ctx.active_tunnels();
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));
        ctl.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(active.borrow()[&1].statistics.is_none());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let first = active.borrow()[&1].statistics.as_ref().unwrap().rx_total();
        assert_eq!(first, 1);

        // A failing read keeps the last value
        h.fake.fail_statistics(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(active.borrow()[&1].statistics.as_ref().unwrap().rx_total(), 1);

        h.fake.fail_statistics(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(active.borrow()[&1].statistics.as_ref().unwrap().rx_total() > 1);

        ctl.stop(StopReason::User).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_config_change_bounces_once() {
        let mut config = tunnel(1, "home");
        config.is_ping_enabled = true;
        let h = harness_with(config.clone());
        let ctl = TunnelController::new(h.ctx.clone(), config.clone());
        ctl.start().await.unwrap();
        settle().await;
        assert_eq!(ctl.ping_job_starts(), 1);

        let mut changed = h.store.get_all()[0].clone();
        changed.wg_quick.push_str("PersistentKeepalive = 25\n");
        TunnelStore::save(h.store.as_ref(), changed.clone())
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.fake.downs(1), 1);
        assert_eq!(h.fake.ups(1), 2);
        assert_eq!(ctl.ping_job_starts(), 1);
        assert_eq!(ctl.config().wg_quick, changed.wg_quick);
        assert_eq!(ctl.status(), TunnelStatus::Up);

        ctl.stop(StopReason::User).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_config_change_restarts_only_ping_jobs() {
        let mut config = tunnel(1, "home");
        config.is_ping_enabled = true;
        config.ping_interval_ms = Some(100_000);
        let h = harness_with(config.clone());
        let ctl = TunnelController::new(h.ctx.clone(), config);
        ctl.start().await.unwrap();
        settle().await;

        let mut changed = h.store.get_all()[0].clone();
        changed.ping_interval_ms = Some(10_000);
        TunnelStore::save(h.store.as_ref(), changed).await.unwrap();
        settle().await;

        assert_eq!(ctl.ping_job_starts(), 2);
        assert_eq!(h.fake.downs(1), 0);
        assert_eq!(h.fake.ups(1), 1);

        // The new interval is in effect
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.probe.count(), 1);

        ctl.stop(StopReason::User).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_ping_cancels_watchdog() {
        let mut config = tunnel(1, "home");
        config.is_ping_enabled = true;
        config.ping_interval_ms = Some(5_000);
        let h = harness_with(config.clone());
        let ctl = TunnelController::new(h.ctx.clone(), config);
        ctl.start().await.unwrap();
        settle().await;

        let mut changed = h.store.get_all()[0].clone();
        changed.is_ping_enabled = false;
        TunnelStore::save(h.store.as_ref(), changed).await.unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.probe.count(), 0);
        ctl.stop(StopReason::User).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_tunnel_is_stopped() {
        let h = harness_with(tunnel(1, "home"));
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));
        ctl.start().await.unwrap();
        settle().await;

        h.store.delete(1).await.unwrap();
        settle().await;

        assert_eq!(ctl.status(), TunnelStatus::Down);
        assert_eq!(h.fake.downs(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_bounces_tunnel() {
        let mut config = tunnel(1, "home");
        config.is_ping_enabled = true;
        config.ping_interval_ms = Some(10_000);
        let h = harness_with(config.clone());
        h.probe.fail_next(1);
        let ctl = TunnelController::new(h.ctx.clone(), config);
        ctl.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(h.fake.downs(1), 1);
        assert_eq!(h.fake.ups(1), 2);
        assert_eq!(ctl.status(), TunnelStatus::Up);

        ctl.stop(StopReason::User).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bounce_stops_tunnel() {
        let h = harness_with(tunnel(1, "home"));
        let mut errors = h.ctx.errors();
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));
        ctl.start().await.unwrap();

        h.fake.fail_next_up(BackendError::Command("boom".to_string()));
        assert!(ctl.bounce(StopReason::Ping).await.is_err());
        settle().await;

        assert_eq!(ctl.status(), TunnelStatus::Down);
        assert_eq!(h.host.foreground_count(), 0);
        assert_eq!(
            errors.try_recv().unwrap().error,
            BackendError::Command("boom".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounce_when_stopped_is_noop() {
        let h = harness_with(tunnel(1, "home"));
        let ctl = TunnelController::new(h.ctx.clone(), tunnel(1, "home"));
        ctl.bounce(StopReason::Ping).await.unwrap();
        assert!(h.fake.calls().is_empty());
    }
}
