// Auto-tunnel orchestrator

//! Auto-tunnel orchestrator
//!
//! Watches settings, the tunnel catalog, connectivity and tunnel status, and
//! after a quiet period (the debounce delay) runs the condition evaluator and
//! dispatches its decision to the registry. A burst of changes inside the
//! delay produces exactly one evaluation, on the latest values.

use crate::evaluator::{evaluate, kill_switch_target, Conditions};
use crate::kill_switch::KillSwitchController;
use crate::registry::TunnelRegistry;
use crate::store::{SettingsStore, TunnelStore};
use crate::tunnel::ActiveTunnels;
use crate::types::{Action, NetworkSnapshot, StopReason, TunnelId, TunnelStatus};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

pub struct AutoTunnelOrchestrator {
    settings: Arc<dyn SettingsStore>,
    tunnels: Arc<dyn TunnelStore>,
    registry: Arc<TunnelRegistry>,
    kill_switch: Arc<KillSwitchController>,
    network: watch::Receiver<NetworkSnapshot>,
    auto_tunnel_active: watch::Sender<bool>,
    evaluations: AtomicU64,
}

/// Status of each started tunnel; statistics updates leave it unchanged
fn status_summary(active: &ActiveTunnels) -> BTreeMap<TunnelId, TunnelStatus> {
    active.iter().map(|(id, state)| (*id, state.status)).collect()
}

impl AutoTunnelOrchestrator {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        tunnels: Arc<dyn TunnelStore>,
        registry: Arc<TunnelRegistry>,
        kill_switch: Arc<KillSwitchController>,
        network: watch::Receiver<NetworkSnapshot>,
        auto_tunnel_active: watch::Sender<bool>,
    ) -> Self {
        Self {
            settings,
            tunnels,
            registry,
            kill_switch,
            network,
            auto_tunnel_active,
            evaluations: AtomicU64::new(0),
        }
    }

    /// Number of evaluations run so far
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Whether an auto-tunnel session is currently running
    pub fn is_active(&self) -> bool {
        *self.auto_tunnel_active.borrow()
    }

    /// Run until `shutdown` turns true or its sender goes away
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut settings = self.settings.subscribe();
        let mut tunnels = self.tunnels.subscribe();
        let mut network = self.network.clone();
        let mut active = self.registry.active_tunnels();
        let mut last_status = status_summary(&active.borrow_and_update());

        // Evaluate once at startup, after the usual quiet period
        let mut deadline = Some(Instant::now() + self.settings.get().debounce_delay());

        log::info!("Auto-tunnel orchestrator running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let sleep = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = settings.changed() => {
                    if res.is_err() {
                        break;
                    }
                    deadline = Some(self.debounce_deadline());
                }
                res = tunnels.changed() => {
                    if res.is_err() {
                        break;
                    }
                    deadline = Some(self.debounce_deadline());
                }
                res = network.changed() => {
                    if res.is_err() {
                        break;
                    }
                    log::debug!("Connectivity changed: {:?}", *network.borrow());
                    deadline = Some(self.debounce_deadline());
                }
                res = active.changed() => {
                    if res.is_err() {
                        break;
                    }
                    let summary = status_summary(&active.borrow_and_update());
                    if summary != last_status {
                        last_status = summary;
                        deadline = Some(self.debounce_deadline());
                    }
                }
                _ = sleep, if deadline.is_some() => {
                    deadline = None;
                    self.evaluate_and_dispatch().await;
                }
            }
        }

        self.auto_tunnel_active.send_replace(false);
        log::info!("Auto-tunnel orchestrator stopped");
    }

    /// End of the quiet period starting now, with the current delay setting
    fn debounce_deadline(&self) -> Instant {
        Instant::now() + self.settings.get().debounce_delay()
    }

    /// Evaluate the current conditions once and act on the result
    pub async fn evaluate_and_dispatch(&self) -> Action {
        self.evaluations.fetch_add(1, Ordering::SeqCst);

        let settings = self.settings.get();
        self.auto_tunnel_active
            .send_if_modified(|active| {
                let changed = *active != settings.auto_tunnel_enabled;
                *active = settings.auto_tunnel_enabled;
                changed
            });
        if !settings.auto_tunnel_enabled {
            return Action::NoOp;
        }

        let network = self.network.borrow().clone();
        let catalog = self.tunnels.get_all();
        // Prefer the stored configuration of the running tunnel
        let active = self.registry.running().into_iter().next().map(|running| {
            catalog
                .iter()
                .find(|t| t.id == running.id)
                .cloned()
                .unwrap_or(running)
        });

        let policy = match kill_switch_target(&network, &settings) {
            Some(target) => {
                self.kill_switch
                    .apply_policy(target, settings.lan_bypass_enabled)
                    .await
            }
            // Switched off in settings: drop whatever the policy raised
            None => self.kill_switch.follow_setting(false, false).await,
        };
        if let Err(e) = policy {
            log::error!("Failed to apply kill switch policy: {}", e);
        }

        let action = evaluate(Conditions {
            network: &network,
            settings: &settings,
            active: active.as_ref(),
            catalog: &catalog,
        });
        if action != Action::NoOp {
            log::info!("Auto-tunnel decision: {}", action);
        }
        self.dispatch(&action).await;
        action
    }

    async fn dispatch(&self, action: &Action) {
        let result = match action {
            Action::NoOp => Ok(()),
            Action::StartTunnel(tunnel) => self.registry.start(tunnel.clone()).await,
            Action::StopTunnel(tunnel, reason) => self.registry.stop(tunnel.id, *reason).await,
            Action::SwitchTunnel { from, to } => {
                self.registry
                    .switch(from.id, to.clone(), StopReason::Settings)
                    .await
            }
        };
        // Failures already went out on the error channel
        if let Err(e) = result {
            log::warn!("Auto-tunnel action '{}' failed: {}", action, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tunnel, wifi, Harness};
    use crate::types::{AppSettings, BackendState};
    use std::time::Duration;

    struct Setup {
        h: Harness,
        registry: Arc<TunnelRegistry>,
        orchestrator: Arc<AutoTunnelOrchestrator>,
        shutdown: watch::Sender<bool>,
    }

    fn setup(settings: AppSettings) -> Setup {
        let mut home = tunnel(1, "home");
        home.is_primary = true;
        let mut h = Harness::new(settings, vec![home, tunnel(2, "work")]);
        // The orchestrator owns the flag the kill switch reads
        let auto_tunnel = std::mem::replace(&mut h.auto_tunnel, watch::channel(false).0);
        let registry = Arc::new(TunnelRegistry::new(h.ctx.clone(), h.store.clone()));
        let orchestrator = Arc::new(AutoTunnelOrchestrator::new(
            h.store.clone(),
            h.store.clone(),
            registry.clone(),
            h.kill_switch.clone(),
            h.network.subscribe(),
            auto_tunnel,
        ));
        let (shutdown, _) = watch::channel(false);
        Setup {
            h,
            registry,
            orchestrator,
            shutdown,
        }
    }

    fn auto_settings() -> AppSettings {
        AppSettings {
            auto_tunnel_enabled: true,
            tunnel_on_wifi: true,
            trusted_networks: vec!["Home".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrusted_wifi_starts_primary() {
        let s = setup(auto_settings());
        let action = s.orchestrator.evaluate_and_dispatch().await;
        assert!(matches!(action, Action::StartTunnel(ref t) if t.id == 1));
        assert!(s.registry.is_running(1));
        assert!(s.orchestrator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_auto_tunnel_does_nothing() {
        let s = setup(AppSettings {
            auto_tunnel_enabled: false,
            ..auto_settings()
        });
        assert_eq!(s.orchestrator.evaluate_and_dispatch().await, Action::NoOp);
        assert_eq!(s.registry.running_count(), 0);
        assert!(!s.orchestrator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_changes_evaluates_once() {
        let s = setup(auto_settings());
        let task = tokio::spawn(s.orchestrator.clone().run(s.shutdown.subscribe()));

        // Startup evaluation
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(s.orchestrator.evaluation_count(), 1);
        assert!(s.registry.is_running(1));
        // Let the status change from that start settle into its own evaluation
        tokio::time::sleep(Duration::from_secs(4)).await;
        let before = s.orchestrator.evaluation_count();

        // Five network changes within the delay
        for name in ["A", "B", "C", "D", "Home"] {
            s.h.network.send_replace(wifi(name));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(s.orchestrator.evaluation_count(), before);

        tokio::time::sleep(Duration::from_millis(2_600)).await;
        assert_eq!(s.orchestrator.evaluation_count(), before + 1);
        // Evaluated on the last value: trusted Home, so the tunnel is stopped
        assert!(!s.registry.is_running(1));

        s.shutdown.send_replace(true);
        task.await.unwrap();
        assert!(!s.orchestrator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_updates_do_not_trigger_evaluation() {
        let s = setup(auto_settings());
        let task = tokio::spawn(s.orchestrator.clone().run(s.shutdown.subscribe()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let settled = s.orchestrator.evaluation_count();
        // The running tunnel publishes statistics every second
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(s.orchestrator.evaluation_count(), settled);

        s.shutdown.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trusted_wifi_stops_and_lowers_kill_switch() {
        let s = setup(AppSettings {
            kill_switch_enabled: true,
            disable_kill_switch_on_trusted: true,
            ..auto_settings()
        });

        s.orchestrator.evaluate_and_dispatch().await;
        assert!(s.registry.is_running(1));
        assert_eq!(s.h.kill_switch.backend_state(), BackendState::KillSwitchActive);

        s.h.network.send_replace(wifi("Home"));
        let action = s.orchestrator.evaluate_and_dispatch().await;
        assert!(matches!(action, Action::StopTunnel(ref t, StopReason::Settings) if t.id == 1));
        assert_eq!(s.registry.running_count(), 0);
        assert_eq!(s.h.kill_switch.backend_state(), BackendState::ServiceActive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_network_switches_tunnel() {
        let s = setup(auto_settings());
        let mut work = s.h.store.get_all()[1].clone();
        work.tunnel_networks = vec!["Office".to_string()];
        TunnelStore::save(s.h.store.as_ref(), work).await.unwrap();

        s.orchestrator.evaluate_and_dispatch().await;
        assert!(s.registry.is_running(1));

        s.h.network.send_replace(wifi("Office"));
        let action = s.orchestrator.evaluate_and_dispatch().await;
        assert!(matches!(action, Action::SwitchTunnel { ref from, ref to } if from.id == 1 && to.id == 2));
        assert!(!s.registry.is_running(1));
        assert!(s.registry.is_running(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_is_contained() {
        let s = setup(auto_settings());
        let mut errors = s.registry.errors();
        s.h.fake
            .fail_next_up(crate::error::BackendError::InvalidConfig("bad key".to_string()));

        let action = s.orchestrator.evaluate_and_dispatch().await;
        assert!(matches!(action, Action::StartTunnel(_)));
        assert_eq!(s.registry.running_count(), 0);
        assert!(errors.try_recv().is_ok());

        // Next evaluation retries
        s.orchestrator.evaluate_and_dispatch().await;
        assert!(s.registry.is_running(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_kill_switch_setting_lowers_it() {
        let s = setup(AppSettings {
            kill_switch_enabled: true,
            ..auto_settings()
        });
        s.orchestrator.evaluate_and_dispatch().await;
        assert_eq!(s.h.kill_switch.backend_state(), BackendState::KillSwitchActive);

        let settings = AppSettings {
            kill_switch_enabled: false,
            ..s.h.store.get()
        };
        SettingsStore::save(s.h.store.as_ref(), settings).await.unwrap();
        s.orchestrator.evaluate_and_dispatch().await;
        assert_eq!(s.h.kill_switch.backend_state(), BackendState::Inactive);
        assert!(s.registry.is_running(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_debounce_delay_applies_to_its_own_change() {
        let s = setup(auto_settings());
        let task = tokio::spawn(s.orchestrator.clone().run(s.shutdown.subscribe()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        let before = s.orchestrator.evaluation_count();

        let settings = AppSettings {
            debounce_delay_secs: 20,
            ..s.h.store.get()
        };
        SettingsStore::save(s.h.store.as_ref(), settings).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(s.orchestrator.evaluation_count(), before);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(s.orchestrator.evaluation_count(), before + 1);

        s.shutdown.send_replace(true);
        task.await.unwrap();
    }
}
