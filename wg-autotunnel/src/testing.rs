// In-memory doubles for the backend and the reachability probe

use crate::backend::{interface_name, BackendAdapter, BackendSlot, RuntimeHandle};
use crate::error::{BackendError, ProbeError};
use crate::kill_switch::KillSwitchController;
use crate::ping::ReachabilityProbe;
use crate::process_host::StateFileHost;
use crate::store::Store;
use crate::tunnel::{Timing, TunnelContext};
use crate::types::{
    AppSettings, BackendMode, BackendState, NetworkSnapshot, PeerStatistics, TunnelConfig,
    TunnelId, TunnelStatistics,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BackendCall {
    Up(TunnelId),
    Down(TunnelId),
    SetState(BackendState, Vec<String>),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<BackendCall>,
    state: BackendState,
    running: Vec<String>,
    fail_up: VecDeque<BackendError>,
    fail_state: Option<BackendState>,
    fail_statistics: bool,
    statistics_reads: u64,
}

/// Backend that records every call and keeps everything in memory
pub(crate) struct FakeBackend {
    mode: BackendMode,
    inner: Mutex<FakeState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::with_mode(BackendMode::Userspace)
    }
}

impl FakeBackend {
    pub(crate) fn with_mode(mode: BackendMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().calls.clone()
    }

    pub(crate) fn ups(&self, id: TunnelId) -> usize {
        self.count(BackendCall::Up(id))
    }

    pub(crate) fn downs(&self, id: TunnelId) -> usize {
        self.count(BackendCall::Down(id))
    }

    fn count(&self, call: BackendCall) -> usize {
        self.inner.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Make the next `up` fail with `error`
    pub(crate) fn fail_next_up(&self, error: BackendError) {
        self.inner.lock().fail_up.push_back(error);
    }

    /// Make every attempt to enter `state` fail
    pub(crate) fn fail_state(&self, state: BackendState) {
        self.inner.lock().fail_state = Some(state);
    }

    pub(crate) fn fail_statistics(&self, fail: bool) {
        self.inner.lock().fail_statistics = fail;
    }

    /// Pretend an interface is already up outside the engine
    pub(crate) fn add_running(&self, interface: &str) {
        self.inner.lock().running.push(interface.to_string());
    }

    pub(crate) fn running(&self) -> Vec<String> {
        self.inner.lock().running.clone()
    }
}

#[async_trait]
impl BackendAdapter for FakeBackend {
    fn mode(&self) -> BackendMode {
        self.mode
    }

    async fn up(&self, config: &TunnelConfig) -> Result<RuntimeHandle, BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Up(config.id));
        if let Some(error) = inner.fail_up.pop_front() {
            return Err(error);
        }

        let interface = interface_name(config);
        inner.running.push(interface.clone());
        Ok(RuntimeHandle {
            tunnel_id: config.id,
            tunnel_name: config.name.clone(),
            interface,
        })
    }

    async fn down(&self, handle: &RuntimeHandle) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Down(handle.tunnel_id));
        inner.running.retain(|i| *i != handle.interface);
        Ok(())
    }

    async fn statistics(&self, handle: &RuntimeHandle) -> Result<TunnelStatistics, BackendError> {
        let mut inner = self.inner.lock();
        if inner.fail_statistics {
            return Err(BackendError::NotRunning(handle.tunnel_name.clone()));
        }
        inner.statistics_reads += 1;
        Ok(TunnelStatistics {
            peers: vec![PeerStatistics {
                public_key: "peer".to_string(),
                rx_bytes: inner.statistics_reads,
                tx_bytes: 0,
                last_handshake: None,
            }],
        })
    }

    fn backend_state(&self) -> BackendState {
        self.inner.lock().state
    }

    async fn set_backend_state(
        &self,
        state: BackendState,
        allowed_ips: &[String],
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(BackendCall::SetState(state, allowed_ips.to_vec()));
        if inner.fail_state == Some(state) {
            return Err(BackendError::Firewall("scripted failure".to_string()));
        }
        inner.state = state;
        Ok(())
    }

    async fn running_tunnel_names(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.inner.lock().running.clone())
    }
}

/// Probe answering from a script; succeeds once the script runs out
#[derive(Default)]
pub(crate) struct ScriptedProbe {
    failures: Mutex<usize>,
    hang: Mutex<bool>,
    probed: Mutex<Vec<IpAddr>>,
}

impl ScriptedProbe {
    pub(crate) fn fail_next(&self, n: usize) {
        *self.failures.lock() = n;
    }

    /// Never answer
    pub(crate) fn hang(&self, hang: bool) {
        *self.hang.lock() = hang;
    }

    pub(crate) fn count(&self) -> usize {
        self.probed.lock().len()
    }

    pub(crate) fn probed(&self) -> Vec<IpAddr> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn probe(&self, target: IpAddr, _timeout: Duration) -> Result<(), ProbeError> {
        self.probed.lock().push(target);
        let hang = *self.hang.lock();
        if hang {
            std::future::pending::<()>().await;
        }

        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(ProbeError::PingProbeFailure {
                target: target.to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn wifi(ssid: &str) -> NetworkSnapshot {
    NetworkSnapshot {
        wifi_connected: true,
        ssid: Some(ssid.to_string()),
        ..Default::default()
    }
}

pub(crate) fn tunnel(id: TunnelId, name: &str) -> TunnelConfig {
    TunnelConfig::new(
        id,
        name,
        format!("[Interface]\nPrivateKey = {name}\n\n[Peer]\nEndpoint = 192.0.2.{id}:51820\n"),
    )
}

/// Engine parts wired around a [`FakeBackend`] and an in-memory store
pub(crate) struct Harness {
    pub fake: Arc<FakeBackend>,
    pub slot: Arc<BackendSlot>,
    pub store: Arc<Store>,
    pub network: watch::Sender<NetworkSnapshot>,
    pub auto_tunnel: watch::Sender<bool>,
    pub kill_switch: Arc<KillSwitchController>,
    pub host: Arc<StateFileHost>,
    pub probe: Arc<ScriptedProbe>,
    pub ctx: Arc<TunnelContext>,
}

impl Harness {
    pub(crate) fn new(settings: AppSettings, tunnels: Vec<TunnelConfig>) -> Self {
        let fake = Arc::new(FakeBackend::default());
        let slot = Arc::new(BackendSlot::new(fake.clone()));
        let store = Arc::new(Store::in_memory(settings, tunnels));
        let (network, network_rx) = watch::channel(wifi("Cafe"));
        let (auto_tunnel, auto_tunnel_rx) = watch::channel(false);
        let kill_switch = Arc::new(KillSwitchController::new(slot.clone(), auto_tunnel_rx));
        let host = Arc::new(StateFileHost::detached());
        let probe = Arc::new(ScriptedProbe::default());

        let ctx = Arc::new(TunnelContext::new(
            slot.clone(),
            kill_switch.clone(),
            host.clone(),
            store.clone(),
            network_rx,
            probe.clone(),
            Timing::default(),
        ));

        Self {
            fake,
            slot,
            store,
            network,
            auto_tunnel,
            kill_switch,
            host,
            probe,
            ctx,
        }
    }
}
