// Ping-based tunnel health checks

//! Ping watchdog
//!
//! Periodically checks that a running tunnel's peers (or a custom address)
//! answer, and bounces the tunnel when one of them does not. Checks are
//! skipped while the device has no connectivity, and a failure observed
//! after connectivity dropped mid-check never triggers a bounce.

use crate::error::ProbeError;
use crate::types::{endpoint_host, StopReason, TunnelConfig};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;

/// Default timeout for a single reachability probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A way of checking that an address answers
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self, target: IpAddr, timeout: Duration) -> Result<(), ProbeError>;
}

/// Probe using the system `ping` binary (one ICMP echo)
pub struct IcmpProbe;

#[async_trait]
impl ReachabilityProbe for IcmpProbe {
    async fn probe(&self, target: IpAddr, timeout: Duration) -> Result<(), ProbeError> {
        let wait = timeout.as_secs().max(1).to_string();
        let output = Command::new("ping")
            .args(["-n", "-q", "-c", "1", "-W", &wait])
            .arg(target.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::PingProbeFailure {
                target: format!("{} (failed to execute ping: {})", target, e),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ProbeError::PingProbeFailure {
                target: target.to_string(),
            })
        }
    }
}

/// Resolve a host (or IP literal), preferring IPv4 results when asked to
pub async fn resolve(host: &str, ipv4_preferred: bool) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .map(|addr| addr.ip())
        .collect();

    pick_address(&addrs, ipv4_preferred).ok_or_else(|| ProbeError::Resolve {
        host: host.to_string(),
        reason: "no addresses".to_string(),
    })
}

fn pick_address(addrs: &[IpAddr], ipv4_preferred: bool) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|ip| ip.is_ipv4() == ipv4_preferred)
        .or_else(|| addrs.first())
        .copied()
}

/// Hosts a tunnel is checked against: the custom ping address, else every peer endpoint
pub fn ping_targets(config: &TunnelConfig) -> Vec<String> {
    match config.ping_ip.as_deref().map(str::trim) {
        Some(ip) if !ip.is_empty() => vec![ip.to_string()],
        _ => config
            .peer_endpoints()
            .iter()
            .map(|endpoint| endpoint_host(endpoint).to_string())
            .collect(),
    }
}

/// The tunnel a watchdog supervises
#[async_trait]
pub trait PingTarget: Send + Sync {
    /// Current configuration snapshot
    fn config(&self) -> TunnelConfig;

    fn is_running(&self) -> bool;

    async fn bounce(&self, reason: StopReason);
}

/// Result of one round of probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Reachable,
    Unreachable,
    /// A probe failed but the device lost connectivity meanwhile
    Offline,
}

/// Per-tunnel ping loop
pub struct PingWatchdog {
    target: Arc<dyn PingTarget>,
    probe: Arc<dyn ReachabilityProbe>,
    network_available: watch::Receiver<bool>,
    probe_timeout: Duration,
}

impl PingWatchdog {
    pub fn new(
        target: Arc<dyn PingTarget>,
        probe: Arc<dyn ReachabilityProbe>,
        network_available: watch::Receiver<bool>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            target,
            probe,
            network_available,
            probe_timeout,
        }
    }

    fn network_available(&self) -> bool {
        *self.network_available.borrow()
    }

    /// Probe every target once
    pub async fn check(&self, config: &TunnelConfig) -> CheckOutcome {
        let targets = ping_targets(config);
        if targets.is_empty() {
            log::debug!("Tunnel '{}' has nothing to ping", config.name);
            return CheckOutcome::Reachable;
        }

        let mut failed = false;
        for host in &targets {
            if let Err(e) = self.probe_host(host, config.is_ipv4_preferred).await {
                log::warn!("Ping check for '{}' failed: {}", config.name, e);
                failed = true;
                break;
            }
        }

        if !failed {
            CheckOutcome::Reachable
        } else if self.network_available() {
            CheckOutcome::Unreachable
        } else {
            CheckOutcome::Offline
        }
    }

    async fn probe_host(&self, host: &str, ipv4_preferred: bool) -> Result<(), ProbeError> {
        let ip = resolve(host, ipv4_preferred).await?;
        match tokio::time::timeout(self.probe_timeout, self.probe.probe(ip, self.probe_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::PingProbeFailure {
                target: format!("{} (timed out)", ip),
            }),
        }
    }

    /// Run until the tunnel stops (or the task is cancelled)
    pub async fn run(self) {
        let mut pause = self.target.config().ping_interval();

        loop {
            tokio::time::sleep(pause).await;
            if !self.target.is_running() {
                break;
            }

            let config = self.target.config();
            pause = config.ping_interval();

            if !self.network_available() {
                log::debug!("No connectivity, skipping ping check for '{}'", config.name);
                continue;
            }

            match self.check(&config).await {
                CheckOutcome::Reachable => {}
                CheckOutcome::Offline => {
                    log::info!(
                        "Connectivity lost during ping check for '{}', not bouncing",
                        config.name
                    );
                }
                CheckOutcome::Unreachable => {
                    log::warn!("Peers of '{}' unreachable, bouncing tunnel", config.name);
                    self.target.bounce(StopReason::Ping).await;
                    pause = config.ping_cooldown();
                }
            }
        }
    }
}
