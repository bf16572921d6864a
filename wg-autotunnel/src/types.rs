// Shared types for the auto-tunnel engine

//! Shared data structures
//!
//! This module defines the values passed between the orchestrator, the
//! tunnel registry and the collaborators: tunnel configurations, user
//! policy, connectivity snapshots, runtime state and evaluator actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// Identifier of a tunnel in the tunnel store
pub type TunnelId = u32;

/// Default interval between two reachability checks
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default pause after a ping-triggered bounce
pub const DEFAULT_PING_COOLDOWN: Duration = Duration::from_secs(30);

/// Default debounce window for the orchestrator (seconds)
pub const DEFAULT_DEBOUNCE_SECS: u64 = 3;

/// A stored tunnel and its per-tunnel policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub id: TunnelId,
    pub name: String,
    /// WireGuard quick-config text
    pub wg_quick: String,
    /// AmneziaWG quick-config text (userspace backend only)
    #[serde(default)]
    pub am_quick: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_mobile_data_tunnel: bool,
    #[serde(default)]
    pub is_ethernet_tunnel: bool,
    /// Persisted "should be running" flag
    #[serde(default)]
    pub is_active: bool,
    /// SSIDs this tunnel is bound to
    #[serde(default)]
    pub tunnel_networks: Vec<String>,
    #[serde(default)]
    pub is_ping_enabled: bool,
    #[serde(default)]
    pub ping_ip: Option<String>,
    #[serde(default)]
    pub ping_interval_ms: Option<u64>,
    #[serde(default)]
    pub ping_cooldown_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub is_ipv4_preferred: bool,
}

fn default_true() -> bool {
    true
}

impl TunnelConfig {
    /// Create a tunnel with the given quick-config and every flag cleared
    pub fn new(id: TunnelId, name: impl Into<String>, wg_quick: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            wg_quick: wg_quick.into(),
            am_quick: String::new(),
            is_primary: false,
            is_mobile_data_tunnel: false,
            is_ethernet_tunnel: false,
            is_active: false,
            tunnel_networks: Vec::new(),
            is_ping_enabled: false,
            ping_ip: None,
            ping_interval_ms: None,
            ping_cooldown_ms: None,
            is_ipv4_preferred: true,
        }
    }

    /// Interval between reachability checks
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PING_INTERVAL)
    }

    /// Pause after a ping-triggered bounce
    pub fn ping_cooldown(&self) -> Duration {
        self.ping_cooldown_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PING_COOLDOWN)
    }

    /// True when the tunnel body text differs (requires a bounce)
    pub fn quick_config_differs(&self, other: &TunnelConfig) -> bool {
        self.wg_quick != other.wg_quick || self.am_quick != other.am_quick
    }

    /// True when the ping policy differs (requires restarting the ping jobs)
    pub fn ping_config_differs(&self, other: &TunnelConfig) -> bool {
        self.is_ping_enabled != other.is_ping_enabled
            || self.ping_ip != other.ping_ip
            || self.ping_interval_ms != other.ping_interval_ms
            || self.ping_cooldown_ms != other.ping_cooldown_ms
    }

    /// `Endpoint` values of every `[Peer]` section, as written (`host:port`)
    pub fn peer_endpoints(&self) -> Vec<String> {
        let mut endpoints = Vec::new();
        let mut in_peer = false;

        for line in self.wg_quick.lines() {
            let line = line.trim();
            if line.starts_with('[') {
                in_peer = line.eq_ignore_ascii_case("[peer]");
                continue;
            }
            if !in_peer {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if key.trim().eq_ignore_ascii_case("endpoint") {
                    let value = value.trim();
                    if !value.is_empty() {
                        endpoints.push(value.to_string());
                    }
                }
            }
        }

        endpoints
    }

    /// True when at least one peer endpoint needs DNS resolution
    pub fn has_hostname_endpoint(&self) -> bool {
        self.peer_endpoints()
            .iter()
            .any(|endpoint| endpoint_host(endpoint).parse::<IpAddr>().is_err())
    }

    /// True when the tunnel is bound to the given SSID
    pub fn is_bound_to(&self, ssid: &str, wildcards: bool) -> bool {
        self.tunnel_networks
            .iter()
            .any(|pattern| crate::evaluator::ssid_matches(pattern, ssid, wildcards))
    }
}

/// Host part of a `host:port` / `[v6]:port` endpoint
pub fn endpoint_host(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match endpoint.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no port
        Some((host, _)) if !host.contains(':') => host,
        Some(_) => endpoint,
        None => endpoint,
    }
}

/// WireGuard implementation driving the tunnels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-kernel WireGuard via wg-quick (requires root)
    Kernel,
    /// AmneziaWG userspace implementation via awg-quick
    #[default]
    Userspace,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Kernel => write!(f, "kernel"),
            BackendMode::Userspace => write!(f, "userspace"),
        }
    }
}

/// Global user policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Master switch for the orchestrator
    pub auto_tunnel_enabled: bool,
    pub tunnel_on_wifi: bool,
    pub tunnel_on_ethernet: bool,
    pub tunnel_on_mobile_data: bool,
    pub trusted_networks: Vec<String>,
    /// Glob matching (`*`, `?`) for trusted and bound SSIDs
    pub wildcards_enabled: bool,
    pub kill_switch_enabled: bool,
    pub lan_bypass_enabled: bool,
    pub disable_kill_switch_on_trusted: bool,
    pub multi_tunnel_enabled: bool,
    pub debounce_delay_secs: u64,
    pub backend: BackendMode,
    pub restore_on_boot: bool,
    /// Stop the active tunnel when every transport is down
    pub stop_on_no_connectivity: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            auto_tunnel_enabled: false,
            tunnel_on_wifi: false,
            tunnel_on_ethernet: false,
            tunnel_on_mobile_data: false,
            trusted_networks: Vec::new(),
            wildcards_enabled: false,
            kill_switch_enabled: false,
            lan_bypass_enabled: false,
            disable_kill_switch_on_trusted: false,
            multi_tunnel_enabled: false,
            debounce_delay_secs: DEFAULT_DEBOUNCE_SECS,
            backend: BackendMode::default(),
            restore_on_boot: false,
            stop_on_no_connectivity: false,
        }
    }
}

impl AppSettings {
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_secs(self.debounce_delay_secs)
    }

    /// True when the SSID matches an entry of the trusted list
    pub fn is_trusted(&self, ssid: &str) -> bool {
        self.trusted_networks
            .iter()
            .any(|pattern| crate::evaluator::ssid_matches(pattern, ssid, self.wildcards_enabled))
    }
}

/// Current connectivity facts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub wifi_connected: bool,
    pub ethernet_connected: bool,
    pub mobile_data_connected: bool,
    pub ssid: Option<String>,
}

impl NetworkSnapshot {
    /// True when any transport is up
    pub fn is_connected(&self) -> bool {
        self.wifi_connected || self.ethernet_connected || self.mobile_data_connected
    }
}

/// Lifecycle status of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelStatus {
    Down,
    Starting,
    Up,
}

/// Per-peer counters read from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatistics {
    pub public_key: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
}

/// Statistics snapshot for one tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStatistics {
    pub peers: Vec<PeerStatistics>,
}

impl TunnelStatistics {
    pub fn rx_total(&self) -> u64 {
        self.peers.iter().map(|p| p.rx_bytes).sum()
    }

    pub fn tx_total(&self) -> u64 {
        self.peers.iter().map(|p| p.tx_bytes).sum()
    }

    /// Most recent handshake across all peers
    pub fn latest_handshake(&self) -> Option<SystemTime> {
        self.peers.iter().filter_map(|p| p.last_handshake).max()
    }
}

/// Runtime state of a started tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnRuntimeState {
    pub status: TunnelStatus,
    pub statistics: Option<TunnelStatistics>,
    /// Configuration the tunnel is running with
    pub config: TunnelConfig,
}

impl VpnRuntimeState {
    pub fn starting(config: TunnelConfig) -> Self {
        Self {
            status: TunnelStatus::Starting,
            statistics: None,
            config,
        }
    }
}

/// Kill-switch state of the active backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendState {
    #[default]
    Inactive,
    /// Service mode: general traffic allowed
    ServiceActive,
    /// Everything outside the tunnel blocked, except the allowed IPs
    KillSwitchActive,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Inactive => write!(f, "inactive"),
            BackendState::ServiceActive => write!(f, "service-active"),
            BackendState::KillSwitchActive => write!(f, "kill-switch-active"),
        }
    }
}

/// Why a tunnel was stopped or bounced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    Ping,
    ConfigChanged,
    NetworkLost,
    Settings,
    /// Daemon going down; the tunnel stays marked active for the next boot
    Shutdown,
}

/// Decision produced by the condition evaluator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NoOp,
    StartTunnel(TunnelConfig),
    StopTunnel(TunnelConfig, StopReason),
    SwitchTunnel {
        from: TunnelConfig,
        to: TunnelConfig,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::NoOp => write!(f, "no-op"),
            Action::StartTunnel(t) => write!(f, "start '{}'", t.name),
            Action::StopTunnel(t, reason) => write!(f, "stop '{}' ({:?})", t.name, reason),
            Action::SwitchTunnel { from, to } => {
                write!(f, "switch '{}' -> '{}'", from.name, to.name)
            }
        }
    }
}
