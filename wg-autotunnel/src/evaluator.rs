// Condition evaluator for auto-tunneling

//! Condition evaluator
//!
//! Pure decision function mapping the current connectivity, the user policy,
//! the active tunnel and the tunnel catalog to a single [`Action`]. Rules are
//! checked in a fixed priority order and the first match wins:
//!
//! 1. Ethernet
//! 2. mobile data with tunneling enabled
//! 3. mobile data with tunneling disabled
//! 4. untrusted Wi-Fi
//! 5. trusted Wi-Fi
//! 6. Wi-Fi with tunneling disabled
//! 7. no connectivity (only when `stop_on_no_connectivity` is set)
//! 8. no-op

use crate::types::{Action, AppSettings, BackendState, NetworkSnapshot, StopReason, TunnelConfig};

/// Everything the evaluator looks at, borrowed from the orchestrator's snapshot
#[derive(Debug, Clone, Copy)]
pub struct Conditions<'a> {
    pub network: &'a NetworkSnapshot,
    pub settings: &'a AppSettings,
    pub active: Option<&'a TunnelConfig>,
    pub catalog: &'a [TunnelConfig],
}

/// Primary tunnel, else the first one in the catalog
pub fn default_tunnel(catalog: &[TunnelConfig]) -> Option<&TunnelConfig> {
    catalog
        .iter()
        .find(|t| t.is_primary)
        .or_else(|| catalog.first())
}

/// Evaluate the rules in priority order
pub fn evaluate(c: Conditions<'_>) -> Action {
    let net = c.network;
    let settings = c.settings;
    let default = default_tunnel(c.catalog);

    // 1. Ethernet claims the decision while tunneling on it is enabled
    if net.ethernet_connected && settings.tunnel_on_ethernet {
        log::debug!("Rule: ethernet");
        if c.active.is_some() {
            return Action::NoOp;
        }
        let target = c
            .catalog
            .iter()
            .find(|t| t.is_ethernet_tunnel)
            .or(default);
        return start_or_switch(c.active, target);
    }

    let on_mobile_only = net.mobile_data_connected && !net.wifi_connected && !net.ethernet_connected;

    // 2. Mobile data with tunneling enabled
    if on_mobile_only && settings.tunnel_on_mobile_data {
        log::debug!("Rule: mobile data on");
        let target = c
            .catalog
            .iter()
            .find(|t| t.is_mobile_data_tunnel)
            .or(default);
        return start_or_switch(c.active, target);
    }

    // 3. Mobile data with tunneling disabled
    if on_mobile_only && !settings.tunnel_on_mobile_data {
        if let Some(active) = c.active {
            log::debug!("Rule: mobile data off");
            return Action::StopTunnel(active.clone(), StopReason::Settings);
        }
    }

    if net.wifi_connected {
        let ssid = net.ssid.as_deref().unwrap_or_default();
        let trusted = settings.is_trusted(ssid);

        // 4. Untrusted Wi-Fi
        if !trusted && settings.tunnel_on_wifi {
            log::debug!("Rule: untrusted wifi '{}'", ssid);
            let target = c
                .catalog
                .iter()
                .find(|t| t.is_bound_to(ssid, settings.wildcards_enabled))
                .or(default);
            return start_or_switch(c.active, target);
        }

        // 5. Trusted Wi-Fi
        if trusted {
            log::debug!("Rule: trusted wifi '{}'", ssid);
            return stop_active(c.active, StopReason::Settings);
        }

        // 6. Wi-Fi tunneling disabled
        if !settings.tunnel_on_wifi {
            log::debug!("Rule: wifi off");
            return stop_active(c.active, StopReason::Settings);
        }
    }

    // 7. No connectivity at all
    if !net.is_connected() && settings.stop_on_no_connectivity {
        log::debug!("Rule: no connectivity");
        return stop_active(c.active, StopReason::NetworkLost);
    }

    Action::NoOp
}

fn start_or_switch(active: Option<&TunnelConfig>, target: Option<&TunnelConfig>) -> Action {
    match (active, target) {
        (_, None) => Action::NoOp,
        (None, Some(to)) => Action::StartTunnel(to.clone()),
        (Some(from), Some(to)) if from.id != to.id => Action::SwitchTunnel {
            from: from.clone(),
            to: to.clone(),
        },
        (Some(_), Some(_)) => Action::NoOp,
    }
}

fn stop_active(active: Option<&TunnelConfig>, reason: StopReason) -> Action {
    match active {
        Some(tunnel) => Action::StopTunnel(tunnel.clone(), reason),
        None => Action::NoOp,
    }
}

/// Backend state the orchestrator should hold the kill switch in.
/// `None` means the kill switch is not managed by policy.
pub fn kill_switch_target(network: &NetworkSnapshot, settings: &AppSettings) -> Option<BackendState> {
    if !settings.kill_switch_enabled {
        return None;
    }
    let on_trusted_wifi = network.wifi_connected
        && network
            .ssid
            .as_deref()
            .is_some_and(|ssid| settings.is_trusted(ssid));
    if on_trusted_wifi && settings.disable_kill_switch_on_trusted {
        Some(BackendState::ServiceActive)
    } else {
        Some(BackendState::KillSwitchActive)
    }
}

/// Match an SSID against a trusted/bound entry.
/// Without wildcards the comparison is exact; with them `*` matches any run
/// of characters and `?` exactly one.
pub fn ssid_matches(pattern: &str, ssid: &str, wildcards: bool) -> bool {
    if !wildcards {
        return pattern == ssid;
    }

    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = ssid.chars().collect();
    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((star_pi, star_si)) = star {
            // Let the last star absorb one more character
            pi = star_pi + 1;
            si = star_si + 1;
            star = Some((star_pi, star_si + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}
