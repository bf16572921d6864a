// nftables kill switch

//! Kill-switch firewall
//!
//! Backend state is materialised as a dedicated nftables table. In
//! `KillSwitchActive` the output chain drops everything that does not leave
//! through a tunnel interface, carry the wg-quick fwmark, or go to one of
//! the allowed (LAN bypass) networks.

use crate::error::BackendError;
use crate::types::BackendState;
use parking_lot::Mutex;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const TABLE: &str = "inet wg_autotunnel";

/// Firewall mark wg-quick puts on encrypted packets (51820)
const WG_QUICK_FWMARK: &str = "0xca6c";

/// Render the full ruleset for a backend state.
///
/// The ruleset always starts by (re)creating and deleting the table so that
/// applying it is idempotent.
pub fn render_ruleset(state: BackendState, allowed_ips: &[String], interfaces: &[String]) -> String {
    let mut rules = format!("table {TABLE}\ndelete table {TABLE}\n");

    match state {
        BackendState::Inactive => {}
        BackendState::ServiceActive => {
            rules.push_str(&format!(
                "table {TABLE} {{\n\
                 \tchain output {{\n\
                 \t\ttype filter hook output priority 0; policy accept;\n\
                 \t}}\n\
                 }}\n"
            ));
        }
        BackendState::KillSwitchActive => {
            rules.push_str(&format!("table {TABLE} {{\n\tchain output {{\n"));
            rules.push_str("\t\ttype filter hook output priority 0; policy drop;\n");
            rules.push_str("\t\toifname \"lo\" accept\n");
            rules.push_str("\t\tct state established,related accept\n");
            rules.push_str(&format!("\t\tmeta mark {WG_QUICK_FWMARK} accept\n"));
            for iface in interfaces {
                rules.push_str(&format!("\t\toifname \"{iface}\" accept\n"));
            }

            let (v6, v4): (Vec<&String>, Vec<&String>) =
                allowed_ips.iter().partition(|cidr| cidr.contains(':'));
            if !v4.is_empty() {
                rules.push_str(&format!("\t\tip daddr {{ {} }} accept\n", join(&v4)));
            }
            if !v6.is_empty() {
                rules.push_str(&format!("\t\tip6 daddr {{ {} }} accept\n", join(&v6)));
            }
            rules.push_str("\t}\n}\n");
        }
    }

    rules
}

fn join(cidrs: &[&String]) -> String {
    cidrs
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

struct Applied {
    state: BackendState,
    allowed_ips: Vec<String>,
    interfaces: Vec<String>,
}

/// Tracks and applies the kill-switch ruleset for one backend
pub struct Firewall {
    applied: Mutex<Applied>,
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall {
    pub fn new() -> Self {
        Self {
            applied: Mutex::new(Applied {
                state: BackendState::Inactive,
                allowed_ips: Vec::new(),
                interfaces: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> BackendState {
        self.applied.lock().state
    }

    /// Switch to a new state and allowed-IP list
    pub async fn set_state(
        &self,
        state: BackendState,
        allowed_ips: &[String],
    ) -> Result<(), BackendError> {
        let interfaces = self.applied.lock().interfaces.clone();
        apply(&render_ruleset(state, allowed_ips, &interfaces)).await?;

        let mut applied = self.applied.lock();
        applied.state = state;
        applied.allowed_ips = allowed_ips.to_vec();
        log::info!("Backend state is now {}", state);
        Ok(())
    }

    /// Record a tunnel interface coming up or going down and refresh the rules
    pub async fn set_interface(&self, interface: &str, present: bool) -> Result<(), BackendError> {
        let (state, allowed_ips, interfaces) = {
            let mut applied = self.applied.lock();
            applied.interfaces.retain(|i| i != interface);
            if present {
                applied.interfaces.push(interface.to_string());
            }
            (
                applied.state,
                applied.allowed_ips.clone(),
                applied.interfaces.clone(),
            )
        };

        if state == BackendState::KillSwitchActive {
            apply(&render_ruleset(state, &allowed_ips, &interfaces)).await?;
        }
        Ok(())
    }
}

async fn apply(ruleset: &str) -> Result<(), BackendError> {
    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BackendError::Firewall(format!("Failed to execute nft: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(ruleset.as_bytes())
            .await
            .map_err(|e| BackendError::Firewall(format!("Failed to feed nft: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BackendError::Firewall(format!("nft did not finish: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::Firewall(stderr.trim().to_string()));
    }
    Ok(())
}
