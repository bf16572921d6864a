// WireGuard Auto-Tunnel Library
// Shared modules for daemon and tests

//! WireGuard Auto-Tunnel Library
//!
//! This library decides when WireGuard tunnels should run, based on the
//! current network and the user's policy, and keeps them running: it brings
//! tunnels up and down, supervises them with background jobs, and holds the
//! kill switch.
//!
//! # Main Components
//!
//! - [`evaluator`]: Pure decision rules mapping conditions to an action
//! - [`orchestrator`]: Debounced evaluation loop dispatching those actions
//! - [`registry`]: Entry point for starting, stopping and bouncing tunnels
//! - [`tunnel`]: Per-tunnel lifecycle controller and its jobs
//! - [`ping`]: Ping watchdog
//! - [`kill_switch`]: Backend state and the hostname-endpoint exception
//! - [`backend`]: Kernel and userspace WireGuard adapters
//! - [`network_monitor`]: Connectivity detection via D-Bus
//! - [`store`]: Settings and tunnel persistence
//! - [`service`]: Wiring of all of the above

pub mod backend;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod kill_switch;
pub mod network_monitor;
pub mod orchestrator;
pub mod ping;
pub mod process_host;
pub mod registry;
pub mod service;
pub mod store;
pub mod tunnel;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
