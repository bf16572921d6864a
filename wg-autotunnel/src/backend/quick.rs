// wg-quick style tunnel driver

//! Shared driver for `wg-quick` and `awg-quick`
//!
//! Both backends render the tunnel text into `<run_dir>/<iface>.conf`, hand
//! the file to the quick tool and read statistics over the WireGuard
//! configuration API.

use crate::error::BackendError;
use crate::types::{PeerStatistics, TunnelStatistics};
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use wireguard_control::{Backend, Device, InterfaceName};

use super::validate_interface_name;

/// Runs one quick tool against rendered config files
pub(crate) struct QuickDriver {
    program: &'static str,
    env: Vec<(&'static str, &'static str)>,
    run_dir: PathBuf,
    wg_backend: Backend,
}

impl QuickDriver {
    pub(crate) fn new(
        program: &'static str,
        env: Vec<(&'static str, &'static str)>,
        run_dir: PathBuf,
        wg_backend: Backend,
    ) -> Self {
        Self {
            program,
            env,
            run_dir,
            wg_backend,
        }
    }

    fn config_path(&self, interface: &str) -> PathBuf {
        self.run_dir.join(format!("{}.conf", interface))
    }

    /// Write the config text where the quick tool expects it (mode 0600)
    fn render(&self, interface: &str, text: &str) -> Result<PathBuf, BackendError> {
        fs::create_dir_all(&self.run_dir).map_err(|e| {
            BackendError::Command(format!("Failed to create {:?}: {}", self.run_dir, e))
        })?;

        let path = self.config_path(interface);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| BackendError::Command(format!("Failed to write {:?}: {}", path, e)))?;
        file.write_all(text.as_bytes())
            .map_err(|e| BackendError::Command(format!("Failed to write {:?}: {}", path, e)))?;

        Ok(path)
    }

    async fn run(&self, action: &str, path: &Path) -> Result<std::process::Output, BackendError> {
        Command::new(self.program)
            .arg(action)
            .arg(path)
            .envs(self.env.iter().copied())
            .output()
            .await
            .map_err(|e| {
                BackendError::Command(format!("Failed to execute {} {}: {}", self.program, action, e))
            })
    }

    /// Bring up the interface from the given config text
    pub(crate) async fn bring_up(&self, interface: &str, text: &str) -> Result<(), BackendError> {
        validate_interface_name(interface)?;
        if text.trim().is_empty() {
            return Err(BackendError::InvalidConfig(
                "tunnel configuration is empty".to_string(),
            ));
        }

        let path = self.render(interface, text)?;
        log::info!("Bringing up {} with {}", interface, self.program);

        let output = self.run("up", &path).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::from_quick_stderr(&stderr));
        }

        log::info!("Interface {} is up", interface);
        Ok(())
    }

    /// Bring down the interface
    pub(crate) async fn bring_down(&self, interface: &str) -> Result<(), BackendError> {
        validate_interface_name(interface)?;
        let path = self.config_path(interface);
        log::info!("Bringing down {} with {}", interface, self.program);

        let output = self.run("down", &path).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Don't fail if interface is already down
            if !stderr.contains("is not a WireGuard interface") {
                return Err(BackendError::from_quick_stderr(&stderr));
            }
        }

        if let Err(e) = fs::remove_file(&path) {
            log::debug!("Could not remove {:?}: {}", path, e);
        }

        log::info!("Interface {} is down", interface);
        Ok(())
    }

    /// Per-peer statistics over the configuration API
    pub(crate) async fn statistics(&self, interface: &str) -> Result<TunnelStatistics, BackendError> {
        let iface_name: InterfaceName = interface
            .parse()
            .map_err(|_| BackendError::InvalidConfig(format!("Invalid interface name: {}", interface)))?;
        let backend = self.wg_backend;

        // The configuration API is synchronous
        tokio::task::spawn_blocking(move || {
            let device = Device::get(&iface_name, backend)
                .map_err(|e| BackendError::Command(format!("Failed to get device info: {}", e)))?;

            let peers = device
                .peers
                .into_iter()
                .map(|peer| PeerStatistics {
                    public_key: peer.config.public_key.to_base64(),
                    rx_bytes: peer.stats.rx_bytes,
                    tx_bytes: peer.stats.tx_bytes,
                    last_handshake: peer.stats.last_handshake_time,
                })
                .collect();

            Ok(TunnelStatistics { peers })
        })
        .await
        .map_err(|e| BackendError::Command(format!("Statistics task panicked: {}", e)))?
    }

    /// Interfaces the configuration API knows about
    pub(crate) async fn interfaces(&self) -> Result<Vec<String>, BackendError> {
        let backend = self.wg_backend;
        tokio::task::spawn_blocking(move || {
            Device::list(backend)
                .map(|names| {
                    names
                        .iter()
                        .map(|name| name.as_str_lossy().to_string())
                        .collect()
                })
                .map_err(|e| BackendError::Command(format!("Failed to list interfaces: {}", e)))
        })
        .await
        .map_err(|e| BackendError::Command(format!("Interface listing task panicked: {}", e)))?
    }
}
