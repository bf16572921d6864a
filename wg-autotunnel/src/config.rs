// Configuration file parser

//! Daemon configuration parsing and validation
//!
//! The daemon config only covers where things live and how the daemon
//! behaves. User policy and the tunnel catalog live in the store file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub ping: PingConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Settings and tunnel catalog
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Rendered tunnel configs and the state file
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store_path: default_store_path(),
            run_dir: default_run_dir(),
        }
    }
}

/// Ping watchdog options
#[derive(Debug, Deserialize, Clone)]
pub struct PingConfig {
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl PingConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/wg-autotunnel/store.toml")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/wg-autotunnel")
}

fn default_probe_timeout() -> u64 {
    5
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if !LOG_LEVELS.contains(&config.general.log_level.as_str()) {
        anyhow::bail!(
            "log_level must be one of {}, got '{}'",
            LOG_LEVELS.join(", "),
            config.general.log_level
        );
    }

    if config.general.store_path.as_os_str().is_empty() {
        anyhow::bail!("store_path cannot be empty");
    }

    // Tunnel configs are rendered here and handed to wg-quick by path
    if !config.general.run_dir.is_absolute() {
        anyhow::bail!(
            "run_dir must be an absolute path, got {:?}",
            config.general.run_dir
        );
    }

    if !(1..=60).contains(&config.ping.probe_timeout_secs) {
        anyhow::bail!(
            "probe_timeout_secs must be between 1 and 60, got {}",
            config.ping.probe_timeout_secs
        );
    }

    Ok(())
}
