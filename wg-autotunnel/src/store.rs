// Settings and tunnel persistence

//! Settings and tunnel stores
//!
//! The engine consumes user policy and the tunnel catalog through the
//! [`SettingsStore`] and [`TunnelStore`] traits. Both expose their latest
//! value as a `watch` channel. [`Store`] implements both on top of a single
//! TOML file, or purely in memory.

use crate::types::{AppSettings, TunnelConfig, TunnelId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// Source of the global user policy
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Stream of the latest settings
    fn subscribe(&self) -> watch::Receiver<AppSettings>;

    fn get(&self) -> AppSettings;

    async fn save(&self, settings: AppSettings) -> Result<()>;
}

/// Source of the tunnel catalog
#[async_trait]
pub trait TunnelStore: Send + Sync {
    /// Stream of the latest catalog
    fn subscribe(&self) -> watch::Receiver<Vec<TunnelConfig>>;

    fn get_all(&self) -> Vec<TunnelConfig>;

    /// Tunnels flagged as "should be running"
    fn get_active(&self) -> Vec<TunnelConfig> {
        self.get_all().into_iter().filter(|t| t.is_active).collect()
    }

    /// Insert or replace a tunnel
    async fn save(&self, tunnel: TunnelConfig) -> Result<()>;

    /// Remove a tunnel from the catalog
    async fn delete(&self, id: TunnelId) -> Result<()>;

    /// Persist only the "should be running" flag
    async fn set_active(&self, id: TunnelId, active: bool) -> Result<()>;

    /// Make `id` the primary tunnel (or clear the flag everywhere)
    async fn update_primary(&self, id: Option<TunnelId>) -> Result<()>;

    async fn update_mobile_data(&self, id: Option<TunnelId>) -> Result<()>;

    async fn update_ethernet(&self, id: Option<TunnelId>) -> Result<()>;
}

/// On-disk layout of the store file
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    settings: AppSettings,
    #[serde(default, rename = "tunnel")]
    tunnels: Vec<TunnelConfig>,
}

/// TOML-backed settings and tunnel store
pub struct Store {
    path: Option<PathBuf>,
    settings: watch::Sender<AppSettings>,
    tunnels: watch::Sender<Vec<TunnelConfig>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Store {
    /// Open the store file, starting empty when it does not exist yet
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            read_store_file(&path)?
        } else {
            log::info!("Store file {:?} does not exist, starting empty", path);
            StoreFile::default()
        };

        let store = Self::from_parts(Some(path), file.settings, file.tunnels);
        Ok(store)
    }

    /// Store that never touches the filesystem
    pub fn in_memory(settings: AppSettings, tunnels: Vec<TunnelConfig>) -> Self {
        Self::from_parts(None, settings, tunnels)
    }

    fn from_parts(path: Option<PathBuf>, settings: AppSettings, tunnels: Vec<TunnelConfig>) -> Self {
        let (settings, _) = watch::channel(settings);
        let (tunnels, _) = watch::channel(tunnels);
        Self {
            path,
            settings,
            tunnels,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Re-read the store file and publish whatever changed
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = read_store_file(path)?;

        self.settings.send_if_modified(|current| replace_if_changed(current, file.settings));
        self.tunnels.send_if_modified(|current| replace_if_changed(current, file.tunnels));
        log::info!("Reloaded store from {:?}", path);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;

        let file = StoreFile {
            settings: self.settings.borrow().clone(),
            tunnels: self.tunnels.borrow().clone(),
        };
        let contents = toml::to_string(&file).context("Failed to serialize store")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create store directory")?;
        }
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents).context("Failed to write store file")?;
        fs::rename(&tmp, path).context("Failed to replace store file")?;
        Ok(())
    }

    /// Apply a change to the catalog, publishing only when something changed
    async fn modify_tunnels<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<TunnelConfig>) -> bool,
    {
        if self.tunnels.send_if_modified(f) {
            self.persist().await?;
        }
        Ok(())
    }

    async fn set_exclusive_flag(
        &self,
        id: Option<TunnelId>,
        flag: fn(&mut TunnelConfig) -> &mut bool,
    ) -> Result<()> {
        self.modify_tunnels(|tunnels| {
            let mut changed = false;
            for tunnel in tunnels.iter_mut() {
                let wanted = Some(tunnel.id) == id;
                let slot = flag(tunnel);
                if *slot != wanted {
                    *slot = wanted;
                    changed = true;
                }
            }
            changed
        })
        .await
    }
}

fn read_store_file(path: &Path) -> Result<StoreFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read store file {:?}", path))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse store file {:?}", path))
}

fn replace_if_changed<T: PartialEq>(current: &mut T, new: T) -> bool {
    if *current == new {
        false
    } else {
        *current = new;
        true
    }
}

#[async_trait]
impl SettingsStore for Store {
    fn subscribe(&self) -> watch::Receiver<AppSettings> {
        self.settings.subscribe()
    }

    fn get(&self) -> AppSettings {
        self.settings.borrow().clone()
    }

    async fn save(&self, settings: AppSettings) -> Result<()> {
        if self
            .settings
            .send_if_modified(|current| replace_if_changed(current, settings))
        {
            self.persist().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelStore for Store {
    fn subscribe(&self) -> watch::Receiver<Vec<TunnelConfig>> {
        self.tunnels.subscribe()
    }

    fn get_all(&self) -> Vec<TunnelConfig> {
        self.tunnels.borrow().clone()
    }

    async fn save(&self, tunnel: TunnelConfig) -> Result<()> {
        self.modify_tunnels(|tunnels| match tunnels.iter_mut().find(|t| t.id == tunnel.id) {
            Some(existing) => replace_if_changed(existing, tunnel),
            None => {
                tunnels.push(tunnel);
                true
            }
        })
        .await
    }

    async fn delete(&self, id: TunnelId) -> Result<()> {
        self.modify_tunnels(|tunnels| {
            let before = tunnels.len();
            tunnels.retain(|t| t.id != id);
            tunnels.len() != before
        })
        .await
    }

    async fn set_active(&self, id: TunnelId, active: bool) -> Result<()> {
        self.modify_tunnels(|tunnels| match tunnels.iter_mut().find(|t| t.id == id) {
            Some(tunnel) if tunnel.is_active != active => {
                tunnel.is_active = active;
                true
            }
            _ => false,
        })
        .await
    }

    async fn update_primary(&self, id: Option<TunnelId>) -> Result<()> {
        self.set_exclusive_flag(id, |t| &mut t.is_primary).await
    }

    async fn update_mobile_data(&self, id: Option<TunnelId>) -> Result<()> {
        self.set_exclusive_flag(id, |t| &mut t.is_mobile_data_tunnel)
            .await
    }

    async fn update_ethernet(&self, id: Option<TunnelId>) -> Result<()> {
        self.set_exclusive_flag(id, |t| &mut t.is_ethernet_tunnel).await
    }
}
