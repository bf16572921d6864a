// NetworkManager connectivity monitor via D-Bus

//! Connectivity detection via D-Bus
//!
//! Follows NetworkManager's active connections and publishes a
//! [`NetworkSnapshot`] (which transports are up, and the Wi-Fi SSID) every
//! time they change.

use crate::types::NetworkSnapshot;
use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use zbus::zvariant::OwnedObjectPath;
use zbus::{proxy, Connection};

/// NM_ACTIVE_CONNECTION_STATE_ACTIVATED
const STATE_ACTIVATED: u32 = 2;

/// D-Bus proxy for NetworkManager
#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    /// Get the primary connection object path
    #[zbus(property)]
    fn primary_connection(&self) -> zbus::Result<OwnedObjectPath>;

    /// Get all active connections
    #[zbus(property)]
    fn active_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

/// D-Bus proxy for active connection
#[proxy(
    interface = "org.freedesktop.NetworkManager.Connection.Active",
    default_service = "org.freedesktop.NetworkManager"
)]
trait ActiveConnection {
    /// Get the connection type
    #[zbus(property, name = "Type")]
    fn connection_type(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    /// Get the devices associated with this connection
    #[zbus(property)]
    fn devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

/// D-Bus proxy for wireless device
#[proxy(
    interface = "org.freedesktop.NetworkManager.Device.Wireless",
    default_service = "org.freedesktop.NetworkManager"
)]
trait WirelessDevice {
    /// Get the active access point object path
    #[zbus(property)]
    fn active_access_point(&self) -> zbus::Result<OwnedObjectPath>;
}

/// D-Bus proxy for access point
#[proxy(
    interface = "org.freedesktop.NetworkManager.AccessPoint",
    default_service = "org.freedesktop.NetworkManager"
)]
trait AccessPoint {
    /// Get the SSID as raw bytes
    #[zbus(property)]
    fn ssid(&self) -> zbus::Result<Vec<u8>>;
}

/// Transport of an active connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Wifi { ssid: Option<String> },
    Ethernet,
    MobileData,
    Other,
}

impl Transport {
    /// Map a NetworkManager connection type
    pub fn from_connection_type(kind: &str) -> Self {
        match kind {
            "802-11-wireless" => Transport::Wifi { ssid: None },
            "802-3-ethernet" => Transport::Ethernet,
            "gsm" | "cdma" => Transport::MobileData,
            _ => Transport::Other,
        }
    }
}

/// Fold the transports of all activated connections into a snapshot
pub fn snapshot_from(transports: &[Transport]) -> NetworkSnapshot {
    let mut snapshot = NetworkSnapshot::default();
    for transport in transports {
        match transport {
            Transport::Wifi { ssid } => {
                snapshot.wifi_connected = true;
                if snapshot.ssid.is_none() {
                    snapshot.ssid = ssid.clone();
                }
            }
            Transport::Ethernet => snapshot.ethernet_connected = true,
            Transport::MobileData => snapshot.mobile_data_connected = true,
            Transport::Other => {}
        }
    }
    snapshot
}

/// Connectivity monitor
pub struct ConnectivityMonitor {
    connection: Connection,
}

impl ConnectivityMonitor {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;

        Ok(Self { connection })
    }

    /// Read the current connectivity
    pub async fn snapshot(&self) -> Result<NetworkSnapshot> {
        let nm = NetworkManagerProxy::new(&self.connection)
            .await
            .context("Failed to create NetworkManager proxy")?;

        let mut transports = Vec::new();
        for path in nm.active_connections().await? {
            match self.transport(&path).await {
                Ok(Some(transport)) => transports.push(transport),
                Ok(None) => {}
                // Connections come and go while we walk them
                Err(e) => log::debug!("Skipping active connection {}: {}", path.as_str(), e),
            }
        }

        Ok(snapshot_from(&transports))
    }

    async fn transport(&self, path: &OwnedObjectPath) -> Result<Option<Transport>> {
        let active_conn = ActiveConnectionProxy::builder(&self.connection)
            .path(path)?
            .build()
            .await?;

        if active_conn.state().await? != STATE_ACTIVATED {
            return Ok(None);
        }

        let transport = match Transport::from_connection_type(&active_conn.connection_type().await?) {
            Transport::Wifi { .. } => Transport::Wifi {
                ssid: self.ssid(&active_conn).await?,
            },
            other => other,
        };
        Ok(Some(transport))
    }

    async fn ssid(&self, active_conn: &ActiveConnectionProxy<'_>) -> Result<Option<String>> {
        let devices = active_conn.devices().await?;
        let Some(device) = devices.first() else {
            return Ok(None);
        };

        let wireless_dev = WirelessDeviceProxy::builder(&self.connection)
            .path(device)?
            .build()
            .await?;

        let ap_path = wireless_dev.active_access_point().await?;
        if ap_path.as_str() == "/" {
            return Ok(None);
        }

        let ap = AccessPointProxy::builder(&self.connection)
            .path(&ap_path)?
            .build()
            .await?;

        let ssid_bytes = ap.ssid().await?;
        let ssid = String::from_utf8(ssid_bytes).context("Invalid UTF-8 in SSID")?;
        Ok(Some(ssid))
    }

    /// Publish connectivity changes until the D-Bus stream ends
    pub async fn monitor(&self, tx: watch::Sender<NetworkSnapshot>) -> Result<()> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        let active = nm.receive_active_connections_changed().await.map(|_| ());
        let primary = nm.receive_primary_connection_changed().await.map(|_| ());
        let mut changes = stream::select(active, primary);

        publish(&tx, self.snapshot().await?);
        log::info!("Starting connectivity monitor");

        while changes.next().await.is_some() {
            match self.snapshot().await {
                Ok(snapshot) => publish(&tx, snapshot),
                Err(e) => {
                    log::warn!("Failed to read connectivity: {}", e);
                    continue;
                }
            }
        }

        Ok(())
    }
}

fn publish(tx: &watch::Sender<NetworkSnapshot>, snapshot: NetworkSnapshot) {
    tx.send_if_modified(|current| {
        if *current == snapshot {
            return false;
        }
        log::info!(
            "Connectivity: wifi={} ({}), ethernet={}, mobile={}",
            snapshot.wifi_connected,
            snapshot.ssid.as_deref().unwrap_or("-"),
            snapshot.ethernet_connected,
            snapshot.mobile_data_connected
        );
        *current = snapshot;
        true
    });
}
