//! NetworkManager D-Bus 客户端
//!
//! 只覆盖建立热点、加入网络和清理所需的接口。

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::ops::Deref;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};
use zbus::Connection;
use zbus::proxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    fn activate_connection(
        &self,
        connection: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
        specific_object: &ObjectPath<'_>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn deactivate_connection(&self, active_connection: &ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> zbus::Result<String>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager/Settings"
)]
trait NmSettings {
    /// 临时连接，不写入磁盘
    fn add_connection_unsaved(
        &self,
        connection: HashMap<&str, HashMap<&str, Value<'_>>>,
    ) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings.Connection",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmConnection {
    fn delete(&self) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Device",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmDevice {
    #[zbus(property)]
    fn interface(&self) -> zbus::Result<String>;

    /// 2 = WiFi
    #[zbus(property)]
    fn device_type(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn hw_address(&self) -> zbus::Result<String>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Connection.Active",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmActiveConnection {
    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn ip4_config(&self) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.IP4Config",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmIp4Config {
    #[zbus(property)]
    fn address_data(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;

    #[zbus(property)]
    fn gateway(&self) -> zbus::Result<String>;
}

const DEVICE_TYPE_WIFI: u32 = 2;

/// NMActiveConnectionState
mod active_state {
    pub const ACTIVATED: u32 = 2;
    pub const DEACTIVATING: u32 = 3;
    pub const DEACTIVATED: u32 = 4;
}

const POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct WifiDevice {
    pub path: OwnedObjectPath,
    pub interface: String,
    pub hw_address: String,
}

/// 连接配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    /// 共享模式热点，由 NetworkManager 提供 DHCP
    Hotspot { ssid: String, psk: String, band: &'static str },
    /// 普通 WPA-PSK 客户端连接
    Client { ssid: String, psk: String },
}

impl Profile {
    fn ssid(&self) -> &str {
        match self {
            Profile::Hotspot { ssid, .. } | Profile::Client { ssid, .. } => ssid,
        }
    }

    fn to_settings<'a>(&'a self, interface: &'a str) -> HashMap<&'a str, HashMap<&'a str, Value<'a>>> {
        let (mode, ipv4, psk) = match self {
            Profile::Hotspot { psk, .. } => ("ap", "shared", psk),
            Profile::Client { psk, .. } => ("infrastructure", "auto", psk),
        };

        let mut wireless = HashMap::from([
            ("ssid", Value::Array(self.ssid().as_bytes().into())),
            ("mode", Value::from(mode)),
        ]);
        if let Profile::Hotspot { band, .. } = self {
            wireless.insert("band", Value::from(*band));
        }

        HashMap::from([
            (
                "connection",
                HashMap::from([
                    ("id", Value::from(format!("proxdrop-{}", self.ssid()))),
                    ("type", Value::from("802-11-wireless")),
                    ("autoconnect", Value::from(false)),
                    ("interface-name", Value::from(interface)),
                ]),
            ),
            ("802-11-wireless", wireless),
            (
                "802-11-wireless-security",
                HashMap::from([
                    ("key-mgmt", Value::from("wpa-psk")),
                    ("psk", Value::from(psk.as_str())),
                ]),
            ),
            ("ipv4", HashMap::from([("method", Value::from(ipv4))])),
            ("ipv6", HashMap::from([("method", Value::from("ignore"))])),
        ])
    }
}

pub struct NmClient {
    connection: Connection,
}

impl NmClient {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;

        let nm = NetworkManagerProxy::new(&connection).await?;
        let version = nm.version().await.context("NetworkManager not available")?;
        info!("Connected to NetworkManager {}", version);

        Ok(Self { connection })
    }

    /// 按接口名查找 WiFi 设备，接口名为空时取第一个
    pub async fn wifi_device(&self, interface: &str) -> Result<WifiDevice> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;

        for path in nm.get_devices().await? {
            let device = NmDeviceProxy::builder(&self.connection)
                .path(path.clone())?
                .build()
                .await?;
            if device.device_type().await.unwrap_or(0) != DEVICE_TYPE_WIFI {
                continue;
            }
            let name = device.interface().await.unwrap_or_default();
            if interface.is_empty() || name == interface {
                return Ok(WifiDevice {
                    path,
                    interface: name,
                    hw_address: device.hw_address().await.unwrap_or_default(),
                });
            }
        }

        match interface {
            "" => bail!("No WiFi device found"),
            name => bail!("WiFi device {} not found", name),
        }
    }

    /// 添加连接并在指定设备上激活，返回 (连接, 活动连接)
    pub async fn activate(
        &self,
        profile: &Profile,
        device: &WifiDevice,
    ) -> Result<(OwnedObjectPath, OwnedObjectPath)> {
        let settings = NmSettingsProxy::new(&self.connection).await?;
        let conn = settings
            .add_connection_unsaved(profile.to_settings(&device.interface))
            .await
            .context("Failed to add connection")?;
        debug!("Added connection {:?} for ssid {}", conn, profile.ssid());

        let nm = NetworkManagerProxy::new(&self.connection).await?;
        let active = match nm
            .activate_connection(
                &conn,
                &device.path,
                &ObjectPath::from_static_str_unchecked("/"),
            )
            .await
        {
            Ok(active) => active,
            Err(e) => {
                let _ = self.delete(&conn).await;
                return Err(anyhow!(e).context("Failed to activate connection"));
            }
        };

        Ok((conn, active))
    }

    /// 轮询直到连接进入 ACTIVATED
    pub async fn wait_until_active(&self, active: &ObjectPath<'_>, timeout: Duration) -> Result<()> {
        let proxy = NmActiveConnectionProxy::builder(&self.connection)
            .path(active)?
            .build()
            .await?;

        tokio::time::timeout(timeout, async {
            loop {
                match proxy.state().await.unwrap_or(0) {
                    active_state::ACTIVATED => return Ok(()),
                    state @ (active_state::DEACTIVATING | active_state::DEACTIVATED) => {
                        bail!("Connection failed to activate (state {})", state)
                    }
                    _ => tokio::time::sleep(POLL_INTERVAL).await,
                }
            }
        })
        .await
        .map_err(|_| anyhow!("Timed out waiting for connection activation"))?
    }

    /// 活动连接的网关；没有网关时取本机地址所在网段的 .1
    pub async fn gateway(&self, active: &ObjectPath<'_>, timeout: Duration) -> Result<Ipv4Addr> {
        let proxy = NmActiveConnectionProxy::builder(&self.connection)
            .path(active)?
            .build()
            .await?;

        tokio::time::timeout(timeout, async {
            loop {
                if let Ok(path) = proxy.ip4_config().await
                    && path.as_str() != "/"
                    && let Some(addr) = self.read_gateway(&path).await?
                {
                    return Ok(addr);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| anyhow!("Timed out waiting for IPv4 configuration"))?
    }

    async fn read_gateway(&self, path: &ObjectPath<'_>) -> Result<Option<Ipv4Addr>> {
        let ip4 = NmIp4ConfigProxy::builder(&self.connection)
            .path(path)?
            .build()
            .await?;

        if let Ok(gateway) = ip4.gateway().await
            && let Ok(addr) = gateway.parse::<Ipv4Addr>()
        {
            return Ok(Some(addr));
        }

        let addresses = ip4.address_data().await.unwrap_or_default();
        let local = addresses.iter().find_map(|entry| match entry.get("address").map(Deref::deref) {
            Some(Value::Str(s)) => s.as_str().parse::<Ipv4Addr>().ok(),
            _ => None,
        });
        Ok(local.map(|ip| {
            let [a, b, c, _] = ip.octets();
            Ipv4Addr::new(a, b, c, 1)
        }))
    }

    pub async fn deactivate(&self, active: &ObjectPath<'_>) -> Result<()> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        nm.deactivate_connection(active)
            .await
            .context("Failed to deactivate connection")
    }

    pub async fn delete(&self, conn: &ObjectPath<'_>) -> Result<()> {
        let proxy = NmConnectionProxy::builder(&self.connection)
            .path(conn)?
            .build()
            .await?;
        proxy.delete().await.context("Failed to delete connection")?;
        debug!("Deleted connection {:?}", conn);
        Ok(())
    }
}
