//! 基于 NetworkManager 的本地链路
//!
//! 发送端在共享模式下开热点，接收端作为普通客户端连入，
//! 组主地址取自客户端连接的网关。

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use tokio::sync::{Mutex, OnceCell};
use zbus::zvariant::OwnedObjectPath;

use super::nm_dbus::{NmClient, Profile};
use super::{GroupInfo, LinkCredentials, LocalLink};

const SSID_PREFIX: &str = "DIRECT-";
const CREDENTIAL_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const FALLBACK_MAC: &str = "02:00:00:00:00:00";
/// 外层由协商器限时，这里只防止轮询无限进行
const ACTIVATION_LIMIT: Duration = Duration::from_secs(30);

struct ActiveLink {
    connection: OwnedObjectPath,
    active: OwnedObjectPath,
}

pub struct NmLocalLink {
    interface: String,
    use_5ghz: bool,
    client: OnceCell<NmClient>,
    current: Mutex<Option<ActiveLink>>,
}

impl NmLocalLink {
    /// `interface` 为空时使用第一个 WiFi 设备
    pub fn new(interface: impl Into<String>, use_5ghz: bool) -> Self {
        Self {
            interface: interface.into(),
            use_5ghz,
            client: OnceCell::new(),
            current: Mutex::new(None),
        }
    }

    async fn client(&self) -> anyhow::Result<&NmClient> {
        self.client.get_or_try_init(NmClient::new).await
    }

    async fn bring_up(&self, profile: &Profile) -> anyhow::Result<(OwnedObjectPath, String)> {
        let client = self.client().await?;
        let device = client.wifi_device(&self.interface).await?;

        // 同一时刻只保留一条链路
        self.remove_group().await?;

        let (connection, active) = client.activate(profile, &device).await?;
        let active_path = active.clone();
        *self.current.lock().await = Some(ActiveLink { connection, active });

        client
            .wait_until_active(&active_path, ACTIVATION_LIMIT)
            .await?;
        Ok((active_path, device.hw_address))
    }
}

#[async_trait]
impl LocalLink for NmLocalLink {
    async fn create_group(&self) -> anyhow::Result<GroupInfo> {
        let ssid = format!("{SSID_PREFIX}{}", random_token(8));
        let psk = random_token(8);
        let band = if self.use_5ghz { "a" } else { "bg" };

        let profile = Profile::Hotspot {
            ssid: ssid.clone(),
            psk: psk.clone(),
            band,
        };
        let (_, hw_address) = self
            .bring_up(&profile)
            .await
            .context("Failed to start hotspot")?;

        let mac = match hw_address.trim() {
            "" => FALLBACK_MAC.to_string(),
            mac => mac.to_uppercase(),
        };
        info!("Hotspot {} is up (band {})", ssid, band);
        Ok(GroupInfo { ssid, psk, mac })
    }

    async fn join_group(&self, credentials: &LinkCredentials) -> anyhow::Result<IpAddr> {
        let profile = Profile::Client {
            ssid: credentials.ssid.clone(),
            psk: credentials.psk.clone(),
        };
        let (active, _) = self
            .bring_up(&profile)
            .await
            .with_context(|| format!("Failed to join {}", credentials.ssid))?;

        let gateway = self.client().await?.gateway(&active, ACTIVATION_LIMIT).await?;
        info!("Joined {}, group owner at {}", credentials.ssid, gateway);
        Ok(IpAddr::V4(gateway))
    }

    async fn hardware_address(&self) -> Option<String> {
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                debug!("NetworkManager unavailable: {:#}", e);
                return None;
            }
        };
        match client.wifi_device(&self.interface).await {
            Ok(device) => Some(device.hw_address).filter(|mac| !mac.trim().is_empty()),
            Err(e) => {
                debug!("No WiFi device for hardware address: {:#}", e);
                None
            }
        }
    }

    async fn remove_group(&self) -> anyhow::Result<()> {
        let Some(link) = self.current.lock().await.take() else {
            return Ok(());
        };
        let client = self.client().await?;

        if let Err(e) = client.deactivate(&link.active).await {
            debug!("Deactivate skipped: {:#}", e);
        }
        client.delete(&link.connection).await
    }
}

fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(CREDENTIAL_CHARS[rng.gen_range(0..CREDENTIAL_CHARS.len())]))
        .collect()
}
