//! 本地直连网络
//!
//! 发送端建立热点（组），接收端凭 BLE 收到的凭据加入。
//! 具体实现藏在 [`LocalLink`] 后面：生产环境走 NetworkManager，测试用回环实现。
//!
//! 每个成功建立的链路由一个 [`LinkSession`] 持有，拆除恰好执行一次。

pub mod nm_dbus;
pub mod nm_link;

#[cfg(test)]
mod tests;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

pub use nm_link::NmLocalLink;

/// 通过 GATT 写入的连接凭据
///
/// 携带 `key` 时 `ssid`/`psk`/`mac` 为密文；没有 `key` 时视为明文（重传或旧版对端）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub ssid: String,
    pub psk: String,
    pub mac: String,
    pub port: i32,
    /// 发送端临时公钥 (Base64 SPKI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl LinkCredentials {
    pub fn new(group: &GroupInfo, port: u16) -> Self {
        Self {
            id: None,
            ssid: group.ssid.clone(),
            psk: group.psk.clone(),
            mac: group.mac.clone(),
            port: i32::from(port),
            key: None,
        }
    }
}

/// 新建组的信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub ssid: String,
    pub psk: String,
    pub mac: String,
}

/// 本地直连网络后端
#[async_trait]
pub trait LocalLink: Send + Sync {
    /// 发送端：建立组
    async fn create_group(&self) -> anyhow::Result<GroupInfo>;

    /// 接收端：加入组，返回发送端（组主）的地址
    async fn join_group(&self, credentials: &LinkCredentials) -> anyhow::Result<IpAddr>;

    /// 拆除本端建立或加入的组
    async fn remove_group(&self) -> anyhow::Result<()>;

    /// 本端网卡的硬件地址，后端不知道时返回 `None`
    async fn hardware_address(&self) -> Option<String> {
        None
    }
}

/// 带超时的链路建立
pub struct LinkNegotiator {
    link: Arc<dyn LocalLink>,
}

impl LinkNegotiator {
    pub fn new(link: Arc<dyn LocalLink>) -> Self {
        Self { link }
    }

    /// 建立组
    pub async fn form(&self, timeout: Duration) -> Result<(GroupInfo, LinkSession), TransferError> {
        info!("Forming local link");
        match tokio::time::timeout(timeout, self.link.create_group()).await {
            Ok(Ok(group)) => {
                info!("Local link up: ssid={}", group.ssid);
                Ok((group, LinkSession::new(self.link.clone(), None)))
            }
            Ok(Err(e)) => {
                self.abandon().await;
                Err(TransferError::Link(format!("{e:#}")))
            }
            Err(_) => {
                self.abandon().await;
                Err(TransferError::Timeout {
                    stage: "forming local link",
                    after: timeout,
                })
            }
        }
    }

    /// 加入对端的组
    pub async fn connect(
        &self,
        credentials: &LinkCredentials,
        timeout: Duration,
    ) -> Result<LinkSession, TransferError> {
        info!("Joining local link: ssid={}", credentials.ssid);
        match tokio::time::timeout(timeout, self.link.join_group(credentials)).await {
            Ok(Ok(peer)) => {
                info!("Joined local link, peer at {}", peer);
                Ok(LinkSession::new(self.link.clone(), Some(peer)))
            }
            Ok(Err(e)) => {
                self.abandon().await;
                Err(TransferError::Link(format!("{e:#}")))
            }
            Err(_) => {
                self.abandon().await;
                Err(TransferError::Timeout {
                    stage: "joining local link",
                    after: timeout,
                })
            }
        }
    }

    async fn abandon(&self) {
        warn!("Local link setup failed, tearing down");
        teardown(self.link.as_ref()).await;
    }
}

/// 已建立的链路
pub struct LinkSession {
    link: Option<Arc<dyn LocalLink>>,
    peer: Option<IpAddr>,
}

impl LinkSession {
    fn new(link: Arc<dyn LocalLink>, peer: Option<IpAddr>) -> Self {
        Self {
            link: Some(link),
            peer,
        }
    }

    /// 对端地址，仅接收端有
    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.peer
    }

    /// 拆除链路
    pub async fn release(mut self) {
        if let Some(link) = self.link.take() {
            teardown(link.as_ref()).await;
        }
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Link session dropped without release, scheduling teardown");
                handle.spawn(async move { teardown(link.as_ref()).await });
            }
            Err(_) => warn!("Link session dropped outside a runtime, link left up"),
        }
    }
}

async fn teardown(link: &dyn LocalLink) {
    match link.remove_group().await {
        Ok(()) => debug!("Local link removed"),
        Err(e) => warn!("Failed to remove local link: {:#}", e),
    }
}
