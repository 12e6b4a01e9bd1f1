//! 集成测试共用的回环实现
//!
//! - [`LoopbackLink`]: 不碰网卡的直连网络，加入后对端地址为 127.0.0.1
//! - [`LoopbackChannel`]: 把 GATT 读写直接转发给进程内的 [`GattResponder`]
//! - [`TruncatingChannel`]: 同上，但让接收端经一层 TCP 转发连到发送端，
//!   下载响应在指定字节数处被掐断

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use proxdrop_core::ble::{BleError, CredentialChannel, DiscoveredPeer, GattResponder};
use proxdrop_core::config::TransferTimeouts;
use proxdrop_core::wifi::{GroupInfo, LinkCredentials, LocalLink};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// 单次 GATT 写入的分段大小
const MTU_PAYLOAD: usize = 20;

#[derive(Default)]
pub struct LoopbackLink {
    pub created: AtomicUsize,
    pub joined: AtomicUsize,
    pub removed: AtomicUsize,
}

impl LoopbackLink {
    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalLink for LoopbackLink {
    async fn create_group(&self) -> anyhow::Result<GroupInfo> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(GroupInfo {
            ssid: "DIRECT-loopback".to_string(),
            psk: "loop1234".to_string(),
            mac: "02:00:00:00:00:01".to_string(),
        })
    }

    async fn join_group(&self, _credentials: &LinkCredentials) -> anyhow::Result<IpAddr> {
        self.joined.fetch_add(1, Ordering::SeqCst);
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn remove_group(&self) -> anyhow::Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct LoopbackChannel {
    responder: Arc<GattResponder>,
}

impl LoopbackChannel {
    pub fn new(responder: Arc<GattResponder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl CredentialChannel for LoopbackChannel {
    async fn read_status(&self, _peer: &DiscoveredPeer) -> Result<Vec<u8>, BleError> {
        Ok(self.responder.read_status(0))
    }

    async fn write_credentials(&self, _peer: &DiscoveredPeer, payload: Vec<u8>) -> Result<(), BleError> {
        let chunks: Vec<&[u8]> = payload.chunks(MTU_PAYLOAD).collect();
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.into_iter().enumerate() {
            self.responder
                .handle_write("loopback", index * MTU_PAYLOAD, chunk, index != last)
                .map_err(|e| BleError::Protocol(e.to_string()))?;
        }
        Ok(())
    }
}

pub struct TruncatingChannel {
    inner: LoopbackChannel,
    cutoff: u64,
}

impl TruncatingChannel {
    /// `cutoff` 按下载响应的字节数计，包括 HTTP 头
    pub fn new(responder: Arc<GattResponder>, cutoff: u64) -> Self {
        Self {
            inner: LoopbackChannel::new(responder),
            cutoff,
        }
    }
}

#[async_trait]
impl CredentialChannel for TruncatingChannel {
    async fn read_status(&self, peer: &DiscoveredPeer) -> Result<Vec<u8>, BleError> {
        self.inner.read_status(peer).await
    }

    async fn write_credentials(&self, peer: &DiscoveredPeer, payload: Vec<u8>) -> Result<(), BleError> {
        let mut json: serde_json::Value =
            serde_json::from_slice(&payload).map_err(|e| BleError::Protocol(e.to_string()))?;
        let upstream = json["port"]
            .as_u64()
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| BleError::Protocol("credentials without port".to_string()))?;

        let relay = spawn_relay(upstream, self.cutoff).await;
        json["port"] = serde_json::Value::from(relay);
        let payload = serde_json::to_vec(&json).map_err(|e| BleError::Protocol(e.to_string()))?;
        self.inner.write_credentials(peer, payload).await
    }
}

async fn spawn_relay(upstream: u16, cutoff: u64) -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(relay(client, upstream, cutoff));
        }
    });
    port
}

async fn relay(mut client: TcpStream, upstream: u16, cutoff: u64) {
    let Ok(mut server) = TcpStream::connect((Ipv4Addr::LOCALHOST, upstream)).await else {
        return;
    };
    let mut head = vec![0u8; 4096];
    let n = match client.read(&mut head).await {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    if server.write_all(&head[..n]).await.is_err() {
        return;
    }

    if head[..n].starts_with(b"GET /download") {
        let mut limited = (&mut server).take(cutoff);
        let _ = tokio::io::copy(&mut limited, &mut client).await;
        // 两端随 drop 一起断开
    } else {
        let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
    }
}

pub fn peer() -> DiscoveredPeer {
    DiscoveredPeer {
        id: "ab12".to_string(),
        name: "Receiver".to_string(),
        brand_id: Some(1),
        supports_5ghz: true,
        address: "AA:BB:CC:DD:EE:FF".to_string(),
        rssi: Some(-50),
    }
}

pub fn fast_timeouts() -> TransferTimeouts {
    TransferTimeouts {
        link_ms: 5_000,
        negotiation_ms: 5_000,
        consent_ms: 5_000,
        stall_ms: 10_000,
    }
}

/// 测试用的临时目录，drop 时删除
pub struct TempDir(pub PathBuf);

impl TempDir {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!("proxdrop-{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
