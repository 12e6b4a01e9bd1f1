//! 设备发现
//!
//! 扫描后端（BlueZ 或测试用的假数据源）把原始广播放进队列，
//! 由唯一的消费任务解码、去重并维护可发现设备列表。
//! 列表快照通过 `watch` 通道发布，读取方不会看到半更新的状态。
//!
//! 同一 sender ID 只保留最新一条，原有位置不变。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::advertisement::Advertisement;
use super::client::BleError;
use crate::config::BrandId;

/// 后端上报的一条原始广播
#[derive(Debug, Clone, Default)]
pub struct RawBeacon {
    pub address: String,
    pub rssi: Option<i16>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// 广播事件来源
#[async_trait]
pub trait BeaconSource: Send + Sync {
    /// 开始扫描，返回事件队列；队列关闭表示扫描结束
    async fn start(&self) -> Result<mpsc::Receiver<RawBeacon>, BleError>;
}

/// 已发现的对端
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// sender ID，4 位小写十六进制
    pub id: String,
    pub name: String,
    pub brand_id: Option<u8>,
    pub supports_5ghz: bool,
    /// BLE 地址，用于 GATT 连接
    pub address: String,
    pub rssi: Option<i16>,
}

impl DiscoveredPeer {
    pub fn from_advertisement(adv: &Advertisement, address: String, rssi: Option<i16>) -> Self {
        Self {
            id: adv.sender_id_hex(),
            name: adv.name.clone(),
            brand_id: adv.brand_id,
            supports_5ghz: adv.supports_5ghz,
            address,
            rssi,
        }
    }

    pub fn brand(&self) -> Option<&'static str> {
        self.brand_id.and_then(|id| BrandId::from_id(id).label())
    }
}

pub struct DiscoveryScanner {
    peers: watch::Sender<Vec<DiscoveredPeer>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DiscoveryScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryScanner {
    pub fn new() -> Self {
        let (peers, _) = watch::channel(Vec::new());
        Self {
            peers,
            consumer: Mutex::new(None),
        }
    }

    /// 接入数据源并开始消费
    ///
    /// 启动失败只记录日志，设备列表保持为空。
    pub async fn attach(&self, source: &dyn BeaconSource) {
        self.detach();

        let mut events = match source.start().await {
            Ok(events) => events,
            Err(e) => {
                warn!("BLE scan unavailable: {}", e);
                return;
            }
        };

        info!("Discovery started");
        let peers = self.peers.clone();
        let consumer = tokio::spawn(async move {
            while let Some(beacon) = events.recv().await {
                let Some(adv) = Advertisement::decode(&beacon.service_data) else {
                    continue;
                };
                let peer = DiscoveredPeer::from_advertisement(&adv, beacon.address, beacon.rssi);
                peers.send_modify(|list| upsert(list, peer));
            }
            debug!("Beacon source closed");
        });

        if let Ok(mut slot) = self.consumer.lock() {
            *slot = Some(consumer);
        }
    }

    /// 停止消费并清空列表
    pub fn detach(&self) {
        let handle = self.consumer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            info!("Discovery stopped");
        }
        self.peers.send_replace(Vec::new());
    }

    pub fn is_scanning(&self) -> bool {
        self.consumer
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// 当前设备列表快照
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.borrow().clone()
    }

    /// 订阅列表变化
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredPeer>> {
        self.peers.subscribe()
    }
}

impl Drop for DiscoveryScanner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.consumer.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

fn upsert(list: &mut Vec<DiscoveredPeer>, peer: DiscoveredPeer) {
    match list.iter_mut().find(|p| p.id == peer.id) {
        Some(existing) => *existing = peer,
        None => {
            debug!("Peer found: id={}, name='{}'", peer.id, peer.name);
            list.push(peer);
        }
    }
}
