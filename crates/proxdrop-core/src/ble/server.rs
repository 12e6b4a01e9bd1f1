//! GATT 响应端（接收端）
//!
//! 与具体 BLE 栈无关的 GATT 逻辑：
//!
//! - STATUS 特征：按 offset 分段读取当前 [`DeviceStatus`] JSON
//! - P2P 特征：按 offset 重组发送端写入的 [`LinkCredentials`]，
//!   带公钥时派生会话密钥解密，完成后交给接收编排器
//!
//! BlueZ 后端只负责把读写请求转发到这里。格式错误的写入返回 [`GattError`]，
//! 由后端映射为 GATT 失败响应，不会影响广播。正在传输或交接队列已满时
//! 同样立即拒绝，写入回调从不阻塞。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use super::DeviceStatus;
use crate::crypto::SessionKeys;
use crate::wifi::{LinkCredentials, LocalLink};
use crate::workflow::TransferSupervisor;

/// 单次凭据写入的上限
pub const MAX_WRITE_LEN: usize = 4096;

/// 未写完的凭据缓存多久没有新分段就丢弃
pub const PENDING_WRITE_TTL: Duration = Duration::from_secs(30);

const HANDOFF_DEPTH: usize = 4;

/// 响应端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    Advertising,
    AwaitingCredentials,
    Decrypting,
    HandoffToReceiver,
}

#[derive(Debug, thiserror::Error)]
pub enum GattError {
    #[error("malformed credentials: {0}")]
    Malformed(String),

    #[error("write exceeds {MAX_WRITE_LEN} bytes")]
    TooLarge,

    #[error("receiver is not listening")]
    HandoffClosed,

    #[error("receiver is busy")]
    Busy,
}

/// 解码完成的凭据
#[derive(Debug, Clone)]
pub struct CredentialsReceived {
    /// 已解密的凭据（`key` 字段已清除）
    pub credentials: LinkCredentials,
    pub was_encrypted: bool,
    /// 写入方的 BLE 地址
    pub device: String,
    /// 凭据写完的时刻，接收编排器据此丢弃过期凭据
    pub received_at: Instant,
}

struct PendingWrite {
    buffer: Vec<u8>,
    updated: Instant,
}

pub struct GattResponder {
    status: Mutex<DeviceStatus>,
    keys: Arc<SessionKeys>,
    pending: Mutex<HashMap<String, PendingWrite>>,
    state: Mutex<ResponderState>,
    handoff: mpsc::Sender<CredentialsReceived>,
    supervisor: Option<Arc<TransferSupervisor>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl GattResponder {
    /// 返回响应端和凭据交接队列的接收端
    pub fn new(keys: Arc<SessionKeys>, mac: String) -> (Self, mpsc::Receiver<CredentialsReceived>) {
        let (handoff, rx) = mpsc::channel(HANDOFF_DEPTH);
        let status = DeviceStatus::new(None, mac);
        (
            Self {
                status: Mutex::new(status),
                keys,
                pending: Mutex::new(HashMap::new()),
                state: Mutex::new(ResponderState::Idle),
                handoff,
                supervisor: None,
            },
            rx,
        )
    }

    /// 传输进行中时拒绝新的凭据
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<TransferSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn state(&self) -> ResponderState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ResponderState) {
        let mut current = lock(&self.state);
        if *current != state {
            trace!("Responder state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// 开始广播：STATUS 中公开本机公钥
    pub fn start_advertising(&self) {
        lock(&self.status).key = Some(self.keys.public_key().to_string());
        self.set_state(ResponderState::Advertising);
        info!("Responder advertising");
    }

    /// 停止广播：撤下公钥并丢弃未完成的写入
    pub fn stop(&self) {
        lock(&self.status).key = None;
        lock(&self.pending).clear();
        self.set_state(ResponderState::Idle);
        info!("Responder stopped");
    }

    pub fn update_mac(&self, mac: impl Into<String>) {
        let mac = mac.into();
        debug!("STATUS mac -> {}", mac);
        lock(&self.status).mac = mac;
    }

    /// 用链路后端报告的硬件地址更新 STATUS，返回是否拿到了地址
    pub async fn refresh_mac(&self, link: &dyn LocalLink) -> bool {
        match link.hardware_address().await {
            Some(mac) if !mac.trim().is_empty() => {
                self.update_mac(mac.trim().to_uppercase());
                true
            }
            _ => false,
        }
    }

    /// STATUS 特征读取
    pub fn read_status(&self, offset: usize) -> Vec<u8> {
        let bytes = match serde_json::to_vec(&*lock(&self.status)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize status: {}", e);
                return Vec::new();
            }
        };
        debug!("STATUS read: offset={}, len={}", offset, bytes.len());
        bytes.get(offset..).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// P2P 特征写入
    ///
    /// `more_to_come` 为真时只缓存。后端无法区分最后一段时传 `false`：
    /// 缓存内容还不是完整 JSON 就继续等待后续分段。
    pub fn handle_write(
        &self,
        device: &str,
        offset: usize,
        value: &[u8],
        more_to_come: bool,
    ) -> Result<(), GattError> {
        let payload = {
            let now = Instant::now();
            let mut pending = lock(&self.pending);
            pending.retain(|other, write| {
                let fresh = now.saturating_duration_since(write.updated) < PENDING_WRITE_TTL;
                if !fresh {
                    debug!("Dropping stale partial write from {}", other);
                }
                fresh
            });

            let write = pending.entry(device.to_string()).or_insert_with(|| PendingWrite {
                buffer: Vec::new(),
                updated: now,
            });
            if offset == 0 {
                write.buffer.clear();
            }
            if offset > write.buffer.len() {
                pending.remove(device);
                return Err(self.reject(device, GattError::Malformed(format!("unexpected offset {offset}"))));
            }
            if offset + value.len() > MAX_WRITE_LEN {
                pending.remove(device);
                return Err(self.reject(device, GattError::TooLarge));
            }
            write.updated = now;
            write.buffer.truncate(offset);
            write.buffer.extend_from_slice(value);
            (!more_to_come).then(|| write.buffer.clone())
        };

        let Some(payload) = payload else {
            self.set_state(ResponderState::AwaitingCredentials);
            return Ok(());
        };

        let credentials = match serde_json::from_slice::<LinkCredentials>(&payload) {
            Ok(credentials) => credentials,
            Err(e) if e.is_eof() => {
                trace!("Credentials from {} incomplete ({} bytes)", device, payload.len());
                self.set_state(ResponderState::AwaitingCredentials);
                return Ok(());
            }
            Err(e) => {
                lock(&self.pending).remove(device);
                return Err(self.reject(device, GattError::Malformed(e.to_string())));
            }
        };
        lock(&self.pending).remove(device);

        if self.supervisor.as_ref().is_some_and(|supervisor| supervisor.is_busy()) {
            return Err(self.reject(device, GattError::Busy));
        }

        let event = self
            .decrypt(device, credentials)
            .map_err(|e| self.reject(device, e))?;

        self.set_state(ResponderState::HandoffToReceiver);
        match self.handoff.try_send(event) {
            Ok(()) => {
                self.set_state(ResponderState::Advertising);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(self.reject(device, GattError::Busy)),
            Err(TrySendError::Closed(_)) => Err(self.reject(device, GattError::HandoffClosed)),
        }
    }

    fn reject(&self, device: &str, error: GattError) -> GattError {
        warn!("Rejected credentials write from {}: {}", device, error);
        self.set_state(ResponderState::Advertising);
        error
    }

    fn decrypt(
        &self,
        device: &str,
        mut credentials: LinkCredentials,
    ) -> Result<CredentialsReceived, GattError> {
        let was_encrypted = credentials.key.is_some();
        if let Some(peer_key) = credentials.key.take() {
            self.set_state(ResponderState::Decrypting);
            let cipher = self
                .keys
                .derive_session_key(&peer_key)
                .map_err(|e| GattError::Malformed(format!("bad sender key: {e}")))?;
            for field in [&mut credentials.ssid, &mut credentials.psk, &mut credentials.mac] {
                *field = cipher
                    .decrypt(field)
                    .map_err(|e| GattError::Malformed(format!("decrypt failed: {e}")))?;
            }
        }

        info!(
            "Credentials received from {}: ssid='{}', port={}, encrypted={}",
            device, credentials.ssid, credentials.port, was_encrypted
        );
        Ok(CredentialsReceived {
            credentials,
            was_encrypted,
            device: device.to_string(),
            received_at: Instant::now(),
        })
    }
}
