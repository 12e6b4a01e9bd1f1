//! 发送端 GATT 客户端
//!
//! 流程:
//! 1. 读取接收端 STATUS 特征，得到 [`DeviceStatus`]（可能带公钥）
//! 2. 有公钥时用一次性密钥对派生会话密钥，加密 ssid/psk/mac
//! 3. 把凭据 JSON 写入 P2P 特征
//!
//! 具体的 BLE 连接藏在 [`CredentialChannel`] 后面，测试可直接接到 [`GattResponder`](super::GattResponder)。

use async_trait::async_trait;
use log::{debug, info};
use uuid::Uuid;

use super::DeviceStatus;
use super::scanner::DiscoveredPeer;
use crate::crypto::SessionKeys;
use crate::wifi::LinkCredentials;

/// BLE 错误
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

/// 到接收端 GATT 服务的通道
#[async_trait]
pub trait CredentialChannel: Send + Sync {
    /// 读取 STATUS 特征的完整内容
    async fn read_status(&self, peer: &DiscoveredPeer) -> Result<Vec<u8>, BleError>;

    /// 写入 P2P 特征
    async fn write_credentials(&self, peer: &DiscoveredPeer, payload: Vec<u8>) -> Result<(), BleError>;
}

/// 把连接凭据发布给接收端，返回对端状态
///
/// 每次调用生成新的一次性密钥对，公钥放在 `key` 字段中。
pub async fn publish_credentials(
    channel: &dyn CredentialChannel,
    peer: &DiscoveredPeer,
    credentials: &LinkCredentials,
    sender_id: &str,
) -> Result<DeviceStatus, BleError> {
    let raw = channel.read_status(peer).await?;
    let status: DeviceStatus = serde_json::from_slice(&raw)
        .map_err(|e| BleError::Protocol(format!("Invalid device status: {e}")))?;
    debug!("Remote status: state={}, has_key={}", status.state, status.key.is_some());

    let mut outgoing = LinkCredentials {
        id: Some(sender_id.to_string()),
        key: None,
        ..credentials.clone()
    };

    if let Some(peer_key) = &status.key {
        let ephemeral = SessionKeys::generate();
        let cipher = ephemeral
            .derive_session_key(peer_key)
            .map_err(|e| BleError::Protocol(format!("Key exchange failed: {e}")))?;
        outgoing.ssid = cipher.encrypt(&credentials.ssid);
        outgoing.psk = cipher.encrypt(&credentials.psk);
        outgoing.mac = cipher.encrypt(&credentials.mac);
        outgoing.key = Some(ephemeral.public_key().to_string());
    }

    let payload = serde_json::to_vec(&outgoing).map_err(|e| BleError::Protocol(e.to_string()))?;
    info!(
        "Publishing credentials to {} ({} bytes, encrypted={})",
        peer.address,
        payload.len(),
        outgoing.key.is_some()
    );
    channel.write_credentials(peer, payload).await?;

    Ok(status)
}

#[cfg(feature = "bluez")]
pub use btle::BtleCredentialChannel;

#[cfg(feature = "bluez")]
mod btle {
    use std::time::Duration;

    use async_trait::async_trait;
    use btleplug::api::{Central, Characteristic, Manager as _, Peripheral, WriteType};
    use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
    use log::{debug, info};
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use super::{BleError, CredentialChannel};
    use crate::ble::scanner::DiscoveredPeer;
    use crate::ble::{MAIN_SERVICE_UUID, P2P_CHAR_UUID, STATUS_CHAR_UUID};

    fn backend(e: btleplug::Error) -> BleError {
        BleError::Backend(e.to_string())
    }

    /// btleplug 实现；读状态时建立连接，写完凭据后断开
    pub struct BtleCredentialChannel {
        adapter: Adapter,
        connected: Mutex<Option<PlatformPeripheral>>,
    }

    impl BtleCredentialChannel {
        pub async fn new() -> Result<Self, BleError> {
            let manager = Manager::new().await.map_err(backend)?;
            let adapter = manager
                .adapters()
                .await
                .map_err(backend)?
                .into_iter()
                .next()
                .ok_or(BleError::NoAdapter)?;
            Ok(Self {
                adapter,
                connected: Mutex::new(None),
            })
        }

        async fn find_device(&self, address: &str) -> Result<PlatformPeripheral, BleError> {
            for peripheral in self.adapter.peripherals().await.map_err(backend)? {
                if let Some(props) = peripheral.properties().await.map_err(backend)?
                    && props.address.to_string().eq_ignore_ascii_case(address)
                {
                    return Ok(peripheral);
                }
            }
            Err(BleError::DeviceNotFound(address.to_string()))
        }

        async fn connect(&self, peer: &DiscoveredPeer) -> Result<PlatformPeripheral, BleError> {
            let mut connected = self.connected.lock().await;
            if let Some(peripheral) = connected.as_ref()
                && peripheral.is_connected().await.unwrap_or(false)
            {
                return Ok(peripheral.clone());
            }

            let peripheral = self.find_device(&peer.address).await?;
            info!("Connecting to {}", peer.address);
            peripheral
                .connect()
                .await
                .map_err(|e| BleError::ConnectionFailed(e.to_string()))?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            peripheral.discover_services().await.map_err(backend)?;

            *connected = Some(peripheral.clone());
            Ok(peripheral)
        }
    }

    fn characteristic(peripheral: &PlatformPeripheral, uuid: Uuid) -> Result<Characteristic, BleError> {
        peripheral
            .services()
            .into_iter()
            .filter(|service| service.uuid == MAIN_SERVICE_UUID)
            .flat_map(|service| service.characteristics)
            .find(|c| c.uuid == uuid)
            .ok_or(BleError::CharacteristicNotFound(uuid))
    }

    #[async_trait]
    impl CredentialChannel for BtleCredentialChannel {
        async fn read_status(&self, peer: &DiscoveredPeer) -> Result<Vec<u8>, BleError> {
            let peripheral = self.connect(peer).await?;
            let status = characteristic(&peripheral, STATUS_CHAR_UUID)?;
            peripheral.read(&status).await.map_err(backend)
        }

        async fn write_credentials(&self, peer: &DiscoveredPeer, payload: Vec<u8>) -> Result<(), BleError> {
            let peripheral = self.connect(peer).await?;
            let p2p = characteristic(&peripheral, P2P_CHAR_UUID)?;
            let result = peripheral
                .write(&p2p, &payload, WriteType::WithResponse)
                .await
                .map_err(backend);

            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect from {} failed: {}", peer.address, e);
            }
            self.connected.lock().await.take();
            result
        }
    }
}
