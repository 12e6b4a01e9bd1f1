//! BLE 层：广播编解码、设备发现、GATT 响应端和凭据发布

pub mod advertisement;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod client;
pub mod scanner;
pub mod server;

use std::sync::OnceLock;

use uuid::Uuid;

pub use advertisement::{Advertisement, BeaconPayload};
pub use client::{BleError, CredentialChannel, publish_credentials};
pub use scanner::{BeaconSource, DiscoveredPeer, DiscoveryScanner, RawBeacon};
pub use server::{CredentialsReceived, GattError, GattResponder, ResponderState};

#[cfg(feature = "bluez")]
pub use bluez::{BluezBeaconSource, BluezResponder};
#[cfg(feature = "bluez")]
pub use client::BtleCredentialChannel;

/// 广播服务 UUID
pub const ADV_SERVICE_UUID: Uuid = Uuid::from_u128(0x00003331_0000_1000_8000_008123456789);
/// 身份段 Service Data 键
pub const IDENTITY_DATA_UUID: Uuid = Uuid::from_u128(0x0000ffff_0000_1000_8000_00805f9b34fb);
/// GATT 主服务
pub const MAIN_SERVICE_UUID: Uuid = Uuid::from_u128(0x00009955_0000_1000_8000_00805f9b34fb);
/// 可读：本机状态 JSON
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x00009954_0000_1000_8000_00805f9b34fb);
/// 可写：发送端写入连接凭据 JSON
pub const P2P_CHAR_UUID: Uuid = Uuid::from_u128(0x00009953_0000_1000_8000_00805f9b34fb);

/// 本机状态，通过 STATUS 特征读出
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: i32,
    /// 仅在广播期间存在的公钥 (Base64 SPKI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub mac: String,
}

impl DeviceStatus {
    pub fn new(public_key: Option<String>, mac: String) -> Self {
        Self {
            state: 0,
            key: public_key,
            mac,
        }
    }
}

/// 本进程的 sender ID，进程内随机生成一次
pub fn local_sender_id() -> u16 {
    static SENDER_ID: OnceLock<u16> = OnceLock::new();
    *SENDER_ID.get_or_init(|| loop {
        let id: u16 = rand::random();
        if id != 0 {
            break id;
        }
    })
}
