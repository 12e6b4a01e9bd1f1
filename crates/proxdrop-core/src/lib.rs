//! ProxDrop Core Library
//!
//! 近场文件互传协议的核心实现：BLE 发现与凭据交换，本地直连网络，
//! 基于 WebSocket 控制通道和 HTTP(S) 下载的文件传输。
//!
//! # 模块
//!
//! - **ble**: 广播编解码、设备发现、GATT 响应端、凭据发布
//! - **crypto**: ECDH 密钥交换和 AES-CTR 加密
//! - **wifi**: 本地直连网络（热点）的建立、加入和拆除
//! - **transfer**: 控制消息、传输服务器、下载与解包
//! - **workflow**: 发送/接收编排器和全局传输调度
//! - **config**: 应用设置
//!
//! # 使用示例
//!
//! ## 发送文件
//!
//! ```ignore
//! use proxdrop_core::{FileDescriptor, SendOptions, Sender, SimpleSendCallback, TransferSupervisor, TransferTask};
//!
//! let sender = Sender::new(SendOptions::default(), TransferSupervisor::global(), link, ble_channel);
//! let task = TransferTask::new(peer, vec![FileDescriptor::from_path("photo.jpg").await?]);
//! let (callback, mut events) = SimpleSendCallback::new();
//! sender.send(task, &callback).await?;
//! ```
//!
//! ## 接收文件
//!
//! ```ignore
//! use proxdrop_core::{GattResponder, ReceiveOptions, Receiver, SessionKeys, SimpleReceiveCallback, TransferSupervisor};
//!
//! let (responder, handoff) = GattResponder::new(SessionKeys::process(), mac);
//! // 后端把 GATT 读写转发给 responder ...
//! let receiver = Receiver::new(ReceiveOptions::default(), TransferSupervisor::global(), link);
//! let (callback, mut events) = SimpleReceiveCallback::new();
//! receiver.serve(handoff, &callback).await;
//! ```

pub mod ble;
pub mod config;
pub mod crypto;
pub mod error;
pub mod transfer;
pub mod wifi;
pub mod workflow;

// BLE re-exports
pub use ble::{
    Advertisement, CredentialChannel, DeviceStatus, DiscoveredPeer, DiscoveryScanner,
    GattResponder, MAIN_SERVICE_UUID, P2P_CHAR_UUID, STATUS_CHAR_UUID,
};

// Crypto re-exports
pub use crypto::{SessionCipher, SessionKeys};

// WiFi re-exports
pub use wifi::{LinkCredentials, LinkNegotiator, LocalLink, NmLocalLink};

// Transfer re-exports
pub use transfer::{FileDescriptor, TransferOutcome, TransferTask};

// Workflow re-exports
pub use workflow::{
    ReceiveOptions, Receiver, SendOptions, Sender, SimpleReceiveCallback, SimpleSendCallback,
    TransferSupervisor,
};

pub use config::AppSettings;
pub use error::TransferError;
