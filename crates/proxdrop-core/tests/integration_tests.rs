//! 集成测试 - 加密与协议兼容性
//!
//! 验证凭据交换、广播和控制消息在线上的格式。

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proxdrop_core::ble::{
    Advertisement, BeaconSource, BleError, DeviceStatus, DiscoveryScanner, GattResponder,
    RawBeacon, ResponderState, publish_credentials,
};
use proxdrop_core::crypto::SessionKeys;
use proxdrop_core::transfer::protocol::{SendRequest, StatusReport, status_type};
use proxdrop_core::transfer::{ControlMessage, MessageKind};
use proxdrop_core::wifi::LinkCredentials;
use tokio::sync::mpsc;

use common::{LoopbackChannel, peer};

/// 测试完整的 ECDH 密钥交换流程
///
/// 模拟发送端和接收端的密钥协商过程
#[test]
fn test_full_ecdh_handshake() {
    // 1. 接收端生成密钥对并公开公钥
    let receiver = SessionKeys::generate();
    let receiver_pub_key = receiver.public_key().to_string();

    // 2. 发送端生成一次性密钥对
    let sender = SessionKeys::generate();
    let sender_pub_key = sender.public_key().to_string();

    // 3. 发送端派生会话密钥并加密
    let sender_cipher = sender.derive_session_key(&receiver_pub_key).unwrap();
    let encrypted_ssid = sender_cipher.encrypt("DIRECT-test1234");
    let encrypted_psk = sender_cipher.encrypt("password123");
    let encrypted_mac = sender_cipher.encrypt("AA:BB:CC:DD:EE:FF");

    // 4. 接收端用发送端公钥派生同一个密钥并解密
    let receiver_cipher = receiver.derive_session_key(&sender_pub_key).unwrap();
    assert_eq!(receiver_cipher.decrypt(&encrypted_ssid).unwrap(), "DIRECT-test1234");
    assert_eq!(receiver_cipher.decrypt(&encrypted_psk).unwrap(), "password123");
    assert_eq!(receiver_cipher.decrypt(&encrypted_mac).unwrap(), "AA:BB:CC:DD:EE:FF");
}

/// 对端状态 JSON：未知字段忽略，没有公钥时不输出 key
#[test]
fn test_device_status_wire_format() {
    let json = r#"{
        "state": 0,
        "key": "MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE",
        "mac": "AA:BB:CC:DD:EE:FF",
        "extra": 123
    }"#;

    let status: DeviceStatus = serde_json::from_str(json).unwrap();
    assert_eq!(status.state, 0);
    assert_eq!(status.key.as_deref(), Some("MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE"));
    assert_eq!(status.mac, "AA:BB:CC:DD:EE:FF");

    let without_key = DeviceStatus::new(None, "AA".to_string());
    let serialized = serde_json::to_string(&without_key).unwrap();
    assert_eq!(serialized, r#"{"state":0,"mac":"AA"}"#);
}

/// 连接凭据 JSON 的字段名与可选字段
#[test]
fn test_link_credentials_wire_format() {
    let json = r#"{
        "id": "a1b2",
        "ssid": "ENCRYPTED_BASE64_SSID",
        "psk": "ENCRYPTED_BASE64_PSK",
        "mac": "ENCRYPTED_BASE64_MAC",
        "port": 8443,
        "key": "SENDER_PUBLIC_KEY_BASE64"
    }"#;

    let credentials: LinkCredentials = serde_json::from_str(json).unwrap();
    assert_eq!(credentials.id.as_deref(), Some("a1b2"));
    assert_eq!(credentials.port, 8443);
    assert_eq!(credentials.key.as_deref(), Some("SENDER_PUBLIC_KEY_BASE64"));

    let plain: LinkCredentials =
        serde_json::from_str(r#"{"ssid":"s","psk":"p","mac":"m","port":1}"#).unwrap();
    assert_eq!(plain.id, None);
    assert_eq!(plain.key, None);
    let serialized = serde_json::to_string(&plain).unwrap();
    assert!(!serialized.contains("\"key\""));
    assert!(!serialized.contains("\"id\""));
}

/// 测试公钥格式 (SPKI DER, Base64)
#[test]
fn test_public_key_spki_format() {
    use base64::Engine;

    let keys = SessionKeys::generate();
    let der = base64::engine::general_purpose::STANDARD
        .decode(keys.public_key())
        .unwrap();

    assert_eq!(der[0], 0x30, "Public key should be SPKI format (0x30 = SEQUENCE)");
    assert_eq!(der.len(), 91, "SPKI P-256 public key should be 91 bytes");
}

/// 发送端经 GATT 发布凭据，接收端解密后交给接收编排器
#[tokio::test]
async fn test_publish_credentials_to_responder() {
    let (responder, mut handoff) =
        GattResponder::new(Arc::new(SessionKeys::generate()), "02:00:00:00:00:09".to_string());
    let responder = Arc::new(responder);
    responder.start_advertising();
    let channel = LoopbackChannel::new(responder.clone());

    let credentials = LinkCredentials {
        id: None,
        ssid: "DIRECT-abcd1234".to_string(),
        psk: "secretpass".to_string(),
        mac: "11:22:33:44:55:66".to_string(),
        port: 9443,
        key: None,
    };
    let status = publish_credentials(&channel, &peer(), &credentials, "1f2e")
        .await
        .unwrap();
    assert!(status.key.is_some());
    assert_eq!(status.mac, "02:00:00:00:00:09");

    let event = handoff.recv().await.unwrap();
    assert!(event.was_encrypted);
    assert_eq!(event.credentials.id.as_deref(), Some("1f2e"));
    assert_eq!(event.credentials.ssid, "DIRECT-abcd1234");
    assert_eq!(event.credentials.psk, "secretpass");
    assert_eq!(event.credentials.mac, "11:22:33:44:55:66");
    assert_eq!(event.credentials.port, 9443);
    assert_eq!(responder.state(), ResponderState::Advertising);
}

/// 响应端停止广播后不再公开公钥，凭据以明文发送
#[tokio::test]
async fn test_publish_plaintext_when_responder_idle() {
    let (responder, mut handoff) =
        GattResponder::new(Arc::new(SessionKeys::generate()), "02:00:00:00:00:09".to_string());
    let channel = LoopbackChannel::new(Arc::new(responder));

    let credentials = LinkCredentials {
        id: None,
        ssid: "DIRECT-plain".to_string(),
        psk: "12345678".to_string(),
        mac: "11:22:33:44:55:66".to_string(),
        port: 1234,
        key: None,
    };
    publish_credentials(&channel, &peer(), &credentials, "1f2e")
        .await
        .unwrap();

    let event = handoff.recv().await.unwrap();
    assert!(!event.was_encrypted);
    assert_eq!(event.credentials.ssid, "DIRECT-plain");
}

struct ScriptedSource {
    beacons: Vec<RawBeacon>,
}

#[async_trait]
impl BeaconSource for ScriptedSource {
    async fn start(&self) -> Result<mpsc::Receiver<RawBeacon>, BleError> {
        let (tx, rx) = mpsc::channel(self.beacons.len().max(1));
        for beacon in &self.beacons {
            tx.send(beacon.clone()).await.unwrap();
        }
        Ok(rx)
    }
}

fn beacon(adv: &Advertisement, address: &str, rssi: i16) -> RawBeacon {
    RawBeacon {
        address: address.to_string(),
        rssi: Some(rssi),
        service_data: adv.encode().service_data().into_iter().collect(),
    }
}

/// 广播经扫描器解码，同一 sender ID 只保留最新一条
#[tokio::test]
async fn test_scanner_decodes_and_dedupes_advertisements() {
    let phone = Advertisement {
        sender_id: 0x0a01,
        name: "Phone".to_string(),
        brand_id: Some(1),
        supports_5ghz: true,
    };
    let tablet = Advertisement {
        sender_id: 0x0b02,
        name: "平板".to_string(),
        brand_id: None,
        supports_5ghz: false,
    };
    let source = ScriptedSource {
        beacons: vec![
            beacon(&phone, "AA:AA:AA:AA:AA:01", -70),
            beacon(&tablet, "AA:AA:AA:AA:AA:02", -60),
            beacon(&phone, "AA:AA:AA:AA:AA:01", -40),
            RawBeacon::default(),
        ],
    };

    let scanner = DiscoveryScanner::new();
    let mut updates = scanner.subscribe();
    scanner.attach(&source).await;

    let peers = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            updates.changed().await.unwrap();
            let peers = updates.borrow_and_update().clone();
            if peers.len() == 2 && peers.iter().any(|p| p.rssi == Some(-40)) {
                break peers;
            }
        }
    })
    .await
    .unwrap();

    let phone_peer = peers.iter().find(|p| p.id == "0a01").unwrap();
    assert_eq!(phone_peer.name, "Phone");
    assert!(phone_peer.supports_5ghz);
    let tablet_peer = peers.iter().find(|p| p.id == "0b02").unwrap();
    assert_eq!(tablet_peer.name, "平板");

    scanner.detach();
    assert!(scanner.peers().is_empty());
}

/// 控制消息的线上格式
#[test]
fn test_control_message_wire_format() {
    let raw = r#"action:3:sendRequest?{"taskId":"t-1","senderName":"Laptop","fileName":"a.jpg","mimeType":"image/jpeg","fileCount":2,"totalSize":2048}"#;
    let message = ControlMessage::parse(raw).unwrap();
    assert_eq!(message.kind, MessageKind::Action);
    assert_eq!(message.id, 3);

    let request: SendRequest = message.payload_as().unwrap();
    assert_eq!(request.task_id(), Some("t-1"));
    assert_eq!(request.file_count, 2);
    assert_eq!(request.total_size, 2048);

    let status = serde_json::to_value(StatusReport::new("t-1", status_type::CANCELLED, "user refuse")).unwrap();
    let line = ControlMessage::action(4, "status", Some(status)).to_string();
    assert!(line.starts_with("action:4:status?{"));
    assert!(line.contains(r#""type":3"#));
    assert!(line.contains(r#""reason":"user refuse""#));

    assert_eq!(ControlMessage::ack(3, "sendRequest", None).to_string(), "ack:3:sendRequest");
    assert!(ControlMessage::parse("garbage").is_none());
}
