//! 控制通道消息格式
//!
//! 每个 WebSocket 文本帧一条消息: `type:id:name?payload`
//! - type: "action" 或 "ack"
//! - id: 消息 ID (十进制)，ack 与对应 action 的 ID 相同
//! - name: 动作名称
//! - payload: 可选的 JSON 载荷

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

static MSG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_]+):([0-9]+):([A-Za-z0-9_]+)(\?(.*))?$").expect("valid pattern")
});

pub const ACTION_VERSION_NEGOTIATION: &str = "versionNegotiation";
pub const ACTION_SEND_REQUEST: &str = "sendRequest";
pub const ACTION_STATUS: &str = "status";

/// 本端支持的最高协议版本
pub const PROTOCOL_VERSION: u32 = 1;
/// 协商应答中通告的并发上限
pub const THREAD_LIMIT: u32 = 5;

/// 状态消息中的 type 字段
pub mod status_type {
    pub const COMPLETED: i32 = 1;
    pub const FAILED: i32 = 2;
    pub const CANCELLED: i32 = 3;
}

/// 接收端拒绝时携带的原因
pub const REASON_USER_REFUSE: &str = "user refuse";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Action,
    Ack,
    Other(String),
}

impl MessageKind {
    fn as_str(&self) -> &str {
        match self {
            MessageKind::Action => "action",
            MessageKind::Ack => "ack",
            MessageKind::Other(s) => s,
        }
    }

    fn from_wire(s: &str) -> Self {
        match s {
            "action" => MessageKind::Action,
            "ack" => MessageKind::Ack,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub kind: MessageKind,
    pub id: u32,
    pub name: String,
    pub payload: Option<Value>,
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.kind.as_str(), self.id, self.name)?;
        if let Some(payload) = &self.payload {
            write!(f, "?{payload}")?;
        }
        Ok(())
    }
}

impl ControlMessage {
    /// 解析一行消息，格式不符返回 `None`
    ///
    /// 载荷存在但不是合法 JSON 时整条消息视为无效。
    pub fn parse(text: &str) -> Option<Self> {
        let caps = MSG_PATTERN.captures(text)?;

        let kind = MessageKind::from_wire(caps.get(1)?.as_str());
        let id: u32 = caps.get(2)?.as_str().parse().ok()?;
        let name = caps.get(3)?.as_str().to_string();

        let payload = match caps.get(5).map(|m| m.as_str()) {
            None | Some("") => None,
            Some(raw) => Some(serde_json::from_str(raw).ok()?),
        };

        Some(Self {
            kind,
            id,
            name,
            payload,
        })
    }

    pub fn action(id: u32, name: &str, payload: Option<Value>) -> Self {
        Self {
            kind: MessageKind::Action,
            id,
            name: name.to_string(),
            payload,
        }
    }

    pub fn ack(id: u32, name: &str, payload: Option<Value>) -> Self {
        Self {
            kind: MessageKind::Ack,
            id,
            name: name.to_string(),
            payload,
        }
    }

    pub fn is_action(&self, name: &str) -> bool {
        self.kind == MessageKind::Action && self.name.eq_ignore_ascii_case(name)
    }

    /// 将载荷解析为指定类型，缺少载荷时按空对象处理
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Some(value) => T::deserialize(value),
            None => T::deserialize(Value::Object(serde_json::Map::new())),
        }
    }
}

/// 发送端发起的版本协商
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionProposal {
    pub version: u32,
    #[serde(default)]
    pub versions: Vec<u32>,
}

impl Default for VersionProposal {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            versions: vec![PROTOCOL_VERSION],
        }
    }
}

/// 接收端对版本协商的应答
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionAck {
    pub version: u32,
    #[serde(default)]
    pub thread_limit: Option<u32>,
}

impl VersionAck {
    /// 对发送端提议的应答: `min(提议版本, 本端最高版本)`
    pub fn answer(proposal: &VersionProposal) -> Self {
        Self {
            version: proposal.version.min(PROTOCOL_VERSION),
            thread_limit: Some(THREAD_LIMIT),
        }
    }
}

/// 发送请求载荷
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendRequest {
    /// 任务 ID (某些版本使用 id 代替 taskId)
    pub task_id: Option<String>,
    pub id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: String,
    /// 代表性文件名（通常是第一个文件）
    pub file_name: String,
    pub mime_type: String,
    pub file_count: u32,
    pub total_size: u64,
    /// 缩略图路径，相对于发送端服务根
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl SendRequest {
    /// 任务 ID，优先使用 task_id，否则使用 id
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref().or(self.id.as_deref())
    }
}

/// 状态消息载荷
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusReport {
    pub task_id: String,
    pub id: String,
    #[serde(rename = "type")]
    pub status_type: i32,
    pub reason: String,
}

impl StatusReport {
    pub fn new(task_id: &str, status_type: i32, reason: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            id: task_id.to_string(),
            status_type,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_action() {
        let msg = ControlMessage::parse("action:1:sendRequest?{\"taskId\":\"123\"}").unwrap();
        assert_eq!(msg.kind, MessageKind::Action);
        assert_eq!(msg.id, 1);
        assert_eq!(msg.name, "sendRequest");
        assert_eq!(msg.payload, Some(json!({"taskId": "123"})));
    }

    #[test]
    fn test_parse_without_payload() {
        let msg = ControlMessage::parse("ack:0:versionNegotiation").unwrap();
        assert_eq!(msg.kind, MessageKind::Ack);
        assert_eq!(msg.payload, None);

        let msg = ControlMessage::parse("ack:7:status?").unwrap();
        assert_eq!(msg.id, 7);
        assert_eq!(msg.payload, None);
    }

    #[test]
    fn test_roundtrip() {
        let messages = [
            ControlMessage::action(0, ACTION_VERSION_NEGOTIATION, Some(json!({"version": 1, "versions": [1]}))),
            ControlMessage::ack(0, ACTION_VERSION_NEGOTIATION, Some(json!({"version": 1, "threadLimit": 5}))),
            ControlMessage::action(42, ACTION_STATUS, Some(json!({"reason": "user refuse", "type": 3}))),
            ControlMessage::ack(u32::MAX, "x", None),
            ControlMessage {
                kind: MessageKind::Other("custom_kind".to_string()),
                id: 3,
                name: "ping_2".to_string(),
                payload: Some(json!({"nested": {"list": [1, "二", null]}, "text": "a:b?c"})),
            },
        ];

        for msg in messages {
            assert_eq!(ControlMessage::parse(&msg.to_string()), Some(msg));
        }
    }

    #[test]
    fn test_malformed_yields_none() {
        for text in [
            "",
            "action",
            "action:1",
            "action:one:sendRequest",
            "action:-1:sendRequest",
            "action:1:send-request",
            "act ion:1:status",
            "action:1:status?{not json",
            "action:1:status?{}\nextra",
            "action:99999999999:status",
        ] {
            assert!(ControlMessage::parse(text).is_none(), "should reject {text:?}");
        }
    }

    #[test]
    fn test_version_answer() {
        let ack = VersionAck::answer(&VersionProposal {
            version: 3,
            versions: vec![1, 2, 3],
        });
        assert_eq!(ack.version, 1);
        assert_eq!(ack.thread_limit, Some(THREAD_LIMIT));

        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value, json!({"version": 1, "threadLimit": 5}));
    }

    #[test]
    fn test_send_request_task_id_alias() {
        let msg = ControlMessage::parse(
            r#"action:1:sendRequest?{"id":"abc","senderName":"Phone","fileName":"a.jpg","fileCount":2,"totalSize":10}"#,
        )
        .unwrap();
        let request: SendRequest = msg.payload_as().unwrap();
        assert_eq!(request.task_id(), Some("abc"));
        assert_eq!(request.file_count, 2);
        assert_eq!(request.thumbnail, None);
    }

    #[test]
    fn test_status_report_wire_names() {
        let value = serde_json::to_value(StatusReport::new("t1", status_type::CANCELLED, REASON_USER_REFUSE)).unwrap();
        assert_eq!(
            value,
            json!({"taskId": "t1", "id": "t1", "type": 3, "reason": "user refuse"})
        );
    }
}
