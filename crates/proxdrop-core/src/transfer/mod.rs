//! 传输层
//!
//! - 控制通道 (WebSocket) 的消息格式与收发
//! - HTTP(S) 压缩包下载与解包
//! - 进度限流

pub mod archive;
pub mod channel;
pub mod progress;
pub mod protocol;
pub mod receiver_client;
pub mod sender_server;
pub mod tls;

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::ble::DiscoveredPeer;

pub use archive::{TransferOutcome, UnpackReport};
pub use channel::{ControlChannel, ControlSender};
pub use progress::{ProgressState, ProgressThrottler};
pub use protocol::{ControlMessage, MessageKind, SendRequest, StatusReport};
pub use receiver_client::Endpoint;
pub use sender_server::{ServerEvent, TransferServer};

/// 待发送的一个文件（或一段文本）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// 文件路径，文本分享时为空
    pub path: Option<PathBuf>,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// 分享纯文本时的内容
    pub text: Option<String>,
}

impl FileDescriptor {
    /// 读取文件元数据
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();

        Ok(Self {
            path: Some(path.to_path_buf()),
            name,
            mime_type,
            size: metadata.len(),
            text: None,
        })
    }

    /// 纯文本分享
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            path: None,
            name: "text.txt".to_string(),
            mime_type: "text/plain".to_string(),
            size: text.len() as u64,
            text: Some(text),
        }
    }
}

/// 一次发送尝试
///
/// 每次尝试都生成新的 ID，不在多次尝试之间复用。
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: String,
    pub peer: DiscoveredPeer,
    pub files: Vec<FileDescriptor>,
    /// 缩略图原始字节 (JPEG/PNG)，由调用方提供
    pub thumbnail: Option<Vec<u8>>,
}

impl TransferTask {
    pub fn new(peer: DiscoveredPeer, files: Vec<FileDescriptor>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            files,
            thumbnail: None,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: Vec<u8>) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// 发送请求中的代表性文件名和 MIME 类型
    pub fn summary(&self) -> (String, String) {
        self.files.first().map_or_else(
            || (String::new(), "application/octet-stream".to_string()),
            |f| (f.name.clone(), f.mime_type.clone()),
        )
    }
}
