//! 传输错误类型
//!
//! 编排器顶层统一使用 [`TransferError`]，各层的底层错误
//! (BLE、NetworkManager、IO) 在边界处映射到对应的种类。

use std::future::Future;
use std::time::Duration;

/// 一次传输任务可能出现的失败种类
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// 本地直连网络建立或加入失败
    #[error("local link failed: {0}")]
    Link(String),

    /// 任何有界等待超时（连接、协商、确认、用户同意）
    #[error("timed out after {}ms while {stage}", .after.as_millis())]
    Timeout { stage: &'static str, after: Duration },

    /// 控制消息格式错误或顺序错误
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 用户取消；`is_remote` 表示是否由对端拒绝/取消
    #[error("transfer cancelled by {}", if *.is_remote { "peer" } else { "user" })]
    UserCancelled { is_remote: bool },

    /// 部分压缩包条目接收失败
    #[error("received {received} of {expected} files")]
    PartialTransfer { received: usize, expected: usize },

    /// 单个文件的存储读写失败
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 已有传输在进行中
    #[error("another transfer is already in progress")]
    Busy,
}

impl TransferError {
    /// 面向用户的提示文本
    ///
    /// 具体错误种类只写入日志，用户看到的是统一的失败提示加上可读原因。
    pub fn user_message(&self) -> String {
        match self {
            TransferError::UserCancelled { is_remote: true } => "对方已取消传输".to_string(),
            TransferError::UserCancelled { is_remote: false } => "已取消传输".to_string(),
            TransferError::Busy => "已有传输正在进行".to_string(),
            TransferError::Link(reason) => format!("传输失败：无法建立连接 ({reason})"),
            TransferError::PartialTransfer { received, expected } => {
                format!("传输失败：仅收到 {received}/{expected} 个文件")
            }
            other => format!("传输失败：{other}"),
        }
    }

    /// 是否属于取消类错误（不需要再向对端回报失败）
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::UserCancelled { .. })
    }
}

/// 带原因的超时包装
///
/// 超时会转换成 [`TransferError::Timeout`]，而不是无限阻塞。
pub async fn with_timeout<T, F>(
    stage: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout { stage, after }),
    }
}
