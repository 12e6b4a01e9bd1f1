//! 工作流模块
//!
//! 提供高层 API 封装完整的发送/接收流程，两端共用同一个 [`TransferSupervisor`]，
//! 同一时刻只有一个传输在进行。

pub mod receiver;
pub mod sender;
pub mod supervisor;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

pub use receiver::{
    ReceiveEvent, ReceiveOptions, ReceiveProgressCallback, ReceiveReport, ReceiveRequest,
    Receiver, SimpleReceiveCallback,
};
pub use sender::{
    SendEvent, SendOptions, SendProgressCallback, SendReport, Sender, SimpleSendCallback,
};
pub use supervisor::{ConsentWaiter, TransferPermit, TransferSupervisor};

fn payload<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, TransferError> {
    serde_json::to_value(value).map_err(|e| TransferError::Protocol(e.to_string()))
}

/// 本地取消时以 `UserCancelled { is_remote: false }` 提前返回
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    tokio::select! {
        result = fut => result,
        () = cancel.cancelled() => Err(TransferError::UserCancelled { is_remote: false }),
    }
}
