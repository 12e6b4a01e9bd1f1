//! 控制通道
//!
//! 把 axum (发送端) 或 tungstenite (接收端) 的 WebSocket 拆成两个泵任务：
//! 读泵把文本帧解析为 [`ControlMessage`] 送入队列，写泵把队列中的消息写出。
//! 编排器只面对队列，可以在 `tokio::select!` 中和其它事件源一起等待。

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, trace, warn};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{ACTION_STATUS, ControlMessage, MessageKind, StatusReport};
use crate::error::{TransferError, with_timeout};

const QUEUE_DEPTH: usize = 32;

/// 与具体 WebSocket 实现无关的帧
enum Frame {
    Text(String),
    Close,
    Ignored,
    Binary,
}

type Incoming = Result<ControlMessage, TransferError>;

/// 可克隆的发送端，ID 计数在所有克隆之间共享
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Frame>,
    next_id: Arc<AtomicU32>,
}

impl ControlSender {
    pub async fn send(&self, message: &ControlMessage) -> Result<(), TransferError> {
        trace!("WS send: {}", message);
        self.tx
            .send(Frame::Text(message.to_string()))
            .await
            .map_err(|_| TransferError::Protocol("control channel closed".to_string()))
    }

    /// 发送 action，返回分配的消息 ID
    pub async fn action(&self, name: &str, payload: Option<Value>) -> Result<u32, TransferError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(&ControlMessage::action(id, name, payload)).await?;
        Ok(id)
    }

    /// 以相同 ID 应答一条 action
    pub async fn ack(
        &self,
        request: &ControlMessage,
        payload: Option<Value>,
    ) -> Result<(), TransferError> {
        self.send(&ControlMessage::ack(request.id, &request.name, payload))
            .await
    }

    pub async fn status(
        &self,
        task_id: &str,
        status_type: i32,
        reason: &str,
    ) -> Result<(), TransferError> {
        let report = serde_json::to_value(StatusReport::new(task_id, status_type, reason))
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        self.action(ACTION_STATUS, Some(report)).await.map(|_| ())
    }

    /// 尽力通知对端，失败只记录日志
    pub async fn status_best_effort(&self, task_id: &str, status_type: i32, reason: &str) {
        if let Err(e) = self.status(task_id, status_type, reason).await {
            debug!("Failed to send status {} ({}): {}", status_type, reason, e);
        }
    }

    /// 请求写泵发送关闭帧
    pub async fn close(&self) {
        let _ = self.tx.send(Frame::Close).await;
    }
}

pub struct ControlChannel {
    sender: ControlSender,
    incoming: mpsc::Receiver<Incoming>,
    backlog: VecDeque<ControlMessage>,
    pumps: [JoinHandle<()>; 2],
}

impl ControlChannel {
    /// 发送端：axum WebSocket
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message;

        let (sink, stream) = socket.split();
        Self::spawn(
            sink,
            stream,
            |frame| match frame {
                Frame::Text(text) => Message::Text(text),
                _ => Message::Close(None),
            },
            |message| match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(_) => Frame::Binary,
                Message::Close(_) => Frame::Close,
                _ => Frame::Ignored,
            },
        )
    }

    /// 接收端：tungstenite WebSocket（TLS 或明文）
    pub fn from_tungstenite<S>(socket: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use tokio_tungstenite::tungstenite::Message;

        let (sink, stream) = socket.split();
        Self::spawn(
            sink,
            stream,
            |frame| match frame {
                Frame::Text(text) => Message::Text(text),
                _ => Message::Close(None),
            },
            |message| match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(_) => Frame::Binary,
                Message::Close(_) => Frame::Close,
                _ => Frame::Ignored,
            },
        )
    }

    fn spawn<Tx, Rx, M, E>(
        mut sink: Tx,
        mut stream: Rx,
        encode: fn(Frame) -> M,
        decode: fn(M) -> Frame,
    ) -> Self
    where
        Tx: Sink<M> + Unpin + Send + 'static,
        Tx::Error: Display,
        Rx: Stream<Item = Result<M, E>> + Unpin + Send + 'static,
        E: Display + Send,
        M: Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<Incoming>(QUEUE_DEPTH);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Frame::Close);
                if let Err(e) = sink.send(encode(frame)).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let event = match item.map(decode) {
                    Ok(Frame::Text(text)) => match ControlMessage::parse(&text) {
                        Some(message) => {
                            trace!("WS recv: {}", message);
                            Ok(message)
                        }
                        None => {
                            warn!("Invalid control message: {}", text);
                            Err(TransferError::Protocol(format!("invalid message: {text}")))
                        }
                    },
                    Ok(Frame::Binary) => Err(TransferError::Protocol(
                        "unexpected binary frame".to_string(),
                    )),
                    Ok(Frame::Ignored) => continue,
                    Ok(Frame::Close) => break,
                    Err(e) => {
                        debug!("WebSocket read failed: {}", e);
                        break;
                    }
                };
                let fatal = event.is_err();
                if in_tx.send(event).await.is_err() || fatal {
                    break;
                }
            }
        });

        Self {
            sender: ControlSender {
                tx: out_tx,
                next_id: Arc::new(AtomicU32::new(0)),
            },
            incoming: in_rx,
            backlog: VecDeque::new(),
            pumps: [writer, reader],
        }
    }

    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    /// 下一条消息；`None` 表示对端已关闭
    ///
    /// 可以安全地用在 `tokio::select!` 分支中。
    pub async fn recv(&mut self) -> Option<Incoming> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(Ok(message));
        }
        self.incoming.recv().await
    }

    /// 发送 action 并等待同 ID 的 ack
    ///
    /// 等待期间收到的其它消息按顺序缓存，随后由 [`recv`](Self::recv) 返回。
    pub async fn request(
        &mut self,
        name: &str,
        payload: Option<Value>,
        timeout: Duration,
        stage: &'static str,
    ) -> Result<ControlMessage, TransferError> {
        let id = self.sender.action(name, payload).await?;
        let incoming = &mut self.incoming;
        let backlog = &mut self.backlog;

        with_timeout(stage, timeout, async move {
            loop {
                match incoming.recv().await {
                    Some(Ok(message)) if message.kind == MessageKind::Ack && message.id == id => {
                        return Ok(message);
                    }
                    Some(Ok(message)) => backlog.push_back(message),
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(TransferError::Protocol(format!(
                            "control channel closed while waiting for ack of {name}"
                        )));
                    }
                }
            }
        })
        .await
    }

    /// 发送关闭帧并等待写泵结束
    pub async fn close(mut self) {
        self.sender.close().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.pumps[0]).await;
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
