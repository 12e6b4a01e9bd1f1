//! 发送端 HTTP(S) 服务
//!
//! 同一端口上提供三个入口：
//!
//! - `GET /websocket`：控制通道，升级为 WebSocket 后交给编排器
//! - `GET /download?taskId=`：ZIP 压缩包下载，首次请求时生成
//! - `GET /thumbnail/{taskId}`：可选缩略图
//!
//! 下载过程通过 [`ServerEvent`] 汇报，编排器据此更新进度和判断卡死。

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use futures_util::{Stream, StreamExt, stream};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::archive::write_archive;
use super::channel::ControlChannel;
use super::tls;
use super::TransferTask;
use crate::config::TransportSecurity;
use crate::error::TransferError;

const CHUNK_SIZE: usize = 64 * 1024;

/// 缩略图相对路径，写入 sendRequest 的 `thumbnail` 字段
pub fn thumbnail_path(task_id: &str) -> String {
    format!("/thumbnail/{task_id}")
}

/// 下载过程中的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    DownloadStarted { total: u64 },
    Progress { sent: u64, total: u64 },
    /// 压缩包全部交给了连接
    ArchiveSent(u64),
    /// 压缩包生成失败或下载中断
    ArchiveFailed(String),
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(rename = "taskId")]
    task_id: String,
}

struct ServerState {
    task: Arc<TransferTask>,
    spool: PathBuf,
    archive: OnceCell<u64>,
    control_tx: mpsc::Sender<ControlChannel>,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
}

impl ServerState {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    async fn ensure_archive(&self) -> Result<u64, TransferError> {
        self.archive
            .get_or_try_init(|| async {
                let files = self.task.files.clone();
                let dest = self.spool.clone();
                let size = tokio::task::spawn_blocking(move || write_archive(&files, &dest))
                    .await
                    .map_err(|e| TransferError::Io(io::Error::other(e)))??;
                info!("Archive ready: {:?} ({} bytes)", self.spool, size);
                Ok(size)
            })
            .await
            .copied()
    }
}

/// 单个任务的传输服务
pub struct TransferServer {
    port: u16,
    state: Arc<ServerState>,
    control_rx: mpsc::Receiver<ControlChannel>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    serve: JoinHandle<()>,
    stopped: bool,
}

impl TransferServer {
    /// 在 `bind` 的随机端口上启动服务
    ///
    /// `cancel` 被取消时正在进行的下载立即中断。
    pub async fn start(
        task: Arc<TransferTask>,
        security: TransportSecurity,
        bind: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<Self, TransferError> {
        let (control_tx, control_rx) = mpsc::channel(1);
        let (events, events_rx) = mpsc::unbounded_channel();
        let spool = std::env::temp_dir().join(format!("proxdrop-{}.zip", task.id));

        let state = Arc::new(ServerState {
            task,
            spool,
            archive: OnceCell::new(),
            control_tx,
            events,
            cancel: cancel.child_token(),
        });

        let app = Router::new()
            .route("/websocket", get(websocket_handler))
            .route("/download", get(download_handler))
            .route("/thumbnail/:task_id", get(thumbnail_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind(SocketAddr::new(bind, 0)).await?;
        let port = listener.local_addr()?.port();

        let serve = match security {
            TransportSecurity::Plain => {
                let shutdown = state.cancel.clone().cancelled_owned();
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        error!("HTTP server error: {}", e);
                    }
                })
            }
            TransportSecurity::Tls => {
                let acceptor =
                    tls::self_signed_acceptor().map_err(|e| TransferError::Io(io::Error::other(e)))?;
                tokio::spawn(serve_tls(listener, acceptor, app, state.cancel.clone()))
            }
        };

        info!("Transfer server listening on {}:{} ({:?})", bind, port, security);

        Ok(Self {
            port,
            state,
            control_rx,
            events_rx,
            serve,
            stopped: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 等待接收端连上控制通道
    pub async fn accept_control(&mut self) -> Option<ControlChannel> {
        self.control_rx.recv().await
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events_rx.recv().await
    }

    /// 停止服务并删除临时压缩包
    pub fn shutdown(mut self) {
        debug!("Shutting down transfer server on port {}", self.port);
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.state.cancel.cancel();
        self.serve.abort();
        match std::fs::remove_file(&self.state.spool) {
            Ok(()) => debug!("Removed spool {:?}", self.state.spool),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove spool {:?}: {}", self.state.spool, e),
        }
    }
}

impl Drop for TransferServer {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: tokio_native_tls::TlsAcceptor,
    app: Router,
    cancel: CancellationToken,
) {
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder;
    use hyper_util::service::TowerToHyperService;

    let acceptor = Arc::new(acceptor);
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), service);
            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        debug!("Connection from {} ended: {}", peer, e);
                    }
                }
                () = cancel.cancelled() => {}
            }
        });
    }
    debug!("TLS accept loop stopped");
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        debug!("Control channel connected");
        if state.control_tx.try_send(ControlChannel::from_axum(socket)).is_err() {
            warn!("Rejecting extra control connection");
        }
    })
}

async fn download_handler(
    Query(query): Query<DownloadQuery>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if query.task_id != state.task.id {
        warn!("Download requested for unknown task {}", query.task_id);
        return (StatusCode::NOT_FOUND, "Task not found").into_response();
    }

    if let Err(e) = state.ensure_archive().await {
        error!("Failed to build archive: {}", e);
        state.emit(ServerEvent::ArchiveFailed(e.to_string()));
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to build archive").into_response();
    }

    let file = match tokio::fs::File::open(&state.spool).await {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to open archive: {}", e);
            state.emit(ServerEvent::ArchiveFailed(e.to_string()));
            return (StatusCode::INTERNAL_SERVER_ERROR, "Archive unavailable").into_response();
        }
    };
    let total = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            state.emit(ServerEvent::ArchiveFailed(e.to_string()));
            return (StatusCode::INTERNAL_SERVER_ERROR, "Archive unavailable").into_response();
        }
    };

    info!("Download started for task {} ({} bytes)", state.task.id, total);
    state.emit(ServerEvent::DownloadStarted { total });

    let body = counted(
        ReaderStream::with_capacity(file, CHUNK_SIZE),
        total,
        state.events.clone(),
    )
    .take_until(state.cancel.clone().cancelled_owned());

    (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, total.to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

async fn thumbnail_handler(
    Path(task_id): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    match (&state.task.thumbnail, task_id == state.task.id) {
        (Some(bytes), true) => {
            let mime = if bytes.starts_with(b"\x89PNG") {
                "image/png"
            } else {
                "image/jpeg"
            };
            ([(header::CONTENT_TYPE, mime)], bytes.clone()).into_response()
        }
        _ => (StatusCode::NOT_FOUND, "No thumbnail").into_response(),
    }
}

/// 下载计数状态；在读完之前被丢弃说明连接中断
struct Counter {
    sent: u64,
    total: u64,
    events: mpsc::UnboundedSender<ServerEvent>,
    finished: bool,
}

impl Counter {
    fn complete(&mut self) {
        self.finished = true;
        info!("Archive sent ({} bytes)", self.sent);
        let _ = self.events.send(ServerEvent::ArchiveSent(self.sent));
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.events.send(ServerEvent::ArchiveFailed(format!(
                "download interrupted after {} of {} bytes",
                self.sent, self.total
            )));
        }
    }
}

fn counted<S>(
    source: S,
    total: u64,
    events: mpsc::UnboundedSender<ServerEvent>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send + 'static,
{
    let counter = Counter {
        sent: 0,
        total,
        events,
        finished: false,
    };
    stream::unfold((source, counter), |(mut source, mut counter)| async move {
        if counter.finished {
            return None;
        }
        match source.next().await {
            Some(Ok(chunk)) => {
                counter.sent += chunk.len() as u64;
                let _ = counter.events.send(ServerEvent::Progress {
                    sent: counter.sent,
                    total: counter.total,
                });
                // 带 Content-Length 时连接写满即停止轮询，不会再读到流结束
                if counter.sent >= counter.total {
                    counter.complete();
                }
                Some((Ok(chunk), (source, counter)))
            }
            Some(Err(e)) => {
                counter.finished = true;
                let _ = counter.events.send(ServerEvent::ArchiveFailed(e.to_string()));
                Some((Err(e), (source, counter)))
            }
            None => {
                counter.complete();
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::FileDescriptor;

    #[tokio::test]
    async fn test_counted_stream_reports_progress_and_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defg")),
        ];
        let body: Vec<_> = counted(stream::iter(chunks), 7, tx).collect().await;
        assert_eq!(body.len(), 2);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                ServerEvent::Progress { sent: 3, total: 7 },
                ServerEvent::Progress { sent: 7, total: 7 },
                ServerEvent::ArchiveSent(7),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_download_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ];
        let mut body = Box::pin(counted(stream::iter(chunks), 6, tx));
        assert!(body.next().await.is_some());
        drop(body);

        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Progress { sent: 3, total: 6 });
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::ArchiveFailed(_)));
    }

    #[tokio::test]
    async fn test_fully_sent_body_is_not_reported_as_interrupted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ];
        let mut body = Box::pin(counted(stream::iter(chunks), 6, tx));
        assert!(body.next().await.is_some());
        assert!(body.next().await.is_some());
        // 不再轮询到流结束就丢弃
        drop(body);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                ServerEvent::Progress { sent: 3, total: 6 },
                ServerEvent::Progress { sent: 6, total: 6 },
                ServerEvent::ArchiveSent(6),
            ]
        );
    }

    fn task() -> Arc<TransferTask> {
        let peer = crate::ble::DiscoveredPeer {
            id: "ab12".to_string(),
            name: "Peer".to_string(),
            brand_id: None,
            supports_5ghz: false,
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: None,
        };
        Arc::new(TransferTask::new(peer, vec![FileDescriptor::from_text("hi")]))
    }

    #[tokio::test]
    async fn test_shutdown_stops_server_and_removes_spool() {
        let cancel = CancellationToken::new();
        let server = TransferServer::start(
            task(),
            TransportSecurity::Plain,
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            &cancel,
        )
        .await
        .unwrap();
        let spool = server.state.spool.clone();
        let stopped = server.state.cancel.clone();
        std::fs::write(&spool, b"zip").unwrap();

        server.shutdown();
        assert!(stopped.is_cancelled());
        assert!(!cancel.is_cancelled());
        assert!(!spool.exists());
    }

    #[test]
    fn test_thumbnail_path() {
        assert_eq!(thumbnail_path("t-1"), "/thumbnail/t-1");
    }
}
