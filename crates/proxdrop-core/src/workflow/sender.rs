//! 发送端工作流
//!
//! 高层 API 封装完整的发送流程:
//! 1. 占用传输槽位，启动传输服务器
//! 2. 建立直连网络（热点）
//! 3. 通过 BLE 把连接凭据交给接收端
//! 4. 等待接收端接入控制通道，协商版本并发出发送请求
//! 5. 提供压缩包下载，直到接收端回报最终状态
//!
//! 无论成功与否，结束时都会关闭控制通道、停止服务器、拆除直连网络并释放槽位。

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::supervisor::TransferSupervisor;
use super::{cancellable, payload};
use crate::ble::{CredentialChannel, local_sender_id, publish_credentials};
use crate::config::{AppSettings, TransferTimeouts, TransportSecurity};
use crate::error::{TransferError, with_timeout};
use crate::transfer::protocol::{
    ACTION_SEND_REQUEST, ACTION_STATUS, ACTION_VERSION_NEGOTIATION, VersionAck, VersionProposal,
    status_type,
};
use crate::transfer::sender_server::thumbnail_path;
use crate::transfer::{
    ControlChannel, MessageKind, ProgressThrottler, SendRequest, ServerEvent, StatusReport,
    TransferServer, TransferTask,
};
use crate::wifi::{LinkCredentials, LinkNegotiator, LinkSession, LocalLink};

/// 发送进度回调
pub trait SendProgressCallback: Send + Sync {
    /// 状态更新
    fn on_status(&self, status: &str);
    /// 进度更新（已限流）
    fn on_progress(&self, sent: u64, total: u64);
    /// 接收端确认完成
    fn on_complete(&self);
    /// 发送失败，参数为面向用户的提示
    fn on_error(&self, error: &str);
}

/// 发送选项
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// 发送者名称
    pub sender_name: String,
    pub transport: TransportSecurity,
    /// 传输服务器监听地址
    pub bind_address: IpAddr,
    pub timeouts: TransferTimeouts,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            sender_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "proxdrop".to_string()),
            transport: TransportSecurity::Tls,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            timeouts: TransferTimeouts::default(),
        }
    }
}

impl SendOptions {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            sender_name: settings.device_name.clone(),
            transport: settings.transport,
            timeouts: settings.timeouts,
            ..Self::default()
        }
    }
}

/// 一次成功发送的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub task_id: String,
    /// 交给连接的压缩包字节数
    pub bytes_sent: u64,
}

/// 发送过程中需要统一清理的资源
#[derive(Default)]
struct Held {
    link: Option<LinkSession>,
    channel: Option<ControlChannel>,
}

/// 发送端工作流
pub struct Sender {
    options: SendOptions,
    supervisor: Arc<TransferSupervisor>,
    negotiator: LinkNegotiator,
    credentials: Arc<dyn CredentialChannel>,
}

impl Sender {
    pub fn new(
        options: SendOptions,
        supervisor: Arc<TransferSupervisor>,
        link: Arc<dyn LocalLink>,
        credentials: Arc<dyn CredentialChannel>,
    ) -> Self {
        Self {
            options,
            supervisor,
            negotiator: LinkNegotiator::new(link),
            credentials,
        }
    }

    /// 发送文件到任务中的目标设备
    ///
    /// 可以通过 [`TransferSupervisor::cancel`] 以任务 ID 取消。
    pub async fn send<C: SendProgressCallback>(
        &self,
        task: TransferTask,
        callback: &C,
    ) -> Result<SendReport, TransferError> {
        let result = self.run(task, callback).await;
        match &result {
            Ok(report) => {
                info!(
                    "Task {} completed, {} bytes sent",
                    report.task_id, report.bytes_sent
                );
                callback.on_complete();
            }
            Err(e) => {
                error!("Send failed: {}", e);
                callback.on_error(&e.user_message());
            }
        }
        result
    }

    async fn run<C: SendProgressCallback>(
        &self,
        task: TransferTask,
        callback: &C,
    ) -> Result<SendReport, TransferError> {
        let permit = self
            .supervisor
            .try_acquire(&task.id)
            .ok_or(TransferError::Busy)?;
        let cancel = permit.cancel_token();
        let task = Arc::new(task);
        info!(
            "Sending {} file(s), {} bytes to '{}' (task {})",
            task.files.len(),
            task.total_size(),
            task.peer.name,
            task.id
        );

        callback.on_status("准备发送...");
        let mut server = TransferServer::start(
            task.clone(),
            self.options.transport,
            self.options.bind_address,
            &cancel,
        )
        .await?;

        let mut held = Held::default();
        let result = self
            .drive(&task, &cancel, &mut server, &mut held, callback)
            .await;

        if let Some(channel) = held.channel.take() {
            let notice = match &result {
                Err(TransferError::UserCancelled { is_remote: false }) => {
                    Some((status_type::CANCELLED, "user cancel".to_string()))
                }
                Err(e @ TransferError::Timeout { .. }) => Some((status_type::FAILED, e.to_string())),
                _ => None,
            };
            if let Some((status, reason)) = notice {
                channel
                    .sender()
                    .status_best_effort(&task.id, status, &reason)
                    .await;
            }
            channel.close().await;
        }
        server.shutdown();
        if let Some(link) = held.link.take() {
            link.release().await;
        }
        permit.release();

        result
    }

    async fn drive<C: SendProgressCallback>(
        &self,
        task: &TransferTask,
        cancel: &CancellationToken,
        server: &mut TransferServer,
        held: &mut Held,
        callback: &C,
    ) -> Result<SendReport, TransferError> {
        let timeouts = self.options.timeouts;

        callback.on_status("创建直连网络...");
        let (group, link) = self.negotiator.form(timeouts.link()).await?;
        held.link = Some(link);
        if cancel.is_cancelled() {
            return Err(TransferError::UserCancelled { is_remote: false });
        }
        callback.on_status(&format!("直连网络已创建: {}", group.ssid));

        callback.on_status("连接到接收端...");
        let sender_id = format!("{:04x}", local_sender_id());
        let credentials = LinkCredentials::new(&group, server.port());
        cancellable(cancel, async {
            publish_credentials(self.credentials.as_ref(), &task.peer, &credentials, &sender_id)
                .await
                .map_err(|e| TransferError::Link(format!("credential exchange failed: {e}")))
        })
        .await?;

        callback.on_status("等待接收端连接...");
        let accepted = cancellable(
            cancel,
            with_timeout("waiting for receiver to connect", timeouts.link(), async {
                server.accept_control().await.ok_or_else(|| {
                    TransferError::Protocol("transfer server stopped".to_string())
                })
            }),
        )
        .await?;
        let channel = held.channel.insert(accepted);
        info!("Receiver connected to control channel");

        let proposal = payload(&VersionProposal::default())?;
        let ack = cancellable(
            cancel,
            channel.request(
                ACTION_VERSION_NEGOTIATION,
                Some(proposal),
                timeouts.negotiation(),
                "negotiating protocol version",
            ),
        )
        .await
        .map_err(|e| match e {
            TransferError::Timeout { .. } => TransferError::Protocol(format!(
                "receiver did not answer {ACTION_VERSION_NEGOTIATION}"
            )),
            other => other,
        })?;
        match ack.payload_as::<VersionAck>() {
            Ok(version) => debug!(
                "Negotiated version {} (thread limit {:?})",
                version.version, version.thread_limit
            ),
            Err(_) => debug!("Version ack without payload"),
        }

        let (file_name, mime_type) = task.summary();
        let request = SendRequest {
            task_id: Some(task.id.clone()),
            id: Some(task.id.clone()),
            sender_id: Some(sender_id),
            sender_name: self.options.sender_name.clone(),
            file_name,
            mime_type,
            file_count: u32::try_from(task.files.len()).unwrap_or(u32::MAX),
            total_size: task.total_size(),
            thumbnail: task.thumbnail.as_ref().map(|_| thumbnail_path(&task.id)),
        };
        cancellable(
            cancel,
            channel.request(
                ACTION_SEND_REQUEST,
                Some(payload(&request)?),
                timeouts.negotiation(),
                "waiting for send request ack",
            ),
        )
        .await?;
        callback.on_status("等待对方接受...");

        let control = channel.sender();
        let stall_after = timeouts.stall();
        let stall = tokio::time::sleep(stall_after);
        tokio::pin!(stall);

        let report = |total: u64, sent: u64| callback.on_progress(sent, total);
        let mut throttler = None;
        let mut bytes_sent = 0;

        loop {
            // 服务器事件优先，保证读到完成状态前已记下发送字节数
            tokio::select! {
                biased;

                Some(event) = server.next_event() => {
                    stall.as_mut().reset(Instant::now() + stall_after);
                    match event {
                        ServerEvent::DownloadStarted { total } => {
                            debug!("Receiver started download ({} bytes)", total);
                            callback.on_status("正在发送...");
                        }
                        ServerEvent::Progress { sent, total } => {
                            throttler
                                .get_or_insert_with(|| ProgressThrottler::new(total, report))
                                .update(sent);
                        }
                        ServerEvent::ArchiveSent(bytes) => {
                            bytes_sent = bytes;
                            throttler
                                .get_or_insert_with(|| ProgressThrottler::new(bytes, report))
                                .finish(bytes);
                            callback.on_status("等待接收端确认...");
                        }
                        ServerEvent::ArchiveFailed(reason) => {
                            warn!("Archive transfer interrupted: {}", reason);
                        }
                    }
                }
                incoming = channel.recv() => {
                    let Some(message) = incoming else {
                        return Err(TransferError::Protocol(
                            "receiver closed the control channel".to_string(),
                        ));
                    };
                    let message = message?;
                    stall.as_mut().reset(Instant::now() + stall_after);

                    if message.kind != MessageKind::Action {
                        debug!("Ignoring {}", message);
                        continue;
                    }
                    if let Err(e) = control.ack(&message, None).await {
                        debug!("Failed to ack '{}': {}", message.name, e);
                    }
                    if !message.is_action(ACTION_STATUS) {
                        debug!("Unhandled action '{}'", message.name);
                        continue;
                    }

                    let status: StatusReport = message
                        .payload_as()
                        .map_err(|e| TransferError::Protocol(format!("invalid status payload: {e}")))?;
                    info!(
                        "Receiver status: type={}, reason='{}'",
                        status.status_type, status.reason
                    );
                    return match status.status_type {
                        status_type::COMPLETED => Ok(SendReport {
                            task_id: task.id.clone(),
                            bytes_sent,
                        }),
                        status_type::CANCELLED => Err(TransferError::UserCancelled { is_remote: true }),
                        other => Err(TransferError::Protocol(format!(
                            "receiver reported status {other}: {}",
                            status.reason
                        ))),
                    };
                }
                () = &mut stall => {
                    return Err(TransferError::Timeout {
                        stage: "waiting for transfer progress",
                        after: stall_after,
                    });
                }
                () = cancel.cancelled() => {
                    return Err(TransferError::UserCancelled { is_remote: false });
                }
            }
        }
    }
}

/// 简化的发送回调实现
pub struct SimpleSendCallback {
    tx: mpsc::Sender<SendEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEvent {
    Status(String),
    Progress { sent: u64, total: u64 },
    Complete,
    Error(String),
}

impl SimpleSendCallback {
    pub fn new() -> (Self, mpsc::Receiver<SendEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl SendProgressCallback for SimpleSendCallback {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(SendEvent::Status(status.to_string()));
    }

    fn on_progress(&self, sent: u64, total: u64) {
        let _ = self.tx.try_send(SendEvent::Progress { sent, total });
    }

    fn on_complete(&self) {
        let _ = self.tx.try_send(SendEvent::Complete);
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.try_send(SendEvent::Error(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{BleError, DiscoveredPeer};
    use crate::transfer::FileDescriptor;
    use crate::wifi::GroupInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FailingLink {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl LocalLink for FailingLink {
        async fn create_group(&self) -> anyhow::Result<GroupInfo> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("no wifi device")
        }

        async fn join_group(&self, _credentials: &LinkCredentials) -> anyhow::Result<IpAddr> {
            anyhow::bail!("no wifi device")
        }

        async fn remove_group(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoBle;

    #[async_trait]
    impl CredentialChannel for NoBle {
        async fn read_status(&self, _peer: &DiscoveredPeer) -> Result<Vec<u8>, BleError> {
            Err(BleError::NoAdapter)
        }

        async fn write_credentials(&self, _peer: &DiscoveredPeer, _payload: Vec<u8>) -> Result<(), BleError> {
            Err(BleError::NoAdapter)
        }
    }

    fn task() -> TransferTask {
        let peer = DiscoveredPeer {
            id: "ab12".to_string(),
            name: "Phone".to_string(),
            brand_id: None,
            supports_5ghz: false,
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: None,
        };
        TransferTask::new(peer, vec![FileDescriptor::from_text("hello")])
    }

    fn sender(supervisor: Arc<TransferSupervisor>, link: Arc<FailingLink>) -> Sender {
        let options = SendOptions {
            transport: TransportSecurity::Plain,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..SendOptions::default()
        };
        Sender::new(options, supervisor, link, Arc::new(NoBle))
    }

    #[test]
    fn test_options_from_settings() {
        let settings = AppSettings {
            device_name: "Desk".to_string(),
            transport: TransportSecurity::Plain,
            ..AppSettings::default()
        };
        let options = SendOptions::from_settings(&settings);
        assert_eq!(options.sender_name, "Desk");
        assert_eq!(options.transport, TransportSecurity::Plain);
        assert_eq!(options.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[tokio::test]
    async fn test_busy_when_slot_taken() {
        let supervisor = Arc::new(TransferSupervisor::new());
        let link = Arc::new(FailingLink::default());
        let _permit = supervisor.try_acquire("other").unwrap();

        let (callback, mut rx) = SimpleSendCallback::new();
        let result = sender(supervisor, link.clone()).send(task(), &callback).await;

        assert!(matches!(result, Err(TransferError::Busy)));
        assert_eq!(link.creates.load(Ordering::SeqCst), 0);
        assert!(matches!(rx.recv().await, Some(SendEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_link_failure_releases_slot() {
        let supervisor = Arc::new(TransferSupervisor::new());
        let link = Arc::new(FailingLink::default());

        let (callback, _rx) = SimpleSendCallback::new();
        let result = sender(supervisor.clone(), link.clone()).send(task(), &callback).await;

        assert!(matches!(result, Err(TransferError::Link(_))));
        assert_eq!(link.creates.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_busy());
    }
}
