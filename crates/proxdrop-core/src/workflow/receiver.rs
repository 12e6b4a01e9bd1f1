//! 接收端工作流
//!
//! 高层 API 封装完整的接收流程:
//! 1. 凭 BLE 收到的凭据加入发送端的直连网络
//! 2. 连接控制通道，应答版本协商，等待发送请求
//! 3. 征求用户同意（或自动接受）
//! 4. 下载压缩包并边下载边解包到输出目录
//! 5. 向发送端回报最终状态

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::supervisor::{TransferPermit, TransferSupervisor};
use super::{cancellable, payload};
use crate::ble::CredentialsReceived;
use crate::config::{AppSettings, TransferTimeouts, TransportSecurity};
use crate::error::{TransferError, with_timeout};
use crate::transfer::protocol::{
    ACTION_SEND_REQUEST, ACTION_STATUS, ACTION_VERSION_NEGOTIATION, REASON_USER_REFUSE,
    VersionAck, VersionProposal, status_type,
};
use crate::transfer::receiver_client::{
    connect_control, download_archive, fetch_thumbnail, http_client,
};
use crate::transfer::{
    ControlChannel, ControlMessage, ControlSender, Endpoint, MessageKind, SendRequest,
    StatusReport, TransferOutcome,
};
use crate::wifi::{LinkCredentials, LinkNegotiator, LocalLink};

/// 接收进度回调
pub trait ReceiveProgressCallback: Send + Sync {
    /// 状态更新
    fn on_status(&self, status: &str);
    /// 收到发送请求
    ///
    /// 未开启自动接受时，通过 [`TransferSupervisor::respond`] 以任务 ID 作答，
    /// 在本回调内直接作答也可以。
    fn on_request(&self, request: &ReceiveRequest);
    /// 进度更新（已限流）
    fn on_progress(&self, received: u64, total: u64);
    /// 接收完成
    fn on_complete(&self, files: Vec<PathBuf>);
    /// 接收失败，参数为面向用户的提示
    fn on_error(&self, error: &str);
}

/// 接收请求信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub task_id: String,
    pub sender_name: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_count: u32,
    pub total_size: u64,
    pub thumbnail: Option<Vec<u8>>,
}

impl ReceiveRequest {
    fn new(task_id: &str, request: &SendRequest, thumbnail: Option<Vec<u8>>) -> Self {
        Self {
            task_id: task_id.to_string(),
            sender_name: request.sender_name.clone(),
            file_name: request.file_name.clone(),
            mime_type: request.mime_type.clone(),
            file_count: request.file_count,
            total_size: request.total_size,
            thumbnail,
        }
    }
}

/// 接收选项
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// 文件保存目录
    pub output_dir: PathBuf,
    /// 是否自动接受
    pub auto_accept: bool,
    pub transport: TransportSecurity,
    pub timeouts: TransferTimeouts,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            auto_accept: false,
            transport: TransportSecurity::Tls,
            timeouts: TransferTimeouts::default(),
        }
    }
}

impl ReceiveOptions {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            output_dir: settings.download_dir.clone(),
            auto_accept: settings.auto_accept,
            transport: settings.transport,
            timeouts: settings.timeouts,
        }
    }
}

/// 一次接收的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    pub task_id: String,
    pub sender_name: String,
    pub files: Vec<PathBuf>,
    /// 发送端通告的文件数
    pub expected: usize,
    pub outcome: TransferOutcome,
}

#[derive(Default)]
struct Held {
    channel: Option<ControlChannel>,
    task_id: Option<String>,
    /// 已经向发送端回报过最终状态
    reported: bool,
}

/// 接收端工作流
pub struct Receiver {
    options: ReceiveOptions,
    supervisor: Arc<TransferSupervisor>,
    negotiator: LinkNegotiator,
}

impl Receiver {
    pub fn new(
        options: ReceiveOptions,
        supervisor: Arc<TransferSupervisor>,
        link: Arc<dyn LocalLink>,
    ) -> Self {
        Self {
            options,
            supervisor,
            negotiator: LinkNegotiator::new(link),
        }
    }

    /// 逐个处理 GATT 响应端交来的凭据，队列关闭时返回
    ///
    /// 排队超过链路超时的凭据直接丢弃，发送端那时已经拆掉了网络。
    pub async fn serve<C: ReceiveProgressCallback>(
        &self,
        mut handoff: mpsc::Receiver<CredentialsReceived>,
        callback: &C,
    ) {
        let max_age = self.options.timeouts.link();
        while let Some(event) = handoff.recv().await {
            let age = event.received_at.elapsed();
            if age > max_age {
                warn!(
                    "Dropping credentials from {} queued for {:?}",
                    event.device, age
                );
                continue;
            }
            info!(
                "Handling credentials from {} (encrypted={})",
                event.device, event.was_encrypted
            );
            if let Err(e) = self.receive(&event.credentials, callback).await {
                debug!("Receive from {} ended: {}", event.device, e);
            }
        }
        debug!("Credential handoff closed");
    }

    /// 按凭据连接发送端并接收文件
    pub async fn receive<C: ReceiveProgressCallback>(
        &self,
        credentials: &LinkCredentials,
        callback: &C,
    ) -> Result<ReceiveReport, TransferError> {
        let result = self.run(credentials, callback).await;
        match &result {
            Ok(report) => {
                info!(
                    "Task {} finished: {:?}, {}/{} file(s) in {:?}",
                    report.task_id,
                    report.outcome,
                    report.files.len(),
                    report.expected,
                    self.options.output_dir
                );
                callback.on_complete(report.files.clone());
            }
            Err(e) => {
                error!("Receive failed: {}", e);
                callback.on_error(&e.user_message());
            }
        }
        result
    }

    async fn run<C: ReceiveProgressCallback>(
        &self,
        credentials: &LinkCredentials,
        callback: &C,
    ) -> Result<ReceiveReport, TransferError> {
        // 真正的任务 ID 在 sendRequest 中才出现
        let provisional = format!("incoming-{}", Uuid::new_v4());
        let mut permit = self
            .supervisor
            .try_acquire(&provisional)
            .ok_or(TransferError::Busy)?;
        let cancel = permit.cancel_token();

        let port = u16::try_from(credentials.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| TransferError::Protocol(format!("invalid port {}", credentials.port)))?;

        callback.on_status("连接到发送端网络...");
        let link = self
            .negotiator
            .connect(credentials, self.options.timeouts.link())
            .await?;
        let Some(host) = link.peer_addr() else {
            link.release().await;
            return Err(TransferError::Link("peer address unknown".to_string()));
        };

        let mut held = Held::default();
        let result = self
            .drive(host, port, &cancel, &mut permit, &mut held, callback)
            .await;

        if let Some(channel) = held.channel.take() {
            if let Some(task_id) = held.task_id.as_deref()
                && !held.reported
                && let Some((status, reason)) = final_status(&result)
            {
                channel
                    .sender()
                    .status_best_effort(task_id, status, &reason)
                    .await;
            }
            channel.close().await;
        }
        link.release().await;
        permit.release();

        result
    }

    async fn drive<C: ReceiveProgressCallback>(
        &self,
        host: IpAddr,
        port: u16,
        cancel: &CancellationToken,
        permit: &mut TransferPermit,
        held: &mut Held,
        callback: &C,
    ) -> Result<ReceiveReport, TransferError> {
        let timeouts = self.options.timeouts;
        let endpoint = Endpoint::new(self.options.transport, host, port);

        callback.on_status("连接到发送端...");
        let connected = cancellable(
            cancel,
            with_timeout("connecting to sender", timeouts.link(), connect_control(&endpoint)),
        )
        .await?;
        let channel = held.channel.insert(connected);
        let control = channel.sender();

        let request = cancellable(
            cancel,
            with_timeout("waiting for send request", timeouts.negotiation(), async {
                loop {
                    let message = channel.recv().await.ok_or_else(|| {
                        TransferError::Protocol(
                            "sender closed the control channel before sendRequest".to_string(),
                        )
                    })??;
                    if let Some(request) = answer(&control, &message).await? {
                        return Ok(request);
                    }
                }
            }),
        )
        .await?;

        let task_id = request
            .task_id()
            .ok_or_else(|| TransferError::Protocol("sendRequest without task id".to_string()))?
            .to_string();
        permit.rebind(&task_id);
        held.task_id = Some(task_id.clone());

        let client = http_client()?;
        let thumbnail = match &request.thumbnail {
            Some(path) => tokio::time::timeout(
                timeouts.negotiation(),
                fetch_thumbnail(&client, &endpoint, path),
            )
            .await
            .ok()
            .flatten(),
            None => None,
        };

        let incoming = ReceiveRequest::new(&task_id, &request, thumbnail);
        info!(
            "Incoming transfer {} from '{}': {} file(s), {} bytes",
            task_id, incoming.sender_name, incoming.file_count, incoming.total_size
        );
        // 先登记，界面可以在 on_request 里直接作答
        let waiter = (!self.options.auto_accept).then(|| self.supervisor.register_consent(&task_id));
        callback.on_request(&incoming);

        let accepted = if let Some(waiter) = waiter {
            callback.on_status("等待确认...");
            let consent = waiter.wait(timeouts.consent());
            tokio::pin!(consent);
            loop {
                tokio::select! {
                    accepted = &mut consent => break accepted,
                    incoming = channel.recv() => match incoming {
                        Some(message) => {
                            answer(&control, &message?).await?;
                        }
                        None => {
                            return Err(TransferError::Protocol(
                                "sender closed the control channel".to_string(),
                            ));
                        }
                    },
                    () = cancel.cancelled() => break false,
                }
            }
        } else {
            true
        };
        if !accepted {
            control
                .status_best_effort(&task_id, status_type::CANCELLED, REASON_USER_REFUSE)
                .await;
            held.reported = true;
            return Err(TransferError::UserCancelled { is_remote: false });
        }

        tokio::fs::create_dir_all(&self.options.output_dir).await?;
        callback.on_status("正在接收...");

        let download_cancel = cancel.child_token();
        let _abort = download_cancel.clone().drop_guard();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let download = download_archive(
            &client,
            &endpoint,
            &task_id,
            &self.options.output_dir,
            request.total_size,
            &download_cancel,
            move |total, processed| {
                let _ = progress_tx.send((total, processed));
            },
        );
        tokio::pin!(download);

        let stall_after = timeouts.stall();
        let stall = tokio::time::sleep(stall_after);
        tokio::pin!(stall);
        let mut control_open = true;

        let unpacked = loop {
            tokio::select! {
                result = &mut download => break result,
                Some((total, processed)) = progress_rx.recv() => {
                    stall.as_mut().reset(Instant::now() + stall_after);
                    callback.on_progress(processed, total);
                }
                incoming = channel.recv(), if control_open => match incoming {
                    Some(message) => {
                        answer(&control, &message?).await?;
                    }
                    None => {
                        debug!("Control channel closed during download");
                        control_open = false;
                    }
                },
                () = &mut stall => {
                    return Err(TransferError::Timeout {
                        stage: "downloading archive",
                        after: stall_after,
                    });
                }
                () = cancel.cancelled() => {
                    return Err(TransferError::UserCancelled { is_remote: false });
                }
            }
        };
        while let Ok((total, processed)) = progress_rx.try_recv() {
            callback.on_progress(processed, total);
        }

        let unpacked = unpacked?;
        let expected = usize::try_from(request.file_count).unwrap_or(usize::MAX);
        let received = unpacked.files.len();
        if let Some(entry) = &unpacked.failed_entry {
            warn!("Entry '{}' could not be stored", entry);
        }

        match TransferOutcome::classify(received, expected) {
            TransferOutcome::Failed => Err(TransferError::PartialTransfer { received, expected }),
            outcome => Ok(ReceiveReport {
                task_id: task_id.clone(),
                sender_name: request.sender_name,
                files: unpacked.files,
                expected,
                outcome,
            }),
        }
    }
}

/// 应答一条消息；是 sendRequest 时返回其载荷
async fn answer(
    control: &ControlSender,
    message: &ControlMessage,
) -> Result<Option<SendRequest>, TransferError> {
    if message.kind != MessageKind::Action {
        debug!("Ignoring {}", message);
        return Ok(None);
    }

    match message.name.as_str() {
        ACTION_VERSION_NEGOTIATION => {
            let proposal: VersionProposal = message.payload_as().unwrap_or_default();
            let ack = VersionAck::answer(&proposal);
            debug!("Version proposal {}, answering {}", proposal.version, ack.version);
            control.ack(message, Some(payload(&ack)?)).await?;
            Ok(None)
        }
        ACTION_SEND_REQUEST => {
            control.ack(message, None).await?;
            message
                .payload_as()
                .map(Some)
                .map_err(|e| TransferError::Protocol(format!("invalid sendRequest payload: {e}")))
        }
        ACTION_STATUS => {
            // 对端发完状态通常随即关闭连接
            if let Err(e) = control.ack(message, None).await {
                debug!("Failed to ack status: {}", e);
            }
            let status: StatusReport = message
                .payload_as()
                .map_err(|e| TransferError::Protocol(format!("invalid status payload: {e}")))?;
            info!(
                "Sender status: type={}, reason='{}'",
                status.status_type, status.reason
            );
            Err(sender_status_error(&status))
        }
        other => {
            debug!("Acknowledging unknown action '{}'", other);
            control.ack(message, None).await?;
            Ok(None)
        }
    }
}

/// 发送端主动发来的状态一律意味着任务结束
fn sender_status_error(status: &StatusReport) -> TransferError {
    match status.status_type {
        status_type::CANCELLED => TransferError::UserCancelled { is_remote: true },
        status_type::FAILED => {
            TransferError::Protocol(format!("sender reported failure: {}", status.reason))
        }
        other => TransferError::Protocol(format!(
            "sender ended the task with status {other}: {}",
            status.reason
        )),
    }
}

/// 结束时回报给发送端的状态；对端发起的取消不回报
fn final_status(result: &Result<ReceiveReport, TransferError>) -> Option<(i32, String)> {
    match result {
        Ok(report) if report.outcome == TransferOutcome::Complete => {
            Some((status_type::COMPLETED, "done".to_string()))
        }
        Ok(report) => Some((
            status_type::FAILED,
            format!("received {} of {} files", report.files.len(), report.expected),
        )),
        Err(TransferError::UserCancelled { is_remote: true }) => None,
        Err(TransferError::UserCancelled { is_remote: false }) => {
            Some((status_type::CANCELLED, "user cancel".to_string()))
        }
        Err(e) => Some((status_type::FAILED, e.to_string())),
    }
}

/// 简化的接收回调实现
pub struct SimpleReceiveCallback {
    tx: mpsc::Sender<ReceiveEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    Status(String),
    Request(ReceiveRequest),
    Progress { received: u64, total: u64 },
    Complete(Vec<PathBuf>),
    Error(String),
}

impl SimpleReceiveCallback {
    pub fn new() -> (Self, mpsc::Receiver<ReceiveEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl ReceiveProgressCallback for SimpleReceiveCallback {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(ReceiveEvent::Status(status.to_string()));
    }

    fn on_request(&self, request: &ReceiveRequest) {
        let _ = self.tx.try_send(ReceiveEvent::Request(request.clone()));
    }

    fn on_progress(&self, received: u64, total: u64) {
        let _ = self.tx.try_send(ReceiveEvent::Progress { received, total });
    }

    fn on_complete(&self, files: Vec<PathBuf>) {
        let _ = self.tx.try_send(ReceiveEvent::Complete(files));
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.try_send(ReceiveEvent::Error(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wifi::GroupInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct UnreachableLink {
        joins: AtomicUsize,
        removals: AtomicUsize,
    }

    #[async_trait]
    impl LocalLink for UnreachableLink {
        async fn create_group(&self) -> anyhow::Result<GroupInfo> {
            anyhow::bail!("not a sender")
        }

        async fn join_group(&self, credentials: &LinkCredentials) -> anyhow::Result<IpAddr> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("network {} not found", credentials.ssid)
        }

        async fn remove_group(&self) -> anyhow::Result<()> {
            self.removals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn credentials(port: i32) -> LinkCredentials {
        LinkCredentials {
            id: Some("ab12".to_string()),
            ssid: "DIRECT-test".to_string(),
            psk: "12345678".to_string(),
            mac: "02:00:00:00:00:01".to_string(),
            port,
            key: None,
        }
    }

    fn report(files: usize, expected: usize, outcome: TransferOutcome) -> ReceiveReport {
        ReceiveReport {
            task_id: "t".to_string(),
            sender_name: "Phone".to_string(),
            files: (0..files).map(|i| PathBuf::from(format!("f{i}"))).collect(),
            expected,
            outcome,
        }
    }

    #[test]
    fn test_options_from_settings() {
        let settings = AppSettings {
            download_dir: PathBuf::from("/tmp/inbox"),
            auto_accept: true,
            ..AppSettings::default()
        };
        let options = ReceiveOptions::from_settings(&settings);
        assert_eq!(options.output_dir, PathBuf::from("/tmp/inbox"));
        assert!(options.auto_accept);
        assert_eq!(options.timeouts, settings.timeouts);
    }

    #[test]
    fn test_final_status() {
        let complete = final_status(&Ok(report(2, 2, TransferOutcome::Complete)));
        assert_eq!(complete, Some((status_type::COMPLETED, "done".to_string())));

        let partial = final_status(&Ok(report(1, 3, TransferOutcome::Partial)));
        assert_eq!(partial.map(|(status, _)| status), Some(status_type::FAILED));

        assert_eq!(
            final_status(&Err(TransferError::UserCancelled { is_remote: true })),
            None
        );
        assert_eq!(
            final_status(&Err(TransferError::UserCancelled { is_remote: false }))
                .map(|(status, _)| status),
            Some(status_type::CANCELLED)
        );
        assert_eq!(
            final_status(&Err(TransferError::PartialTransfer { received: 0, expected: 2 }))
                .map(|(status, _)| status),
            Some(status_type::FAILED)
        );
    }

    #[test]
    fn test_any_sender_status_ends_the_task() {
        assert!(matches!(
            sender_status_error(&StatusReport::new("t", status_type::CANCELLED, "user cancel")),
            TransferError::UserCancelled { is_remote: true }
        ));
        assert!(matches!(
            sender_status_error(&StatusReport::new("t", status_type::FAILED, "disk full")),
            TransferError::Protocol(_)
        ));
        assert!(matches!(
            sender_status_error(&StatusReport::new("t", status_type::COMPLETED, "done")),
            TransferError::Protocol(_)
        ));
        assert!(matches!(
            sender_status_error(&StatusReport::new("t", 9, "")),
            TransferError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_port_is_rejected_before_joining() {
        let supervisor = Arc::new(TransferSupervisor::new());
        let link = Arc::new(UnreachableLink::default());
        let receiver = Receiver::new(ReceiveOptions::default(), supervisor.clone(), link.clone());

        let (callback, _rx) = SimpleReceiveCallback::new();
        let result = receiver.receive(&credentials(70_000), &callback).await;

        assert!(matches!(result, Err(TransferError::Protocol(_))));
        assert_eq!(link.joins.load(Ordering::SeqCst), 0);
        assert!(!supervisor.is_busy());
    }

    #[tokio::test]
    async fn test_join_failure_tears_down_and_releases_slot() {
        let supervisor = Arc::new(TransferSupervisor::new());
        let link = Arc::new(UnreachableLink::default());
        let receiver = Receiver::new(ReceiveOptions::default(), supervisor.clone(), link.clone());

        let (callback, mut rx) = SimpleReceiveCallback::new();
        let result = receiver.receive(&credentials(40_000), &callback).await;

        assert!(matches!(result, Err(TransferError::Link(_))));
        assert_eq!(link.joins.load(Ordering::SeqCst), 1);
        assert_eq!(link.removals.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_busy());

        assert!(matches!(rx.recv().await, Some(ReceiveEvent::Status(_))));
        assert!(matches!(rx.recv().await, Some(ReceiveEvent::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_skips_stale_credentials() {
        let supervisor = Arc::new(TransferSupervisor::new());
        let link = Arc::new(UnreachableLink::default());
        let options = ReceiveOptions::default();
        let max_age = options.timeouts.link();
        let receiver = Receiver::new(options, supervisor, link.clone());

        let (tx, rx) = mpsc::channel(4);
        let event = |device: &str| CredentialsReceived {
            credentials: credentials(40_000),
            was_encrypted: false,
            device: device.to_string(),
            received_at: Instant::now(),
        };
        tx.send(event("stale")).await.unwrap();
        tokio::time::advance(max_age + std::time::Duration::from_secs(1)).await;
        tx.send(event("fresh")).await.unwrap();
        drop(tx);

        let (callback, _events) = SimpleReceiveCallback::new();
        receiver.serve(rx, &callback).await;
        assert_eq!(link.joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_while_sending() {
        let supervisor = Arc::new(TransferSupervisor::new());
        let _permit = supervisor.try_acquire("outgoing").unwrap();
        let link = Arc::new(UnreachableLink::default());
        let receiver = Receiver::new(ReceiveOptions::default(), supervisor, link.clone());

        let (callback, _rx) = SimpleReceiveCallback::new();
        let result = receiver.receive(&credentials(40_000), &callback).await;

        assert!(matches!(result, Err(TransferError::Busy)));
        assert_eq!(link.joins.load(Ordering::SeqCst), 0);
    }
}
