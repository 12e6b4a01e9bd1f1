//! 接收端 HTTP(S) 客户端
//!
//! 连接发送端的控制通道，下载并流式解包压缩包。
//! TLS 模式下跳过证书校验（发送端使用临时自签名证书）。

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use futures_util::StreamExt;
use log::{debug, info};
use tokio::net::TcpStream;
use tokio_tungstenite::Connector;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;

use super::archive::{UnpackReport, unpack_archive};
use super::channel::ControlChannel;
use super::progress::ProgressThrottler;
use super::tls;
use crate::config::TransportSecurity;
use crate::error::TransferError;

/// 发送端服务地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub security: TransportSecurity,
    pub host: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(security: TransportSecurity, host: IpAddr, port: u16) -> Self {
        Self {
            security,
            host,
            port,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.security.http_scheme(), self.addr())
    }

    pub fn ws_url(&self) -> String {
        format!("{}://{}/websocket", self.security.ws_scheme(), self.addr())
    }

    pub fn download_url(&self, task_id: &str) -> String {
        format!("{}/download?taskId={}", self.base_url(), task_id)
    }
}

fn http_error(e: reqwest::Error) -> TransferError {
    TransferError::Io(io::Error::other(e))
}

/// 连接控制通道
pub async fn connect_control(endpoint: &Endpoint) -> Result<ControlChannel, TransferError> {
    info!("Connecting to control channel: {}", endpoint.ws_url());

    let tcp = TcpStream::connect(endpoint.addr()).await?;
    let connector = match endpoint.security {
        TransportSecurity::Tls => Connector::NativeTls(
            tls::insecure_connector().map_err(|e| TransferError::Link(e.to_string()))?,
        ),
        TransportSecurity::Plain => Connector::Plain,
    };

    let (socket, _) =
        tokio_tungstenite::client_async_tls_with_config(endpoint.ws_url(), tcp, None, Some(connector))
            .await
            .map_err(|e| TransferError::Link(format!("WebSocket handshake failed: {e}")))?;

    debug!("Control channel established");
    Ok(ControlChannel::from_tungstenite(socket))
}

/// 下载用的 HTTP 客户端
pub fn http_client() -> Result<reqwest::Client, TransferError> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .build()
        .map_err(http_error)
}

/// 获取缩略图，任何失败都返回 `None`
pub async fn fetch_thumbnail(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    path: &str,
) -> Option<Vec<u8>> {
    let url = format!("{}/{}", endpoint.base_url(), path.trim_start_matches('/'));
    let result = async {
        let response = client.get(&url).send().await?.error_for_status()?;
        response.bytes().await
    }
    .await;

    match result {
        Ok(bytes) => Some(bytes.to_vec()),
        Err(e) => {
            debug!("Thumbnail unavailable ({}): {}", url, e);
            None
        }
    }
}

/// 下载压缩包并边下载边解包到 `dest_dir`
///
/// `on_progress` 在阻塞线程中调用，参数为 `(total, processed)`，已经过限流。
/// `cancel` 被取消后下载流立即结束，解包返回取消错误。
pub async fn download_archive<F>(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    task_id: &str,
    dest_dir: &Path,
    expected_total: u64,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<UnpackReport, TransferError>
where
    F: FnMut(u64, u64) + Send + 'static,
{
    let url = endpoint.download_url(task_id);
    info!("Downloading archive: {}", url);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(http_error)?
        .error_for_status()
        .map_err(http_error)?;

    let total = match expected_total {
        0 => response.content_length().unwrap_or(0),
        n => n,
    };

    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .take_until(cancel.clone().cancelled_owned());
    let mut reader = SyncIoBridge::new(StreamReader::new(Box::pin(body)));

    let dest_dir = dest_dir.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        let mut throttler = ProgressThrottler::new(total, on_progress);
        unpack_archive(&mut reader, &dest_dir, &mut throttler, &cancel)
    })
    .await
    .map_err(|e| TransferError::Io(io::Error::other(e)))?
}
