//! 接收服务 - BLE 响应端 + 接收编排器

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use proxdrop_core::workflow::{ReceiveProgressCallback, ReceiveRequest};
use proxdrop_core::{
    AppSettings, GattResponder, NmLocalLink, ReceiveOptions, Receiver, SessionKeys,
    TransferSupervisor,
};

/// 读不到网卡地址时对外公布的 MAC
const FALLBACK_MAC: &str = "02:00:00:00:00:00";

pub async fn run_service(settings: AppSettings) -> Result<()> {
    tracing::info!("接收服务初始化...");

    let supervisor = TransferSupervisor::global();
    let link = Arc::new(NmLocalLink::new(
        settings.wifi_interface.clone(),
        settings.supports_5ghz,
    ));

    let mac = interface_mac(&settings.wifi_interface).unwrap_or_else(|| FALLBACK_MAC.to_string());
    let (responder, handoff) = GattResponder::new(SessionKeys::process(), mac);
    let responder = Arc::new(responder.with_supervisor(supervisor.clone()));
    if !responder.refresh_mac(link.as_ref()).await {
        tracing::warn!(
            "NetworkManager did not report a MAC for {}, using sysfs or fallback",
            settings.wifi_interface
        );
    }

    // 句柄在服务生命周期内保持注册
    let _ble = start_ble(&responder, &settings).await?;

    if !settings.auto_accept {
        tracing::warn!("auto_accept is off; incoming requests are refused when consent times out");
    }

    let receiver = Receiver::new(ReceiveOptions::from_settings(&settings), supervisor, link);

    tracing::info!("Waiting for senders, saving to {:?}", settings.download_dir);
    receiver.serve(handoff, &LoggingCallback).await;
    responder.stop();

    anyhow::bail!("credential handoff closed")
}

#[cfg(feature = "bluez")]
async fn start_ble(
    responder: &Arc<GattResponder>,
    settings: &AppSettings,
) -> Result<proxdrop_core::ble::BluezResponder> {
    let sender_id = proxdrop_core::ble::local_sender_id();
    let adv = settings.advertisement(sender_id);
    let handle = proxdrop_core::ble::BluezResponder::start(responder.clone(), &adv).await?;
    responder.start_advertising();
    tracing::info!("Advertising as '{}' ({:04x})", adv.name, sender_id);
    Ok(handle)
}

#[cfg(not(feature = "bluez"))]
async fn start_ble(_responder: &Arc<GattResponder>, _settings: &AppSettings) -> Result<()> {
    anyhow::bail!("built without BLE support, rebuild with --features bluez")
}

fn interface_mac(preferred: &str) -> Option<String> {
    for iface in [preferred, "p2p0", "wlan0"] {
        let path = format!("/sys/class/net/{iface}/address");
        if let Ok(mac) = std::fs::read_to_string(&path) {
            return Some(mac.trim().to_uppercase());
        }
    }
    None
}

struct LoggingCallback;

impl ReceiveProgressCallback for LoggingCallback {
    fn on_status(&self, status: &str) {
        tracing::info!("{}", status);
    }

    fn on_request(&self, request: &ReceiveRequest) {
        tracing::info!(
            "Incoming from '{}': {} ({} file(s), {} bytes), task {}",
            request.sender_name,
            request.file_name,
            request.file_count,
            request.total_size,
            request.task_id
        );
    }

    fn on_progress(&self, received: u64, total: u64) {
        tracing::debug!("Received {}/{} bytes", received, total);
    }

    fn on_complete(&self, files: Vec<PathBuf>) {
        for file in &files {
            tracing::info!("Saved {:?}", file);
        }
    }

    fn on_error(&self, error: &str) {
        tracing::warn!("Receive failed: {}", error);
    }
}
