//! ProxDrop Daemon
//!
//! 后台接收守护进程，负责：
//! - BLE 广播和 GATT 凭据接收
//! - 加入发送端建立的直连网络
//! - 下载并解包收到的文件

mod service;

use anyhow::Result;
use proxdrop_core::AppSettings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AppSettings::load();

    // 桥接 log crate（proxdrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if settings.verbose {
        "debug"
    } else {
        "info,proxdrop_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    tracing::info!("ProxDrop daemon starting as '{}'", settings.device_name);

    tokio::select! {
        res = service::run_service(settings) => {
            if let Err(e) = &res {
                tracing::error!("Receive service exited: {:#}", e);
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
