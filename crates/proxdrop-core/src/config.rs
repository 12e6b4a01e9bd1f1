//! 应用配置和持久化
//!
//! 提供设备名称、厂商 ID、传输超时等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::ble::advertisement::Advertisement;

/// 厂商 ID
///
/// 广播中的单字节厂商标识，按区间归类到品牌
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BrandId {
    #[default]
    Unknown = 0,
    Oppo = 10,
    Realme = 11,
    Vivo = 20,
    Xiaomi = 30,
    OnePlus = 41,
    Meizu = 50,
    Samsung = 70,
    Lenovo = 100,
}

impl BrandId {
    /// 品牌显示名称，未知品牌返回 `None`
    pub fn label(self) -> Option<&'static str> {
        match self {
            BrandId::Unknown => None,
            BrandId::Oppo => Some("OPPO"),
            BrandId::Realme => Some("realme"),
            BrandId::Vivo => Some("vivo"),
            BrandId::Xiaomi => Some("Xiaomi"),
            BrandId::OnePlus => Some("OnePlus"),
            BrandId::Meizu => Some("Meizu"),
            BrandId::Samsung => Some("Samsung"),
            BrandId::Lenovo => Some("Lenovo"),
        }
    }

    /// 从广播中的 ID 值归类
    pub fn from_id(id: u8) -> Self {
        match id {
            11 => BrandId::Realme,
            10..=19 => BrandId::Oppo,
            20..=29 => BrandId::Vivo,
            30..=39 => BrandId::Xiaomi,
            41..=45 => BrandId::OnePlus,
            50..=59 => BrandId::Meizu,
            70..=75 => BrandId::Samsung,
            100..=109 => BrandId::Lenovo,
            _ => BrandId::Unknown,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// 控制通道的传输层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportSecurity {
    /// HTTPS / WSS，自签名证书
    #[default]
    Tls,
    /// 明文 HTTP / WS，仅用于测试
    Plain,
}

impl TransportSecurity {
    pub fn http_scheme(self) -> &'static str {
        match self {
            TransportSecurity::Tls => "https",
            TransportSecurity::Plain => "http",
        }
    }

    pub fn ws_scheme(self) -> &'static str {
        match self {
            TransportSecurity::Tls => "wss",
            TransportSecurity::Plain => "ws",
        }
    }
}

/// 各阶段的有界等待时长（毫秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferTimeouts {
    /// 直连网络建立 / 等待对端接入
    pub link_ms: u64,
    /// 版本协商及请求确认
    pub negotiation_ms: u64,
    /// 等待用户同意
    pub consent_ms: u64,
    /// 传输过程中无任何进展的最长时间
    pub stall_ms: u64,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            link_ms: 10_000,
            negotiation_ms: 5_000,
            consent_ms: 10_000,
            stall_ms: 30_000,
        }
    }
}

impl TransferTimeouts {
    pub fn link(&self) -> Duration {
        Duration::from_millis(self.link_ms)
    }

    pub fn negotiation(&self) -> Duration {
        Duration::from_millis(self.negotiation_ms)
    }

    pub fn consent(&self) -> Duration {
        Duration::from_millis(self.consent_ms)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 设备名称（在扫描时显示）
    pub device_name: String,
    /// 厂商 ID
    pub brand_id: BrandId,
    /// 是否支持 5GHz WiFi
    pub supports_5ghz: bool,
    /// WiFi 接口名称
    pub wifi_interface: String,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 是否自动接受传输
    pub auto_accept: bool,
    /// 详细日志模式
    pub verbose: bool,
    /// 控制通道传输层
    pub transport: TransportSecurity,
    /// 超时设置
    pub timeouts: TransferTimeouts,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            brand_id: BrandId::Xiaomi,
            supports_5ghz: true,
            wifi_interface: "wlan0".to_string(),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            auto_accept: false,
            verbose: false,
            transport: TransportSecurity::Tls,
            timeouts: TransferTimeouts::default(),
        }
    }
}

impl AppSettings {
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("proxdrop")
            .join("settings.toml")
    }

    /// 加载设置（文件不存在或无法解析时使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content).unwrap_or_else(|e| {
                log::warn!("Failed to parse settings: {}, using defaults", e);
                Self::default()
            }),
            Err(e) => {
                log::warn!("Failed to read settings file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// 从 TOML 文本解析，缺失字段取默认值
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let settings = toml::from_str(content)?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 本机广播内容
    pub fn advertisement(&self, sender_id: u16) -> Advertisement {
        Advertisement {
            sender_id,
            name: self.device_name.clone(),
            brand_id: Some(self.brand_id.id()).filter(|id| *id != 0),
            supports_5ghz: self.supports_5ghz,
        }
    }
}

fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "proxdrop".to_string())
}
