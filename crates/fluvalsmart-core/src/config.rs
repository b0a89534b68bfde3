//! 传输参数配置
//!
//! 所有时间参数都以毫秒存储，方便在 TOML 中手工编辑。
//! 配置只读：本库不在进程之间保存任何状态。

use crate::ble::{NOTIFY_CHAR_UUID, PRIMARY_SERVICE_UUID, WRITE_CHAR_UUID};
use crate::logging::LogLevel;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// BLE 传输设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    /// 扫描自动停止时间
    pub scan_period_ms: u64,
    /// 单次写入的最大字节数
    pub packet_limit: usize,
    /// 接收端判定新帧的最小间隔
    pub frame_gap_ms: u64,
    /// 分包发送时相邻两包的间隔
    pub chunk_interval_ms: u64,
    /// 每个分包的最大尝试次数
    pub max_send_attempts: u32,
    /// 分包重试前的等待
    pub retry_delay_ms: u64,
    /// 服务发现后开启通知的延时
    pub notify_delay_ms: u64,
    /// 服务发现后标记数据可用的延时
    pub valid_delay_ms: u64,
    pub primary_service_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
    pub log_level: LogLevel,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            scan_period_ms: 12_000,
            packet_limit: 17,
            frame_gap_ms: 64,
            chunk_interval_ms: 8,
            max_send_attempts: 8,
            retry_delay_ms: 1,
            notify_delay_ms: 100,
            valid_delay_ms: 300,
            primary_service_uuid: PRIMARY_SERVICE_UUID,
            write_char_uuid: WRITE_CHAR_UUID,
            notify_char_uuid: NOTIFY_CHAR_UUID,
            log_level: LogLevel::Info,
        }
    }
}

impl BleSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fluvalsmart")
            .join("ble.toml")
    }

    /// 加载设置（如果文件不存在或无法解析则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// 从指定文件加载设置
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings = Self::from_toml(&content)?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    pub fn frame_gap(&self) -> Duration {
        Duration::from_millis(self.frame_gap_ms)
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }

    pub fn valid_delay(&self) -> Duration {
        Duration::from_millis(self.valid_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = BleSettings::default();
        assert_eq!(settings.scan_period(), Duration::from_millis(12_000));
        assert_eq!(settings.packet_limit, 17);
        assert_eq!(settings.frame_gap(), Duration::from_millis(64));
        assert_eq!(settings.max_send_attempts, 8);
        assert_eq!(settings.primary_service_uuid, PRIMARY_SERVICE_UUID);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = BleSettings::from_toml(
            r#"
            scan_period_ms = 5000
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(settings.scan_period(), Duration::from_secs(5));
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.packet_limit, 17);
        assert_eq!(settings.valid_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_uuid_from_toml() {
        let settings = BleSettings::from_toml(
            r#"primary_service_uuid = "00003331-0000-1000-8000-008123456789""#,
        )
        .unwrap();
        assert_eq!(
            settings.primary_service_uuid.to_string(),
            "00003331-0000-1000-8000-008123456789"
        );
    }

    #[test]
    fn test_invalid_toml() {
        assert!(BleSettings::from_toml("packet_limit = \"big\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "fluvalsmart-settings-{}.toml",
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, "packet_limit = 20\n").unwrap();

        let settings = BleSettings::load_from(&path).unwrap();
        assert_eq!(settings.packet_limit, 20);

        fs::remove_file(&path).unwrap();
    }
}
