//! Radio - 底层 BLE 协议栈契约
//!
//! 核心层不直接驱动蓝牙硬件：它通过 [`Radio`] 发出指令，
//! 协议栈则把异步回调包装成 [`RadioEvent`] 送回来，
//! 由 [`BleManager::handle_radio_event`](crate::BleManager::handle_radio_event) 统一处理。

pub mod platform;

use crate::ble::AdvertisementRecord;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use platform::{BtleplugRadio, GattProfile};

/// 协议栈错误
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),
}

/// 寄存器读取成功的状态码
pub const REGISTER_READ_OK: i32 = 0;

/// 可读取的设备寄存器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// 广播中的厂商自定义数据
    ManufacturerData,
    /// 设备名称
    DeviceName,
}

/// 协议栈回调事件
///
/// 同一设备的事件必须按到达顺序投递。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    DeviceDiscovered {
        mac: String,
        name: Option<String>,
        rssi: Option<i16>,
        record: AdvertisementRecord,
    },
    Connected {
        mac: String,
    },
    ServicesDiscovered {
        mac: String,
    },
    ServicesUndiscovered {
        mac: String,
        reason: String,
    },
    ConnectTimeout {
        mac: String,
    },
    ConnectionError {
        mac: String,
        reason: String,
    },
    Disconnected {
        mac: String,
    },
    CharacteristicChanged {
        mac: String,
        bytes: Vec<u8>,
    },
    RegisterRead {
        mac: String,
        value: String,
        register: Register,
        status: i32,
    },
}

impl RadioEvent {
    /// 从原始广播包构造发现事件
    pub fn discovered_from_raw(
        mac: impl Into<String>,
        name: Option<String>,
        rssi: Option<i16>,
        raw: &[u8],
    ) -> Self {
        RadioEvent::DeviceDiscovered {
            mac: mac.into(),
            name,
            rssi,
            record: AdvertisementRecord::parse(raw),
        }
    }

    /// 事件对应的设备地址
    pub fn mac(&self) -> &str {
        match self {
            RadioEvent::DeviceDiscovered { mac, .. }
            | RadioEvent::Connected { mac }
            | RadioEvent::ServicesDiscovered { mac }
            | RadioEvent::ServicesUndiscovered { mac, .. }
            | RadioEvent::ConnectTimeout { mac }
            | RadioEvent::ConnectionError { mac, .. }
            | RadioEvent::Disconnected { mac }
            | RadioEvent::CharacteristicChanged { mac, .. }
            | RadioEvent::RegisterRead { mac, .. } => mac,
        }
    }
}

pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;
pub type RadioEventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// 创建协议栈回调通道
pub fn event_channel() -> (RadioEventSender, RadioEventReceiver) {
    mpsc::unbounded_channel()
}

/// 核心层对底层协议栈的要求
///
/// 所有方法都只表示"请求已受理"，结果通过 [`RadioEvent`] 异步返回；
/// 唯一的例外是 [`Radio::write`]，它直接返回本次写入是否被协议栈接受。
#[async_trait::async_trait]
pub trait Radio: Send + Sync {
    async fn start_discovery(&self) -> Result<(), RadioError>;

    async fn stop_discovery(&self) -> Result<(), RadioError>;

    async fn connect(&self, mac: &str) -> Result<(), RadioError>;

    async fn disconnect(&self, mac: &str) -> Result<(), RadioError>;

    /// 写入一个数据包 (不超过包长限制)
    async fn write(&self, mac: &str, bytes: &[u8]) -> bool;

    async fn enable_notifications(&self, mac: &str) -> Result<(), RadioError>;

    async fn read_register(&self, mac: &str, register: Register) -> Result<(), RadioError>;

    async fn set_device_name(&self, mac: &str, name: &str) -> Result<(), RadioError> {
        let _ = (mac, name);
        Err(RadioError::Unsupported("set_device_name"))
    }
}

/// 当前绑定的协议栈
///
/// 未绑定时所有需要协议栈的操作都立即失败。
#[derive(Clone, Default)]
pub struct RadioBinding {
    slot: Arc<RwLock<Option<Arc<dyn Radio>>>>,
}

impl RadioBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<dyn Radio>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_bound(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 绑定协议栈，返回被替换掉的旧实例
    pub fn bind(&self, radio: Arc<dyn Radio>) -> Option<Arc<dyn Radio>> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(radio)
    }

    pub fn unbind(&self) -> Option<Arc<dyn Radio>> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for RadioBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioBinding")
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRadio;

    #[async_trait::async_trait]
    impl Radio for NullRadio {
        async fn start_discovery(&self) -> Result<(), RadioError> {
            Ok(())
        }
        async fn stop_discovery(&self) -> Result<(), RadioError> {
            Ok(())
        }
        async fn connect(&self, _mac: &str) -> Result<(), RadioError> {
            Ok(())
        }
        async fn disconnect(&self, _mac: &str) -> Result<(), RadioError> {
            Ok(())
        }
        async fn write(&self, _mac: &str, _bytes: &[u8]) -> bool {
            true
        }
        async fn enable_notifications(&self, _mac: &str) -> Result<(), RadioError> {
            Ok(())
        }
        async fn read_register(&self, _mac: &str, _register: Register) -> Result<(), RadioError> {
            Ok(())
        }
    }

    #[test]
    fn test_binding_lifecycle() {
        let binding = RadioBinding::new();
        assert!(!binding.is_bound());
        assert!(binding.get().is_none());

        assert!(binding.bind(Arc::new(NullRadio)).is_none());
        assert!(binding.is_bound());
        assert!(binding.bind(Arc::new(NullRadio)).is_some());

        assert!(binding.unbind().is_some());
        assert!(!binding.is_bound());
    }

    #[tokio::test]
    async fn test_set_device_name_defaults_to_unsupported() {
        let radio = NullRadio;
        let err = radio.set_device_name("AA", "tank").await.unwrap_err();
        assert!(matches!(err, RadioError::Unsupported(_)));
    }

    #[test]
    fn test_event_mac() {
        let event = RadioEvent::CharacteristicChanged {
            mac: "AA:BB".to_string(),
            bytes: vec![1],
        };
        assert_eq!(event.mac(), "AA:BB");
    }
}
