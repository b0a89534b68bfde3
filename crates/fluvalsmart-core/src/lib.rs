//! FluvalSmart Core Library
//!
//! 水族灯具 BLE 控制的传输与连接管理核心
//!
//! # 模块
//!
//! - **ble**: 扫描、连接管理、分包发送、基于时间间隔的接收重组、事件分发
//! - **radio**: 底层蓝牙协议栈契约 ([`Radio`]) 以及基于 btleplug 的实现
//! - **config**: 可调参数 (扫描时长、包长限制、帧间隔等)
//! - **logging**: 日志级别定义
//!
//! # 使用示例
//!
//! ```ignore
//! use fluvalsmart_core::{BleManager, BleSettings, BtleplugRadio, ChannelListener, radio};
//!
//! let settings = BleSettings::load();
//! let manager = BleManager::new(settings.clone());
//!
//! // 1. 绑定底层协议栈，并把回调事件接入管理器
//! let (events_tx, events_rx) = radio::event_channel();
//! let radio = BtleplugRadio::new((&settings).into(), events_tx).await?;
//! manager.bind_radio(radio);
//! manager.spawn_event_loop(events_rx);
//!
//! // 2. 订阅事件
//! let (listener, mut events) = ChannelListener::new();
//! manager.events().add_listener_all(listener);
//!
//! // 3. 扫描、连接、发送
//! manager.start_scan().await?;
//! manager.connect_device("AA:BB:CC:DD:EE:FF").await?;
//! let pending = manager.send_bytes("AA:BB:CC:DD:EE:FF", &payload).await?;
//! let outcome = pending.wait().await;
//! ```

pub mod ble;
pub mod config;
pub mod logging;
pub mod radio;

// BLE re-exports
pub use ble::{
    AdvertisementRecord, BleCommunicateListener, BleError, BleEvent, BleManager,
    BleScanListener, BleStateListener, ChannelListener, ConnectionManager, DeviceRegistry,
    EventBus, FrameTransport, NOTIFY_CHAR_UUID, PRIMARY_SERVICE_UUID, PendingSend,
    ReceiveBuffer, ScannedDevice, Scanner, SendOutcome, SubscriptionId, WRITE_CHAR_UUID,
};

// Radio re-exports
pub use radio::{
    BtleplugRadio, GattProfile, REGISTER_READ_OK, Radio, RadioBinding, RadioError, RadioEvent,
    Register,
};

// Config re-exports
pub use config::BleSettings;
pub use logging::LogLevel;
