pub mod advertisement;
pub mod connection;
pub mod events;
pub mod manager;
pub mod registry;
pub mod scanner;
pub mod transport;

use crate::radio::RadioError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

pub use advertisement::AdvertisementRecord;
pub use connection::{ConnectionManager, RemovalHook};
pub use events::{
    BleCommunicateListener, BleEvent, BleScanListener, BleStateListener, ChannelListener,
    EventBus, SubscriptionId,
};
pub use manager::BleManager;
pub use registry::DeviceRegistry;
pub use scanner::{ScannedDevice, Scanner};
pub use transport::{FrameTransport, PendingSend, ReceiveBuffer, SendOutcome};

/// 灯具广播的主服务 UUID
pub const PRIMARY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// 数据通知特征 (设备 -> 手机)
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
/// 数据写入特征 (手机 -> 设备)
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// 核心层错误
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("Radio is not bound")]
    RadioUnavailable,

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
