//! 连接管理
//!
//! 单个设备的状态流转：
//!
//! ```text
//! Disconnected -> Connecting -> ServicesUndiscovered -> Connected(valid)
//!      ^              |                  |                    |
//!      +--------------+------------------+--------------------+
//!              (错误 / 超时 / 主动断开)
//! ```
//!
//! 协议栈回调 `Connected` 时记入设备表 (数据不可用)；服务发现完成后
//! 分别延时开启通知和标记数据可用，两个延时都从服务发现时刻起算。

use log::{debug, info, trace, warn};

use super::events::{BleCommunicateListener, EventBus};
use super::registry::DeviceRegistry;
use super::BleError;
use crate::config::BleSettings;
use crate::radio::{REGISTER_READ_OK, RadioBinding, Register};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// 服务发现后的等待时间
#[derive(Debug, Clone, Copy)]
pub struct SettleDelays {
    /// 开启通知
    pub notify: Duration,
    /// 标记数据可用
    pub valid: Duration,
}

impl From<&BleSettings> for SettleDelays {
    fn from(settings: &BleSettings) -> Self {
        Self {
            notify: settings.notify_delay(),
            valid: settings.valid_delay(),
        }
    }
}

/// 设备被移出设备表后执行的清理
pub type RemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ConnectionManager {
    radio: RadioBinding,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    delays: SettleDelays,
    on_removed: Option<RemovalHook>,
}

impl ConnectionManager {
    pub fn new(
        radio: RadioBinding,
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
        delays: SettleDelays,
    ) -> Self {
        Self {
            radio,
            registry,
            bus,
            delays,
            on_removed: None,
        }
    }

    /// 设置移除设备时的清理回调 (例如丢弃接收缓冲区)
    ///
    /// 所有移除路径都会调用它：协议栈回调的断开、连接错误、连接超时，
    /// 以及 [`connect_device_with_timeout`](Self::connect_device_with_timeout) 自己判定的超时。
    pub fn with_removal_hook(mut self, hook: RemovalHook) -> Self {
        self.on_removed = Some(hook);
        self
    }

    pub fn is_connected(&self, mac: &str) -> bool {
        self.registry.contains(mac)
    }

    pub fn is_data_valid(&self, mac: &str) -> bool {
        self.registry.is_valid(mac)
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.registry.macs()
    }

    /// 连接设备
    ///
    /// 已连接的设备直接返回成功，不会重复发起连接。
    /// 返回 `Ok` 只表示协议栈受理了请求，连接结果通过回调事件通知。
    pub async fn connect_device(&self, mac: &str) -> Result<(), BleError> {
        let radio = self.radio.get().ok_or(BleError::RadioUnavailable)?;
        if self.registry.contains(mac) {
            debug!("{} already connected", mac);
            return Ok(());
        }

        info!("Connecting to {}", mac);
        radio.connect(mac).await?;
        Ok(())
    }

    /// 带超时的连接
    ///
    /// 每隔 `tick` 检查一次设备是否已连接，连上即停止检查；
    /// 超过 `timeout` 仍未连接则按连接超时处理，并额外通知 `listener`。
    pub async fn connect_device_with_timeout(
        &self,
        mac: &str,
        tick: Duration,
        timeout: Duration,
        listener: Option<Arc<dyn BleCommunicateListener>>,
    ) -> Result<(), BleError> {
        let radio = self.radio.get().ok_or(BleError::RadioUnavailable)?;
        if self.registry.contains(mac) {
            debug!("{} already connected", mac);
            return Ok(());
        }

        info!("Connecting to {} (timeout {} ms)", mac, timeout.as_millis());
        radio.connect(mac).await?;
        self.spawn_connect_watchdog(mac.to_string(), tick, timeout, listener);
        Ok(())
    }

    fn spawn_connect_watchdog(
        &self,
        mac: String,
        tick: Duration,
        timeout: Duration,
        listener: Option<Arc<dyn BleCommunicateListener>>,
    ) {
        let manager = self.clone();
        let deadline = Instant::now() + timeout;
        tokio::spawn(async move {
            let mut ticker = time::interval(tick.max(Duration::from_millis(1)));
            let expiry = time::sleep_until(deadline);
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    biased;
                    _ = ticker.tick() => {
                        if manager.registry.contains(&mac) {
                            trace!("{} connected, connect watchdog finished", mac);
                            return;
                        }
                    }
                    _ = &mut expiry => {
                        // 到期时刻恰好连上也算成功
                        if manager.registry.contains(&mac) {
                            trace!("{} connected at deadline", mac);
                            return;
                        }
                        break;
                    }
                }
            }

            warn!("Connect to {} timed out after {} ms", mac, timeout.as_millis());
            manager.on_connect_timeout(&mac);
            if let Some(listener) = listener {
                listener.on_connect_timeout(&mac);
            }
        });
    }

    /// 断开设备；未绑定协议栈时什么也不做
    pub async fn disconnect_device(&self, mac: &str) -> Result<(), BleError> {
        let Some(radio) = self.radio.get() else {
            return Ok(());
        };
        info!("Disconnecting {}", mac);
        radio.disconnect(mac).await?;
        Ok(())
    }

    /// 断开所有设备
    ///
    /// 先对设备表做快照，再逐个断开：回调在此期间修改设备表不会影响本次调用，
    /// 调用时已连接的每个设备恰好收到一次断开请求。返回发出的请求数。
    pub async fn disconnect_all(&self) -> usize {
        let Some(radio) = self.radio.get() else {
            return 0;
        };

        let macs = self.registry.macs();
        info!("Disconnecting {} device(s)", macs.len());
        for mac in &macs {
            if let Err(e) = radio.disconnect(mac).await {
                warn!("Failed to disconnect {}: {}", mac, e);
            }
        }
        macs.len()
    }

    /// 请求读取广播厂商数据寄存器
    pub async fn read_manufacturer_data(&self, mac: &str) -> Result<(), BleError> {
        let radio = self.radio.get().ok_or(BleError::RadioUnavailable)?;
        radio.read_register(mac, Register::ManufacturerData).await?;
        Ok(())
    }

    /// 请求读取设备名称寄存器
    pub async fn read_device_name(&self, mac: &str) -> Result<(), BleError> {
        let radio = self.radio.get().ok_or(BleError::RadioUnavailable)?;
        radio.read_register(mac, Register::DeviceName).await?;
        Ok(())
    }

    /// 修改设备广播名称
    pub async fn set_device_name(&self, mac: &str, name: &str) -> Result<(), BleError> {
        let radio = self.radio.get().ok_or(BleError::RadioUnavailable)?;
        info!("Renaming {} to '{}'", mac, name);
        radio.set_device_name(mac, name).await?;
        Ok(())
    }

    pub fn on_connected(&self, mac: &str) {
        if self.registry.track(mac) {
            info!("Connected: {}", mac);
        } else {
            debug!("Duplicate connected callback for {}", mac);
        }
    }

    pub fn on_services_discovered(&self, mac: &str) {
        let Some(token) = self.registry.settle_token(mac) else {
            debug!("Services discovered for untracked device {}, ignoring", mac);
            return;
        };
        info!("Services discovered: {}", mac);

        self.schedule_enable_notifications(mac.to_string(), token.clone());
        self.schedule_mark_valid(mac.to_string(), token);
    }

    fn schedule_enable_notifications(&self, mac: String, token: CancellationToken) {
        let radio = self.radio.clone();
        let delay = self.delays.notify;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!("Enable notifications for {} cancelled", mac);
                }
                _ = time::sleep(delay) => {
                    let Some(radio) = radio.get() else {
                        return;
                    };
                    match radio.enable_notifications(&mac).await {
                        Ok(()) => debug!("Notifications enabled for {}", mac),
                        Err(e) => warn!("Failed to enable notifications for {}: {}", mac, e),
                    }
                }
            }
        });
    }

    fn schedule_mark_valid(&self, mac: String, token: CancellationToken) {
        let manager = self.clone();
        let delay = self.delays.valid;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!("Mark valid for {} cancelled", mac);
                }
                _ = time::sleep(delay) => {
                    if manager.registry.mark_valid(&mac, &token) {
                        info!("Data channel valid: {}", mac);
                        manager.bus.notify_communicate(|l| l.on_data_valid(&mac));
                    }
                }
            }
        });
    }

    pub fn on_services_undiscovered(&self, mac: &str, reason: &str) {
        if self.registry.invalidate(mac) {
            warn!("Services undiscovered for {}: {}", mac, reason);
        } else {
            debug!("Services undiscovered for untracked device {}: {}", mac, reason);
        }
    }

    pub fn on_connect_timeout(&self, mac: &str) {
        self.drop_device(mac, "connect timeout");
    }

    pub fn on_connection_error(&self, mac: &str, reason: &str) {
        self.drop_device(mac, reason);
    }

    pub fn on_disconnected(&self, mac: &str) {
        self.drop_device(mac, "disconnected");
    }

    fn drop_device(&self, mac: &str, cause: &str) {
        if self.registry.remove(mac) {
            info!("Device {} removed: {}", mac, cause);
        } else {
            debug!("Device {} not tracked ({})", mac, cause);
        }
        if let Some(hook) = &self.on_removed {
            hook(mac);
        }
        self.bus.notify_communicate(|l| l.on_data_invalid(mac));
    }

    pub fn on_register_read(&self, mac: &str, value: &str, register: Register, status: i32) {
        if !self.registry.contains(mac) {
            debug!("Dropping register read from untracked device {}", mac);
            return;
        }
        if status != REGISTER_READ_OK {
            warn!(
                "Register {:?} read from {} failed with status {}",
                register, mac, status
            );
            return;
        }
        trace!("Register {:?} read from {}: value={}", register, mac, value);
        self.bus
            .notify_communicate(|l| l.on_register_read(mac, register, value));
    }
}
