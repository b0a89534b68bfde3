//! BleManager - 核心上下文
//!
//! 应用启动时构造一次并传给所有使用方 (克隆开销很小，内部都是 `Arc`)。
//! 它持有协议栈绑定、设备表、事件总线和三个组件，并把协议栈回调
//! 路由给负责对应状态的组件。

use log::{debug, info};

use super::connection::{ConnectionManager, SettleDelays};
use super::events::{
    BleCommunicateListener, BleScanListener, BleStateListener, EventBus, SubscriptionId,
};
use super::registry::DeviceRegistry;
use super::scanner::Scanner;
use super::transport::{FrameTransport, PendingSend, TransportConfig};
use super::BleError;
use crate::config::BleSettings;
use crate::radio::{Radio, RadioBinding, RadioEvent, RadioEventReceiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct BleManager {
    settings: Arc<BleSettings>,
    radio: RadioBinding,
    bus: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    scanner: Scanner,
    connections: ConnectionManager,
    transport: FrameTransport,
}

impl BleManager {
    pub fn new(settings: BleSettings) -> Self {
        let radio = RadioBinding::new();
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new());

        let scanner = Scanner::new(
            radio.clone(),
            bus.clone(),
            settings.primary_service_uuid,
            settings.scan_period(),
        );
        let transport = FrameTransport::new(
            radio.clone(),
            registry.clone(),
            bus.clone(),
            TransportConfig::from(&settings),
        );
        let buffers = transport.clone();
        let connections = ConnectionManager::new(
            radio.clone(),
            registry.clone(),
            bus.clone(),
            SettleDelays::from(&settings),
        )
        .with_removal_hook(Arc::new(move |mac: &str| buffers.drop_buffer(mac)));

        Self {
            settings: Arc::new(settings),
            radio,
            bus,
            registry,
            scanner,
            connections,
            transport,
        }
    }

    pub fn settings(&self) -> &BleSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn transport(&self) -> &FrameTransport {
        &self.transport
    }

    // ------------------------------------------------------------------
    // 协议栈绑定
    // ------------------------------------------------------------------

    pub fn bind_radio(&self, radio: Arc<dyn Radio>) {
        if self.radio.bind(radio).is_some() {
            debug!("Replacing previously bound radio");
        }
        info!("Radio bound");
        self.bus.notify_state(|l| l.on_radio_bound());
    }

    pub fn unbind_radio(&self) {
        if self.radio.unbind().is_some() {
            info!("Radio unbound");
            self.bus.notify_state(|l| l.on_radio_unbound());
        }
    }

    pub fn is_radio_bound(&self) -> bool {
        self.radio.is_bound()
    }

    // ------------------------------------------------------------------
    // 订阅
    // ------------------------------------------------------------------

    pub fn add_state_listener(&self, listener: Arc<dyn BleStateListener>) -> SubscriptionId {
        self.bus.add_state_listener(listener)
    }

    pub fn add_scan_listener(&self, listener: Arc<dyn BleScanListener>) -> SubscriptionId {
        self.bus.add_scan_listener(listener)
    }

    pub fn add_communicate_listener(
        &self,
        listener: Arc<dyn BleCommunicateListener>,
    ) -> SubscriptionId {
        self.bus.add_communicate_listener(listener)
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.bus.remove_listener(id)
    }

    // ------------------------------------------------------------------
    // 扫描
    // ------------------------------------------------------------------

    pub async fn start_scan(&self) -> Result<(), BleError> {
        self.scanner.start_scan().await
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn scan_period(&self) -> Duration {
        self.scanner.scan_period()
    }

    pub fn set_scan_period(&self, period: Duration) {
        self.scanner.set_scan_period(period)
    }

    // ------------------------------------------------------------------
    // 连接
    // ------------------------------------------------------------------

    pub async fn connect_device(&self, mac: &str) -> Result<(), BleError> {
        self.connections.connect_device(mac).await
    }

    pub async fn connect_device_with_timeout(
        &self,
        mac: &str,
        tick: Duration,
        timeout: Duration,
        listener: Option<Arc<dyn BleCommunicateListener>>,
    ) -> Result<(), BleError> {
        self.connections
            .connect_device_with_timeout(mac, tick, timeout, listener)
            .await
    }

    pub async fn disconnect_device(&self, mac: &str) -> Result<(), BleError> {
        self.connections.disconnect_device(mac).await
    }

    pub async fn disconnect_all(&self) -> usize {
        self.connections.disconnect_all().await
    }

    pub fn is_connected(&self, mac: &str) -> bool {
        self.connections.is_connected(mac)
    }

    pub fn is_data_valid(&self, mac: &str) -> bool {
        self.connections.is_data_valid(mac)
    }

    pub async fn read_manufacturer_data(&self, mac: &str) -> Result<(), BleError> {
        self.connections.read_manufacturer_data(mac).await
    }

    pub async fn read_device_name(&self, mac: &str) -> Result<(), BleError> {
        self.connections.read_device_name(mac).await
    }

    pub async fn set_device_name(&self, mac: &str, name: &str) -> Result<(), BleError> {
        self.connections.set_device_name(mac, name).await
    }

    // ------------------------------------------------------------------
    // 数据
    // ------------------------------------------------------------------

    pub async fn send_bytes(&self, mac: &str, payload: &[u8]) -> Result<PendingSend, BleError> {
        self.transport.send_bytes(mac, payload).await
    }

    pub fn clear_receive_buffer(&self) {
        self.transport.clear_receive_buffer()
    }

    // ------------------------------------------------------------------
    // 协议栈回调
    // ------------------------------------------------------------------

    /// 处理一条协议栈回调
    ///
    /// 需要在 tokio 运行时内调用 (服务发现会派生延时任务)。
    pub fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::DeviceDiscovered {
                mac,
                name,
                rssi,
                record,
            } => {
                self.scanner
                    .on_device_discovered(&mac, name.as_deref(), rssi, &record);
            }
            RadioEvent::Connected { mac } => self.connections.on_connected(&mac),
            RadioEvent::ServicesDiscovered { mac } => {
                self.connections.on_services_discovered(&mac)
            }
            RadioEvent::ServicesUndiscovered { mac, reason } => {
                self.connections.on_services_undiscovered(&mac, &reason)
            }
            RadioEvent::ConnectTimeout { mac } => self.connections.on_connect_timeout(&mac),
            RadioEvent::ConnectionError { mac, reason } => {
                self.connections.on_connection_error(&mac, &reason)
            }
            RadioEvent::Disconnected { mac } => self.connections.on_disconnected(&mac),
            RadioEvent::CharacteristicChanged { mac, bytes } => {
                self.transport.on_data_notified(&mac, &bytes)
            }
            RadioEvent::RegisterRead {
                mac,
                value,
                register,
                status,
            } => self
                .connections
                .on_register_read(&mac, &value, register, status),
        }
    }

    /// 在单个任务中按顺序处理回调通道里的事件，通道关闭后任务结束
    pub fn spawn_event_loop(&self, mut events: RadioEventReceiver) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_radio_event(event);
            }
            debug!("Radio event channel closed");
        })
    }
}
