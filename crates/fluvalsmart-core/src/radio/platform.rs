//! 基于 btleplug 的协议栈实现
//!
//! 使用系统的第一个蓝牙适配器。适配器事件和设备通知由后台任务转换成
//! [`RadioEvent`] 发送到回调通道，调用方只需要把通道接到
//! [`BleManager::spawn_event_loop`](crate::BleManager::spawn_event_loop)。

use super::{REGISTER_READ_OK, Radio, RadioError, RadioEvent, RadioEventSender, Register};
use crate::ble::{AdvertisementRecord, hex, lock};
use crate::config::BleSettings;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

/// 协议栈建立连接的最长等待
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 灯具的 GATT 布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl From<&BleSettings> for GattProfile {
    fn from(settings: &BleSettings) -> Self {
        Self {
            service: settings.primary_service_uuid,
            write: settings.write_char_uuid,
            notify: settings.notify_char_uuid,
        }
    }
}

type PeripheralCache = Arc<tokio::sync::Mutex<HashMap<String, PlatformPeripheral>>>;
type NotificationPumps = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

pub struct BtleplugRadio {
    adapter: Adapter,
    profile: GattProfile,
    events: RadioEventSender,
    peripherals: PeripheralCache,
    pumps: NotificationPumps,
    central_pump: JoinHandle<()>,
}

impl BtleplugRadio {
    pub async fn new(
        profile: GattProfile,
        events: RadioEventSender,
    ) -> Result<Arc<Self>, RadioError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(RadioError::NoAdapter)?;

        let peripherals: PeripheralCache = Arc::default();
        let central_pump =
            spawn_central_pump(adapter.clone(), peripherals.clone(), events.clone()).await?;

        Ok(Arc::new(Self {
            adapter,
            profile,
            events,
            peripherals,
            pumps: Arc::default(),
            central_pump,
        }))
    }

    async fn find_device(&self, mac: &str) -> Result<PlatformPeripheral, RadioError> {
        find_device(&self.adapter, &self.peripherals, mac).await
    }

    fn find_characteristic(
        &self,
        peripheral: &PlatformPeripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, RadioError> {
        find_characteristic(peripheral, self.profile.service, uuid)
            .ok_or(RadioError::CharacteristicNotFound(uuid))
    }

    fn emit(&self, event: RadioEvent) {
        emit(&self.events, event);
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.central_pump.abort();
        for (_, pump) in lock(&self.pumps).drain() {
            pump.abort();
        }
    }
}

#[async_trait::async_trait]
impl Radio for BtleplugRadio {
    async fn start_discovery(&self) -> Result<(), RadioError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, mac: &str) -> Result<(), RadioError> {
        let peripheral = self.find_device(mac).await?;
        let mac = mac.to_string();
        let profile = self.profile;
        let events = self.events.clone();
        let pumps = self.pumps.clone();

        tokio::spawn(async move {
            match time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
                Err(_) => {
                    warn!("Connect to {} timed out", mac);
                    emit(&events, RadioEvent::ConnectTimeout { mac });
                    return;
                }
                Ok(Err(e)) => {
                    emit(
                        &events,
                        RadioEvent::ConnectionError {
                            mac,
                            reason: e.to_string(),
                        },
                    );
                    return;
                }
                Ok(Ok(())) => {}
            }
            emit(&events, RadioEvent::Connected { mac: mac.clone() });

            if let Err(e) = peripheral.discover_services().await {
                emit(
                    &events,
                    RadioEvent::ServicesUndiscovered {
                        mac,
                        reason: e.to_string(),
                    },
                );
                return;
            }
            if find_characteristic(&peripheral, profile.service, profile.notify).is_none() {
                emit(
                    &events,
                    RadioEvent::ServicesUndiscovered {
                        mac,
                        reason: format!("service {} not found", profile.service),
                    },
                );
                return;
            }

            match spawn_notification_pump(&peripheral, &mac, profile.notify, events.clone()).await
            {
                Ok(pump) => {
                    if let Some(old) = lock(&pumps).insert(mac.clone(), pump) {
                        old.abort();
                    }
                }
                Err(e) => warn!("Failed to open notification stream for {}: {}", mac, e),
            }
            emit(&events, RadioEvent::ServicesDiscovered { mac });
        });
        Ok(())
    }

    async fn disconnect(&self, mac: &str) -> Result<(), RadioError> {
        if let Some(pump) = lock(&self.pumps).remove(mac) {
            pump.abort();
        }
        let peripheral = self.find_device(mac).await?;
        // 断开结果由适配器的 DeviceDisconnected 事件上报
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn write(&self, mac: &str, bytes: &[u8]) -> bool {
        let result = async {
            let peripheral = self.find_device(mac).await?;
            let characteristic = self.find_characteristic(&peripheral, self.profile.write)?;
            peripheral
                .write(&characteristic, bytes, WriteType::WithoutResponse)
                .await?;
            Ok::<_, RadioError>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("Write to {} failed: {}", mac, e);
                false
            }
        }
    }

    async fn enable_notifications(&self, mac: &str) -> Result<(), RadioError> {
        let peripheral = self.find_device(mac).await?;
        let characteristic = self.find_characteristic(&peripheral, self.profile.notify)?;
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn read_register(&self, mac: &str, register: Register) -> Result<(), RadioError> {
        let peripheral = self.find_device(mac).await?;
        let props = peripheral
            .properties()
            .await?
            .ok_or_else(|| RadioError::DeviceNotFound(mac.to_string()))?;

        let value = match register {
            Register::ManufacturerData => record_from_properties(&props)
                .manufacturer_payload()
                .map(|payload| hex(&payload))
                .unwrap_or_default(),
            Register::DeviceName => props.local_name.unwrap_or_default(),
        };

        self.emit(RadioEvent::RegisterRead {
            mac: mac.to_string(),
            value,
            register,
            status: REGISTER_READ_OK,
        });
        Ok(())
    }
}

fn emit(events: &RadioEventSender, event: RadioEvent) {
    if events.send(event).is_err() {
        trace!("Radio event channel closed, dropping event");
    }
}

async fn find_device(
    adapter: &Adapter,
    cache: &PeripheralCache,
    mac: &str,
) -> Result<PlatformPeripheral, RadioError> {
    let key = mac.to_uppercase();
    if let Some(peripheral) = cache.lock().await.get(&key) {
        return Ok(peripheral.clone());
    }

    for peripheral in adapter.peripherals().await? {
        if peripheral.address().to_string().to_uppercase() == key {
            cache.lock().await.insert(key, peripheral.clone());
            return Ok(peripheral);
        }
    }

    Err(RadioError::DeviceNotFound(mac.to_string()))
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    service_uuid: Uuid,
    uuid: Uuid,
) -> Option<Characteristic> {
    for service in peripheral.services() {
        if service.uuid == service_uuid {
            for char in service.characteristics {
                if char.uuid == uuid {
                    return Some(char);
                }
            }
        }
    }
    None
}

fn record_from_properties(props: &PeripheralProperties) -> AdvertisementRecord {
    AdvertisementRecord {
        service_uuids: props.services.clone(),
        manufacturer_data: props
            .manufacturer_data
            .iter()
            .map(|(id, data)| (*id, data.clone()))
            .collect(),
        local_name: props.local_name.clone(),
    }
}

async fn spawn_central_pump(
    adapter: Adapter,
    cache: PeripheralCache,
    events: RadioEventSender,
) -> Result<JoinHandle<()>, RadioError> {
    let mut stream = adapter.events().await?;

    Ok(tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    let peripheral = match adapter.peripheral(&id).await {
                        Ok(p) => p,
                        Err(e) => {
                            trace!("Peripheral {:?} vanished: {}", id, e);
                            continue;
                        }
                    };
                    let props = match peripheral.properties().await {
                        Ok(Some(props)) => props,
                        Ok(None) => continue,
                        Err(e) => {
                            trace!("Failed to read properties of {:?}: {}", id, e);
                            continue;
                        }
                    };

                    let mac = props.address.to_string().to_uppercase();
                    cache.lock().await.insert(mac.clone(), peripheral);
                    emit(
                        &events,
                        RadioEvent::DeviceDiscovered {
                            mac,
                            name: props.local_name.clone(),
                            rssi: props.rssi,
                            record: record_from_properties(&props),
                        },
                    );
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        continue;
                    };
                    let mac = peripheral.address().to_string().to_uppercase();
                    info!("Adapter reported disconnect: {}", mac);
                    emit(&events, RadioEvent::Disconnected { mac });
                }
                _ => {}
            }
        }
        debug!("Adapter event stream ended");
    }))
}

async fn spawn_notification_pump(
    peripheral: &PlatformPeripheral,
    mac: &str,
    notify_uuid: Uuid,
    events: RadioEventSender,
) -> Result<JoinHandle<()>, RadioError> {
    let mut stream = peripheral.notifications().await?;
    let mac = mac.to_string();

    Ok(tokio::spawn(async move {
        while let Some(notification) = stream.next().await {
            if notification.uuid != notify_uuid {
                continue;
            }
            emit(
                &events,
                RadioEvent::CharacteristicChanged {
                    mac: mac.clone(),
                    bytes: notification.value,
                },
            );
        }
        trace!("Notification stream for {} ended", mac);
    }))
}
