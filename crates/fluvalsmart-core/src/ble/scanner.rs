//! BLE Scanner - 发现灯具
//!
//! # 设备识别
//!
//! 只有广播中第一个服务 UUID 等于主服务 UUID (默认 `0000fff0-...`) 的设备
//! 才会上报给订阅者；没有服务 UUID 或 UUID 不匹配的广播直接忽略，这不是错误。
//!
//! # 厂商数据
//!
//! 上报的厂商数据格式为 2 字节小端厂商 ID 加原始数据，没有厂商数据时为 `None`。
//!
//! # 自动停止
//!
//! 每次开始扫描都会启动一个定时器，`scan_period` 到期后自动停止。

use log::{debug, info, trace, warn};

use super::advertisement::AdvertisementRecord;
use super::events::EventBus;
use super::{BleError, hex, lock};
use crate::radio::RadioBinding;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedDevice {
    pub mac: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// 厂商 ID (小端) + 厂商数据
    pub manufacturer_data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct ScanSession {
    scanning: bool,
    /// 每次开始扫描递增，定时器只停止自己所属的那一轮
    session: u64,
    timer: Option<CancellationToken>,
}

#[derive(Clone)]
pub struct Scanner {
    radio: RadioBinding,
    bus: Arc<EventBus>,
    state: Arc<Mutex<ScanSession>>,
    period_ms: Arc<AtomicU64>,
    service_uuid: Uuid,
}

impl Scanner {
    pub fn new(
        radio: RadioBinding,
        bus: Arc<EventBus>,
        service_uuid: Uuid,
        scan_period: Duration,
    ) -> Self {
        Self {
            radio,
            bus,
            state: Arc::new(Mutex::new(ScanSession::default())),
            period_ms: Arc::new(AtomicU64::new(scan_period.as_millis() as u64)),
            service_uuid,
        }
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Relaxed))
    }

    /// 修改扫描时长，下一次 `start_scan` 生效
    pub fn set_scan_period(&self, period: Duration) {
        self.period_ms
            .store(period.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    /// 开始扫描；已在扫描时什么也不做
    pub async fn start_scan(&self) -> Result<(), BleError> {
        let radio = self.radio.get().ok_or(BleError::RadioUnavailable)?;

        let (session, timer) = {
            let mut state = lock(&self.state);
            if state.scanning {
                debug!("Scan already running");
                return Ok(());
            }
            state.scanning = true;
            state.session += 1;
            let timer = CancellationToken::new();
            state.timer = Some(timer.clone());
            (state.session, timer)
        };

        self.bus.notify_state(|l| l.on_scan_started());

        if let Err(e) = radio.start_discovery().await {
            warn!("Failed to start discovery: {}", e);
            timer.cancel();
            let rolled_back = {
                let mut state = lock(&self.state);
                if state.session == session && state.scanning {
                    state.scanning = false;
                    state.timer = None;
                    true
                } else {
                    false
                }
            };
            if rolled_back {
                self.bus.notify_state(|l| l.on_scan_stopped());
            }
            return Err(e.into());
        }

        // 等待协议栈期间本轮扫描可能已被停止，此时协议栈刚刚开始扫描，需要再停一次。
        // 若已有更新的一轮在扫描，协议栈归它管
        let (current, newer_running) = {
            let state = lock(&self.state);
            (
                state.session == session && state.scanning,
                state.session != session && state.scanning,
            )
        };
        if !current {
            if newer_running {
                debug!("Scan session {} superseded while starting", session);
            } else {
                debug!("Scan session {} stopped while starting, stopping discovery", session);
                if let Err(e) = radio.stop_discovery().await {
                    warn!("Failed to stop discovery: {}", e);
                }
            }
            return Ok(());
        }

        let period = self.scan_period();
        info!("Starting BLE scan for {} ms", period.as_millis());
        self.arm_auto_stop(session, timer, period);
        Ok(())
    }

    /// 停止扫描；未在扫描时什么也不做
    pub async fn stop_scan(&self) {
        self.stop_session(None).await;
    }

    fn arm_auto_stop(&self, session: u64, timer: CancellationToken, period: Duration) {
        let scanner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => {
                    trace!("Auto-stop timer for scan session {} cancelled", session);
                }
                _ = time::sleep(period) => {
                    debug!("Scan period elapsed, stopping scan session {}", session);
                    scanner.stop_session(Some(session)).await;
                }
            }
        });
    }

    async fn stop_session(&self, only: Option<u64>) -> bool {
        let timer = {
            let mut state = lock(&self.state);
            if !state.scanning || only.is_some_and(|id| id != state.session) {
                return false;
            }
            state.scanning = false;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }

        if let Some(radio) = self.radio.get() {
            if let Err(e) = radio.stop_discovery().await {
                warn!("Failed to stop discovery: {}", e);
            }
        }

        info!("BLE scan stopped");
        self.bus.notify_state(|l| l.on_scan_stopped());
        true
    }

    /// 处理协议栈上报的广播
    pub fn on_device_discovered(
        &self,
        mac: &str,
        name: Option<&str>,
        rssi: Option<i16>,
        record: &AdvertisementRecord,
    ) {
        let Some(first) = record.service_uuids.first() else {
            trace!("Ignoring {}: no service UUIDs advertised", mac);
            return;
        };
        if *first != self.service_uuid {
            trace!("Ignoring {}: primary service {} does not match", mac, first);
            return;
        }

        let device = ScannedDevice {
            mac: mac.to_string(),
            name: name
                .map(str::to_string)
                .or_else(|| record.local_name.clone()),
            rssi,
            manufacturer_data: record.manufacturer_payload(),
        };

        debug!(
            "Fixture found: mac={}, name={:?}, rssi={:?}, mfr={}",
            device.mac,
            device.name,
            device.rssi,
            device
                .manufacturer_data
                .as_deref()
                .map(hex)
                .unwrap_or_else(|| "-".to_string())
        );

        self.bus.notify_scan(|l| l.on_device_scanned(&device));
    }
}
