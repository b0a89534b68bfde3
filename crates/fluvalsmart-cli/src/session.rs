//! 命令行会话 - 把核心层接到真实蓝牙适配器上

use anyhow::{Result, bail};
use fluvalsmart_core::{
    BleEvent, BleManager, BleSettings, BtleplugRadio, ChannelListener, GattProfile,
    radio::event_channel,
};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// 连接轮询间隔
const CONNECT_TICK: Duration = Duration::from_millis(200);

pub struct Session {
    pub manager: BleManager,
    pub events: UnboundedReceiver<BleEvent>,
    event_loop: JoinHandle<()>,
}

impl Session {
    pub async fn open(settings: BleSettings) -> Result<Self> {
        let manager = BleManager::new(settings);
        let (listener, events) = ChannelListener::new();
        manager.events().add_listener_all(listener);

        let (tx, rx) = event_channel();
        let radio = BtleplugRadio::new(GattProfile::from(manager.settings()), tx).await?;
        let event_loop = manager.spawn_event_loop(rx);
        manager.bind_radio(radio);

        Ok(Self {
            manager,
            events,
            event_loop,
        })
    }

    /// 下一个核心事件，超过 `deadline` 返回 `None`
    pub async fn next_event(&mut self, deadline: Instant) -> Option<BleEvent> {
        time::timeout_at(deadline, self.events.recv())
            .await
            .ok()
            .flatten()
    }

    /// 扫描直到发现指定设备
    ///
    /// btleplug 只能连接适配器已经见过的设备，所以连接前需要先扫描一次。
    pub async fn discover(&mut self, mac: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.manager.set_scan_period(timeout);
        self.manager.start_scan().await?;

        let mut found = false;
        while let Some(event) = self.next_event(deadline).await {
            match event {
                BleEvent::DeviceScanned(device) if device.mac.eq_ignore_ascii_case(mac) => {
                    found = true;
                    break;
                }
                BleEvent::ScanStopped => break,
                _ => {}
            }
        }
        self.manager.stop_scan().await;

        if !found {
            bail!("Device {} not found", mac);
        }
        Ok(())
    }

    /// 发现并连接设备，等待数据通道可用
    pub async fn connect(&mut self, mac: &str, timeout: Duration) -> Result<()> {
        self.discover(mac, timeout).await?;

        let deadline = Instant::now() + timeout;
        self.manager
            .connect_device_with_timeout(mac, CONNECT_TICK, timeout, None)
            .await?;

        while let Some(event) = self.next_event(deadline).await {
            match event {
                BleEvent::DataValid(m) if m.eq_ignore_ascii_case(mac) => return Ok(()),
                BleEvent::DataInvalid(m) if m.eq_ignore_ascii_case(mac) => {
                    bail!("Connection to {} failed", mac)
                }
                _ => {}
            }
        }
        bail!("Timed out waiting for {}", mac)
    }

    pub async fn close(self) {
        self.manager.disconnect_all().await;
        // 留出时间让断开回调送达
        time::sleep(Duration::from_millis(200)).await;
        self.manager.unbind_radio();
        self.event_loop.abort();
    }
}
