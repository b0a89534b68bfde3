//! 已连接设备表
//!
//! MAC 地址 -> 数据是否可用。每条记录带一个取消令牌，
//! 服务发现后挂起的延时任务都绑定在这个令牌上：记录被移除或
//! 被标记为不可用时令牌取消，过期任务不会再把旧状态写回来。

use super::lock;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct DeviceRecord {
    valid: bool,
    settle: CancellationToken,
}

impl DeviceRecord {
    fn new() -> Self {
        Self {
            valid: false,
            settle: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设备是否已连接 (不论数据是否可用)
    pub fn contains(&self, mac: &str) -> bool {
        lock(&self.devices).contains_key(mac)
    }

    /// 设备是否可以收发数据
    pub fn is_valid(&self, mac: &str) -> bool {
        lock(&self.devices).get(mac).is_some_and(|d| d.valid)
    }

    /// 当前所有已连接设备的快照 (按地址排序)
    pub fn macs(&self) -> Vec<String> {
        let mut macs: Vec<String> = lock(&self.devices).keys().cloned().collect();
        macs.sort();
        macs
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.devices).is_empty()
    }

    /// 记录新连接；已存在时不做任何修改并返回 `false`
    pub(crate) fn track(&self, mac: &str) -> bool {
        let mut devices = lock(&self.devices);
        if devices.contains_key(mac) {
            return false;
        }
        devices.insert(mac.to_string(), DeviceRecord::new());
        true
    }

    /// 当前记录的延时任务令牌
    pub(crate) fn settle_token(&self, mac: &str) -> Option<CancellationToken> {
        lock(&self.devices).get(mac).map(|d| d.settle.clone())
    }

    /// 令牌仍有效时把设备标记为可用
    pub(crate) fn mark_valid(&self, mac: &str, token: &CancellationToken) -> bool {
        let mut devices = lock(&self.devices);
        match devices.get_mut(mac) {
            Some(device) if !token.is_cancelled() => {
                device.valid = true;
                true
            }
            _ => false,
        }
    }

    /// 标记为不可用并作废挂起的延时任务，设备仍保持连接
    pub(crate) fn invalidate(&self, mac: &str) -> bool {
        let mut devices = lock(&self.devices);
        match devices.get_mut(mac) {
            Some(device) => {
                device.valid = false;
                device.settle.cancel();
                device.settle = CancellationToken::new();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, mac: &str) -> bool {
        match lock(&self.devices).remove(mac) {
            Some(device) => {
                device.settle.cancel();
                true
            }
            None => false,
        }
    }
}
