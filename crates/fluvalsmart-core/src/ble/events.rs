//! 事件分发
//!
//! 三类互相独立的订阅者：
//!
//! - **state**: 协议栈绑定/解绑、扫描开始/结束
//! - **scan**: 扫描到灯具
//! - **communicate**: 数据可用/不可用、收到数据、寄存器读取、连接超时
//!
//! 注册返回 [`SubscriptionId`]，按 ID 注销。同一个监听器可以重复注册，
//! 每次注册都会得到独立的 ID 并各自收到一次回调。
//!
//! 分发时先对订阅列表做快照再逐个回调，回调期间不持有锁；
//! 在回调中增删订阅者是允许的，从下一次分发开始生效。

use super::{ScannedDevice, lock};
use crate::radio::Register;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// 订阅凭证
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// 协议栈与扫描状态回调
pub trait BleStateListener: Send + Sync {
    fn on_radio_bound(&self) {}
    fn on_radio_unbound(&self) {}
    fn on_scan_started(&self) {}
    fn on_scan_stopped(&self) {}
}

/// 扫描结果回调
pub trait BleScanListener: Send + Sync {
    fn on_device_scanned(&self, device: &ScannedDevice);
}

/// 连接与数据回调
pub trait BleCommunicateListener: Send + Sync {
    fn on_data_valid(&self, _mac: &str) {}
    fn on_data_invalid(&self, _mac: &str) {}
    /// `frame` 是当前接收缓冲区的快照 (可能是不完整的帧)
    fn on_data_received(&self, _mac: &str, _frame: &[u8]) {}
    fn on_register_read(&self, _mac: &str, _register: Register, _value: &str) {}
    fn on_connect_timeout(&self, _mac: &str) {}
}

struct Subscribers<L: ?Sized> {
    entries: Mutex<Vec<(SubscriptionId, Arc<L>)>>,
}

impl<L: ?Sized> Subscribers<L> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriptionId, listener: Arc<L>) {
        lock(&self.entries).push((id, listener));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = lock(&self.entries);
        match entries.iter().position(|(existing, _)| *existing == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        lock(&self.entries)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// 三类订阅者的事件总线
pub struct EventBus {
    next_id: AtomicU64,
    state: Subscribers<dyn BleStateListener>,
    scan: Subscribers<dyn BleScanListener>,
    communicate: Subscribers<dyn BleCommunicateListener>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Subscribers::new(),
            scan: Subscribers::new(),
            communicate: Subscribers::new(),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_state_listener(&self, listener: Arc<dyn BleStateListener>) -> SubscriptionId {
        let id = self.next_id();
        self.state.add(id, listener);
        id
    }

    pub fn add_scan_listener(&self, listener: Arc<dyn BleScanListener>) -> SubscriptionId {
        let id = self.next_id();
        self.scan.add(id, listener);
        id
    }

    pub fn add_communicate_listener(
        &self,
        listener: Arc<dyn BleCommunicateListener>,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.communicate.add(id, listener);
        id
    }

    /// 同时注册到三类订阅列表，返回的 ID 依次为 state、scan、communicate
    pub fn add_listener_all<L>(&self, listener: Arc<L>) -> [SubscriptionId; 3]
    where
        L: BleStateListener + BleScanListener + BleCommunicateListener + 'static,
    {
        [
            self.add_state_listener(listener.clone()),
            self.add_scan_listener(listener.clone()),
            self.add_communicate_listener(listener),
        ]
    }

    /// 注销订阅；ID 不存在时返回 `false`
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.state.remove(id) || self.scan.remove(id) || self.communicate.remove(id)
    }

    /// (state, scan, communicate) 订阅数量
    pub fn listener_counts(&self) -> (usize, usize, usize) {
        (self.state.len(), self.scan.len(), self.communicate.len())
    }

    pub(crate) fn notify_state(&self, f: impl Fn(&dyn BleStateListener)) {
        for listener in self.state.snapshot() {
            f(listener.as_ref());
        }
    }

    pub(crate) fn notify_scan(&self, f: impl Fn(&dyn BleScanListener)) {
        for listener in self.scan.snapshot() {
            f(listener.as_ref());
        }
    }

    pub(crate) fn notify_communicate(&self, f: impl Fn(&dyn BleCommunicateListener)) {
        for listener in self.communicate.snapshot() {
            f(listener.as_ref());
        }
    }
}

/// 通道化的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    RadioBound,
    RadioUnbound,
    ScanStarted,
    ScanStopped,
    DeviceScanned(ScannedDevice),
    DataValid(String),
    DataInvalid(String),
    DataReceived { mac: String, frame: Vec<u8> },
    RegisterRead {
        mac: String,
        register: Register,
        value: String,
    },
    ConnectTimeout(String),
}

/// 把所有回调转发到 mpsc 通道的监听器
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<BleEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: BleEvent) {
        let _ = self.tx.send(event);
    }
}

impl BleStateListener for ChannelListener {
    fn on_radio_bound(&self) {
        self.send(BleEvent::RadioBound);
    }

    fn on_radio_unbound(&self) {
        self.send(BleEvent::RadioUnbound);
    }

    fn on_scan_started(&self) {
        self.send(BleEvent::ScanStarted);
    }

    fn on_scan_stopped(&self) {
        self.send(BleEvent::ScanStopped);
    }
}

impl BleScanListener for ChannelListener {
    fn on_device_scanned(&self, device: &ScannedDevice) {
        self.send(BleEvent::DeviceScanned(device.clone()));
    }
}

impl BleCommunicateListener for ChannelListener {
    fn on_data_valid(&self, mac: &str) {
        self.send(BleEvent::DataValid(mac.to_string()));
    }

    fn on_data_invalid(&self, mac: &str) {
        self.send(BleEvent::DataInvalid(mac.to_string()));
    }

    fn on_data_received(&self, mac: &str, frame: &[u8]) {
        self.send(BleEvent::DataReceived {
            mac: mac.to_string(),
            frame: frame.to_vec(),
        });
    }

    fn on_register_read(&self, mac: &str, register: Register, value: &str) {
        self.send(BleEvent::RegisterRead {
            mac: mac.to_string(),
            register,
            value: value.to_string(),
        });
    }

    fn on_connect_timeout(&self, mac: &str) {
        self.send(BleEvent::ConnectTimeout(mac.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        valid: AtomicUsize,
    }

    impl BleCommunicateListener for Counter {
        fn on_data_valid(&self, _mac: &str) {
            self.valid.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl BleStateListener for Tagged {
            fn on_scan_started(&self) {
                self.1.lock().unwrap().push(self.0);
            }
        }

        bus.add_state_listener(Arc::new(Tagged("a", order.clone())));
        bus.add_state_listener(Arc::new(Tagged("b", order.clone())));
        bus.add_state_listener(Arc::new(Tagged("c", order.clone())));
        bus.notify_state(|l| l.on_scan_started());

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_registration_gets_two_callbacks() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter::default());

        let first = bus.add_communicate_listener(counter.clone());
        let second = bus.add_communicate_listener(counter.clone());
        assert_ne!(first, second);

        bus.notify_communicate(|l| l.on_data_valid("AA"));
        assert_eq!(counter.valid.load(Ordering::SeqCst), 2);

        assert!(bus.remove_listener(first));
        bus.notify_communicate(|l| l.on_data_valid("AA"));
        assert_eq!(counter.valid.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let bus = EventBus::new();
        let id = bus.add_communicate_listener(Arc::new(Counter::default()));
        assert!(bus.remove_listener(id));
        assert!(!bus.remove_listener(id));
        assert_eq!(bus.listener_counts(), (0, 0, 0));
    }

    /// 回调中注销自己并注册新监听器，本轮分发不受影响
    #[test]
    fn test_mutation_during_dispatch() {
        struct SelfRemoving {
            bus: Arc<EventBus>,
            id: Mutex<Option<SubscriptionId>>,
            late: Arc<Counter>,
            calls: AtomicUsize,
        }

        impl BleCommunicateListener for SelfRemoving {
            fn on_data_valid(&self, _mac: &str) {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = self.id.lock().unwrap().take() {
                    self.bus.remove_listener(id);
                    self.bus.add_communicate_listener(self.late.clone());
                }
            }
        }

        let bus = Arc::new(EventBus::new());
        let late = Arc::new(Counter::default());
        let tail = Arc::new(Counter::default());
        let remover = Arc::new(SelfRemoving {
            bus: bus.clone(),
            id: Mutex::new(None),
            late: late.clone(),
            calls: AtomicUsize::new(0),
        });

        let id = bus.add_communicate_listener(remover.clone());
        *remover.id.lock().unwrap() = Some(id);
        bus.add_communicate_listener(tail.clone());

        bus.notify_communicate(|l| l.on_data_valid("AA"));
        // 快照中的 tail 照常收到，新注册的 late 本轮收不到
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tail.valid.load(Ordering::SeqCst), 1);
        assert_eq!(late.valid.load(Ordering::SeqCst), 0);

        bus.notify_communicate(|l| l.on_data_valid("AA"));
        assert_eq!(remover.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tail.valid.load(Ordering::SeqCst), 2);
        assert_eq!(late.valid.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_listener_forwards() {
        let bus = EventBus::new();
        let (listener, mut rx) = ChannelListener::new();
        let ids = bus.add_listener_all(listener);
        assert_eq!(bus.listener_counts(), (1, 1, 1));

        bus.notify_state(|l| l.on_scan_started());
        bus.notify_communicate(|l| l.on_data_received("AA", &[1, 2]));

        assert_eq!(rx.recv().await, Some(BleEvent::ScanStarted));
        assert_eq!(
            rx.recv().await,
            Some(BleEvent::DataReceived {
                mac: "AA".to_string(),
                frame: vec![1, 2]
            })
        );

        for id in ids {
            assert!(bus.remove_listener(id));
        }
        assert_eq!(bus.listener_counts(), (0, 0, 0));
    }
}
