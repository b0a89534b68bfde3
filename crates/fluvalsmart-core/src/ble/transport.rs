//! 帧传输
//!
//! # 发送
//!
//! 单次写入最多 `packet_limit` (17) 字节。超长数据按顺序切分后在后台任务中逐包写入：
//! 每包最多尝试 `max_send_attempts` 次，成功后等待 `chunk_interval` 再发下一包，
//! 某包重试耗尽则放弃剩余部分。分包不带序号，接收端只能依赖时间间隔重组。
//!
//! # 接收
//!
//! 协议没有长度字段或分隔符，唯一的帧边界信号是时间：距上次收到数据超过
//! `frame_gap` (64ms) 时，先清空缓冲区再追加。每次追加后把缓冲区快照
//! 推送给订阅者，由订阅者自行判断消息是否完整。

use super::events::EventBus;
use super::registry::DeviceRegistry;
use super::{BleError, hex, lock};
use crate::config::BleSettings;
use crate::radio::{Radio, RadioBinding};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// 发送参数
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub packet_limit: usize,
    pub frame_gap: Duration,
    pub chunk_interval: Duration,
    pub max_send_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&BleSettings> for TransportConfig {
    fn from(settings: &BleSettings) -> Self {
        Self {
            packet_limit: settings.packet_limit.max(1),
            frame_gap: settings.frame_gap(),
            chunk_interval: settings.chunk_interval(),
            max_send_attempts: settings.max_send_attempts.max(1),
            retry_delay: settings.retry_delay(),
        }
    }
}

/// 按包长限制切分，保持原始字节顺序
pub fn split_chunks(payload: &[u8], limit: usize) -> Vec<Vec<u8>> {
    payload.chunks(limit.max(1)).map(<[u8]>::to_vec).collect()
}

/// 发送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 全部分包发送成功
    Complete { chunks: usize },
    /// 第 `sent + 1` 包重试耗尽，之后的分包未发送
    Partial { sent: usize, total: usize },
}

impl SendOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, SendOutcome::Complete { .. })
    }
}

enum PendingInner {
    Ready(SendOutcome),
    Running {
        handle: JoinHandle<SendOutcome>,
        sent: Arc<AtomicUsize>,
        total: usize,
    },
}

/// 进行中的发送
///
/// 丢弃句柄不会中断发送，后台任务会一直运行到完成或失败。
pub struct PendingSend {
    inner: PendingInner,
}

impl PendingSend {
    fn ready(outcome: SendOutcome) -> Self {
        Self {
            inner: PendingInner::Ready(outcome),
        }
    }

    /// 等待发送结束
    pub async fn wait(self) -> SendOutcome {
        match self.inner {
            PendingInner::Ready(outcome) => outcome,
            PendingInner::Running {
                handle,
                sent,
                total,
            } => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Send task aborted: {}", e);
                    SendOutcome::Partial {
                        sent: sent.load(Ordering::Acquire),
                        total,
                    }
                }
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            PendingInner::Ready(_) => true,
            PendingInner::Running { handle, .. } => handle.is_finished(),
        }
    }
}

/// 单个设备的接收缓冲区
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    bytes: Vec<u8>,
    last: Option<Instant>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加数据；距上次追加超过 `gap` 时先清空。返回是否发生了清空
    pub fn push(&mut self, bytes: &[u8], now: Instant, gap: Duration) -> bool {
        let reset = self
            .last
            .is_some_and(|last| now.saturating_duration_since(last) > gap);
        if reset {
            self.bytes.clear();
        }
        self.bytes.extend_from_slice(bytes);
        self.last = Some(now);
        reset
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

#[derive(Clone)]
pub struct FrameTransport {
    radio: RadioBinding,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    buffers: Arc<Mutex<HashMap<String, ReceiveBuffer>>>,
    config: TransportConfig,
}

impl FrameTransport {
    pub fn new(
        radio: RadioBinding,
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
        config: TransportConfig,
    ) -> Self {
        Self {
            radio,
            registry,
            bus,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// 发送数据
    ///
    /// 不超过包长限制时直接写入一次 (不重试)，否则切分后在后台任务中发送。
    pub async fn send_bytes(&self, mac: &str, payload: &[u8]) -> Result<PendingSend, BleError> {
        let radio = self.radio.get().ok_or(BleError::RadioUnavailable)?;
        if !self.registry.is_valid(mac) {
            debug!("Sending to {} before data channel is valid", mac);
        }

        if payload.len() <= self.config.packet_limit {
            let accepted = radio.write(mac, payload).await;
            trace!("Write to {}: {} accepted={}", mac, hex(payload), accepted);
            let outcome = if accepted {
                SendOutcome::Complete { chunks: 1 }
            } else {
                SendOutcome::Partial { sent: 0, total: 1 }
            };
            return Ok(PendingSend::ready(outcome));
        }

        let chunks = split_chunks(payload, self.config.packet_limit);
        let total = chunks.len();
        debug!(
            "Sending {} bytes to {} in {} chunks: {}",
            payload.len(),
            mac,
            total,
            hex(payload)
        );

        let sent = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(send_chunks(
            radio,
            mac.to_string(),
            chunks,
            self.config.clone(),
            sent.clone(),
        ));

        Ok(PendingSend {
            inner: PendingInner::Running {
                handle,
                sent,
                total,
            },
        })
    }

    /// 处理设备通知的数据
    ///
    /// 未在设备表中的设备 (例如断开后迟到的数据) 直接丢弃。
    pub fn on_data_notified(&self, mac: &str, bytes: &[u8]) {
        if !self.registry.contains(mac) {
            debug!(
                "Dropping {} bytes from untracked device {}",
                bytes.len(),
                mac
            );
            return;
        }

        let frame = {
            let mut buffers = lock(&self.buffers);
            let buffer = buffers.entry(mac.to_string()).or_default();
            if buffer.push(bytes, Instant::now(), self.config.frame_gap) {
                trace!("Frame gap exceeded for {}, receive buffer reset", mac);
            }
            buffer.as_slice().to_vec()
        };
        trace!("Notified by {}: {}", mac, hex(bytes));

        self.bus
            .notify_communicate(|l| l.on_data_received(mac, &frame));
    }

    /// 清空所有设备的接收缓冲区
    pub fn clear_receive_buffer(&self) {
        for buffer in lock(&self.buffers).values_mut() {
            buffer.clear();
        }
    }

    pub fn clear_receive_buffer_for(&self, mac: &str) {
        if let Some(buffer) = lock(&self.buffers).get_mut(mac) {
            buffer.clear();
        }
    }

    /// 当前缓冲区内容的快照
    pub fn receive_buffer(&self, mac: &str) -> Option<Vec<u8>> {
        lock(&self.buffers)
            .get(mac)
            .map(|buffer| buffer.as_slice().to_vec())
    }

    /// 设备断开时丢弃其缓冲区
    pub(crate) fn drop_buffer(&self, mac: &str) {
        lock(&self.buffers).remove(mac);
    }
}

async fn send_chunks(
    radio: Arc<dyn Radio>,
    mac: String,
    chunks: Vec<Vec<u8>>,
    config: TransportConfig,
    sent: Arc<AtomicUsize>,
) -> SendOutcome {
    let total = chunks.len();

    for (index, chunk) in chunks.iter().enumerate() {
        if !write_with_retry(radio.as_ref(), &mac, chunk, &config).await {
            warn!(
                "Chunk {}/{} to {} failed after {} attempts, abandoning message",
                index + 1,
                total,
                mac,
                config.max_send_attempts
            );
            return SendOutcome::Partial { sent: index, total };
        }
        sent.store(index + 1, Ordering::Release);

        if index + 1 < total {
            time::sleep(config.chunk_interval).await;
        }
    }

    debug!("Sent {} chunks to {}", total, mac);
    SendOutcome::Complete { chunks: total }
}

async fn write_with_retry(
    radio: &dyn Radio,
    mac: &str,
    chunk: &[u8],
    config: &TransportConfig,
) -> bool {
    for attempt in 1..=config.max_send_attempts {
        if radio.write(mac, chunk).await {
            return true;
        }
        trace!(
            "Write to {} rejected (attempt {}/{})",
            mac, attempt, config.max_send_attempts
        );
        if attempt < config.max_send_attempts {
            time::sleep(config.retry_delay).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_roundtrip() {
        for len in [0usize, 1, 16, 17, 18, 34, 35, 100] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let chunks = split_chunks(&payload, 17);

            assert_eq!(chunks.len(), len.div_ceil(17));
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 17));
            assert_eq!(chunks.concat(), payload);
        }
    }

    #[test]
    fn test_split_chunks_last_is_shorter() {
        let payload = [0u8; 40];
        let sizes: Vec<usize> = split_chunks(&payload, 17).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![17, 17, 6]);
    }

    #[test]
    fn test_receive_buffer_gap_reframing() {
        let gap = Duration::from_millis(64);
        let t0 = Instant::now();
        let mut buffer = ReceiveBuffer::new();

        assert!(!buffer.push(&[0x01, 0x02], t0, gap));
        assert!(!buffer.push(&[0x03], t0 + Duration::from_millis(30), gap));
        assert_eq!(buffer.as_slice(), &[0x01, 0x02, 0x03]);

        assert!(buffer.push(&[0x04], t0 + Duration::from_millis(100), gap));
        assert_eq!(buffer.as_slice(), &[0x04]);
    }

    #[test]
    fn test_receive_buffer_gap_measured_from_last_append() {
        let gap = Duration::from_millis(64);
        let t0 = Instant::now();
        let mut buffer = ReceiveBuffer::new();

        // 每段间隔 50ms，总跨度超过 64ms 也不应清空
        for (i, byte) in [0x10u8, 0x11, 0x12, 0x13].iter().enumerate() {
            buffer.push(&[*byte], t0 + Duration::from_millis(50 * i as u64), gap);
        }
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_receive_buffer_clear_keeps_timing() {
        let gap = Duration::from_millis(64);
        let t0 = Instant::now();
        let mut buffer = ReceiveBuffer::new();

        buffer.push(&[0x01], t0, gap);
        buffer.clear();
        assert!(buffer.is_empty());

        assert!(!buffer.push(&[0x02], t0 + Duration::from_millis(10), gap));
        assert_eq!(buffer.as_slice(), &[0x02]);
    }

    #[test]
    fn test_send_outcome() {
        assert!(SendOutcome::Complete { chunks: 2 }.is_complete());
        assert!(!SendOutcome::Partial { sent: 1, total: 2 }.is_complete());
    }
}
