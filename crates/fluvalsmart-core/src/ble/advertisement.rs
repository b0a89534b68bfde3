//! 广播包解析
//!
//! 广播数据由若干 AD 结构组成，每个结构的格式为：
//!
//! ```text
//! | len (1) | type (1) | data (len - 1) |
//! ```
//!
//! 只解析核心层关心的字段：服务 UUID 列表、厂商自定义数据和本地名称。

use std::collections::BTreeMap;
use uuid::Uuid;

const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// 蓝牙基准 UUID: 00000000-0000-1000-8000-00805f9b34fb
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// 解析后的广播记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementRecord {
    /// 按广播顺序排列的服务 UUID
    pub service_uuids: Vec<Uuid>,
    /// 厂商 ID -> 厂商数据
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub local_name: Option<String>,
}

impl AdvertisementRecord {
    /// 解析原始广播包
    ///
    /// 长度为 0 的结构视为填充，截断的结构直接结束解析。
    pub fn parse(raw: &[u8]) -> Self {
        let mut record = Self::default();
        let mut rest = raw;

        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if len == 0 || len > tail.len() {
                break;
            }
            let (field, next) = tail.split_at(len);
            rest = next;

            let Some((&ad_type, data)) = field.split_first() else {
                continue;
            };
            match ad_type {
                AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                    record.service_uuids.extend(
                        data.chunks_exact(2)
                            .map(|b| uuid_from_short(u16::from_le_bytes([b[0], b[1]]) as u32)),
                    );
                }
                AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                    record.service_uuids.extend(
                        data.chunks_exact(4)
                            .map(|b| uuid_from_short(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))),
                    );
                }
                AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                    for chunk in data.chunks_exact(16) {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(chunk);
                        // 广播中是小端序
                        bytes.reverse();
                        record.service_uuids.push(Uuid::from_bytes(bytes));
                    }
                }
                AD_SHORT_LOCAL_NAME | AD_COMPLETE_LOCAL_NAME => {
                    if record.local_name.is_none() || ad_type == AD_COMPLETE_LOCAL_NAME {
                        record.local_name = Some(String::from_utf8_lossy(data).into_owned());
                    }
                }
                AD_MANUFACTURER_DATA if data.len() >= 2 => {
                    let id = u16::from_le_bytes([data[0], data[1]]);
                    record.manufacturer_data.insert(id, data[2..].to_vec());
                }
                _ => {}
            }
        }

        record
    }

    /// 厂商数据：2 字节小端厂商 ID + 原始数据
    ///
    /// 有多条厂商数据时取 ID 最小的一条。
    pub fn manufacturer_payload(&self) -> Option<Vec<u8>> {
        self.manufacturer_data.iter().next().map(|(id, data)| {
            let mut raw = Vec::with_capacity(2 + data.len());
            raw.extend_from_slice(&id.to_le_bytes());
            raw.extend_from_slice(data);
            raw
        })
    }
}

fn uuid_from_short(value: u32) -> Uuid {
    Uuid::from_u128(((value as u128) << 96) | BLUETOOTH_BASE_UUID)
}
