//! 广播数据编解码
//!
//! 一个信标由两段 Service Data 组成：
//!
//! - 能力段 (6 字节)，键为能力 UUID `0000XXYY-0000-1000-8000-00805f9b34fb`，
//!   XX = 5GHz 标志，YY = 厂商 ID；数据中 byte[2]/byte[3] 同样携带这两个值
//! - 身份段 (27 字节)：
//!   - `[8..10]` 大端 sender ID
//!   - `[10..26]` UTF-8 设备名，NUL 结尾，被截断时以 `\t` 结尾
//!   - `[26]` 协议版本
//!
//! 解码时按长度识别两段，不依赖键 UUID。

use std::collections::BTreeMap;

use uuid::Uuid;

use super::{ADV_SERVICE_UUID, IDENTITY_DATA_UUID};
use crate::config::BrandId;

pub const CAPABILITY_DATA_LEN: usize = 6;
pub const IDENTITY_DATA_LEN: usize = 27;
pub const PROTOCOL_VERSION: u8 = 1;

const SENDER_ID_OFFSET: usize = 8;
const NAME_OFFSET: usize = 10;
const NAME_LEN: usize = 16;
const VERSION_OFFSET: usize = 26;
const TRUNCATION_MARKER: char = '\t';
const ELLIPSIS: &str = "...";

/// 广播中携带的设备信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub sender_id: u16,
    pub name: String,
    /// 厂商 ID，0 视为未知
    pub brand_id: Option<u8>,
    pub supports_5ghz: bool,
}

/// 编码后的信标内容，交给平台广播 API
#[derive(Debug, Clone)]
pub struct BeaconPayload {
    pub service_uuid: Uuid,
    pub capability_uuid: Uuid,
    pub capability_data: Vec<u8>,
    pub identity_uuid: Uuid,
    pub identity_data: Vec<u8>,
}

impl BeaconPayload {
    /// 按 UUID 组织的 Service Data
    pub fn service_data(&self) -> BTreeMap<Uuid, Vec<u8>> {
        BTreeMap::from([
            (self.capability_uuid, self.capability_data.clone()),
            (self.identity_uuid, self.identity_data.clone()),
        ])
    }
}

/// 能力 UUID: `0000XXYY-0000-1000-8000-00805f9b34fb`
pub fn capability_uuid(supports_5ghz: bool, brand_id: u8) -> Uuid {
    let high = (u128::from(supports_5ghz) << 8) | u128::from(brand_id);
    Uuid::from_u128((high << 96) | 0x0000_1000_8000_0080_5f9b_34fb_u128)
}

impl Advertisement {
    /// 4 位小写十六进制 sender ID
    pub fn sender_id_hex(&self) -> String {
        format!("{:04x}", self.sender_id)
    }

    /// 品牌显示名称
    pub fn brand(&self) -> Option<&'static str> {
        self.brand_id.and_then(|id| BrandId::from_id(id).label())
    }

    pub fn encode(&self) -> BeaconPayload {
        let brand = self.brand_id.unwrap_or(0);
        let flag = u8::from(self.supports_5ghz);
        let id = self.sender_id.to_be_bytes();

        let mut capability = vec![0u8; CAPABILITY_DATA_LEN];
        capability[..2].copy_from_slice(&id);
        capability[2] = flag;
        capability[3] = brand;

        let mut identity = vec![0u8; IDENTITY_DATA_LEN];
        identity[SENDER_ID_OFFSET..NAME_OFFSET].copy_from_slice(&id);
        identity[NAME_OFFSET..NAME_OFFSET + NAME_LEN].copy_from_slice(&encode_name(&self.name));
        identity[VERSION_OFFSET] = PROTOCOL_VERSION;

        BeaconPayload {
            service_uuid: ADV_SERVICE_UUID,
            capability_uuid: capability_uuid(self.supports_5ghz, brand),
            capability_data: capability,
            identity_uuid: IDENTITY_DATA_UUID,
            identity_data: identity,
        }
    }

    /// 从扫描到的 Service Data 解码
    ///
    /// 缺少身份段、名称为空或 sender ID 为 0 的信标不可被发现，返回 `None`。
    pub fn decode<'a, I>(service_data: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a Uuid, &'a Vec<u8>)>,
    {
        let mut capability = None;
        let mut identity = None;
        for (uuid, data) in service_data {
            match data.len() {
                CAPABILITY_DATA_LEN => capability = Some((uuid, data)),
                IDENTITY_DATA_LEN => identity = Some(data),
                _ => {}
            }
        }

        let identity = identity?;
        let sender_id = u16::from_be_bytes([
            identity[SENDER_ID_OFFSET],
            identity[SENDER_ID_OFFSET + 1],
        ]);
        let name = decode_name(&identity[NAME_OFFSET..NAME_OFFSET + NAME_LEN]);
        if sender_id == 0 || name.is_empty() {
            return None;
        }

        let (brand_id, supports_5ghz) = match capability {
            Some((uuid, _)) => {
                let bytes = uuid.as_bytes();
                (Some(bytes[3]).filter(|b| *b != 0), bytes[2] == 1)
            }
            None => (None, false),
        };

        Some(Self {
            sender_id,
            name,
            brand_id,
            supports_5ghz,
        })
    }
}

fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let clean: String = name.chars().filter(|c| !c.is_control()).collect();
    let mut field = [0u8; NAME_LEN];

    if clean.len() <= NAME_LEN {
        field[..clean.len()].copy_from_slice(clean.as_bytes());
        return field;
    }

    let mut cut = NAME_LEN - 1;
    while !clean.is_char_boundary(cut) {
        cut -= 1;
    }
    field[..cut].copy_from_slice(&clean.as_bytes()[..cut]);
    field[cut] = TRUNCATION_MARKER as u8;
    field
}

fn decode_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    let mut name = String::from_utf8_lossy(&field[..end]).into_owned();
    if name.ends_with(TRUNCATION_MARKER) {
        name.pop();
        name.push_str(ELLIPSIS);
    }
    name
}
