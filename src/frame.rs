use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved metadata keys, per the frame record's documented contract.
pub const KEY_ENCODING_TYPE: &str = "encoding_type";
pub const KEY_ENCODING_LEVEL: &str = "encoding_level";
pub const KEY_RESOLUTION: &str = "resolution";
pub const KEY_HEIGHT: &str = "height";
pub const KEY_WIDTH: &str = "width";
pub const KEY_CHANNEL: &str = "channel";
pub const KEY_IMG_HANDLE: &str = "img_handle";
pub const KEY_USER_DATA: &str = "user_data";
pub const KEY_TS_VI_ENTRY: &str = "ts_vi_entry";
pub const KEY_TS_VI_FILTER_ENTRY: &str = "ts_vi_filter_entry";
pub const KEY_TS_VI_QUEUE_WAIT: &str = "ts_vi_queue_wait";
pub const KEY_TS_VI_ENCODE_START: &str = "ts_vi_encode_start";
pub const KEY_TS_VI_ENCODE_END: &str = "ts_vi_encode_end";
pub const KEY_TS_VI_EXIT: &str = "ts_vi_exit";

/// A scalar metadata value. Frame metadata is a flat mapping of string keys
/// to one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            MetaValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}

impl From<u32> for MetaValue {
    fn from(i: u32) -> Self {
        MetaValue::Int(i as i64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata(pub HashMap<String, MetaValue>);

impl Metadata {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(MetaValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(MetaValue::as_i64)
    }

    /// Stamp a profiling timestamp, in epoch milliseconds, per spec's
    /// `str(round(time.time() * 1000))` convention.
    pub fn stamp(&mut self, key: &str, epoch_millis: i64) {
        self.set(key, epoch_millis);
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.0)
    }
}

/// Raw pixel data (when `shape` is `Some`) or an already-encoded byte
/// sequence (when `shape` is `None`, e.g. after JPEG/PNG encoding).
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    /// (height, width, channel) for raw buffers; `None` once compressed.
    pub shape: Option<(u32, u32, u32)>,
}

impl FrameBuffer {
    pub fn raw(data: Vec<u8>, height: u32, width: u32, channel: u32) -> Self {
        Self {
            data,
            shape: Some((height, width, channel)),
        }
    }

    pub fn encoded(data: Vec<u8>) -> Self {
        Self { data, shape: None }
    }

    pub fn is_raw(&self) -> bool {
        self.shape.is_some()
    }
}

/// A single frame record flowing through the pipeline: metadata plus buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub metadata: Metadata,
    pub buffer: FrameBuffer,
}

impl Frame {
    pub fn new(metadata: Metadata, buffer: FrameBuffer) -> Self {
        Self { metadata, buffer }
    }
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
