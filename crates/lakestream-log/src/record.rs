//! Log records and their on-disk frame encoding.
//!
//! # Frame Format
//!
//! ```text
//! [u32 little-endian length][frame]
//!
//! frame = [u64 LE offset][i64 LE timestamp_ms][u32 LE key_len][key][value]
//! ```

use crate::error::{LogError, Result};

/// Size of the fixed part of a frame (offset, timestamp, key length).
pub const FRAME_HEADER_LEN: usize = 8 + 8 + 4;

/// Size of the length prefix preceding every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// A record read from the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,

    /// Broker-assigned offset, dense per partition and starting at 0.
    pub offset: u64,

    /// Broker append time in milliseconds since the epoch.
    pub timestamp_ms: i64,

    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Offset of the record that follows this one.
    pub fn next_offset(&self) -> u64 {
        self.offset + 1
    }
}

/// Encode a record as a length-prefixed frame, appending to `out`.
pub fn encode_frame(offset: u64, timestamp_ms: i64, key: &[u8], value: &[u8], out: &mut Vec<u8>) {
    let frame_len = FRAME_HEADER_LEN + key.len() + value.len();
    out.reserve(LENGTH_PREFIX_LEN + frame_len);
    out.extend_from_slice(&(frame_len as u32).to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&timestamp_ms.to_le_bytes());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}

/// Total encoded size of a record, including the length prefix.
pub fn encoded_len(key: &[u8], value: &[u8]) -> usize {
    LENGTH_PREFIX_LEN + FRAME_HEADER_LEN + key.len() + value.len()
}

/// Decode a frame body (without its length prefix).
///
/// `position` is the byte position of the frame in the partition file and is
/// only used for error reporting.
pub fn decode_frame(partition: u32, position: u64, frame: &[u8]) -> Result<LogRecord> {
    let corrupt = |reason: &str| LogError::Corrupt {
        partition,
        position,
        reason: reason.to_string(),
    };

    if frame.len() < FRAME_HEADER_LEN {
        return Err(corrupt("frame shorter than header"));
    }

    let offset = u64::from_le_bytes(frame[0..8].try_into().map_err(|_| corrupt("offset"))?);
    let timestamp_ms =
        i64::from_le_bytes(frame[8..16].try_into().map_err(|_| corrupt("timestamp"))?);
    let key_len =
        u32::from_le_bytes(frame[16..20].try_into().map_err(|_| corrupt("key length"))?) as usize;

    let body = &frame[FRAME_HEADER_LEN..];
    if key_len > body.len() {
        return Err(corrupt("key length exceeds frame"));
    }
    let (key, value) = body.split_at(key_len);

    Ok(LogRecord {
        partition,
        offset,
        timestamp_ms,
        key: key.to_vec(),
        value: value.to_vec(),
    })
}
