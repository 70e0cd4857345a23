//! Error types for the durable log.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, LogError>;

/// Errors returned by log brokers and the producer.
#[derive(Error, Debug)]
pub enum LogError {
    /// I/O error talking to the log storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (topic or lease document) could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker is temporarily unable to accept or serve records.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A partition file contains a frame that cannot be decoded.
    #[error("corrupt partition {partition} at byte {position}: {reason}")]
    Corrupt {
        partition: u32,
        position: u64,
        reason: String,
    },

    /// The partition does not exist on this topic.
    #[error("unknown partition {partition} (topic has {partitions})")]
    UnknownPartition { partition: u32, partitions: u32 },

    /// The record exceeds the broker's size limit.
    #[error("record of {size} bytes exceeds limit of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// Another live consumer holds the group lease.
    #[error("consumer group {group} is held by {holder}")]
    GroupBusy { group: String, holder: String },

    /// The producer has been closed.
    #[error("producer is closed")]
    Closed,

    /// Invalid broker configuration or on-disk layout.
    #[error("configuration error: {0}")]
    Config(String),

    /// The log was opened read-only.
    #[error("{0} is open read-only")]
    ReadOnly(PathBuf),

    /// Topic metadata is missing.
    #[error("topic not found at {0}")]
    TopicNotFound(PathBuf),
}

impl LogError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_))
    }
}
