//! Error types for the stream job and the table sink.

use lakestream_log::LogError;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the stream job.
#[derive(Error, Debug)]
pub enum Error {
    /// Durable log error.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Object storage error.
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Parquet encoding or decoding error.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow error.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event model error.
    #[error("event error: {0}")]
    Event(#[from] lakestream_core::Error),

    /// The checkpoint store is unreadable or was written by someone else.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Table metadata is missing or malformed.
    #[error("table error: {0}")]
    Table(String),

    /// Every commit attempt lost the optimistic-concurrency race.
    #[error("commit conflict after {attempts} attempts")]
    CommitConflict { attempts: u32 },

    /// The table sink rejected the commit.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// Invalid-records sink error.
    #[error("invalid-records sink error: {0}")]
    InvalidSink(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background task failed.
    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    /// Whether the job must stop rather than retry the cycle.
    ///
    /// Fatal errors indicate corrupted or contested durable state: the
    /// checkpoint store, table metadata, a log partition, or the consumer
    /// group lease.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Checkpoint(_) | Self::Table(_) | Self::Config(_) | Self::RocksDb(_) => true,
            Self::Log(e) => matches!(
                e,
                LogError::Corrupt { .. }
                    | LogError::GroupBusy { .. }
                    | LogError::UnknownPartition { .. }
                    | LogError::Config(_)
                    | LogError::TopicNotFound(_)
                    | LogError::ReadOnly(_)
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Checkpoint("undecodable".into()).is_fatal());
        assert!(Error::Table("missing schema".into()).is_fatal());
        assert!(
            Error::Log(LogError::GroupBusy {
                group: "g".into(),
                holder: "other".into()
            })
            .is_fatal()
        );

        assert!(!Error::CommitConflict { attempts: 3 }.is_fatal());
        assert!(!Error::CommitFailed("throttled".into()).is_fatal());
        assert!(!Error::Log(LogError::Unavailable("leader election".into())).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::CommitConflict { attempts: 4 };
        assert_eq!(err.to_string(), "commit conflict after 4 attempts");
    }
}
