//! Stream-to-lakehouse job for lakestream.
//!
//! This crate consumes the durable event log in micro-batches and commits
//! them to a partitioned, versioned table on object storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   LogBroker     │  partitions of LogRecords, consumer-group lease
//! └────────┬────────┘
//!          │ READ
//!          ▼
//! ┌─────────────────┐
//! │   transform     │  PARSE → DERIVE → VALIDATE ──► InvalidSink
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  DedupeIndex    │  optional, RocksDB
//! └────────┬────────┘
//!          │ WRITE
//!          ▼
//! ┌─────────────────┐
//! │     Table       │  Parquet data files + snapshot documents
//! └────────┬────────┘
//!          │ COMMIT_CHECKPOINT
//!          ▼
//! ┌─────────────────┐
//! │ CheckpointStore │  per-batch offsets next to the table
//! └─────────────────┘
//! ```

pub mod checkpoint;
pub mod dedupe;
pub mod error;
pub mod invalid;
pub mod job;
pub mod storage;
pub mod table;
pub mod transform;

pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore};
pub use dedupe::{DedupeIndex, DedupeStats};
pub use error::{Error, Result};
pub use invalid::{
    InvalidReason, InvalidRecord, InvalidSink, InvalidSinkConfig, LogInvalidSink, ManifestWriter,
    MemoryInvalidSink, SealedSegment, SegmentInvalidSink,
};
pub use job::{BatchReport, CycleOutcome, JobConfig, JobState, JobStats, StreamJob};
pub use storage::open_warehouse;
pub use table::{
    CommittedTxn, PartitionSpec, Snapshot, SnapshotId, StreamTxn, Table, TableConfig, TableRow,
    TableSchema, TableSink,
};
