//! Durable partitioned log for lakestream.
//!
//! This crate provides:
//! - The [`LogBroker`] trait: a topic of append-only partitions with dense offsets
//! - [`FileLog`]: a broker persisted as length-prefixed frame files
//! - [`MemoryLog`]: an in-memory broker with fault injection for tests
//! - [`Producer`]: at-least-once publishing with ordered per-partition delivery
//! - A Kafka-compatible key partitioner

mod broker;
mod error;
mod file;
mod memory;
mod partitioner;
mod producer;
mod record;

pub use broker::{AckLevel, LogBroker};
pub use error::{LogError, Result};
pub use file::{FileLog, FileLogConfig};
pub use memory::MemoryLog;
pub use partitioner::{murmur2, partition_for_key};
pub use producer::{DeliveryHandle, DeliveryResult, Producer, ProducerConfig};
pub use record::LogRecord;
