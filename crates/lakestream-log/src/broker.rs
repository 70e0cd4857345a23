//! The broker abstraction the producer and the stream job talk to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::LogRecord;

/// How durable a record must be before an append is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckLevel {
    /// Fire-and-forget: the broker buffers the record, callers do not wait.
    None,
    /// The broker has handed the record to the OS.
    #[default]
    Leader,
    /// The broker has synced the record to stable storage.
    All,
}

impl AckLevel {
    /// Whether the ingest path should wait for the delivery result.
    pub fn waits_for_delivery(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for AckLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Leader => "leader",
            Self::All => "all",
        })
    }
}

impl FromStr for AckLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "leader" | "1" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            other => Err(format!(
                "unknown ack level {other:?} (expected none, leader or all)"
            )),
        }
    }
}

/// A partitioned append-only log for a single topic.
///
/// Implementations must be safe for concurrent use: the producer appends from
/// many tasks while the stream job fetches.
pub trait LogBroker: Send + Sync {
    /// Topic name.
    fn topic(&self) -> &str;

    /// Number of partitions of the topic.
    fn partitions(&self) -> u32;

    /// Append a record and return its offset.
    fn append(&self, partition: u32, key: &[u8], value: &[u8], ack: AckLevel) -> Result<u64>;

    /// Read up to `max_records` records starting at `offset`.
    ///
    /// Returns an empty vector when `offset` is at or past the end.
    fn fetch(&self, partition: u32, offset: u64, max_records: usize) -> Result<Vec<LogRecord>>;

    /// Offset the next appended record will receive.
    fn end_offset(&self, partition: u32) -> Result<u64>;

    /// Take exclusive ownership of the topic for `group` as `member`.
    ///
    /// Fails with [`crate::LogError::GroupBusy`] while another member holds a
    /// live lease.
    fn acquire_group(&self, group: &str, member: &str) -> Result<()>;

    /// Extend the lease. Fails if the lease was lost to another member.
    fn renew_group(&self, group: &str, member: &str) -> Result<()>;

    /// Give up the lease. Releasing a lease held by someone else is a no-op.
    fn release_group(&self, group: &str, member: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_level_parse() {
        assert_eq!("none".parse::<AckLevel>().unwrap(), AckLevel::None);
        assert_eq!("LEADER".parse::<AckLevel>().unwrap(), AckLevel::Leader);
        assert_eq!("all".parse::<AckLevel>().unwrap(), AckLevel::All);
        assert_eq!("-1".parse::<AckLevel>().unwrap(), AckLevel::All);
        assert!("quorum".parse::<AckLevel>().is_err());
    }

    #[test]
    fn test_ack_level_defaults_to_leader() {
        assert_eq!(AckLevel::default(), AckLevel::Leader);
        assert!(AckLevel::Leader.waits_for_delivery());
        assert!(!AckLevel::None.waits_for_delivery());
        assert_eq!(AckLevel::All.to_string(), "all");
    }
}
