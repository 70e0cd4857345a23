//! In-memory log broker with fault injection, for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::broker::{AckLevel, LogBroker};
use crate::error::{LogError, Result};
use crate::record::LogRecord;

/// A [`LogBroker`] that keeps records in memory.
///
/// Faults can be injected to exercise retry paths:
/// - [`fail_next_appends`](Self::fail_next_appends): the append is rejected
///   with a transient error and nothing is stored.
/// - [`lose_next_acks`](Self::lose_next_acks): the record is stored but the
///   caller sees a transient error, as when an acknowledgment is lost.
/// - [`set_unavailable`](Self::set_unavailable): every append and fetch fails
///   until cleared.
pub struct MemoryLog {
    topic: String,
    partitions: Vec<Mutex<Vec<LogRecord>>>,
    lease_ttl: Duration,
    leases: Mutex<HashMap<String, (String, Instant)>>,
    fail_next: AtomicU32,
    lose_next_acks: AtomicU32,
    unavailable: AtomicBool,
    append_attempts: AtomicU64,
}

impl MemoryLog {
    /// Create a topic with `partitions` empty partitions.
    pub fn new(topic: impl Into<String>, partitions: u32) -> Self {
        Self {
            topic: topic.into(),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            lease_ttl: Duration::from_secs(30),
            leases: Mutex::new(HashMap::new()),
            fail_next: AtomicU32::new(0),
            lose_next_acks: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            append_attempts: AtomicU64::new(0),
        }
    }

    /// Set how long a group lease stays live without renewal.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Reject the next `n` appends with a transient error.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Store the next `n` appends but report a transient error for them.
    pub fn lose_next_acks(&self, n: u32) {
        self.lose_next_acks.store(n, Ordering::SeqCst);
    }

    /// Make the broker unavailable (or available again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of append calls received, including failed ones.
    pub fn append_attempts(&self) -> u64 {
        self.append_attempts.load(Ordering::SeqCst)
    }

    /// Every record of a partition.
    pub fn records(&self, partition: u32) -> Vec<LogRecord> {
        self.partitions
            .get(partition as usize)
            .map(|p| p.lock().clone())
            .unwrap_or_default()
    }

    /// Total number of stored records across partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition(&self, partition: u32) -> Result<&Mutex<Vec<LogRecord>>> {
        self.partitions
            .get(partition as usize)
            .ok_or(LogError::UnknownPartition {
                partition,
                partitions: self.partitions.len() as u32,
            })
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("broker is down".into()));
        }
        Ok(())
    }
}

/// Decrement `counter` if positive, returning whether it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LogBroker for MemoryLog {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn append(&self, partition: u32, key: &[u8], value: &[u8], _ack: AckLevel) -> Result<u64> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        let records = self.partition(partition)?;
        self.check_available()?;

        if take_one(&self.fail_next) {
            return Err(LogError::Unavailable("injected append failure".into()));
        }

        let mut records = records.lock();
        let offset = records.len() as u64;
        records.push(LogRecord {
            partition,
            offset,
            timestamp_ms: Utc::now().timestamp_millis(),
            key: key.to_vec(),
            value: value.to_vec(),
        });

        if take_one(&self.lose_next_acks) {
            return Err(LogError::Unavailable("injected lost acknowledgment".into()));
        }

        Ok(offset)
    }

    fn fetch(&self, partition: u32, offset: u64, max_records: usize) -> Result<Vec<LogRecord>> {
        let records = self.partition(partition)?;
        self.check_available()?;

        let records = records.lock();
        Ok(records
            .iter()
            .skip(offset as usize)
            .take(max_records)
            .cloned()
            .collect())
    }

    fn end_offset(&self, partition: u32) -> Result<u64> {
        Ok(self.partition(partition)?.lock().len() as u64)
    }

    fn acquire_group(&self, group: &str, member: &str) -> Result<()> {
        let mut leases = self.leases.lock();
        if let Some((holder, renewed)) = leases.get(group)
            && holder != member
            && renewed.elapsed() <= self.lease_ttl
        {
            return Err(LogError::GroupBusy {
                group: group.to_string(),
                holder: holder.clone(),
            });
        }
        leases.insert(group.to_string(), (member.to_string(), Instant::now()));
        Ok(())
    }

    fn renew_group(&self, group: &str, member: &str) -> Result<()> {
        self.acquire_group(group, member)
    }

    fn release_group(&self, group: &str, member: &str) -> Result<()> {
        let mut leases = self.leases.lock();
        if leases.get(group).is_some_and(|(holder, _)| holder == member) {
            leases.remove(group);
        }
        Ok(())
    }
}
