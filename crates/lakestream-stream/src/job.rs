//! The micro-batch stream job.
//!
//! One cycle moves through
//! `AWAIT_INPUT → READ → PARSE → DERIVE → VALIDATE → WRITE → COMMIT_CHECKPOINT`
//! and back to `AWAIT_INPUT`. The table commit always precedes the
//! checkpoint save, and every commit carries a stream transaction marker
//! `{job_id, batch_id, end_offsets}`. A batch replayed after a crash finds
//! its marker in the table and adopts it instead of writing the rows again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use lakestream_core::metrics::{increment, set_gauge};
use lakestream_log::{LogBroker, LogRecord};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::dedupe::DedupeIndex;
use crate::error::{Error, Result};
use crate::invalid::{InvalidRecord, InvalidSink};
use crate::table::{PartitionSpec, SnapshotId, StreamTxn, TableRow, TableSink};
use crate::transform::{self, Validated};

/// Configuration for [`StreamJob`].
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Identifies the job's checkpoints and its transaction markers.
    pub job_id: String,

    /// Consumer group holding the partitions.
    pub group: String,

    /// This process's identity within the group.
    pub member: String,

    /// Pause between cycles when there is no backlog.
    pub batch_interval: Duration,

    /// Upper bound on records read per cycle, split across partitions.
    pub max_records_per_batch: usize,

    /// Commit attempts per cycle before the cycle fails.
    pub max_commit_attempts: u32,
    pub commit_backoff: Duration,

    /// Threads used for PARSE, DERIVE and VALIDATE.
    pub workers: usize,

    pub partition_spec: PartitionSpec,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_id: "events-to-lakehouse".to_string(),
            group: "lakestream-stream".to_string(),
            member: Uuid::new_v4().to_string(),
            batch_interval: Duration::from_secs(5),
            max_records_per_batch: 10_000,
            max_commit_attempts: 3,
            commit_backoff: Duration::from_millis(500),
            workers: num_cpus::get(),
            partition_spec: PartitionSpec::default(),
        }
    }
}

/// States of the micro-batch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    AwaitInput,
    Read,
    Parse,
    Derive,
    Validate,
    Write,
    CommitCheckpoint,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitInput => "AWAIT_INPUT",
            Self::Read => "READ",
            Self::Parse => "PARSE",
            Self::Derive => "DERIVE",
            Self::Validate => "VALIDATE",
            Self::Write => "WRITE",
            Self::CommitCheckpoint => "COMMIT_CHECKPOINT",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// What a committed cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: u64,
    pub records_read: usize,
    pub rows_written: usize,
    pub rows_invalid: usize,
    pub rows_duplicate: usize,

    /// `None` when the batch had no valid rows.
    pub snapshot_id: Option<SnapshotId>,

    /// Whether the table already held this batch.
    pub replayed: bool,

    pub offsets: BTreeMap<u32, u64>,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Shutdown was requested before READ.
    Stopped,

    /// Nothing new on the log.
    Idle,

    /// Shutdown was requested after READ; nothing was written.
    Aborted { records_read: usize },

    Committed(BatchReport),
}

/// Statistics about a running job.
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub batches_committed: u64,
    pub records_read: u64,
    pub rows_written: u64,
    pub rows_invalid: u64,
    pub rows_duplicate: u64,
}

/// Consumes the log and commits micro-batches to a table.
pub struct StreamJob<S: TableSink> {
    broker: Arc<dyn LogBroker>,
    sink: S,
    checkpoints: CheckpointStore,
    invalid: Arc<dyn InvalidSink>,
    dedupe: Option<Arc<DedupeIndex>>,
    config: JobConfig,
    state: JobState,
    checkpoint: Option<Checkpoint>,

    /// A commit may have landed without its checkpoint being saved.
    uncertain: bool,
    started: bool,
    stats: JobStats,

    #[cfg(test)]
    visited: Vec<JobState>,
}

impl<S: TableSink> StreamJob<S> {
    pub fn new(
        broker: Arc<dyn LogBroker>,
        sink: S,
        checkpoints: CheckpointStore,
        invalid: Arc<dyn InvalidSink>,
        config: JobConfig,
    ) -> Self {
        Self {
            broker,
            sink,
            checkpoints,
            invalid,
            dedupe: None,
            config,
            state: JobState::AwaitInput,
            checkpoint: None,
            uncertain: true,
            started: false,
            stats: JobStats::default(),
            #[cfg(test)]
            visited: Vec::new(),
        }
    }

    /// Skip rows whose `event_id` was already committed.
    pub fn with_dedupe(mut self, dedupe: Arc<DedupeIndex>) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    fn set_state(&mut self, state: JobState) {
        debug!("Job {}: {} -> {}", self.config.job_id, self.state, state);
        #[cfg(test)]
        self.visited.push(state);
        self.state = state;
    }

    fn offset(&self, partition: u32) -> u64 {
        self.checkpoint.as_ref().map_or(0, |c| c.offset(partition))
    }

    fn next_batch_id(&self) -> u64 {
        self.checkpoint.as_ref().map_or(0, |c| c.batch_id + 1)
    }

    /// Join the consumer group and restore the committed position.
    ///
    /// If the table holds a later batch of this job than the checkpoint store
    /// (the process died between WRITE and COMMIT_CHECKPOINT), the checkpoint
    /// is fast-forwarded to the table's marker.
    pub async fn start(&mut self) -> Result<()> {
        self.broker
            .acquire_group(&self.config.group, &self.config.member)?;
        info!(
            "Job {} joined group {} as {} ({} partitions of {})",
            self.config.job_id,
            self.config.group,
            self.config.member,
            self.broker.partitions(),
            self.broker.topic()
        );

        self.checkpoint = self.checkpoints.load_latest().await?;
        self.reconcile().await?;

        for partition in 0..self.broker.partitions() {
            let end = self.broker.end_offset(partition)?;
            let committed = self.offset(partition);
            if committed > end {
                return Err(Error::Checkpoint(format!(
                    "checkpoint is at offset {committed} of partition {partition}, but the log ends at {end}"
                )));
            }
        }

        match &self.checkpoint {
            Some(c) => info!(
                "Resuming job {} after batch {} at offsets {:?}",
                self.config.job_id, c.batch_id, c.offsets
            ),
            None => info!("Starting job {} from the beginning of the log", self.config.job_id),
        }

        self.started = true;
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<()> {
        let Some(committed) = self.sink.committed_txn(&self.config.job_id).await? else {
            self.uncertain = false;
            return Ok(());
        };
        let checkpoint_batch = self.checkpoint.as_ref().map(|c| c.batch_id);
        if checkpoint_batch.is_some_and(|b| b >= committed.txn.batch_id) {
            self.uncertain = false;
            return Ok(());
        }

        warn!(
            "Table holds batch {} of job {} but the checkpoint is at {:?}; fast-forwarding",
            committed.txn.batch_id, self.config.job_id, checkpoint_batch
        );
        self.remark_committed(committed.snapshot_id, committed.txn.batch_id)
            .await?;

        let checkpoint = Checkpoint {
            job_id: self.config.job_id.clone(),
            batch_id: committed.txn.batch_id,
            offsets: committed.txn.end_offsets,
            snapshot_id: Some(committed.snapshot_id),
            written_at: Utc::now(),
        };
        self.checkpoints.save(&checkpoint).await?;
        self.checkpoint = Some(checkpoint);
        self.uncertain = false;
        Ok(())
    }

    /// Restore dedupe entries for rows a snapshot added.
    async fn remark_committed(&self, snapshot_id: SnapshotId, batch_id: u64) -> Result<()> {
        let Some(dedupe) = &self.dedupe else {
            return Ok(());
        };
        let ids = self.sink.added_event_ids(snapshot_id).await?;
        let marked = dedupe.mark_committed(ids.iter().map(String::as_str), batch_id)?;
        info!("Re-marked {} event ids from snapshot {}", marked, snapshot_id);
        Ok(())
    }

    async fn read(&self) -> Result<Vec<LogRecord>> {
        let partitions = self.broker.partitions();
        let per_partition = (self.config.max_records_per_batch / partitions.max(1) as usize).max(1);
        let positions: Vec<(u32, u64)> = (0..partitions).map(|p| (p, self.offset(p))).collect();
        let broker = self.broker.clone();

        tokio::task::spawn_blocking(move || {
            let mut records = Vec::new();
            for (partition, offset) in positions {
                records.extend(broker.fetch(partition, offset, per_partition)?);
            }
            Ok(records)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn write_invalid(&self, records: Vec<InvalidRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sink = self.invalid.clone();
        tokio::task::spawn_blocking(move || sink.write(&records))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn commit_with_retries(&mut self, rows: Vec<TableRow>, txn: StreamTxn) -> Result<SnapshotId> {
        let max_attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            // The outcome of a failed commit is unknown until the table is reread
            self.uncertain = true;
            match self
                .sink
                .commit(rows.clone(), &self.config.partition_spec, Some(txn.clone()))
                .await
            {
                Ok(snapshot_id) => {
                    self.uncertain = false;
                    return Ok(snapshot_id);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    error!(
                        "Commit of batch {} failed after {} attempts: {}",
                        txn.batch_id, attempt, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let backoff = self.config.commit_backoff * attempt;
                    warn!(
                        "Commit of batch {} failed (attempt {}/{}), retrying in {:?}: {}",
                        txn.batch_id, attempt, max_attempts, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Run one micro-batch cycle.
    pub async fn run_cycle(&mut self, running: &AtomicBool) -> Result<CycleOutcome> {
        if !self.started {
            self.start().await?;
        }
        self.set_state(JobState::AwaitInput);
        if !running.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::Stopped);
        }
        self.broker
            .renew_group(&self.config.group, &self.config.member)?;

        // READ
        self.set_state(JobState::Read);
        let records = self.read().await?;
        if records.is_empty() {
            self.set_state(JobState::AwaitInput);
            return Ok(CycleOutcome::Idle);
        }
        let records_read = records.len();
        increment("stream_records_read_total", records_read as u64);

        let mut end_offsets: BTreeMap<u32, u64> = (0..self.broker.partitions())
            .map(|p| (p, self.offset(p)))
            .collect();
        for record in &records {
            let next = end_offsets.entry(record.partition).or_default();
            *next = (*next).max(record.next_offset());
        }

        let workers = self.config.workers;

        // PARSE
        self.set_state(JobState::Parse);
        let parsed = blocking(move || transform::parse_batch(records, workers)).await?;

        // DERIVE
        self.set_state(JobState::Derive);
        let derived = blocking(move || transform::derive_batch(parsed, workers)).await?;

        // VALIDATE
        self.set_state(JobState::Validate);
        let validated = blocking(move || transform::validate_batch(derived, workers)).await?;

        let mut valid = Vec::with_capacity(validated.len());
        let mut invalid = Vec::new();
        for row in validated {
            match row {
                Validated::Valid(row) => valid.push(row),
                Validated::Invalid(record) => invalid.push(record),
            }
        }

        let mut rows_duplicate = 0;
        if let Some(dedupe) = &self.dedupe {
            let (kept, dropped) = dedupe.filter(valid)?;
            valid = kept;
            rows_duplicate = dropped;
            increment("stream_rows_duplicate_total", dropped as u64);
        }

        if !running.load(Ordering::SeqCst) {
            info!("Shutdown requested, aborting batch of {} records before write", records_read);
            increment("stream_batches_aborted_total", 1);
            self.set_state(JobState::AwaitInput);
            return Ok(CycleOutcome::Aborted { records_read });
        }

        // WRITE
        self.set_state(JobState::Write);
        let rows_invalid = invalid.len();
        self.write_invalid(invalid).await?;

        let mut batch_id = self.next_batch_id();
        let mut replayed = false;
        let rows_written;
        let snapshot_id;

        let already_committed = if self.uncertain {
            self.sink
                .committed_txn(&self.config.job_id)
                .await?
                .filter(|c| c.txn.batch_id >= batch_id)
        } else {
            None
        };

        if let Some(committed) = already_committed {
            info!(
                "Batch {} is already in snapshot {}; adopting its offsets",
                committed.txn.batch_id, committed.snapshot_id
            );
            self.remark_committed(committed.snapshot_id, committed.txn.batch_id)
                .await?;
            batch_id = committed.txn.batch_id;
            end_offsets = committed.txn.end_offsets;
            snapshot_id = Some(committed.snapshot_id);
            rows_written = 0;
            replayed = true;
            self.uncertain = false;
        } else if valid.is_empty() {
            snapshot_id = None;
            rows_written = 0;
        } else {
            let txn = StreamTxn {
                job_id: self.config.job_id.clone(),
                batch_id,
                end_offsets: end_offsets.clone(),
            };
            let event_ids: Vec<String> = valid.iter().map(|r| r.event.event_id.clone()).collect();
            rows_written = valid.len();

            let id = self.commit_with_retries(valid, txn).await?;
            if let Some(dedupe) = &self.dedupe {
                dedupe.mark_committed(event_ids.iter().map(String::as_str), batch_id)?;
            }
            snapshot_id = Some(id);
        }

        // COMMIT_CHECKPOINT
        self.set_state(JobState::CommitCheckpoint);
        let checkpoint = Checkpoint {
            job_id: self.config.job_id.clone(),
            batch_id,
            offsets: end_offsets.clone(),
            snapshot_id,
            written_at: Utc::now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            self.uncertain = true;
            return Err(e);
        }
        self.checkpoint = Some(checkpoint);
        self.set_state(JobState::AwaitInput);

        increment("stream_batches_committed_total", 1);
        increment("stream_rows_written_total", rows_written as u64);
        self.stats.batches_committed += 1;
        self.stats.records_read += records_read as u64;
        self.stats.rows_written += rows_written as u64;
        self.stats.rows_invalid += rows_invalid as u64;
        self.stats.rows_duplicate += rows_duplicate as u64;

        Ok(CycleOutcome::Committed(BatchReport {
            batch_id,
            records_read,
            rows_written,
            rows_invalid,
            rows_duplicate,
            snapshot_id,
            replayed,
            offsets: end_offsets,
        }))
    }

    /// Run cycles until `running` is cleared or a fatal error occurs.
    ///
    /// Non-fatal errors end the cycle without advancing the checkpoint; the
    /// next cycle re-reads the same input.
    pub async fn run(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        if let Err(e) = self.start().await {
            self.set_state(JobState::Failed);
            return Err(e);
        }
        set_gauge("stream_running", 1.0);

        while running.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            match self.run_cycle(&running).await {
                Ok(CycleOutcome::Committed(report)) => {
                    metrics::histogram!("stream_batch_duration_seconds")
                        .record(cycle_start.elapsed().as_secs_f64());
                    info!(
                        "Batch {} committed: {} read, {} written, {} invalid, {} duplicate{}",
                        report.batch_id,
                        report.records_read,
                        report.rows_written,
                        report.rows_invalid,
                        report.rows_duplicate,
                        if report.replayed { " (replayed)" } else { "" }
                    );
                    // A full batch means there is backlog; go again right away
                    if report.records_read < self.config.max_records_per_batch {
                        sleep_while_running(&running, self.config.batch_interval).await;
                    }
                }
                Ok(CycleOutcome::Idle) => {
                    sleep_while_running(&running, self.config.batch_interval).await;
                }
                Ok(CycleOutcome::Stopped) | Ok(CycleOutcome::Aborted { .. }) => break,
                Err(e) if e.is_fatal() => {
                    self.set_state(JobState::Failed);
                    set_gauge("stream_running", 0.0);
                    error!("Job {} failed: {}", self.config.job_id, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Cycle failed, retrying from the last checkpoint: {}", e);
                    sleep_while_running(&running, self.config.batch_interval).await;
                }
            }
        }

        set_gauge("stream_running", 0.0);
        if let Err(e) = self.invalid.flush() {
            warn!("Failed to flush invalid-records sink: {}", e);
        }
        self.broker
            .release_group(&self.config.group, &self.config.member)?;
        info!("Job {} stopped", self.config.job_id);
        Ok(())
    }
}

async fn sleep_while_running(running: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep((deadline - now).min(Duration::from_millis(100))).await;
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Task(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointConfig;
    use crate::invalid::MemoryInvalidSink;
    use crate::table::{Table, TableConfig};
    use lakestream_log::{AckLevel, MemoryLog};
    use object_store::ObjectStore;
    use object_store::memory::InMemory;
    use serde_json::json;

    struct Harness {
        log: Arc<MemoryLog>,
        store: Arc<dyn ObjectStore>,
        invalid: Arc<MemoryInvalidSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(MemoryLog::new("events", 2)),
                store: Arc::new(InMemory::new()),
                invalid: Arc::new(MemoryInvalidSink::new()),
            }
        }

        fn job(&self) -> StreamJob<Table> {
            StreamJob::new(
                self.log.clone(),
                Table::open(self.store.clone(), TableConfig::default()),
                CheckpointStore::new(self.store.clone(), "job", CheckpointConfig::default()),
                self.invalid.clone(),
                JobConfig {
                    job_id: "job".to_string(),
                    workers: 2,
                    ..JobConfig::default()
                },
            )
        }

        fn publish(&self, partition: u32, value: serde_json::Value) {
            self.log
                .append(partition, b"s", &serde_json::to_vec(&value).unwrap(), AckLevel::Leader)
                .unwrap();
        }
    }

    fn event(id: &str) -> serde_json::Value {
        json!({"event_id": id, "event_type": "page_view", "session_id": "s", "timestamp": "2024-05-01T10:00:00Z"})
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::AwaitInput.to_string(), "AWAIT_INPUT");
        assert_eq!(JobState::CommitCheckpoint.to_string(), "COMMIT_CHECKPOINT");
    }

    #[tokio::test]
    async fn test_idle_cycle_commits_nothing() {
        let h = Harness::new();
        let mut job = h.job();
        let running = AtomicBool::new(true);

        assert_eq!(job.run_cycle(&running).await.unwrap(), CycleOutcome::Idle);
        assert!(job.checkpoint().is_none());
        assert_eq!(job.state(), JobState::AwaitInput);
    }

    #[tokio::test]
    async fn test_cycle_commits_and_advances() {
        let h = Harness::new();
        h.publish(0, event("e1"));
        h.publish(1, event("e2"));
        h.publish(1, json!("not an object"));

        let mut job = h.job();
        let running = AtomicBool::new(true);
        let CycleOutcome::Committed(report) = job.run_cycle(&running).await.unwrap() else {
            panic!("expected a commit");
        };

        assert_eq!(report.batch_id, 0);
        assert_eq!(report.records_read, 3);
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.rows_invalid, 1);
        assert_eq!(report.offsets, BTreeMap::from([(0, 1), (1, 2)]));
        assert_eq!(h.invalid.records().len(), 1);

        let checkpoint = job.checkpoint().unwrap();
        assert_eq!(checkpoint.snapshot_id, Some(1));

        // Nothing new afterwards
        assert_eq!(job.run_cycle(&running).await.unwrap(), CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn test_cycle_walks_every_state() {
        let h = Harness::new();
        h.publish(0, event("e1"));

        let mut job = h.job();
        let running = AtomicBool::new(true);
        job.start().await.unwrap();
        job.visited.clear();
        assert!(matches!(job.run_cycle(&running).await.unwrap(), CycleOutcome::Committed(_)));

        assert_eq!(
            job.visited,
            vec![
                JobState::AwaitInput,
                JobState::Read,
                JobState::Parse,
                JobState::Derive,
                JobState::Validate,
                JobState::Write,
                JobState::CommitCheckpoint,
                JobState::AwaitInput,
            ]
        );
    }

    #[tokio::test]
    async fn test_stopped_before_read() {
        let h = Harness::new();
        h.publish(0, event("e1"));
        let mut job = h.job();

        let running = AtomicBool::new(false);
        assert_eq!(job.run_cycle(&running).await.unwrap(), CycleOutcome::Stopped);
        assert!(job.checkpoint().is_none());
    }

    #[tokio::test]
    async fn test_all_invalid_batch_advances_without_commit() {
        let h = Harness::new();
        h.publish(0, json!({"event_id": "e1", "event_type": "x", "session_id": "s"}));

        let mut job = h.job();
        let running = AtomicBool::new(true);
        let CycleOutcome::Committed(report) = job.run_cycle(&running).await.unwrap() else {
            panic!("expected a checkpoint commit");
        };
        assert_eq!(report.snapshot_id, None);
        assert_eq!(report.rows_invalid, 1);
        assert!(job.sink().head().await.unwrap().is_none());
        assert_eq!(job.checkpoint().unwrap().offset(0), 1);
    }

    #[tokio::test]
    async fn test_second_member_is_rejected() {
        let h = Harness::new();
        let mut first = h.job();
        first.start().await.unwrap();

        let mut second = h.job();
        let err = second.start().await.unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }

    #[tokio::test]
    async fn test_run_exits_when_flag_cleared() {
        let h = Harness::new();
        h.publish(0, event("e1"));
        let mut job = h.job();
        job.config.batch_interval = Duration::from_millis(10);

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(false, Ordering::SeqCst);
        });

        job.run(running).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(job.stats().rows_written, 1);
        // The lease was released, so another member can join
        let mut next = h.job();
        next.start().await.unwrap();
    }
}
