//! End-to-end tests: gateway → log → stream job → table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use lakestream_core::validate_slice;
use lakestream_gateway::{Gateway, IngestAck};
use lakestream_log::{
    FileLog, FileLogConfig, LogBroker, MemoryLog, Producer, ProducerConfig, partition_for_key,
};
use lakestream_stream::invalid::{InvalidReason, MemoryInvalidSink};
use lakestream_stream::transform::{self, RowBody};
use lakestream_stream::{
    CheckpointConfig, CheckpointStore, CommittedTxn, CycleOutcome, DedupeIndex, Error, JobConfig,
    PartitionSpec, SnapshotId, StreamJob, StreamTxn, Table, TableConfig, TableRow, TableSink,
};
use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use serde_json::{Map, Value, json};
use tempfile::TempDir;

const PARTITIONS: u32 = 3;
const JOB_ID: &str = "events-job";

struct Pipeline {
    log: Arc<MemoryLog>,
    gateway: Gateway,
    store: Arc<dyn ObjectStore>,
    invalid: Arc<MemoryInvalidSink>,
}

impl Pipeline {
    fn new() -> Self {
        let log = Arc::new(MemoryLog::new("ecommerce_events", PARTITIONS));
        let producer = Producer::new(
            log.clone(),
            ProducerConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                ..Default::default()
            },
        );
        Self {
            log,
            gateway: Gateway::new(Arc::new(producer)),
            store: Arc::new(InMemory::new()),
            invalid: Arc::new(MemoryInvalidSink::new()),
        }
    }

    fn table(&self) -> Table {
        Table::open(self.store.clone(), TableConfig::default())
    }

    fn job_with<S: TableSink>(&self, sink: S, config: JobConfig) -> StreamJob<S> {
        StreamJob::new(
            self.log.clone(),
            sink,
            CheckpointStore::new(self.store.clone(), JOB_ID, CheckpointConfig::default()),
            self.invalid.clone(),
            config,
        )
    }

    fn job(&self) -> StreamJob<Table> {
        self.job_with(self.table(), job_config())
    }

    async fn ingest(&self, event: Value) -> IngestAck {
        self.gateway
            .ingest(&serde_json::to_vec(&event).unwrap())
            .await
            .unwrap()
    }

    async fn rows(&self) -> Vec<Map<String, Value>> {
        let mut rows = self.table().scan_rows(None).await.unwrap();
        rows.sort_by(|a, b| a["event_id"].as_str().cmp(&b["event_id"].as_str()));
        rows
    }

    async fn event_ids(&self) -> Vec<String> {
        self.rows()
            .await
            .iter()
            .map(|r| r["event_id"].as_str().unwrap().to_string())
            .collect()
    }
}

fn job_config() -> JobConfig {
    JobConfig {
        job_id: JOB_ID.to_string(),
        member: "worker-1".to_string(),
        max_records_per_batch: 1_000,
        commit_backoff: Duration::from_millis(1),
        workers: 2,
        ..Default::default()
    }
}

fn event(id: &str, event_type: &str, session: &str) -> Value {
    json!({
        "event_id": id,
        "event_type": event_type,
        "session_id": session,
        "user_id": 7,
        "timestamp": "2024-05-01T10:15:00Z",
    })
}

async fn drain<S: TableSink>(job: &mut StreamJob<S>) -> Vec<CycleOutcome> {
    let running = AtomicBool::new(true);
    let mut outcomes = Vec::new();
    loop {
        let outcome = job.run_cycle(&running).await.unwrap();
        if outcome == CycleOutcome::Idle {
            return outcomes;
        }
        outcomes.push(outcome);
    }
}

/// Wraps a table, failing a configurable number of commits.
struct FlakySink {
    inner: Table,

    /// Commits rejected before reaching the table.
    reject: AtomicU32,

    /// Commits that land in the table but report a failure.
    lose_ack: AtomicU32,
}

impl FlakySink {
    fn new(inner: Table) -> Self {
        Self {
            inner,
            reject: AtomicU32::new(0),
            lose_ack: AtomicU32::new(0),
        }
    }
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl TableSink for FlakySink {
    async fn commit(
        &self,
        rows: Vec<TableRow>,
        spec: &PartitionSpec,
        txn: Option<StreamTxn>,
    ) -> lakestream_stream::Result<SnapshotId> {
        if take(&self.reject) {
            return Err(Error::CommitFailed("injected rejection".into()));
        }
        let id = self.inner.commit(rows, spec, txn).await?;
        if take(&self.lose_ack) {
            return Err(Error::CommitFailed("injected lost acknowledgment".into()));
        }
        Ok(id)
    }

    async fn committed_txn(&self, job_id: &str) -> lakestream_stream::Result<Option<CommittedTxn>> {
        self.inner.committed_txn(job_id).await
    }

    async fn added_event_ids(&self, snapshot_id: SnapshotId) -> lakestream_stream::Result<Vec<String>> {
        self.inner.added_event_ids(snapshot_id).await
    }
}

#[tokio::test]
async fn test_three_events_land_in_three_partitions() {
    let p = Pipeline::new();
    for (id, event_type) in [("e1", "page_view"), ("e2", "add_to_cart"), ("e3", "purchase")] {
        let ack = p.ingest(event(id, event_type, "s1")).await;
        assert!(matches!(ack, IngestAck::Delivered { .. }));
    }

    let mut job = p.job();
    let outcomes = drain(&mut job).await;
    assert_eq!(outcomes.len(), 1);

    let head = p.table().head().await.unwrap().unwrap();
    let mut partitions: Vec<(String, String)> = head
        .files
        .iter()
        .map(|f| (f.partition["event_type"].clone(), f.partition["event_date"].clone()))
        .collect();
    partitions.sort();
    assert_eq!(
        partitions,
        vec![
            ("add_to_cart".to_string(), "2024-05-01".to_string()),
            ("page_view".to_string(), "2024-05-01".to_string()),
            ("purchase".to_string(), "2024-05-01".to_string()),
        ]
    );
    assert!(head.files.iter().all(|f| f.record_count == 1));

    let rows = p.rows().await;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["user_id"], "7");
    assert_eq!(rows[0]["event_date"], "2024-05-01");

    let s1_partition = partition_for_key(b"s1", PARTITIONS);
    let checkpoint = job.checkpoint().unwrap();
    assert_eq!(checkpoint.offset(s1_partition), 3);
    assert_eq!(checkpoint.offsets.values().sum::<u64>(), 3);
}

#[tokio::test]
async fn test_unparseable_timestamp_goes_to_invalid_channel() {
    let p = Pipeline::new();
    let mut bad = event("bad", "purchase", "s1");
    bad["timestamp"] = json!("last tuesday");
    p.ingest(bad).await;
    p.ingest(event("good", "purchase", "s1")).await;

    let mut job = p.job();
    drain(&mut job).await;

    let invalid = p.invalid.records();
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].reason, InvalidReason::MissingEventDate);
    assert_eq!(invalid[0].event_id.as_deref(), Some("bad"));
    assert_eq!(invalid[0].event_date, None);
    assert_eq!(serde_json::to_value(&invalid[0]).unwrap()["event_date"], Value::Null);

    assert_eq!(p.event_ids().await, vec!["good"]);
}

#[tokio::test]
async fn test_rejected_events_never_reach_the_log() {
    let p = Pipeline::new();
    for payload in [
        json!({"event_type": "page_view", "session_id": "s1"}),
        json!({"event_id": "e1", "session_id": "s1"}),
        json!({"event_id": "e1", "event_type": "page_view"}),
        json!({"event_id": "", "event_type": "page_view", "session_id": "s1"}),
    ] {
        let result = p.gateway.ingest(&serde_json::to_vec(&payload).unwrap()).await;
        assert!(result.is_err());
    }
    assert!(p.log.is_empty());
}

#[tokio::test]
async fn test_gateway_to_parse_round_trip() {
    let p = Pipeline::new();
    let original = json!({
        "event_id": "e1",
        "event_type": "add_to_cart",
        "session_id": "s9",
        "user_id": "u-1",
        "location": {"city": "Porto", "country": "PT"},
        "device": "iPhone",
        "timestamp": "2024-05-01T10:15:00.250+02:00",
        "product_id": "P1234",
        "quantity": 2,
        "cart": {"items": [1, 2, 3], "coupon": null},
    });
    let bytes = serde_json::to_vec(&original).unwrap();
    p.gateway.ingest(&bytes).await.unwrap();

    let partition = partition_for_key(b"s9", PARTITIONS);
    let records = p.log.fetch(partition, 0, 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, b"s9");

    let parsed = transform::parse(records[0].clone());
    let RowBody::Parsed { raw, issues, .. } = parsed.body else {
        panic!("expected a parsed row");
    };
    assert!(issues.is_empty(), "{issues:?}");

    let (expected, _) = validate_slice(&bytes).unwrap();
    assert_eq!(raw.into_event().unwrap(), expected);
}

#[tokio::test]
async fn test_same_session_keeps_publish_order() {
    let p = Pipeline::new();
    for i in 0..20 {
        p.ingest(event(&format!("a{i:02}"), "page_view", "session-a")).await;
        p.ingest(event(&format!("b{i:02}"), "page_view", "session-b")).await;
    }

    let partition = partition_for_key(b"session-a", PARTITIONS);
    let ids: Vec<String> = p
        .log
        .fetch(partition, 0, 100)
        .unwrap()
        .iter()
        .filter(|r| r.key == b"session-a")
        .map(|r| serde_json::from_slice::<Value>(&r.value).unwrap()["event_id"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("a{i:02}")).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_replay_after_lost_checkpoint_matches_uninterrupted_run() {
    let p = Pipeline::new();
    for i in 0..10 {
        p.ingest(event(&format!("e{i}"), "page_view", &format!("s{}", i % 4))).await;
    }

    let mut job = p.job();
    drain(&mut job).await;
    let uninterrupted = p.event_ids().await;
    let last = job.checkpoint().unwrap().clone();
    drop(job);

    // Crash between WRITE and COMMIT_CHECKPOINT: the table has the batch,
    // the checkpoint store does not
    let path = ObjectPath::from(format!("_checkpoints/{JOB_ID}/offsets/{:020}.json", last.batch_id));
    p.store.delete(&path).await.unwrap();

    let mut restarted = p.job();
    restarted.start().await.unwrap();
    let restored = restarted.checkpoint().unwrap();
    assert_eq!(restored.batch_id, last.batch_id);
    assert_eq!(restored.offsets, last.offsets);

    drain(&mut restarted).await;
    assert_eq!(p.event_ids().await, uninterrupted);
    assert_eq!(p.table().snapshot_ids().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lost_commit_ack_is_not_written_twice() {
    let p = Pipeline::new();
    for i in 0..6 {
        p.ingest(event(&format!("e{i}"), "purchase", "s1")).await;
    }

    let sink = FlakySink::new(p.table());
    sink.lose_ack.store(1, Ordering::SeqCst);
    let mut job = p.job_with(
        sink,
        JobConfig {
            max_commit_attempts: 1,
            ..job_config()
        },
    );

    let running = AtomicBool::new(true);
    assert!(job.run_cycle(&running).await.is_err());
    assert!(job.checkpoint().is_none());

    // More input arrives before the retry; it must still be read, once
    p.ingest(event("e6", "purchase", "s1")).await;

    let CycleOutcome::Committed(report) = job.run_cycle(&running).await.unwrap() else {
        panic!("expected the replayed batch");
    };
    assert!(report.replayed);
    assert_eq!(report.batch_id, 0);

    drain(&mut job).await;
    let expected: Vec<String> = (0..7).map(|i| format!("e{i}")).collect();
    assert_eq!(p.event_ids().await, expected);
}

#[tokio::test]
async fn test_commit_failures_do_not_advance_checkpoint() {
    let p = Pipeline::new();
    p.ingest(event("e1", "page_view", "s1")).await;
    p.ingest(event("e2", "page_view", "s2")).await;

    let sink = FlakySink::new(p.table());
    sink.reject.store(2, Ordering::SeqCst);
    let mut job = p.job_with(
        sink,
        JobConfig {
            max_commit_attempts: 2,
            ..job_config()
        },
    );

    let running = AtomicBool::new(true);
    let err = job.run_cycle(&running).await.unwrap_err();
    assert!(matches!(err, Error::CommitFailed(_)));
    assert!(!err.is_fatal());
    assert!(job.checkpoint().is_none());
    assert!(p.table().head().await.unwrap().is_none());

    let CycleOutcome::Committed(report) = job.run_cycle(&running).await.unwrap() else {
        panic!("expected a commit");
    };
    assert_eq!(report.batch_id, 0);
    assert_eq!(report.rows_written, 2);
    assert_eq!(p.event_ids().await, vec!["e1", "e2"]);
}

#[tokio::test]
async fn test_restart_after_crash_mid_commit() {
    let p = Pipeline::new();
    for i in 0..4 {
        p.ingest(event(&format!("e{i}"), "login", "s1")).await;
    }

    let sink = FlakySink::new(p.table());
    sink.lose_ack.store(1, Ordering::SeqCst);
    let mut crashed = p.job_with(
        sink,
        JobConfig {
            max_commit_attempts: 1,
            ..job_config()
        },
    );
    let running = AtomicBool::new(true);
    assert!(crashed.run_cycle(&running).await.is_err());
    drop(crashed);

    let mut restarted = p.job();
    restarted.start().await.unwrap();
    assert_eq!(restarted.checkpoint().unwrap().batch_id, 0);

    p.ingest(event("e4", "login", "s1")).await;
    drain(&mut restarted).await;

    let expected: Vec<String> = (0..5).map(|i| format!("e{i}")).collect();
    assert_eq!(p.event_ids().await, expected);
    assert_eq!(restarted.checkpoint().unwrap().batch_id, 1);
}

#[tokio::test]
async fn test_dedupe_drops_producer_duplicates() {
    let p = Pipeline::new();
    let tmp = TempDir::new().unwrap();
    let dedupe = Arc::new(DedupeIndex::open(tmp.path()).unwrap());

    // The broker stores the record but the ack is lost; the producer retries
    p.log.lose_next_acks(1);
    p.ingest(event("e1", "purchase", "s1")).await;
    p.ingest(event("e2", "purchase", "s1")).await;
    assert_eq!(p.log.len(), 3);

    let mut job = p.job().with_dedupe(dedupe.clone());
    let outcomes = drain(&mut job).await;
    let CycleOutcome::Committed(report) = &outcomes[0] else {
        panic!("expected a commit");
    };
    assert_eq!(report.rows_duplicate, 1);
    assert_eq!(p.event_ids().await, vec!["e1", "e2"]);
    assert!(dedupe.is_committed("e1").unwrap());

    // A later duplicate is dropped against the index
    p.ingest(event("e2", "purchase", "s1")).await;
    drain(&mut job).await;
    assert_eq!(p.event_ids().await, vec!["e1", "e2"]);
}

#[tokio::test]
async fn test_schema_evolution_across_batches() {
    let p = Pipeline::new();
    let mut job = p.job();

    p.ingest(event("e1", "purchase", "s1")).await;
    drain(&mut job).await;

    let mut with_extras = event("e2", "purchase", "s1");
    with_extras["price"] = json!(19.99);
    with_extras["coupon"] = json!({"code": "SPRING"});
    p.ingest(with_extras).await;
    drain(&mut job).await;

    let rows = p.rows().await;
    assert_eq!(rows[0]["price"], Value::Null);
    assert_eq!(rows[0]["coupon"], Value::Null);
    assert_eq!(rows[1]["price"], 19.99);
    assert_eq!(rows[1]["coupon"], r#"{"code":"SPRING"}"#);

    // Time travel: the first snapshot predates the new columns
    let first = p.table().scan_rows(Some(1)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(!first[0].contains_key("price"));

    let history = p.table().snapshots().await.unwrap();
    assert_eq!(history.len(), 2);
    let markers: BTreeMap<u64, u64> = history
        .iter()
        .map(|s| (s.snapshot_id, s.stream_txn(JOB_ID).unwrap().batch_id))
        .collect();
    assert_eq!(markers, BTreeMap::from([(1, 0), (2, 1)]));
}

#[tokio::test]
async fn test_corrupt_log_record_is_audited() {
    let p = Pipeline::new();
    p.log
        .append(0, b"s1", b"{not json", lakestream_log::AckLevel::Leader)
        .unwrap();
    p.ingest(event("e1", "page_view", "s1")).await;

    let mut job = p.job();
    drain(&mut job).await;

    let invalid = p.invalid.records();
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].reason, InvalidReason::CorruptRecord);
    assert_eq!(invalid[0].corrupt_record.as_deref(), Some("{not json"));
    assert_eq!(p.event_ids().await, vec!["e1"]);
}

#[tokio::test]
async fn test_gateway_and_job_share_file_log() {
    let tmp = TempDir::new().unwrap();
    let log_config = FileLogConfig {
        dir: tmp.path().to_path_buf(),
        topic: "ecommerce_events".to_string(),
        partitions: PARTITIONS,
        ..Default::default()
    };

    // Separate instances over one directory, as the two binaries run
    let gateway_log = Arc::new(FileLog::open(log_config.clone()).unwrap());
    let producer = Producer::new(gateway_log.clone(), ProducerConfig::default());
    let gateway = Gateway::new(Arc::new(producer));
    let job_log = Arc::new(FileLog::open_existing(log_config).unwrap());

    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let table = Table::open(store.clone(), TableConfig::default());
    let mut job = StreamJob::new(
        job_log,
        Table::open(store.clone(), TableConfig::default()),
        CheckpointStore::new(store, JOB_ID, CheckpointConfig::default()),
        Arc::new(MemoryInvalidSink::new()),
        job_config(),
    );
    job.start().await.unwrap();
    assert_eq!(drain(&mut job).await.len(), 0);

    for i in 0..4 {
        let payload =
            serde_json::to_vec(&event(&format!("e{i}"), "page_view", &format!("s{i}"))).unwrap();
        gateway.ingest(&payload).await.unwrap();
    }
    assert_eq!(drain(&mut job).await.len(), 1);
    assert_eq!(table.scan_rows(None).await.unwrap().len(), 4);

    let payload = serde_json::to_vec(&event("e4", "purchase", "s0")).unwrap();
    gateway.ingest(&payload).await.unwrap();
    drain(&mut job).await;

    let mut ids: Vec<String> = table
        .scan_rows(None)
        .await
        .unwrap()
        .iter()
        .map(|r| r["event_id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4"]);
    assert_eq!(job.checkpoint().unwrap().offsets.values().sum::<u64>(), 5);
    let written: u64 = (0..PARTITIONS)
        .map(|p| gateway_log.end_offset(p).unwrap())
        .sum();
    assert_eq!(written, 5);
}
