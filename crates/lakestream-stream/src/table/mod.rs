//! Versioned, partitioned event table on object storage.
//!
//! Every commit writes its Parquet data files first, then publishes a new
//! snapshot document with a create-only put. The create-only put is the
//! optimistic-concurrency point: when two writers race for the same version
//! one of them gets `AlreadyExists`, reloads the head and tries again. Data
//! files not referenced by any snapshot are never read.

pub mod columnar;
pub mod schema;
pub mod snapshot;

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::AsArray;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use lakestream_core::Event;
use lakestream_core::metrics::increment;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
pub use schema::{Column, ColumnType, SchemaChanges, TableSchema};
pub use snapshot::{
    DataFile, PartitionSpec, Snapshot, SnapshotId, SnapshotSummary, StreamTxn, TablePaths,
};

/// A validated event with its derived partition fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub event: Event,
    pub event_time: DateTime<Utc>,
    pub event_date: NaiveDate,
}

/// Table location and commit policy.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub namespace: String,
    pub name: String,

    /// Attempts at publishing a snapshot before giving up on a conflict.
    pub max_commit_retries: u32,

    /// Pause between conflicting attempts (doubles each time).
    pub commit_backoff: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            namespace: "analytics".to_string(),
            name: "events".to_string(),
            max_commit_retries: 5,
            commit_backoff: Duration::from_millis(50),
        }
    }
}

/// A stream transaction marker together with the snapshot that committed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTxn {
    pub snapshot_id: SnapshotId,
    pub txn: StreamTxn,
}

/// Append interface the stream job writes through.
pub trait TableSink: Send + Sync {
    /// Atomically append `rows` as one new snapshot.
    ///
    /// When `txn` is given and the table already holds that batch (or a later
    /// one) for the same job, nothing is written and the existing snapshot id
    /// is returned.
    fn commit(
        &self,
        rows: Vec<TableRow>,
        spec: &PartitionSpec,
        txn: Option<StreamTxn>,
    ) -> impl Future<Output = Result<SnapshotId>> + Send;

    /// Latest marker committed by `job_id`, if any.
    fn committed_txn(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<CommittedTxn>>> + Send;

    /// Event ids of the rows a snapshot added.
    fn added_event_ids(
        &self,
        snapshot_id: SnapshotId,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Rows of one partition, keyed by partition values.
type PartitionGroups<'a> = BTreeMap<BTreeMap<String, String>, Vec<&'a TableRow>>;

/// A table rooted at `<namespace>/<name>` in a warehouse store.
pub struct Table {
    store: Arc<dyn ObjectStore>,
    paths: TablePaths,
    config: TableConfig,
}

impl Table {
    pub fn open(store: Arc<dyn ObjectStore>, config: TableConfig) -> Self {
        let paths = TablePaths::new(&config.namespace, &config.name);
        info!("Table {}.{} at {}", config.namespace, config.name, paths.root());
        Self {
            store,
            paths,
            config,
        }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn paths(&self) -> &TablePaths {
        &self.paths
    }

    /// Ids of every published snapshot, ascending.
    pub async fn snapshot_ids(&self) -> Result<Vec<SnapshotId>> {
        let dir = self.paths.metadata_dir();
        let objects: Vec<_> = self.store.list(Some(&dir)).try_collect().await?;

        let mut ids: Vec<SnapshotId> = objects
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(snapshot::parse_snapshot_file_name)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Load one snapshot document.
    pub async fn snapshot(&self, id: SnapshotId) -> Result<Snapshot> {
        let path = self.paths.snapshot(id);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::Table(format!("snapshot {id} does not exist")));
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Table(format!("snapshot {id} is malformed: {e}")))?;
        if snapshot.snapshot_id != id {
            return Err(Error::Table(format!(
                "{path} claims snapshot id {}",
                snapshot.snapshot_id
            )));
        }
        Ok(snapshot)
    }

    /// The latest snapshot, `None` for an empty table.
    pub async fn head(&self) -> Result<Option<Snapshot>> {
        match self.snapshot_ids().await?.last() {
            Some(&id) => Ok(Some(self.snapshot(id).await?)),
            None => Ok(None),
        }
    }

    /// Full history, oldest first.
    pub async fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for id in self.snapshot_ids().await? {
            snapshots.push(self.snapshot(id).await?);
        }
        Ok(snapshots)
    }

    /// Read the table as of `snapshot_id` (latest when `None`).
    ///
    /// Every data file is projected onto that snapshot's schema; columns a
    /// file predates come back null.
    pub async fn scan(&self, snapshot_id: Option<SnapshotId>) -> Result<Vec<RecordBatch>> {
        let snapshot = match snapshot_id {
            Some(id) => self.snapshot(id).await?,
            None => match self.head().await? {
                Some(head) => head,
                None => return Ok(Vec::new()),
            },
        };

        let target = snapshot.schema.to_arrow();
        let mut batches = Vec::new();
        for file in &snapshot.files {
            let bytes = self
                .store
                .get(&self.paths.data_file(&file.path))
                .await?
                .bytes()
                .await?;
            for batch in columnar::read_parquet(bytes)? {
                batches.push(columnar::project(&batch, &target)?);
            }
        }
        Ok(batches)
    }

    /// [`Table::scan`] rendered as JSON objects.
    pub async fn scan_rows(&self, snapshot_id: Option<SnapshotId>) -> Result<Vec<Map<String, Value>>> {
        let batches = self.scan(snapshot_id).await?;
        Ok(batches.iter().flat_map(columnar::batch_to_json).collect())
    }

    async fn write_data_files(
        &self,
        schema: &TableSchema,
        groups: &PartitionGroups<'_>,
        spec: &PartitionSpec,
        file_tag: &str,
    ) -> Result<Vec<DataFile>> {
        let mut files = Vec::with_capacity(groups.len());

        for (partition, rows) in groups {
            let batch = columnar::rows_to_batch(schema, rows)?;
            let bytes = columnar::write_parquet(&batch)?;
            let relative = format!(
                "{}/{}-{}.parquet",
                snapshot::partition_dir(spec, partition),
                file_tag,
                Uuid::new_v4()
            );
            let size_bytes = bytes.len() as u64;

            self.store
                .put(&self.paths.data_file(&relative), PutPayload::from(bytes))
                .await?;
            debug!("Wrote {} rows to {}", rows.len(), relative);

            increment("table_data_files_written_total", 1);
            increment("table_bytes_written_total", size_bytes);
            files.push(DataFile {
                path: relative,
                partition: partition.clone(),
                record_count: rows.len() as u64,
                size_bytes,
                added_in: 0,
            });
        }
        Ok(files)
    }

    async fn commit_rows(
        &self,
        rows: Vec<TableRow>,
        spec: &PartitionSpec,
        txn: Option<StreamTxn>,
    ) -> Result<SnapshotId> {
        let groups = group_by_partition(&rows, spec)?;
        let file_tag = txn
            .as_ref()
            .map(|t| format!("b{:010}", t.batch_id))
            .unwrap_or_else(|| "append".to_string());
        let max_attempts = self.config.max_commit_retries.max(1);

        // Data files are rewritten only if a conflicting commit changed the schema
        let mut written: Option<(TableSchema, Vec<DataFile>)> = None;
        let mut head = self.head().await?;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let (Some(txn), Some(head)) = (&txn, &head)
                && let Some(existing) = head.stream_txn(&txn.job_id)
                && existing.batch_id >= txn.batch_id
            {
                info!(
                    "Batch {} of job {} already committed (table holds batch {}), skipping write",
                    txn.batch_id, txn.job_id, existing.batch_id
                );
                return Ok(head.snapshot_id);
            }

            if let Some(head) = &head
                && head.partition_spec != *spec
            {
                return Err(Error::Table(format!(
                    "table is partitioned by {:?}, commit asked for {:?}",
                    head.partition_spec.fields, spec.fields
                )));
            }

            let mut schema = head.as_ref().map(|h| h.schema.clone()).unwrap_or_default();
            let changes = schema.evolve(&rows);

            let new_files = match &written {
                Some((written_schema, files)) if *written_schema == schema => files.clone(),
                _ => {
                    let files = self.write_data_files(&schema, &groups, spec, &file_tag).await?;
                    written = Some((schema.clone(), files.clone()));
                    files
                }
            };

            let snapshot = next_snapshot(head.as_ref(), schema, spec, new_files, txn.clone());
            let snapshot_id = snapshot.snapshot_id;
            let document = Bytes::from(serde_json::to_vec_pretty(&snapshot)?);

            match self
                .store
                .put_opts(
                    &self.paths.snapshot(snapshot_id),
                    PutPayload::from(document),
                    PutOptions::from(PutMode::Create),
                )
                .await
            {
                Ok(_) => {
                    if !changes.added.is_empty() {
                        info!("Schema evolved, added columns: {}", changes.added.join(", "));
                    }
                    if !changes.widened.is_empty() {
                        info!("Schema evolved, widened columns: {}", changes.widened.join(", "));
                    }
                    if !changes.is_empty() {
                        let touched = changes.added.len() + changes.widened.len();
                        increment("table_schema_evolutions_total", touched as u64);
                    }
                    increment("table_commits_total", 1);
                    info!(
                        "Committed snapshot {} (+{} rows in {} files, {} rows total)",
                        snapshot_id,
                        snapshot.summary.added_rows,
                        snapshot.summary.added_files,
                        snapshot.summary.total_rows
                    );
                    return Ok(snapshot_id);
                }
                Err(object_store::Error::AlreadyExists { .. }) => {
                    increment("table_commit_conflicts_total", 1);
                    if attempt >= max_attempts {
                        return Err(Error::CommitConflict { attempts: attempt });
                    }
                    let backoff = self.config.commit_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "Snapshot {} already exists, retrying commit in {:?} (attempt {}/{})",
                        snapshot_id, backoff, attempt, max_attempts
                    );
                    tokio::time::sleep(backoff).await;
                    head = self.head().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl TableSink for Table {
    async fn commit(
        &self,
        rows: Vec<TableRow>,
        spec: &PartitionSpec,
        txn: Option<StreamTxn>,
    ) -> Result<SnapshotId> {
        self.commit_rows(rows, spec, txn).await
    }

    async fn committed_txn(&self, job_id: &str) -> Result<Option<CommittedTxn>> {
        let mut ids = self.snapshot_ids().await?;
        let Some(head_id) = ids.pop() else {
            return Ok(None);
        };
        let head = self.snapshot(head_id).await?;
        let Some(txn) = head.stream_txn(job_id).cloned() else {
            return Ok(None);
        };

        // Markers are carried forward; find the snapshot that introduced this one
        let mut snapshot_id = head_id;
        while let Some(&parent_id) = ids.last() {
            let parent = self.snapshot(parent_id).await?;
            if parent.stream_txn(job_id) != Some(&txn) {
                break;
            }
            snapshot_id = parent_id;
            ids.pop();
        }

        Ok(Some(CommittedTxn { snapshot_id, txn }))
    }

    async fn added_event_ids(&self, snapshot_id: SnapshotId) -> Result<Vec<String>> {
        let snapshot = self.snapshot(snapshot_id).await?;
        let mut ids = Vec::new();

        for file in snapshot.added_files() {
            let bytes = self
                .store
                .get(&self.paths.data_file(&file.path))
                .await?
                .bytes()
                .await?;
            for batch in columnar::read_parquet(bytes)? {
                let column = batch
                    .column_by_name("event_id")
                    .ok_or_else(|| Error::Table(format!("{} has no event_id column", file.path)))?;
                ids.extend(column.as_string::<i32>().iter().flatten().map(str::to_string));
            }
        }
        Ok(ids)
    }
}

fn partition_value(row: &TableRow, field: &str) -> Result<String> {
    match field {
        "event_type" => Ok(row.event.event_type.clone()),
        "event_date" => Ok(row.event_date.to_string()),
        "session_id" => Ok(row.event.session_id.clone()),
        other => Err(Error::Table(format!("unsupported partition field {other:?}"))),
    }
}

fn group_by_partition<'a>(rows: &'a [TableRow], spec: &PartitionSpec) -> Result<PartitionGroups<'a>> {
    let mut groups = PartitionGroups::new();
    for row in rows {
        let mut key = BTreeMap::new();
        for field in &spec.fields {
            key.insert(field.clone(), partition_value(row, field)?);
        }
        groups.entry(key).or_default().push(row);
    }
    Ok(groups)
}

fn next_snapshot(
    head: Option<&Snapshot>,
    schema: TableSchema,
    spec: &PartitionSpec,
    new_files: Vec<DataFile>,
    txn: Option<StreamTxn>,
) -> Snapshot {
    let snapshot_id = head.map_or(1, |h| h.snapshot_id + 1);
    let added_files = new_files.len() as u64;
    let added_rows: u64 = new_files.iter().map(|f| f.record_count).sum();

    let mut files = head.map(|h| h.files.clone()).unwrap_or_default();
    files.extend(new_files.into_iter().map(|f| DataFile {
        added_in: snapshot_id,
        ..f
    }));

    let mut stream_txns = head.map(|h| h.stream_txns.clone()).unwrap_or_default();
    if let Some(txn) = txn {
        stream_txns.insert(txn.job_id.clone(), txn);
    }

    let summary = SnapshotSummary {
        operation: "append".to_string(),
        added_files,
        added_rows,
        total_files: files.len() as u64,
        total_rows: files.iter().map(|f| f.record_count).sum(),
    };

    Snapshot {
        snapshot_id,
        parent_id: head.map(|h| h.snapshot_id),
        committed_at: Utc::now(),
        schema,
        partition_spec: spec.clone(),
        files,
        stream_txns,
        summary,
    }
}

/// Distinct partition values present in a snapshot.
pub fn partitions(snapshot: &Snapshot) -> Vec<BTreeMap<String, String>> {
    let mut seen = HashSet::new();
    snapshot
        .files
        .iter()
        .filter(|f| seen.insert(f.partition.clone()))
        .map(|f| f.partition.clone())
        .collect()
}
