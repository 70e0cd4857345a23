//! Snapshot documents and table paths.
//!
//! # Layout
//!
//! ```text
//! <namespace>/<table>/metadata/v00000000000000000001.json
//! <namespace>/<table>/data/event_type=<v>/event_date=<YYYY-MM-DD>/<batch>-<uuid>.parquet
//! ```
//!
//! A snapshot document is self-contained: it carries the full schema, the
//! full list of live data files, and the latest stream transaction marker of
//! every writer job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};

use super::schema::TableSchema;

/// Snapshot identifier; equals the metadata version, starting at 1.
pub type SnapshotId = u64;

/// Columns a table is partitioned by, in path order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub fields: Vec<String>,
}

impl Default for PartitionSpec {
    fn default() -> Self {
        Self::event_type_and_date()
    }
}

impl PartitionSpec {
    /// Partition by `event_type`, then `event_date`.
    pub fn event_type_and_date() -> Self {
        Self {
            fields: vec!["event_type".to_string(), "event_date".to_string()],
        }
    }
}

/// Exactly-once marker written by a stream job with each of its commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTxn {
    pub job_id: String,
    pub batch_id: u64,

    /// Next offset to read per partition after this batch.
    pub end_offsets: BTreeMap<u32, u64>,
}

/// A Parquet data file referenced by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// Path relative to the table root.
    pub path: String,

    /// Partition values, keyed by partition field.
    pub partition: BTreeMap<String, String>,

    pub record_count: u64,
    pub size_bytes: u64,

    /// Snapshot that added the file.
    pub added_in: SnapshotId,
}

/// What a commit changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub operation: String,
    pub added_files: u64,
    pub added_rows: u64,
    pub total_files: u64,
    pub total_rows: u64,
}

/// An immutable table version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub parent_id: Option<SnapshotId>,
    pub committed_at: DateTime<Utc>,
    pub schema: TableSchema,
    pub partition_spec: PartitionSpec,
    pub files: Vec<DataFile>,

    /// Latest marker per writer job.
    #[serde(default)]
    pub stream_txns: BTreeMap<String, StreamTxn>,

    pub summary: SnapshotSummary,
}

impl Snapshot {
    /// Total rows across live data files.
    pub fn total_rows(&self) -> u64 {
        self.files.iter().map(|f| f.record_count).sum()
    }

    /// Latest marker committed by `job_id`.
    pub fn stream_txn(&self, job_id: &str) -> Option<&StreamTxn> {
        self.stream_txns.get(job_id)
    }

    /// Files this snapshot added.
    pub fn added_files(&self) -> impl Iterator<Item = &DataFile> {
        self.files
            .iter()
            .filter(move |f| f.added_in == self.snapshot_id)
    }
}

/// Object paths of one table.
#[derive(Debug, Clone)]
pub struct TablePaths {
    root: ObjectPath,
}

impl TablePaths {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            root: ObjectPath::from_iter([namespace, name]),
        }
    }

    pub fn root(&self) -> &ObjectPath {
        &self.root
    }

    pub fn metadata_dir(&self) -> ObjectPath {
        self.root.child("metadata")
    }

    pub fn snapshot(&self, id: SnapshotId) -> ObjectPath {
        self.metadata_dir().child(snapshot_file_name(id))
    }

    /// Resolve a data file path relative to the table root.
    pub fn data_file(&self, relative: &str) -> ObjectPath {
        relative
            .split('/')
            .fold(self.root.clone(), |path, part| path.child(part))
    }
}

/// `v` followed by a 20-digit zero-padded version, so names sort by version.
pub fn snapshot_file_name(id: SnapshotId) -> String {
    format!("v{id:020}.json")
}

/// Parse a snapshot id from a metadata file name.
pub fn parse_snapshot_file_name(name: &str) -> Option<SnapshotId> {
    let digits = name.strip_prefix('v')?.strip_suffix(".json")?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Relative directory of a partition, e.g. `data/event_type=purchase/event_date=2024-05-01`.
pub fn partition_dir(spec: &PartitionSpec, values: &BTreeMap<String, String>) -> String {
    let mut dir = String::from("data");
    for field in &spec.fields {
        let value = values.get(field).map(String::as_str).unwrap_or("");
        dir.push('/');
        dir.push_str(field);
        dir.push('=');
        dir.push_str(&escape_partition_value(value));
    }
    dir
}

/// Percent-encode everything outside `[A-Za-z0-9._-]`.
fn escape_partition_value(value: &str) -> String {
    if value.is_empty() {
        return "__null__".to_string();
    }
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
