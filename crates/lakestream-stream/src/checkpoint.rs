//! Checkpoint store: the stream job's committed read positions.
//!
//! One immutable JSON file per committed micro-batch, stored next to the
//! table in the warehouse:
//!
//! ```text
//! _checkpoints/<job_id>/offsets/00000000000000000042.json
//! ```
//!
//! Files are created with create-only puts. Finding the file for a batch
//! already there means another process is writing as this job, which is
//! fatal, as is a checkpoint that cannot be decoded.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::table::SnapshotId;

/// The last durably committed read position of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub batch_id: u64,

    /// Next offset to read, per partition.
    pub offsets: BTreeMap<u32, u64>,

    /// Snapshot holding the batch, `None` when the batch had no valid rows.
    pub snapshot_id: Option<SnapshotId>,

    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Next offset to read on `partition`.
    pub fn offset(&self, partition: u32) -> u64 {
        self.offsets.get(&partition).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Checkpoint files kept after a save.
    pub retain: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { retain: 10 }
    }
}

/// Checkpoint files of one job.
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    job_id: String,
    dir: ObjectPath,
    config: CheckpointConfig,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>, job_id: &str, config: CheckpointConfig) -> Self {
        let dir = ObjectPath::from_iter(["_checkpoints", job_id, "offsets"]);
        Self {
            store,
            job_id: job_id.to_string(),
            dir,
            config,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    fn path(&self, batch_id: u64) -> ObjectPath {
        self.dir.child(format!("{batch_id:020}.json"))
    }

    /// Batch ids with a checkpoint file, ascending.
    pub async fn batch_ids(&self) -> Result<Vec<u64>> {
        let objects: Vec<_> = self.store.list(Some(&self.dir)).try_collect().await?;
        let mut ids: Vec<u64> = objects
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(|digits| digits.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn load(&self, batch_id: u64) -> Result<Checkpoint> {
        let path = self.path(batch_id);
        let bytes = self.store.get(&path).await?.bytes().await?;

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Checkpoint(format!("{path} is unreadable: {e}")))?;
        if checkpoint.job_id != self.job_id || checkpoint.batch_id != batch_id {
            return Err(Error::Checkpoint(format!(
                "{path} holds job {:?} batch {}",
                checkpoint.job_id, checkpoint.batch_id
            )));
        }
        Ok(checkpoint)
    }

    /// The latest checkpoint, `None` before the first commit.
    pub async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        match self.batch_ids().await?.last() {
            Some(&batch_id) => Ok(Some(self.load(batch_id).await?)),
            None => Ok(None),
        }
    }

    /// Every retained checkpoint, oldest first.
    pub async fn history(&self) -> Result<Vec<Checkpoint>> {
        let mut history = Vec::new();
        for batch_id in self.batch_ids().await? {
            history.push(self.load(batch_id).await?);
        }
        Ok(history)
    }

    /// Persist `checkpoint`, then prune old files.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.job_id != self.job_id {
            return Err(Error::Checkpoint(format!(
                "refusing to save a checkpoint of job {:?} as {:?}",
                checkpoint.job_id, self.job_id
            )));
        }

        let path = self.path(checkpoint.batch_id);
        let payload = PutPayload::from(serde_json::to_vec_pretty(checkpoint)?);

        match self
            .store
            .put_opts(&path, payload, PutOptions::from(PutMode::Create))
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                return Err(Error::Checkpoint(format!(
                    "{path} already exists; another writer is running as job {:?}",
                    self.job_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        debug!(
            "Checkpoint saved: job={} batch={} offsets={:?}",
            self.job_id, checkpoint.batch_id, checkpoint.offsets
        );
        lakestream_core::metrics::set_gauge("checkpoint_batch_id", checkpoint.batch_id as f64);

        if let Err(e) = self.prune().await {
            warn!("Failed to prune old checkpoints: {}", e);
        }
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        let ids = self.batch_ids().await?;
        let excess = ids.len().saturating_sub(self.config.retain.max(1));
        for &batch_id in &ids[..excess] {
            self.store.delete(&self.path(batch_id)).await?;
        }
        if excess > 0 {
            info!("Pruned {} old checkpoints of job {}", excess, self.job_id);
        }
        Ok(())
    }
}
