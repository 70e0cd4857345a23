//! Consumer-side deduplication by `event_id`, backed by RocksDB.
//!
//! The producer is at-least-once, so the log may hold the same event twice.
//! The index remembers which event ids have been committed to the table.
//!
//! # Key Design
//!
//! - Keys: `event_id` as UTF-8 bytes
//! - Values: the micro-batch id that committed the event (u64 little-endian)
//! - Bloom filters for fast "not seen" lookups
//!
//! Ids are written only after the table commit that contains them, so a
//! crash before the commit never hides a row from the replay.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteBatch, WriteOptions};
use tracing::{debug, info};

use crate::error::Result;
use crate::table::TableRow;

/// RocksDB-backed index of committed event ids.
///
/// Thread-safe: can be shared across threads via `Arc<DedupeIndex>`.
pub struct DedupeIndex {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl DedupeIndex {
    /// Open or create an index at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening dedupe index at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);

        // 10 bits per key, ~1% false positives
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Batch that committed `event_id`, if it was committed.
    pub fn committed_batch(&self, event_id: &str) -> Result<Option<u64>> {
        Ok(self.db.get(event_id.as_bytes())?.map(|value| {
            let mut bytes = [0u8; 8];
            let n = value.len().min(8);
            bytes[..n].copy_from_slice(&value[..n]);
            u64::from_le_bytes(bytes)
        }))
    }

    pub fn is_committed(&self, event_id: &str) -> Result<bool> {
        Ok(self.committed_batch(event_id)?.is_some())
    }

    /// Drop rows whose event id is already committed or repeats within
    /// `rows`. The first occurrence in the batch wins.
    ///
    /// Returns the kept rows and the number dropped.
    pub fn filter(&self, rows: Vec<TableRow>) -> Result<(Vec<TableRow>, usize)> {
        let mut seen = HashSet::with_capacity(rows.len());
        let mut kept = Vec::with_capacity(rows.len());
        let mut dropped = 0;

        for row in rows {
            if !seen.insert(row.event.event_id.clone()) || self.is_committed(&row.event.event_id)? {
                debug!("Skipping duplicate event {}", row.event.event_id);
                dropped += 1;
                continue;
            }
            kept.push(row);
        }
        Ok((kept, dropped))
    }

    /// Record `event_ids` as committed by `batch_id` in one synced write.
    pub fn mark_committed<'a, I>(&self, event_ids: I, batch_id: u64) -> Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        let value = batch_id.to_le_bytes();

        for event_id in event_ids {
            batch.put(event_id.as_bytes(), value);
            count += 1;
        }

        if count > 0 {
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(true);
            self.db.write_opt(batch, &write_opts)?;
            debug!("Marked {} event ids as committed by batch {}", count, batch_id);
        }
        Ok(count)
    }

    pub fn approximate_count(&self) -> Result<u64> {
        Ok(self
            .db
            .property_int_value("rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> DedupeStats {
        DedupeStats {
            approximate_keys: self.approximate_count().unwrap_or(0),
        }
    }
}

/// Statistics about the dedupe index.
#[derive(Debug, Clone)]
pub struct DedupeStats {
    pub approximate_keys: u64,
}
