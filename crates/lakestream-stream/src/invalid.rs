//! Invalid-records side channel.
//!
//! Rows that fail PARSE, DERIVE or VALIDATE are never written to the table.
//! They go to an [`InvalidSink`] instead, so the volume that was read stays
//! auditable. The channel is permanent: nothing is retried or reconciled,
//! and a replayed batch may deliver the same record twice.
//!
//! # Segment format
//!
//! [`SegmentInvalidSink`] writes one JSON document per line:
//! ```text
//! invalid-000000000.jsonl.gz   (sealed)
//! invalid-000000001.jsonl      (current)
//! manifest.jsonl               (one line per sealed segment)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use flate2::Compression;
use flate2::write::GzEncoder;
use lakestream_core::metrics::increment_with_reason;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Why a row was kept out of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    CorruptRecord,
    MissingRequiredFields,
    MissingEventDate,
}

impl InvalidReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CorruptRecord => "corrupt_record",
            Self::MissingRequiredFields => "missing_required_fields",
            Self::MissingEventDate => "missing_event_date",
        }
    }
}

/// A row routed to the invalid-records channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidRecord {
    pub partition: u32,
    pub offset: u64,
    pub reason: InvalidReason,
    pub detail: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Always present in the output, `null` when it could not be derived.
    pub event_date: Option<NaiveDate>,

    /// The record as JSON, when it parsed as JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// The raw value (lossily decoded) of a record that did not parse.
    #[serde(rename = "_corrupt_record", skip_serializing_if = "Option::is_none")]
    pub corrupt_record: Option<String>,
}

/// Destination for invalid rows.
pub trait InvalidSink: Send + Sync {
    fn write(&self, records: &[InvalidRecord]) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn count(records: &[InvalidRecord]) {
    for record in records {
        increment_with_reason("stream_rows_invalid_total", record.reason.as_str(), 1);
    }
}

/// Logs every invalid row at `warn`.
#[derive(Debug, Default)]
pub struct LogInvalidSink;

impl InvalidSink for LogInvalidSink {
    fn write(&self, records: &[InvalidRecord]) -> Result<()> {
        for record in records {
            warn!(
                partition = record.partition,
                offset = record.offset,
                reason = record.reason.as_str(),
                event_id = record.event_id.as_deref().unwrap_or(""),
                "Invalid record: {}",
                record.detail
            );
        }
        count(records);
        Ok(())
    }
}

/// Keeps invalid rows in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryInvalidSink {
    records: Mutex<Vec<InvalidRecord>>,
}

impl MemoryInvalidSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<InvalidRecord> {
        self.records.lock().clone()
    }
}

impl InvalidSink for MemoryInvalidSink {
    fn write(&self, records: &[InvalidRecord]) -> Result<()> {
        self.records.lock().extend_from_slice(records);
        count(records);
        Ok(())
    }
}

/// Configuration for [`SegmentInvalidSink`].
#[derive(Debug, Clone)]
pub struct InvalidSinkConfig {
    pub dir: PathBuf,

    /// Seal the current segment once it reaches this size.
    /// Default: 64 MB
    pub max_segment_bytes: usize,

    /// Gzip sealed segments.
    /// Default: true
    pub compress: bool,
}

impl Default for InvalidSinkConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/invalid"),
            max_segment_bytes: 64 * 1024 * 1024,
            compress: true,
        }
    }
}

const SEGMENT_PREFIX: &str = "invalid";

/// A finished segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSegment {
    pub path: PathBuf,
    pub segment_number: u64,
    pub record_count: usize,
    pub size_bytes: usize,
    pub compressed_size_bytes: usize,
    pub sealed_at: DateTime<Utc>,
}

struct CurrentSegment {
    writer: BufWriter<File>,
    path: PathBuf,
    record_count: usize,
    size_bytes: usize,
}

/// Writes invalid rows as JSON lines into size-rotated segment files.
pub struct SegmentInvalidSink {
    config: InvalidSinkConfig,
    current: Mutex<Option<CurrentSegment>>,
    segment_number: AtomicU64,
    total_records: AtomicUsize,
    sealed_sender: Option<Sender<SealedSegment>>,
}

impl SegmentInvalidSink {
    /// Open the sink, resuming numbering after the segments already on disk.
    pub fn new(config: InvalidSinkConfig, sealed_sender: Option<Sender<SealedSegment>>) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let next_segment = next_segment_number(&config.dir)?;

        info!(
            "Invalid-records sink: dir={}, max_segment={} bytes, starting at segment {}",
            config.dir.display(),
            config.max_segment_bytes,
            next_segment
        );

        Ok(Self {
            config,
            current: Mutex::new(None),
            segment_number: AtomicU64::new(next_segment),
            total_records: AtomicUsize::new(0),
            sealed_sender,
        })
    }

    fn segment_path(&self, segment_number: u64) -> PathBuf {
        self.config
            .dir
            .join(format!("{SEGMENT_PREFIX}-{segment_number:09}.jsonl"))
    }

    pub fn total_records(&self) -> usize {
        self.total_records.load(Ordering::Relaxed)
    }

    /// Finish the current segment; a no-op when nothing was written to it.
    pub fn seal(&self) -> Result<Option<SealedSegment>> {
        let Some(segment) = self.current.lock().take() else {
            return Ok(None);
        };
        let CurrentSegment {
            mut writer,
            path,
            record_count,
            size_bytes,
        } = segment;
        writer.flush()?;
        drop(writer);

        let segment_number = self.segment_number.fetch_add(1, Ordering::SeqCst);

        let (path, compressed_size_bytes) = if self.config.compress {
            let gz_path = path.with_extension("jsonl.gz");
            let compressed = compress_file(&path, &gz_path)?;
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove uncompressed segment: {}", e);
            }
            (gz_path, compressed)
        } else {
            (path, size_bytes)
        };

        info!(
            "Sealed invalid-records segment {}: {} records, {} bytes at {}",
            segment_number,
            record_count,
            compressed_size_bytes,
            path.display()
        );

        let sealed = SealedSegment {
            path,
            segment_number,
            record_count,
            size_bytes,
            compressed_size_bytes,
            sealed_at: Utc::now(),
        };

        if let Some(sender) = &self.sealed_sender
            && let Err(e) = sender.send(sealed.clone())
        {
            warn!("Failed to send sealed segment notification: {}", e);
        }

        Ok(Some(sealed))
    }
}

impl InvalidSink for SegmentInvalidSink {
    fn write(&self, records: &[InvalidRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::new();
        for record in records {
            serde_json::to_writer(&mut lines, record)?;
            lines.push(b'\n');
        }

        let should_seal = {
            let mut current = self.current.lock();
            if current.is_none() {
                let path = self.segment_path(self.segment_number.load(Ordering::SeqCst));
                debug!("Creating invalid-records segment {}", path.display());
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                *current = Some(CurrentSegment {
                    writer: BufWriter::new(file),
                    path,
                    record_count: 0,
                    size_bytes: 0,
                });
            }
            let segment = current
                .as_mut()
                .ok_or_else(|| Error::InvalidSink("no current segment".to_string()))?;

            segment.writer.write_all(&lines)?;
            segment.record_count += records.len();
            segment.size_bytes += lines.len();
            segment.size_bytes >= self.config.max_segment_bytes
        };

        self.total_records.fetch_add(records.len(), Ordering::Relaxed);
        count(records);

        if should_seal {
            self.seal()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if let Some(segment) = self.current.lock().as_mut() {
            segment.writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for SegmentInvalidSink {
    fn drop(&mut self) {
        if let Err(e) = self.seal() {
            warn!("Error sealing invalid-records segment on drop: {}", e);
        }
    }
}

fn next_segment_number(dir: &Path) -> Result<u64> {
    let mut next = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        let number = name
            .strip_prefix(&format!("{SEGMENT_PREFIX}-"))
            .and_then(|rest| {
                rest.strip_suffix(".jsonl.gz")
                    .or_else(|| rest.strip_suffix(".jsonl"))
            })
            .and_then(|digits| digits.parse::<u64>().ok());
        if let Some(number) = number {
            next = next.max(number + 1);
        }
    }
    Ok(next)
}

fn compress_file(src: &Path, dst: &Path) -> Result<usize> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::default());

    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buffer[..n])?;
    }
    encoder.finish()?.flush()?;

    Ok(fs::metadata(dst)?.len() as usize)
}

/// Appends a line to `manifest.jsonl` for every sealed segment it receives.
pub struct ManifestWriter {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ManifestWriter {
    pub fn spawn(dir: PathBuf, receiver: Receiver<SealedSegment>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = std::thread::spawn(move || {
            let manifest = dir.join("manifest.jsonl");
            while flag.load(Ordering::SeqCst) {
                match receiver.recv_timeout(Duration::from_secs(1)) {
                    Ok(sealed) => {
                        if let Err(e) = append_manifest(&manifest, &sealed) {
                            error!("Failed to record segment {} in manifest: {}", sealed.segment_number, e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Drain anything sealed during shutdown
            for sealed in receiver.try_iter() {
                if let Err(e) = append_manifest(&manifest, &sealed) {
                    error!("Failed to record segment {} in manifest: {}", sealed.segment_number, e);
                }
            }
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Wait for the sender side to close, then for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Manifest writer thread panicked");
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn append_manifest(manifest: &Path, sealed: &SealedSegment) -> Result<()> {
    let mut line = serde_json::to_vec(sealed)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(manifest)?;
    file.write_all(&line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn record(offset: u64) -> InvalidRecord {
        InvalidRecord {
            partition: 0,
            offset,
            reason: InvalidReason::MissingEventDate,
            detail: "timestamp is missing".to_string(),
            event_id: Some(format!("e{offset}")),
            event_date: None,
            payload: Some(serde_json::json!({"event_id": format!("e{offset}")})),
            corrupt_record: None,
        }
    }

    fn config(tmp: &TempDir) -> InvalidSinkConfig {
        InvalidSinkConfig {
            dir: tmp.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_serialization() {
        let value = serde_json::to_value(record(3)).unwrap();
        assert_eq!(value["reason"], "missing_event_date");
        assert_eq!(value["event_date"], Value::Null);
        assert!(value.get("_corrupt_record").is_none());

        let corrupt = InvalidRecord {
            reason: InvalidReason::CorruptRecord,
            event_id: None,
            payload: None,
            corrupt_record: Some("{oops".to_string()),
            ..record(4)
        };
        let value = serde_json::to_value(corrupt).unwrap();
        assert_eq!(value["_corrupt_record"], "{oops");
        assert!(value.get("event_id").is_none());
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemoryInvalidSink::new();
        sink.write(&[record(1), record(2)]).unwrap();
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn test_segment_written_as_json_lines() {
        let tmp = TempDir::new().unwrap();
        let sink = SegmentInvalidSink::new(
            InvalidSinkConfig {
                compress: false,
                ..config(&tmp)
            },
            None,
        )
        .unwrap();

        sink.write(&[record(1), record(2)]).unwrap();
        sink.flush().unwrap();

        let text = fs::read_to_string(tmp.path().join("invalid-000000000.jsonl")).unwrap();
        let lines: Vec<InvalidRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![record(1), record(2)]);
        assert_eq!(sink.total_records(), 2);
    }

    #[test]
    fn test_seal_compresses_and_rotates() {
        let tmp = TempDir::new().unwrap();
        let sink = SegmentInvalidSink::new(
            InvalidSinkConfig {
                max_segment_bytes: 10,
                ..config(&tmp)
            },
            None,
        )
        .unwrap();

        sink.write(&[record(1)]).unwrap();
        sink.write(&[record(2)]).unwrap();

        let gz = tmp.path().join("invalid-000000000.jsonl.gz");
        assert!(gz.exists());
        assert!(!tmp.path().join("invalid-000000000.jsonl").exists());
        assert!(tmp.path().join("invalid-000000001.jsonl.gz").exists());

        let mut text = String::new();
        GzDecoder::new(File::open(gz).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("\"e1\""));
    }

    #[test]
    fn test_numbering_resumes_after_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let sink = SegmentInvalidSink::new(config(&tmp), None).unwrap();
            sink.write(&[record(1)]).unwrap();
        }

        let sink = SegmentInvalidSink::new(config(&tmp), None).unwrap();
        sink.write(&[record(2)]).unwrap();
        sink.seal().unwrap();

        assert!(tmp.path().join("invalid-000000000.jsonl.gz").exists());
        assert!(tmp.path().join("invalid-000000001.jsonl.gz").exists());
    }

    #[test]
    fn test_manifest_records_sealed_segments() {
        let tmp = TempDir::new().unwrap();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let manifest = ManifestWriter::spawn(tmp.path().to_path_buf(), receiver);

        let sink = SegmentInvalidSink::new(config(&tmp), Some(sender)).unwrap();
        sink.write(&[record(1)]).unwrap();
        // Dropping the sink seals the segment and closes the channel
        drop(sink);
        manifest.join();

        let text = fs::read_to_string(tmp.path().join("manifest.jsonl")).unwrap();
        let sealed: SealedSegment = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(sealed.segment_number, 0);
        assert_eq!(sealed.record_count, 1);
    }
}
