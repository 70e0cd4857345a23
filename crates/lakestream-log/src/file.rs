//! File-backed durable log.
//!
//! # Layout
//!
//! ```text
//! <dir>/<topic>/topic.json               partition count, creation time
//! <dir>/<topic>/partition-00000.log      length-prefixed frames (see record.rs)
//! <dir>/<topic>/groups/<group>.lease     consumer-group lease
//! ```
//!
//! Each partition keeps an in-memory index of frame positions, rebuilt on
//! open. A trailing frame cut short by a crash is truncated away; any other
//! undecodable frame is reported as [`LogError::Corrupt`].
//!
//! One process appends ([`FileLog::open`]); consumers in other processes open
//! the topic read-only ([`FileLog::open_existing`]) and extend their index
//! from the file on every fetch. A reader skips a frame the writer has not
//! finished and never truncates.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{AckLevel, LogBroker};
use crate::error::{LogError, Result};
use crate::record::{LENGTH_PREFIX_LEN, LogRecord, decode_frame, encode_frame, encoded_len};

/// Buffered bytes after which an unacknowledged (`none`) append is written out.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Configuration for the file-backed log.
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    /// Root directory holding one subdirectory per topic.
    pub dir: PathBuf,

    /// Topic name.
    /// Default: "ecommerce_events"
    pub topic: String,

    /// Partition count used when the topic is created.
    /// An existing topic keeps its own count.
    /// Default: 3
    pub partitions: u32,

    /// A group lease not renewed within this window may be taken over.
    /// Default: 30 seconds
    pub group_lease_ttl: Duration,

    /// Largest accepted encoded record.
    /// Default: 1 MB
    pub max_record_bytes: usize,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            topic: "ecommerce_events".to_string(),
            partitions: 3,
            group_lease_ttl: Duration::from_secs(30),
            max_record_bytes: 1024 * 1024, // 1 MB
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TopicMetadata {
    topic: String,
    partitions: u32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupLease {
    member: String,
    renewed_at_ms: i64,
}

impl GroupLease {
    fn is_live(&self, ttl: Duration) -> bool {
        let age_ms = Utc::now().timestamp_millis() - self.renewed_at_ms;
        age_ms <= ttl.as_millis() as i64
    }
}

/// How a [`FileLog`] instance uses the partition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Sole appender. Repairs a torn tail on open.
    Writer,

    /// Follows files appended by another process. Never writes to them;
    /// picks up new frames on every read.
    Reader,
}

/// State of one partition file.
struct Partition {
    id: u32,
    path: PathBuf,
    mode: Mode,

    /// `None` only for a reader whose file the writer has not created yet.
    file: Option<File>,

    /// Byte position of every frame, indexed by offset.
    positions: Vec<u64>,

    /// Logical length including buffered bytes.
    len: u64,

    /// Length of the data already written to the file.
    flushed_len: u64,

    /// Encoded frames not yet written to the file.
    pending: Vec<u8>,
}

impl Partition {
    fn open(id: u32, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let (positions, valid_len) = scan_frames(id, &file, 0, 0, file_len)?;

        if valid_len < file_len {
            warn!(
                "Partition {}: truncating torn tail ({} bytes) at byte {}",
                id,
                file_len - valid_len,
                valid_len
            );
            file.set_len(valid_len)?;
        }

        debug!(
            "Partition {} opened: {} records, {} bytes",
            id,
            positions.len(),
            valid_len
        );

        Ok(Self {
            id,
            path: path.to_path_buf(),
            mode: Mode::Writer,
            file: Some(file),
            positions,
            len: valid_len,
            flushed_len: valid_len,
            pending: Vec::new(),
        })
    }

    fn open_reader(id: u32, path: &Path) -> Result<Self> {
        let mut partition = Self {
            id,
            path: path.to_path_buf(),
            mode: Mode::Reader,
            file: None,
            positions: Vec::new(),
            len: 0,
            flushed_len: 0,
            pending: Vec::new(),
        };
        partition.refresh()?;
        debug!(
            "Partition {} opened read-only: {} records, {} bytes",
            id,
            partition.positions.len(),
            partition.len
        );
        Ok(partition)
    }

    /// Index frames the writer completed since the last refresh.
    ///
    /// A trailing frame still being written is left for a later refresh.
    fn refresh(&mut self) -> Result<()> {
        if self.mode != Mode::Reader {
            return Ok(());
        }
        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        let Some(file) = &self.file else {
            return Ok(());
        };

        let file_len = file.metadata()?.len();
        if file_len < self.len {
            return Err(self.corrupt(
                file_len,
                &format!("file shrank below {} indexed bytes", self.len),
            ));
        }
        if file_len == self.len {
            return Ok(());
        }

        let (positions, valid_len) =
            scan_frames(self.id, file, self.len, self.positions.len() as u64, file_len)?;
        self.positions.extend(positions);
        self.len = valid_len;
        self.flushed_len = valid_len;
        Ok(())
    }

    fn end_offset(&self) -> u64 {
        self.positions.len() as u64
    }

    fn writable_file(&mut self) -> Result<&mut File> {
        match (self.mode, self.file.as_mut()) {
            (Mode::Writer, Some(file)) => Ok(file),
            _ => Err(LogError::ReadOnly(self.path.clone())),
        }
    }

    fn append(&mut self, key: &[u8], value: &[u8], ack: AckLevel) -> Result<u64> {
        self.writable_file()?;
        let offset = self.end_offset();
        let position = self.len;
        let before = self.pending.len();

        encode_frame(offset, Utc::now().timestamp_millis(), key, value, &mut self.pending);
        self.positions.push(position);
        self.len += (self.pending.len() - before) as u64;

        let must_flush = ack.waits_for_delivery() || self.pending.len() >= FLUSH_THRESHOLD;
        if must_flush && let Err(e) = self.flush(matches!(ack, AckLevel::All)) {
            self.rollback();
            return Err(e);
        }

        Ok(offset)
    }

    fn flush(&mut self, sync: bool) -> Result<()> {
        if self.mode == Mode::Reader {
            return Ok(());
        }
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.writable_file()?.write_all(&pending)?;
            self.flushed_len = self.len;
        }
        if sync {
            self.writable_file()?.sync_data()?;
        }
        Ok(())
    }

    /// Drop everything not yet confirmed written, including partial writes.
    fn rollback(&mut self) {
        let keep = self.flushed_len;
        if let Ok(file) = self.writable_file()
            && let Err(e) = file.set_len(keep)
        {
            warn!("Partition {}: failed to truncate after write error: {}", self.id, e);
        }
        self.positions.retain(|p| *p < keep);
        self.pending.clear();
        self.len = keep;
    }

    fn fetch(&mut self, offset: u64, max_records: usize) -> Result<Vec<LogRecord>> {
        self.refresh()?;
        let end = self.end_offset();
        if offset >= end || max_records == 0 {
            return Ok(Vec::new());
        }

        if let Err(e) = self.flush(false) {
            self.rollback();
            return Err(e);
        }

        let last = end.min(offset.saturating_add(max_records as u64));
        let start_pos = self.positions[offset as usize];
        let end_pos = self
            .positions
            .get(last as usize)
            .copied()
            .unwrap_or(self.len);

        let mut buf = vec![0u8; (end_pos - start_pos) as usize];
        let Some(file) = self.file.as_mut() else {
            return Err(LogError::Unavailable(format!("{} is not open", self.path.display())));
        };
        file.seek(SeekFrom::Start(start_pos))?;
        file.read_exact(&mut buf)?;

        let mut records = Vec::with_capacity((last - offset) as usize);
        let mut cursor = 0usize;
        while cursor < buf.len() {
            let position = start_pos + cursor as u64;
            let header = buf
                .get(cursor..cursor + LENGTH_PREFIX_LEN)
                .ok_or_else(|| self.corrupt(position, "truncated length prefix"))?;
            let frame_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let frame_start = cursor + LENGTH_PREFIX_LEN;
            let frame = buf
                .get(frame_start..frame_start + frame_len)
                .ok_or_else(|| self.corrupt(position, "truncated frame"))?;
            records.push(decode_frame(self.id, position, frame)?);
            cursor = frame_start + frame_len;
        }

        Ok(records)
    }

    fn corrupt(&self, position: u64, reason: &str) -> LogError {
        LogError::Corrupt {
            partition: self.id,
            position,
            reason: reason.to_string(),
        }
    }
}

/// Read complete frames from byte `start` of a partition file, expecting the
/// first one to carry `first_offset`.
///
/// Returns the new frame positions and the end of the last complete frame.
fn scan_frames(
    id: u32,
    file: &File,
    start: u64,
    first_offset: u64,
    file_len: u64,
) -> Result<(Vec<u64>, u64)> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(handle);
    let mut positions = Vec::new();
    let mut position = start;
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];

    loop {
        if position + LENGTH_PREFIX_LEN as u64 > file_len || !read_full(&mut reader, &mut len_buf)? {
            break;
        }
        let frame_len = u32::from_le_bytes(len_buf) as usize;
        let frame_end = position + (LENGTH_PREFIX_LEN + frame_len) as u64;
        if frame_end > file_len {
            break;
        }

        let mut frame = vec![0u8; frame_len];
        if !read_full(&mut reader, &mut frame)? {
            break;
        }

        let record = decode_frame(id, position, &frame)?;
        let expected = first_offset + positions.len() as u64;
        if record.offset != expected {
            return Err(LogError::Corrupt {
                partition: id,
                position,
                reason: format!("expected offset {}, found {}", expected, record.offset),
            });
        }

        positions.push(position);
        position = frame_end;
    }

    Ok((positions, position))
}

/// Fill `buf`, returning `false` if the reader ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// A durable, partitioned log stored in local files.
///
/// Thread-safe: every partition has its own lock.
pub struct FileLog {
    config: FileLogConfig,
    root: PathBuf,
    partitions: Vec<Mutex<Partition>>,
    leases: Mutex<()>,
}

impl FileLog {
    /// Open the topic, creating it if it does not exist.
    pub fn open(config: FileLogConfig) -> Result<Self> {
        if config.partitions == 0 {
            return Err(LogError::Config("partition count must be at least 1".into()));
        }
        validate_name("topic", &config.topic)?;

        let root = config.dir.join(&config.topic);
        fs::create_dir_all(root.join("groups"))?;

        let partition_count = load_or_create_metadata(&root, &config)?;

        let partitions = (0..partition_count)
            .map(|id| {
                let path = root.join(format!("partition-{id:05}.log"));
                Partition::open(id, &path).map(Mutex::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let records: u64 = partitions.iter().map(|p| p.lock().end_offset()).sum();
        info!(
            "FileLog opened: topic={}, dir={}, partitions={}, records={}",
            config.topic,
            root.display(),
            partition_count,
            records
        );

        Ok(Self {
            config,
            root,
            partitions,
            leases: Mutex::new(()),
        })
    }

    /// Open an existing topic read-only, following the files another process
    /// appends to. Consumers never create or repair a topic.
    pub fn open_existing(config: FileLogConfig) -> Result<Self> {
        validate_name("topic", &config.topic)?;
        let root = config.dir.join(&config.topic);
        let metadata = root.join("topic.json");
        if !metadata.exists() {
            return Err(LogError::TopicNotFound(metadata));
        }
        let meta: TopicMetadata = serde_json::from_slice(&fs::read(&metadata)?)?;
        if meta.partitions == 0 {
            return Err(LogError::Config(format!(
                "{} declares zero partitions",
                metadata.display()
            )));
        }
        fs::create_dir_all(root.join("groups"))?;

        let partitions = (0..meta.partitions)
            .map(|id| {
                let path = root.join(format!("partition-{id:05}.log"));
                Partition::open_reader(id, &path).map(Mutex::new)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "FileLog opened read-only: topic={}, dir={}, partitions={}",
            config.topic,
            root.display(),
            meta.partitions
        );

        Ok(Self {
            config,
            root,
            partitions,
            leases: Mutex::new(()),
        })
    }

    /// Write out buffered records of every partition and sync them.
    pub fn flush(&self) -> Result<()> {
        for partition in &self.partitions {
            let mut partition = partition.lock();
            if let Err(e) = partition.flush(true) {
                partition.rollback();
                return Err(e);
            }
        }
        Ok(())
    }

    fn partition(&self, partition: u32) -> Result<&Mutex<Partition>> {
        self.partitions
            .get(partition as usize)
            .ok_or(LogError::UnknownPartition {
                partition,
                partitions: self.partitions.len() as u32,
            })
    }

    fn lease_path(&self, group: &str) -> PathBuf {
        self.root.join("groups").join(format!("{group}.lease"))
    }

    fn read_lease(&self, group: &str) -> Result<Option<GroupLease>> {
        match fs::read(self.lease_path(group)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_lease(&self, group: &str, member: &str) -> Result<()> {
        let lease = GroupLease {
            member: member.to_string(),
            renewed_at_ms: Utc::now().timestamp_millis(),
        };
        let path = self.lease_path(group);
        let tmp = path.with_extension("lease.tmp");
        fs::write(&tmp, serde_json::to_vec(&lease)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl LogBroker for FileLog {
    fn topic(&self) -> &str {
        &self.config.topic
    }

    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn append(&self, partition: u32, key: &[u8], value: &[u8], ack: AckLevel) -> Result<u64> {
        let size = encoded_len(key, value);
        if size > self.config.max_record_bytes {
            return Err(LogError::RecordTooLarge {
                size,
                max: self.config.max_record_bytes,
            });
        }

        self.partition(partition)?.lock().append(key, value, ack)
    }

    fn fetch(&self, partition: u32, offset: u64, max_records: usize) -> Result<Vec<LogRecord>> {
        self.partition(partition)?.lock().fetch(offset, max_records)
    }

    fn end_offset(&self, partition: u32) -> Result<u64> {
        let mut partition = self.partition(partition)?.lock();
        partition.refresh()?;
        Ok(partition.end_offset())
    }

    fn acquire_group(&self, group: &str, member: &str) -> Result<()> {
        validate_name("group", group)?;
        let _guard = self.leases.lock();

        if let Some(lease) = self.read_lease(group)?
            && lease.member != member
        {
            if lease.is_live(self.config.group_lease_ttl) {
                return Err(LogError::GroupBusy {
                    group: group.to_string(),
                    holder: lease.member,
                });
            }
            warn!(
                "Taking over stale lease on group {} from {}",
                group, lease.member
            );
        }

        self.write_lease(group, member)
    }

    fn renew_group(&self, group: &str, member: &str) -> Result<()> {
        self.acquire_group(group, member)
    }

    fn release_group(&self, group: &str, member: &str) -> Result<()> {
        validate_name("group", group)?;
        let _guard = self.leases.lock();

        if let Some(lease) = self.read_lease(group)?
            && lease.member == member
        {
            fs::remove_file(self.lease_path(group))?;
            debug!("Released lease on group {}", group);
        }
        Ok(())
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush log on close: {}", e);
        }
    }
}

fn load_or_create_metadata(root: &Path, config: &FileLogConfig) -> Result<u32> {
    let path = root.join("topic.json");
    if path.exists() {
        let meta: TopicMetadata = serde_json::from_slice(&fs::read(&path)?)?;
        if meta.partitions == 0 {
            return Err(LogError::Config(format!(
                "{} declares zero partitions",
                path.display()
            )));
        }
        if meta.partitions != config.partitions {
            warn!(
                "Topic {} exists with {} partitions, ignoring configured {}",
                meta.topic, meta.partitions, config.partitions
            );
        }
        return Ok(meta.partitions);
    }

    let meta = TopicMetadata {
        topic: config.topic.clone(),
        partitions: config.partitions,
        created_at: Utc::now(),
    };
    fs::write(&path, serde_json::to_vec_pretty(&meta)?)?;
    info!(
        "Created topic {} with {} partitions",
        config.topic, config.partitions
    );
    Ok(config.partitions)
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(LogError::Config(format!("invalid {kind} name {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_existing_requires_topic() {
        let tmp = TempDir::new().unwrap();
        let config = FileLogConfig {
            dir: tmp.path().to_path_buf(),
            ..Default::default()
        };

        let err = FileLog::open_existing(config.clone()).err().unwrap();
        assert!(matches!(err, LogError::TopicNotFound(_)));

        drop(FileLog::open(config.clone()).unwrap());
        let log = FileLog::open_existing(config).unwrap();
        assert_eq!(log.partitions(), 3);
    }

    fn test_config(dir: &TempDir) -> FileLogConfig {
        FileLogConfig {
            dir: dir.path().to_path_buf(),
            topic: "events".to_string(),
            partitions: 2,
            group_lease_ttl: Duration::from_secs(30),
            max_record_bytes: 4096,
        }
    }

    #[test]
    fn test_append_and_fetch() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::open(test_config(&dir)).unwrap();

        for i in 0..5 {
            let offset = log
                .append(1, b"s1", format!("v{i}").as_bytes(), AckLevel::Leader)
                .unwrap();
            assert_eq!(offset, i);
        }

        assert_eq!(log.end_offset(1).unwrap(), 5);
        assert_eq!(log.end_offset(0).unwrap(), 0);

        let records = log.fetch(1, 1, 3).unwrap();
        let values: Vec<_> = records.iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);
        assert!(records.iter().all(|r| r.partition == 1 && r.key == b"s1"));

        assert!(log.fetch(1, 5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        {
            let log = FileLog::open(test_config(&dir)).unwrap();
            log.append(0, b"k", b"a", AckLevel::All).unwrap();
            log.append(0, b"k", b"b", AckLevel::Leader).unwrap();
        }

        let log = FileLog::open(test_config(&dir)).unwrap();
        assert_eq!(log.end_offset(0).unwrap(), 2);
        assert_eq!(log.append(0, b"k", b"c", AckLevel::Leader).unwrap(), 2);

        let values: Vec<_> = log
            .fetch(0, 0, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_unacknowledged_appends_are_fetchable_and_survive_close() {
        let dir = TempDir::new().unwrap();
        {
            let log = FileLog::open(test_config(&dir)).unwrap();
            log.append(0, b"k", b"buffered", AckLevel::None).unwrap();
            assert_eq!(log.fetch(0, 0, 1).unwrap()[0].value, b"buffered");
            log.append(0, b"k", b"buffered-2", AckLevel::None).unwrap();
        }

        let log = FileLog::open(test_config(&dir)).unwrap();
        assert_eq!(log.end_offset(0).unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let log = FileLog::open(test_config(&dir)).unwrap();
            for _ in 0..3 {
                log.append(0, b"s", b"value", AckLevel::Leader).unwrap();
            }
        }

        // Simulate a crash mid-write: a length prefix promising more than is there
        let path = dir.path().join("events").join("partition-00000.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let log = FileLog::open(test_config(&dir)).unwrap();
        assert_eq!(log.end_offset(0).unwrap(), 3);
        assert_eq!(log.append(0, b"s", b"next", AckLevel::Leader).unwrap(), 3);
        assert_eq!(log.fetch(0, 0, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_reader_follows_writer() {
        let dir = TempDir::new().unwrap();
        let writer = FileLog::open(test_config(&dir)).unwrap();
        writer.append(0, b"s1", b"before", AckLevel::Leader).unwrap();

        let reader = FileLog::open_existing(test_config(&dir)).unwrap();
        assert_eq!(reader.end_offset(0).unwrap(), 1);

        for i in 0..3 {
            writer
                .append(0, b"s1", format!("after-{i}").as_bytes(), AckLevel::Leader)
                .unwrap();
        }
        assert_eq!(reader.end_offset(0).unwrap(), 4);

        let values: Vec<_> = reader
            .fetch(0, 1, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(
            values,
            vec![b"after-0".to_vec(), b"after-1".to_vec(), b"after-2".to_vec()]
        );
        assert!(matches!(
            reader.append(0, b"s1", b"nope", AckLevel::Leader),
            Err(LogError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_reader_waits_for_unfinished_frame() {
        let dir = TempDir::new().unwrap();
        drop(FileLog::open(test_config(&dir)).unwrap());
        let path = dir.path().join("events").join("partition-00000.log");

        let mut frames = Vec::new();
        encode_frame(0, 0, b"k", b"complete", &mut frames);
        let first_len = frames.len();
        encode_frame(1, 0, b"k", b"in-flight", &mut frames);

        // Writer is midway through the second frame
        fs::write(&path, &frames[..first_len + 6]).unwrap();
        let reader = FileLog::open_existing(test_config(&dir)).unwrap();
        assert_eq!(reader.end_offset(0).unwrap(), 1);
        assert_eq!(reader.fetch(0, 0, 10).unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), (first_len + 6) as u64);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frames[first_len + 6..]).unwrap();
        drop(file);

        let records = reader.fetch(0, 0, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, b"in-flight");
    }

    #[test]
    fn test_reader_picks_up_partition_created_later() {
        let dir = TempDir::new().unwrap();
        drop(FileLog::open(test_config(&dir)).unwrap());
        let path = dir.path().join("events").join("partition-00001.log");
        fs::remove_file(&path).unwrap();

        let reader = FileLog::open_existing(test_config(&dir)).unwrap();
        assert_eq!(reader.end_offset(1).unwrap(), 0);

        let writer = FileLog::open(test_config(&dir)).unwrap();
        writer.append(1, b"k", b"v", AckLevel::Leader).unwrap();
        assert_eq!(reader.fetch(1, 0, 10).unwrap()[0].value, b"v");
    }

    #[test]
    fn test_offset_gap_is_corrupt() {
        let dir = TempDir::new().unwrap();
        drop(FileLog::open(test_config(&dir)).unwrap());

        let mut buf = Vec::new();
        encode_frame(0, 0, b"k", b"a", &mut buf);
        encode_frame(5, 0, b"k", b"b", &mut buf);
        let path = dir.path().join("events").join("partition-00001.log");
        fs::write(&path, buf).unwrap();

        let err = FileLog::open(test_config(&dir)).err().unwrap();
        assert!(matches!(err, LogError::Corrupt { partition: 1, .. }));
    }

    #[test]
    fn test_existing_partition_count_wins() {
        let dir = TempDir::new().unwrap();
        drop(FileLog::open(test_config(&dir)).unwrap());

        let mut config = test_config(&dir);
        config.partitions = 8;
        let log = FileLog::open(config).unwrap();
        assert_eq!(log.partitions(), 2);
    }

    #[test]
    fn test_unknown_partition_and_oversized_record() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::open(test_config(&dir)).unwrap();

        assert!(matches!(
            log.append(7, b"k", b"v", AckLevel::Leader),
            Err(LogError::UnknownPartition {
                partition: 7,
                partitions: 2
            })
        ));

        let big = vec![0u8; 5000];
        assert!(matches!(
            log.append(0, b"k", &big, AckLevel::Leader),
            Err(LogError::RecordTooLarge { .. })
        ));
        assert_eq!(log.end_offset(0).unwrap(), 0);
    }

    #[test]
    fn test_group_lease_exclusive() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::open(test_config(&dir)).unwrap();

        log.acquire_group("stream", "job-a").unwrap();
        log.renew_group("stream", "job-a").unwrap();

        let err = log.acquire_group("stream", "job-b").unwrap_err();
        assert!(matches!(err, LogError::GroupBusy { ref holder, .. } if holder == "job-a"));

        // Releasing someone else's lease does nothing
        log.release_group("stream", "job-b").unwrap();
        assert!(log.acquire_group("stream", "job-b").is_err());

        log.release_group("stream", "job-a").unwrap();
        log.acquire_group("stream", "job-b").unwrap();
    }

    #[test]
    fn test_stale_lease_taken_over() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.group_lease_ttl = Duration::from_millis(10);
        let log = FileLog::open(config).unwrap();

        log.acquire_group("stream", "job-a").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        log.acquire_group("stream", "job-b").unwrap();
        assert!(log.renew_group("stream", "job-b").is_ok());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.topic = "../escape".to_string();
        assert!(matches!(FileLog::open(config), Err(LogError::Config(_))));

        let log = FileLog::open(test_config(&dir)).unwrap();
        assert!(log.acquire_group("a/b", "m").is_err());
    }
}
