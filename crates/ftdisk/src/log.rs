//! Checkpoint log
//!
//! An append-only sequence of LSN-numbered records split into segment
//! files (`log.000001`, `log.000002`, ...). A segment is closed and a new
//! one started whenever a checkpoint completes, so whole segments older
//! than the last checkpoint can be trimmed.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::header::{encode_record, parse_record, LogRecord, RecordKind, LOG_MAGIC};

/// Log sequence number
pub type Lsn = u64;

const SEGMENT_PREFIX: &str = "log.";

#[derive(Debug)]
struct Segment {
    seq: u64,
    path: PathBuf,
    last_lsn: Option<Lsn>,
}

#[derive(Debug)]
struct LogInner {
    current: File,
    segments: Vec<Segment>,
    next_lsn: Lsn,
    last_checkpoint: Option<Lsn>,
}

/// Append-only log with fsync-up-to semantics
#[derive(Debug)]
pub struct LogFile {
    dir: PathBuf,
    inner: Mutex<LogInner>,
    durable_lsn: AtomicU64,
}

impl LogFile {
    /// Open or create the log in `dir`
    ///
    /// Existing segments are scanned to recover the next LSN and the last
    /// completed checkpoint; a torn record at the tail is cut off.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = list_segments(&dir)?;
        let mut next_lsn: Lsn = 1;
        let mut last_checkpoint = None;

        let segment_count = segments.len();
        for (i, segment) in segments.iter_mut().enumerate() {
            let bytes = fs::read(&segment.path)?;
            let (records, valid_len) = scan_segment(&bytes)?;
            for record in &records {
                next_lsn = next_lsn.max(record.lsn + 1);
                segment.last_lsn = Some(record.lsn);
                if record.kind == RecordKind::EndCheckpoint {
                    last_checkpoint = Some(decode_lsn(&record.payload)?);
                }
            }
            if valid_len < bytes.len() {
                if i + 1 != segment_count {
                    return Err(Error::Parse(format!(
                        "Torn record inside sealed segment {:?}",
                        segment.path
                    )));
                }
                warn!(
                    "Truncating torn log tail in {:?} ({} bytes)",
                    segment.path,
                    bytes.len() - valid_len
                );
                let file = OpenOptions::new().write(true).open(&segment.path)?;
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
        }

        let current = match segments.last() {
            Some(segment) => OpenOptions::new().append(true).open(&segment.path)?,
            None => {
                let segment = create_segment(&dir, 1)?;
                let file = OpenOptions::new().append(true).open(&segment.path)?;
                segments.push(segment);
                file
            }
        };

        debug!(
            "Opened log {:?}: {} segments, next LSN {}, last checkpoint {:?}",
            dir,
            segments.len(),
            next_lsn,
            last_checkpoint
        );

        Ok(LogFile {
            dir,
            inner: Mutex::new(LogInner {
                current,
                segments,
                next_lsn,
                last_checkpoint,
            }),
            durable_lsn: AtomicU64::new(next_lsn - 1),
        })
    }

    /// Append a record, returning its LSN
    pub fn append(&self, kind: RecordKind, payload: &[u8]) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.current.write_all(&encode_record(lsn, kind, payload))?;
        inner.next_lsn += 1;
        if let Some(segment) = inner.segments.last_mut() {
            segment.last_lsn = Some(lsn);
        }
        Ok(lsn)
    }

    /// Make every record up to and including `lsn` durable
    pub fn fsync_up_to(&self, lsn: Lsn) -> Result<()> {
        if self.durable_lsn.load(Ordering::Acquire) >= lsn {
            return Ok(());
        }
        let inner = self.inner.lock();
        if self.durable_lsn.load(Ordering::Acquire) >= lsn {
            return Ok(());
        }
        inner.current.sync_data()?;
        self.durable_lsn.fetch_max(inner.next_lsn - 1, Ordering::AcqRel);
        Ok(())
    }

    /// Log the start of a checkpoint and return its LSN
    pub fn begin_checkpoint(&self) -> Result<Lsn> {
        self.append(RecordKind::BeginCheckpoint, &[])
    }

    /// Record that the checkpoint begun at `begin_lsn` is complete
    ///
    /// The end record is fsynced, then the log rolls to a fresh segment.
    pub fn note_checkpoint(&self, begin_lsn: Lsn) -> Result<()> {
        let end_lsn = self.append(RecordKind::EndCheckpoint, &begin_lsn.to_le_bytes())?;
        self.fsync_up_to(end_lsn)?;

        let mut inner = self.inner.lock();
        inner.last_checkpoint = Some(begin_lsn);
        let next_seq = inner.segments.last().map_or(1, |s| s.seq + 1);
        let segment = create_segment(&self.dir, next_seq)?;
        inner.current = OpenOptions::new().append(true).open(&segment.path)?;
        inner.segments.push(segment);
        debug!("Checkpoint at LSN {} noted, rolled to segment {}", begin_lsn, next_seq);
        Ok(())
    }

    /// Delete sealed segments whose records all precede `lsn`
    ///
    /// A segment that cannot be removed stays listed and is retried by the
    /// next trim.
    pub fn trim_before(&self, lsn: Lsn) -> Result<usize> {
        let mut inner = self.inner.lock();
        let current_seq = inner.segments.last().map(|s| s.seq);
        let (obsolete, mut kept): (Vec<Segment>, Vec<Segment>) =
            inner.segments.drain(..).partition(|segment| {
                Some(segment.seq) != current_seq
                    && segment.last_lsn.map_or(true, |last| last < lsn)
            });

        let mut removed = 0;
        for segment in obsolete {
            match fs::remove_file(&segment.path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => removed += 1,
                Err(err) => {
                    warn!("Failed to remove log segment {}: {}", segment.path.display(), err);
                    kept.push(segment);
                }
            }
        }
        kept.sort_by_key(|s| s.seq);
        inner.segments = kept;
        if removed > 0 {
            debug!("Trimmed {} log segments before LSN {}", removed, lsn);
        }
        Ok(removed)
    }

    /// LSN the next append will receive
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Highest LSN known to be on stable storage
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    /// Begin LSN of the last completed checkpoint
    pub fn last_checkpoint(&self) -> Option<Lsn> {
        self.inner.lock().last_checkpoint
    }

    /// Number of segment files currently on disk
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Read every record still on disk, oldest first
    pub fn read_records(&self) -> Result<Vec<LogRecord>> {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        for segment in &inner.segments {
            let bytes = fs::read(&segment.path)?;
            let (mut parsed, _) = scan_segment(&bytes)?;
            records.append(&mut parsed);
        }
        Ok(records)
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{}{:06}", SEGMENT_PREFIX, seq))
}

fn create_segment(dir: &Path, seq: u64) -> Result<Segment> {
    let path = segment_path(dir, seq);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.write_all(LOG_MAGIC)?;
    file.sync_all()?;
    Ok(Segment {
        seq,
        path,
        last_lsn: None,
    })
}

fn list_segments(dir: &Path) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(seq) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        segments.push(Segment {
            seq,
            path: entry.path(),
            last_lsn: None,
        });
    }
    segments.sort_by_key(|s| s.seq);
    Ok(segments)
}

fn scan_segment(bytes: &[u8]) -> Result<(Vec<LogRecord>, usize)> {
    if bytes.len() < LOG_MAGIC.len() || &bytes[..LOG_MAGIC.len()] != LOG_MAGIC {
        return Err(Error::Parse("Invalid log segment magic".to_string()));
    }
    let mut pos = LOG_MAGIC.len();
    let mut records = Vec::new();
    while pos < bytes.len() {
        match parse_record(&bytes[pos..])? {
            Some((record, used)) => {
                records.push(record);
                pos += used;
            }
            None => break,
        }
    }
    Ok((records, pos))
}

fn decode_lsn(payload: &[u8]) -> Result<Lsn> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| Error::Parse("Checkpoint record payload is not an LSN".to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_assigns_increasing_lsns() {
        let dir = TempDir::new().unwrap();
        let log = LogFile::open(dir.path()).unwrap();

        let a = log.append(RecordKind::User, b"a").unwrap();
        let b = log.append(RecordKind::User, b"b").unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(log.next_lsn(), 3);
    }

    #[test]
    fn test_fsync_up_to_advances_durable_lsn() {
        let dir = TempDir::new().unwrap();
        let log = LogFile::open(dir.path()).unwrap();

        let lsn = log.append(RecordKind::User, b"x").unwrap();
        assert!(log.durable_lsn() < lsn);
        log.fsync_up_to(lsn).unwrap();
        assert!(log.durable_lsn() >= lsn);
    }

    #[test]
    fn test_reopen_recovers_lsn_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        {
            let log = LogFile::open(dir.path()).unwrap();
            log.append(RecordKind::User, b"one").unwrap();
            let begin = log.begin_checkpoint().unwrap();
            log.note_checkpoint(begin).unwrap();
            log.append(RecordKind::User, b"two").unwrap();
        }

        let log = LogFile::open(dir.path()).unwrap();
        assert_eq!(log.last_checkpoint(), Some(2));
        assert_eq!(log.next_lsn(), 5);
        assert_eq!(log.read_records().unwrap().len(), 4);
    }

    #[test]
    fn test_checkpoint_rolls_and_trims_segments() {
        let dir = TempDir::new().unwrap();
        let log = LogFile::open(dir.path()).unwrap();

        log.append(RecordKind::User, b"old").unwrap();
        let first = log.begin_checkpoint().unwrap();
        log.note_checkpoint(first).unwrap();
        log.append(RecordKind::User, b"mid").unwrap();
        let second = log.begin_checkpoint().unwrap();
        log.note_checkpoint(second).unwrap();
        assert_eq!(log.segment_count(), 3);

        let removed = log.trim_before(second).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(log.segment_count(), 2);
        assert!(log.read_records().unwrap().iter().all(|r| r.lsn > first + 1));
    }

    #[test]
    fn test_failed_trim_keeps_segments_listed() {
        let dir = TempDir::new().unwrap();
        let log = LogFile::open(dir.path()).unwrap();

        let first = log.begin_checkpoint().unwrap();
        log.note_checkpoint(first).unwrap();
        let second = log.begin_checkpoint().unwrap();
        log.note_checkpoint(second).unwrap();

        // A non-empty directory in place of the oldest segment cannot be
        // removed as a file
        let oldest = segment_path(dir.path(), 1);
        fs::remove_file(&oldest).unwrap();
        fs::create_dir(&oldest).unwrap();
        fs::write(oldest.join("pinned"), b"x").unwrap();

        assert_eq!(log.trim_before(second).unwrap(), 0);
        assert_eq!(log.segment_count(), 3);

        // The log keeps rolling past the stuck segment
        let third = log.begin_checkpoint().unwrap();
        log.note_checkpoint(third).unwrap();
        assert_eq!(log.segment_count(), 4);
        assert!(segment_path(dir.path(), 4).exists());

        // Once it is gone, the next trim catches up
        fs::remove_dir_all(&oldest).unwrap();
        assert_eq!(log.trim_before(third).unwrap(), 2);
        assert_eq!(log.segment_count(), 2);
        assert_eq!(log.last_checkpoint(), Some(third));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let log = LogFile::open(dir.path()).unwrap();
            log.append(RecordKind::User, b"whole").unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0, 0]).unwrap();
        drop(file);

        let log = LogFile::open(dir.path()).unwrap();
        assert_eq!(log.read_records().unwrap().len(), 1);
        assert_eq!(log.append(RecordKind::User, b"next").unwrap(), 2);
    }
}
