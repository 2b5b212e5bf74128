//! Logging collaborator used by the checkpoint coordinator

use std::sync::atomic::{AtomicU64, Ordering};

use ftdisk::{LogFile, Lsn};

use crate::error::CallbackError;

/// Write-ahead log operations a checkpoint depends on
pub trait CheckpointLog: Send + Sync {
    /// Append a begin-checkpoint record and return its LSN
    fn begin_checkpoint(&self) -> Result<Lsn, CallbackError>;

    /// Make the log durable up to `lsn`
    fn fsync_up_to(&self, lsn: Lsn) -> Result<(), CallbackError>;

    /// Record (durably) that the checkpoint begun at `lsn` is complete
    fn note_checkpoint(&self, lsn: Lsn) -> Result<(), CallbackError>;

    /// Drop log data no longer needed after the checkpoint at `lsn`
    fn trim_before(&self, lsn: Lsn) -> Result<(), CallbackError>;
}

impl CheckpointLog for LogFile {
    fn begin_checkpoint(&self) -> Result<Lsn, CallbackError> {
        Ok(LogFile::begin_checkpoint(self)?)
    }

    fn fsync_up_to(&self, lsn: Lsn) -> Result<(), CallbackError> {
        Ok(LogFile::fsync_up_to(self, lsn)?)
    }

    fn note_checkpoint(&self, lsn: Lsn) -> Result<(), CallbackError> {
        Ok(LogFile::note_checkpoint(self, lsn)?)
    }

    fn trim_before(&self, lsn: Lsn) -> Result<(), CallbackError> {
        LogFile::trim_before(self, lsn)?;
        Ok(())
    }
}

/// In-memory log: hands out LSNs and remembers the last checkpoint
///
/// For cachetables whose durability is handled entirely by the block files.
#[derive(Debug, Default)]
pub struct NullLog {
    next_lsn: AtomicU64,
    last_checkpoint: AtomicU64,
}

impl NullLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin LSN of the last noted checkpoint (0 if none)
    pub fn last_checkpoint(&self) -> Lsn {
        self.last_checkpoint.load(Ordering::Acquire)
    }
}

impl CheckpointLog for NullLog {
    fn begin_checkpoint(&self) -> Result<Lsn, CallbackError> {
        Ok(self.next_lsn.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn fsync_up_to(&self, _lsn: Lsn) -> Result<(), CallbackError> {
        Ok(())
    }

    fn note_checkpoint(&self, lsn: Lsn) -> Result<(), CallbackError> {
        self.last_checkpoint.fetch_max(lsn, Ordering::AcqRel);
        Ok(())
    }

    fn trim_before(&self, _lsn: Lsn) -> Result<(), CallbackError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_null_log_lsns() {
        let log = NullLog::new();
        let a = CheckpointLog::begin_checkpoint(&log).unwrap();
        let b = CheckpointLog::begin_checkpoint(&log).unwrap();
        assert!(b > a);

        log.note_checkpoint(b).unwrap();
        assert_eq!(log.last_checkpoint(), b);
    }

    #[test]
    fn test_log_file_as_checkpoint_log() {
        let dir = TempDir::new().unwrap();
        let file = LogFile::open(dir.path()).unwrap();
        let log: &dyn CheckpointLog = &file;

        let lsn = log.begin_checkpoint().unwrap();
        log.fsync_up_to(lsn).unwrap();
        log.note_checkpoint(lsn).unwrap();
        log.trim_before(lsn).unwrap();

        assert_eq!(file.last_checkpoint(), Some(lsn));
    }
}
