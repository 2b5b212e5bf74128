//! Client callbacks
//!
//! The cachetable never looks inside a value. Everything object-specific
//! (reading it from disk, writing it back, shrinking it, snapshotting it
//! for a checkpoint) goes through these traits.
//!
//! - [`PairCallbacks`] is registered once per cachefile and is used by the
//!   cachetable on its own initiative (eviction, checkpoint, cleaner).
//! - [`FetchCallbacks`] is supplied by each caller that may cause a fetch,
//!   since what a caller needs resident can differ per call.

use ftdisk::{BlockFile, Lsn};

use crate::error::CallbackError;
use crate::pair::{BlockKey, DiskData, PairAttr};

/// How expensive a partial eviction would be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCost {
    /// Run inline by the evicting thread
    Cheap,
    /// Run on a background writer thread
    Expensive,
}

/// Arguments of a fetch
#[derive(Debug)]
pub struct FetchRequest<'a> {
    /// Backing file
    pub file: &'a BlockFile,
    /// Block to read
    pub key: BlockKey,
    /// Precomputed hash of the pair identity
    pub fullhash: u32,
}

/// Result of a fetch
pub struct Fetched<V> {
    /// In-memory value
    pub value: V,
    /// Auxiliary state kept next to the value
    pub disk_data: Option<DiskData>,
    /// Initial memory accounting
    pub attr: PairAttr,
    /// Whether the fetched value already needs writing back
    pub dirty: bool,
}

impl<V> Fetched<V> {
    /// A clean value with no disk data
    pub fn clean(value: V, attr: PairAttr) -> Self {
        Self {
            value,
            disk_data: None,
            attr,
            dirty: false,
        }
    }
}

/// Arguments of a partial fetch
pub struct PartialFetchRequest<'a, V> {
    /// Backing file
    pub file: &'a BlockFile,
    /// Block being completed
    pub key: BlockKey,
    /// Resident partial value, to be completed in place
    pub value: &'a mut V,
    /// Auxiliary state
    pub disk_data: Option<&'a mut DiskData>,
}

/// Arguments of a flush (write-back)
pub struct FlushRequest<'a, V> {
    /// Backing file
    pub file: &'a BlockFile,
    /// Block being written
    pub key: BlockKey,
    /// Value to write
    pub value: &'a V,
    /// Auxiliary state; `None` for clones
    pub disk_data: Option<&'a DiskData>,
    /// Current memory accounting
    pub attr: PairAttr,
    /// Written on behalf of a checkpoint
    pub for_checkpoint: bool,
    /// The value stays resident afterwards; otherwise it is dropped
    pub keep_resident: bool,
    /// `value` is a checkpoint snapshot, not the live value
    pub is_clone: bool,
}

/// Arguments of a cleaner pass
pub struct CleanerRequest<'a, V> {
    /// Backing file
    pub file: &'a BlockFile,
    /// Block being cleaned
    pub key: BlockKey,
    /// Write-locked value
    pub value: &'a mut V,
    /// Auxiliary state
    pub disk_data: Option<&'a mut DiskData>,
}

/// Per-call fetch behaviour
pub trait FetchCallbacks<V>: Send + Sync {
    /// Produce the value for a missing pair
    fn fetch(&self, req: FetchRequest<'_>) -> Result<Fetched<V>, CallbackError>;

    /// Does the resident value lack something this caller needs?
    fn partial_fetch_required(&self, _value: &V) -> bool {
        false
    }

    /// Complete a resident value in place, returning its new accounting
    fn partial_fetch(&self, _req: PartialFetchRequest<'_, V>) -> Result<PairAttr, CallbackError> {
        Err(CallbackError::from("partial fetch not supported"))
    }
}

/// Per-cachefile object behaviour
pub trait PairCallbacks<V>: Send + Sync {
    /// Write a value back, returning its accounting afterwards
    fn flush(&self, req: FlushRequest<'_, V>) -> Result<PairAttr, CallbackError>;

    /// Bytes a partial eviction would free, and what it would cost
    fn partial_eviction_estimate(
        &self,
        _value: &V,
        _disk_data: Option<&DiskData>,
    ) -> (usize, EvictionCost) {
        (0, EvictionCost::Cheap)
    }

    /// Shrink a value in place, returning the bytes actually freed
    fn partial_evict(
        &self,
        _value: &mut V,
        _disk_data: Option<&mut DiskData>,
        _bytes_to_free: usize,
    ) -> usize {
        0
    }

    /// Snapshot a dirty value for a checkpoint
    ///
    /// `None` means the object cannot be cloned; it is then written in
    /// place before anyone may modify it again.
    fn clone_for_checkpoint(&self, _value: &V, _attr: PairAttr) -> Option<(V, PairAttr)> {
        None
    }

    /// Background maintenance on an unpinned value
    ///
    /// Returning `Some(attr)` means the value changed: it is marked dirty and
    /// re-accounted.
    fn cleaner(&self, _req: CleanerRequest<'_, V>) -> Result<Option<PairAttr>, CallbackError> {
        Ok(None)
    }

    /// Marking for checkpoint `lsn` finished
    fn checkpoint_begun(&self, _file: &BlockFile, _lsn: Lsn) {}

    /// All pairs for checkpoint `lsn` are written; persist file metadata
    ///
    /// The block translation is persisted by the cachetable right after.
    fn checkpoint_written(&self, _file: &BlockFile, _lsn: Lsn) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Checkpoint `lsn` is recorded in the log
    fn checkpoint_ended(&self, _file: &BlockFile, _lsn: Lsn) {}

    /// Final close, after every dirty pair has been written
    fn closing(&self, _file: &BlockFile) -> Result<(), CallbackError> {
        Ok(())
    }
}
