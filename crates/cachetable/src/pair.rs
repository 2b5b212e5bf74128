//! Pairs: one cached unit of a backing file
//!
//! A pair's value lives behind its own `RwLock`, which doubles as the pin
//! lock: read pins share it, write pins and every in-flight operation on the
//! pair (fetch, flush, partial fetch, partial eviction) hold it exclusively.
//! The small `state` mutex carries the bookkeeping that must be readable
//! while the value lock is held by someone else.
//!
//! Lock order: value -> table -> state. Whoever already holds the table or
//! a `state` mutex may only *try* a value lock.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::cachefile::FileShared;
use crate::error::Error;
use crate::stats::CachetableStats;
use crate::table::PairHandle;

/// Object-specific auxiliary state kept next to a value
pub type DiskData = Box<dyn Any + Send + Sync>;

/// Values the cachetable can hold
pub trait Value: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Value for T {}

/// Identity of a cachefile within one cachetable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

/// Block number within a cachefile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(pub u64);

/// Full identity of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    /// Owning cachefile
    pub file: FileId,
    /// Block within the file
    pub block: BlockKey,
}

impl PairKey {
    /// Build a pair identity
    pub fn new(file: FileId, block: BlockKey) -> Self {
        Self { file, block }
    }

    /// Precomputed hash of this identity
    pub fn fullhash(&self) -> u32 {
        fullhash(self.file, self.block)
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.0, self.block.0)
    }
}

/// Hash of a (file, block) identity
///
/// Stable for the lifetime of the cachetable; handed to fetch callbacks so
/// they can reuse it.
pub fn fullhash(file: FileId, block: BlockKey) -> u32 {
    let mut h = block.0 ^ (((file.0 as u64) << 32) | file.0 as u64);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h as u32
}

/// Memory accounting for a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairAttr {
    /// Bytes charged against the cachetable budget
    pub size: usize,
    /// Cleaner priority; higher is cleaned first
    pub cache_pressure: usize,
}

impl PairAttr {
    /// Attribute with `size` bytes and no cleaner pressure
    pub fn new(size: usize) -> Self {
        Self {
            size,
            cache_pressure: 0,
        }
    }
}

/// What sits behind the pin lock
pub(crate) struct Resident<V> {
    pub(crate) value: Option<V>,
    pub(crate) disk_data: Option<DiskData>,
}

pub(crate) type ReadGuard<V> = ArcRwLockReadGuard<RawRwLock, Resident<V>>;
pub(crate) type WriteGuard<V> = ArcRwLockWriteGuard<RawRwLock, Resident<V>>;

/// Lifecycle of a pair
#[derive(Debug, Clone)]
pub(crate) enum Phase {
    Fetching,
    Ready,
    Flushing,
    PartialFetching,
    PartialEvicting,
    Evicted,
    FetchFailed(Error),
}

/// A frozen copy of a dirty value, written by `end_checkpoint`
pub(crate) struct Snapshot<V> {
    pub(crate) value: V,
    pub(crate) attr: PairAttr,
}

/// Checkpoint status of a pair
pub(crate) enum CheckpointMark<V> {
    /// Not part of the running checkpoint (or already written)
    Clean,
    /// Write-locked during marking; resolved when that lock is released
    Deferred,
    /// Dirty and not cloneable; the live value must be written before it
    /// is mutated again
    Pending,
    /// Snapshot taken, waiting to be written
    Cloned(Snapshot<V>),
    /// Snapshot being written
    Writing,
}

impl<V> CheckpointMark<V> {
    pub(crate) fn is_clean(&self) -> bool {
        matches!(self, CheckpointMark::Clean)
    }
}

impl<V> fmt::Debug for CheckpointMark<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointMark::Clean => "Clean",
            CheckpointMark::Deferred => "Deferred",
            CheckpointMark::Pending => "Pending",
            CheckpointMark::Cloned(_) => "Cloned",
            CheckpointMark::Writing => "Writing",
        };
        f.write_str(name)
    }
}

pub(crate) struct PairState<V> {
    pub(crate) phase: Phase,
    pub(crate) dirty: bool,
    pub(crate) attr: PairAttr,
    pub(crate) mark: CheckpointMark<V>,
}

impl<V> PairState<V> {
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }

    pub(crate) fn is_gone(&self) -> bool {
        matches!(self.phase, Phase::Evicted | Phase::FetchFailed(_))
    }
}

pub(crate) struct Pair<V> {
    pub(crate) key: PairKey,
    pub(crate) fullhash: u32,
    pub(crate) handle: PairHandle,
    pub(crate) file: Arc<FileShared<V>>,
    pub(crate) value: Arc<RwLock<Resident<V>>>,
    pub(crate) state: Mutex<PairState<V>>,
    /// Clock bit, set on every pin
    pub(crate) referenced: AtomicBool,
    pub(crate) pins: AtomicU32,
}

impl<V> Pair<V> {
    pub(crate) fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }
}

impl<V: Value> Pair<V> {
    pub(crate) fn new(
        handle: PairHandle,
        file: Arc<FileShared<V>>,
        block: BlockKey,
        phase: Phase,
    ) -> Self {
        let key = PairKey::new(file.id, block);
        Self {
            key,
            fullhash: key.fullhash(),
            handle,
            file,
            value: Arc::new(RwLock::new(Resident {
                value: None,
                disk_data: None,
            })),
            state: Mutex::new(PairState {
                phase,
                dirty: false,
                attr: PairAttr::default(),
                mark: CheckpointMark::Clean,
            }),
            referenced: AtomicBool::new(true),
            pins: AtomicU32::new(0),
        }
    }

    pub(crate) fn add_pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
        self.referenced.store(true, Ordering::Release);
    }

    pub(crate) fn drop_pin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pin count underflow on {}", self.key);
    }

    /// Take a checkpoint snapshot of the current value if it is dirty
    ///
    /// Leaves the mark `Cloned` (live value becomes clean), `Pending` when
    /// the object cannot be cloned, or `Clean` when there is nothing to
    /// write.
    pub(crate) fn snapshot_for_checkpoint(
        &self,
        state: &mut PairState<V>,
        resident: &Resident<V>,
        stats: &CachetableStats,
    ) {
        let value = match resident.value.as_ref() {
            Some(value) if state.is_ready() && state.dirty => value,
            _ => {
                state.mark = CheckpointMark::Clean;
                return;
            }
        };
        match self.file.callbacks.clone_for_checkpoint(value, state.attr) {
            Some((value, attr)) => {
                stats.record_clone(attr.size);
                state.mark = CheckpointMark::Cloned(Snapshot { value, attr });
                state.dirty = false;
            }
            None => state.mark = CheckpointMark::Pending,
        }
    }

    /// Resolve a mark deferred while this pair was write-locked
    ///
    /// Must be called by every holder of the write lock before releasing it.
    pub(crate) fn settle(
        &self,
        state: &mut PairState<V>,
        resident: &Resident<V>,
        stats: &CachetableStats,
    ) {
        if matches!(state.mark, CheckpointMark::Deferred) {
            self.snapshot_for_checkpoint(state, resident, stats);
        }
    }
}

impl<V> fmt::Debug for Pair<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pair")
            .field("key", &self.key)
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .finish()
    }
}
