//! Cachetable: the bounded, concurrent cache of pairs

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ftdisk::{Lsn, OpenFlags};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::background::{join_all, spawn_periodic, StopSignal};
use crate::cachefile::{CacheFile, FileRegistry, FileShared};
use crate::callbacks::{FetchCallbacks, PairCallbacks};
use crate::checkpoint::{Checkpointer, OperationGuard};
use crate::config::CachetableConfig;
use crate::error::{Error, Result};
use crate::evictor::Evictor;
use crate::log::{CheckpointLog, NullLog};
use crate::pair::{BlockKey, PairAttr, PairKey, Value};
use crate::pin::{Dependent, PinMode, PinOutcome, PinnedPair};
use crate::pool::WorkerPool;
use crate::stats::{CachetableStats, StatsSnapshot};
use crate::table::PairTable;

/// State shared by the cachetable, its cachefiles, pins and worker jobs
pub(crate) struct Shared<V> {
    pub(crate) config: CachetableConfig,
    pub(crate) table: RwLock<PairTable<V>>,
    pub(crate) files: Mutex<FileRegistry<V>>,
    pub(crate) files_changed: Condvar,
    pub(crate) evictor: Evictor,
    pub(crate) checkpoint: Checkpointer<V>,
    pub(crate) pool: WorkerPool,
    pub(crate) stats: CachetableStats,
    pub(crate) cleaner_hand: Mutex<usize>,
    panic_reason: Mutex<Option<Arc<str>>>,
    panicked: AtomicBool,
    shut_down: AtomicBool,
}

impl<V> Shared<V> {
    /// Put the cachetable into the panicked state
    ///
    /// A failed write-back means memory and disk no longer agree, so every
    /// later operation is refused. The first reason wins.
    pub(crate) fn panic(&self, reason: String) -> Error {
        let mut slot = self.panic_reason.lock();
        let reason = Arc::clone(slot.get_or_insert_with(|| {
            error!("Cachetable panicked: {}", reason);
            Arc::from(reason)
        }));
        self.panicked.store(true, Ordering::Release);
        Error::Panicked(reason)
    }

    pub(crate) fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    pub(crate) fn check_panicked(&self) -> Result<()> {
        if !self.is_panicked() {
            return Ok(());
        }
        let reason = self
            .panic_reason
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::from("unknown"));
        Err(Error::Panicked(reason))
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        self.check_panicked()?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }
}

/// Resident state of one pair, for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairInfo {
    /// Needs writing back
    pub dirty: bool,
    /// Current pin count
    pub pins: u32,
    /// Memory accounting
    pub attr: PairAttr,
    /// Carries unwritten work for the running checkpoint
    pub checkpoint_pending: bool,
}

/// A bounded cache of file blocks with clock eviction and online checkpoints
///
/// Values are opaque to the cachetable; everything object-specific goes
/// through the callbacks registered per cachefile ([`PairCallbacks`]) and
/// supplied per pin ([`FetchCallbacks`]).
pub struct Cachetable<V: Value> {
    shared: Arc<Shared<V>>,
    signal: Arc<StopSignal>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<V: Value> Cachetable<V> {
    /// Create a cachetable whose checkpoints are not logged
    ///
    /// # Arguments
    /// * `config` - Budget, pool size and background periods
    ///
    /// # Returns
    /// * `Result<Cachetable<V>>` - Running cachetable with its workers started
    pub fn new(config: CachetableConfig) -> Result<Self> {
        Self::with_log(config, Arc::new(NullLog::new()))
    }

    /// Create a cachetable that records checkpoints in `log`
    pub fn with_log(config: CachetableConfig, log: Arc<dyn CheckpointLog>) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new("ct-writer", config.writer_threads)?;

        let shared = Arc::new(Shared {
            evictor: Evictor::new(&config),
            checkpoint: Checkpointer::new(log),
            config,
            table: RwLock::new(PairTable::new()),
            files: Mutex::new(FileRegistry::new()),
            files_changed: Condvar::new(),
            pool,
            stats: CachetableStats::new(),
            cleaner_hand: Mutex::new(0),
            panic_reason: Mutex::new(None),
            panicked: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });

        let signal = StopSignal::new();
        let mut threads = Vec::new();
        if let Err(e) = Self::spawn_workers(&shared, &signal, &mut threads) {
            join_all(&signal, threads);
            shared.pool.shutdown();
            return Err(e.into());
        }

        info!(
            "Cachetable started: limit {} bytes, {} writer threads, {} background threads",
            shared.config.size_limit,
            shared.config.writer_threads,
            threads.len()
        );
        Ok(Self {
            shared,
            signal,
            threads: Mutex::new(threads),
        })
    }

    fn spawn_workers(
        shared: &Arc<Shared<V>>,
        signal: &Arc<StopSignal>,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> std::io::Result<()> {
        let config = &shared.config;

        if let Some(period) = CachetableConfig::period(config.eviction_period_ms) {
            let shared = Arc::clone(shared);
            threads.push(spawn_periodic("ct-evictor", period, Arc::clone(signal), move || {
                if shared.check_usable().is_ok() && shared.evictor.over_budget() {
                    shared.evict_to_limit();
                }
            })?);
        }

        if let Some(period) = CachetableConfig::period(config.checkpoint_period_ms) {
            let shared = Arc::clone(shared);
            threads.push(spawn_periodic("ct-checkpointer", period, Arc::clone(signal), move || {
                if shared.check_usable().is_err() {
                    return;
                }
                match shared.begin_checkpoint().and_then(|_| shared.end_checkpoint()) {
                    Ok(()) | Err(Error::CheckpointInProgress) => {}
                    Err(e) => warn!("Periodic checkpoint failed: {}", e),
                }
            })?);
        }

        if let Some(period) = CachetableConfig::period(config.cleaner_period_ms) {
            let shared = Arc::clone(shared);
            threads.push(spawn_periodic("ct-cleaner", period, Arc::clone(signal), move || {
                if shared.check_usable().is_ok() {
                    shared.run_cleaner();
                }
            })?);
        }

        Ok(())
    }

    /// Open (or share) a backing file
    ///
    /// Opening a path that is already open returns another handle onto the
    /// same cachefile; its pairs are shared and `callbacks` is ignored.
    ///
    /// # Arguments
    /// * `path` - Block file path
    /// * `flags` - Create / read-only flags for the block file
    /// * `callbacks` - Flush, eviction, checkpoint and cleaner behaviour
    pub fn open_file<P: AsRef<Path>>(
        &self,
        path: P,
        flags: OpenFlags,
        callbacks: Arc<dyn PairCallbacks<V>>,
    ) -> Result<CacheFile<V>> {
        self.shared.open_file(path.as_ref(), flags, callbacks)
    }

    fn file<'f>(&self, file: &'f CacheFile<V>) -> Result<&'f Arc<FileShared<V>>> {
        debug_assert!(file.is_for(&self.shared), "cachefile of another cachetable");
        file.shared()
    }

    /// Pin a pair, fetching it on a miss; blocks until the pin is granted
    ///
    /// # Arguments
    /// * `file` - Owning cachefile
    /// * `key` - Block to pin
    /// * `mode` - Read (shared) or write (exclusive)
    /// * `fetch` - Fetch / partial-fetch behaviour for this call
    ///
    /// # Returns
    /// * `Err(Fetch)` if the fetch failed; the pair is not left resident
    pub fn get_and_pin(
        &self,
        file: &CacheFile<V>,
        key: BlockKey,
        mode: PinMode,
        fetch: &dyn FetchCallbacks<V>,
    ) -> Result<PinnedPair<V>> {
        self.shared.pin(self.file(file)?, key, mode, fetch)
    }

    /// Pin a pair without ever waiting for I/O or a contended lock
    ///
    /// Any needed fetch, partial fetch or checkpoint write is started in the
    /// background and [`PinOutcome::Busy`] is returned.
    pub fn get_and_pin_nonblocking(
        &self,
        file: &CacheFile<V>,
        key: BlockKey,
        mode: PinMode,
        fetch: &Arc<dyn FetchCallbacks<V>>,
    ) -> Result<PinOutcome<V>> {
        self.shared.try_pin(self.file(file)?, key, mode, fetch)
    }

    /// Pin only if resident, uncontended and usable without I/O
    pub fn maybe_get_and_pin(
        &self,
        file: &CacheFile<V>,
        key: BlockKey,
        mode: PinMode,
    ) -> Result<Option<PinnedPair<V>>> {
        self.shared.maybe_pin(self.file(file)?, key, mode)
    }

    /// Insert a new dirty pair, returned write-pinned
    ///
    /// # Returns
    /// * `Err(DuplicateKey)` if the block is already resident
    pub fn put(
        &self,
        file: &CacheFile<V>,
        key: BlockKey,
        value: V,
        attr: PairAttr,
    ) -> Result<PinnedPair<V>> {
        self.shared.put(self.file(file)?, key, value, attr, &[])
    }

    /// Insert a new dirty pair and dirty already-pinned dependents, atomically
    /// with respect to checkpoint marking
    pub fn put_with_dependents(
        &self,
        file: &CacheFile<V>,
        key: BlockKey,
        value: V,
        attr: PairAttr,
        dependents: &[Dependent<'_, V>],
    ) -> Result<PinnedPair<V>> {
        self.shared.put(self.file(file)?, key, value, attr, dependents)
    }

    /// Warm a pair in the background
    ///
    /// # Returns
    /// * `Ok(true)` if a fetch or partial fetch was started
    pub fn prefetch(
        &self,
        file: &CacheFile<V>,
        key: BlockKey,
        fetch: Arc<dyn FetchCallbacks<V>>,
    ) -> Result<bool> {
        self.shared.prefetch(self.file(file)?, key, fetch)
    }

    /// Write back every dirty pair of a file, keeping them resident
    pub fn flush_file(&self, file: &CacheFile<V>) -> Result<()> {
        self.shared.flush_file(self.file(file)?)
    }

    /// Start a checkpoint: log it and mark every resident pair
    ///
    /// # Returns
    /// * `Result<Lsn>` - LSN of the begin-checkpoint record
    pub fn begin_checkpoint(&self) -> Result<Lsn> {
        self.shared.begin_checkpoint()
    }

    /// Write everything the running checkpoint still owes and record it
    pub fn end_checkpoint(&self) -> Result<()> {
        self.shared.end_checkpoint()
    }

    /// Run a full checkpoint
    pub fn checkpoint(&self) -> Result<Lsn> {
        let lsn = self.shared.begin_checkpoint()?;
        self.shared.end_checkpoint()?;
        Ok(lsn)
    }

    /// Keep checkpoint marking out of a multi-pair operation
    pub fn begin_operation(&self) -> OperationGuard<'_> {
        self.shared.checkpoint.begin_operation()
    }

    /// Run one eviction pass; returns pairs freed or queued for write-back
    pub fn evict(&self) -> usize {
        self.shared.evict_to_limit()
    }

    /// Run the cleaner once; returns pairs cleaned
    pub fn run_cleaner(&self) -> usize {
        self.shared.run_cleaner()
    }

    /// Bytes of resident pairs
    pub fn size_current(&self) -> usize {
        self.shared.evictor.size_current()
    }

    /// Bytes expected back from in-flight evictions
    pub fn size_evicting(&self) -> usize {
        self.shared.evictor.size_evicting()
    }

    /// Configured budget
    pub fn size_limit(&self) -> usize {
        self.shared.evictor.limit()
    }

    /// Resident pairs
    pub fn len(&self) -> usize {
        self.shared.table.read().len()
    }

    /// No resident pairs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is the block resident?
    pub fn contains(&self, file: &CacheFile<V>, key: BlockKey) -> bool {
        self.shared
            .table
            .read()
            .contains(&PairKey::new(file.id(), key))
    }

    /// Inspect a resident pair without pinning it
    pub fn pair_info(&self, file: &CacheFile<V>, key: BlockKey) -> Option<PairInfo> {
        let pair = self.shared.table.read().get(&PairKey::new(file.id(), key))?;
        let state = pair.state.lock();
        Some(PairInfo {
            dirty: state.dirty,
            pins: pair.pin_count(),
            attr: state.attr,
            checkpoint_pending: !state.mark.is_clean(),
        })
    }

    /// Live counters
    pub fn stats(&self) -> &CachetableStats {
        &self.shared.stats
    }

    /// Counters and size gauges at this instant
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pairs: self.len(),
            size_current: self.size_current(),
            size_evicting: self.size_evicting(),
            size_limit: self.size_limit(),
            ..StatsSnapshot::from_counters(&self.shared.stats)
        }
    }

    /// LSN of the last completed checkpoint
    pub fn last_checkpoint_lsn(&self) -> Option<Lsn> {
        self.shared.checkpoint.last_lsn()
    }

    /// LSN of the running checkpoint
    pub fn checkpoint_in_progress(&self) -> Option<Lsn> {
        self.shared.checkpoint.in_progress()
    }

    /// Why the cachetable panicked, if it did
    pub fn panic_reason(&self) -> Option<Arc<str>> {
        self.shared.panic_reason.lock().clone()
    }

    /// Configuration in effect
    pub fn config(&self) -> &CachetableConfig {
        &self.shared.config
    }

    /// Shut down: stop background threads and the writer pool
    ///
    /// # Returns
    /// * `Err(FilesStillOpen)` while any cachefile is open
    pub fn close(&self) -> Result<()> {
        let open = self.shared.files.lock().len();
        if open > 0 {
            return Err(Error::FilesStillOpen(open));
        }
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_workers();
        info!("Cachetable shut down");
        Ok(())
    }

    fn stop_workers(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        join_all(&self.signal, threads);
        self.shared.pool.shutdown();
    }
}

impl<V: Value> Drop for Cachetable<V> {
    fn drop(&mut self) {
        if !self.shared.shut_down.swap(true, Ordering::AcqRel) {
            let open = self.shared.files.lock().len();
            if open > 0 {
                warn!("Cachetable dropped with {} cachefiles open", open);
            }
            self.stop_workers();
        }
    }
}

impl<V: Value> fmt::Debug for Cachetable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cachetable")
            .field("pairs", &self.len())
            .field("size_current", &self.size_current())
            .field("size_limit", &self.size_limit())
            .field("pool", &self.shared.pool)
            .finish()
    }
}
