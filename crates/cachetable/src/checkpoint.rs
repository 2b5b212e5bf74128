//! Checkpoint coordinator
//!
//! `begin_checkpoint` logs a begin record, then marks every resident pair
//! in one pass with client operations and new-pair insertion excluded:
//!
//! - dirty pairs that are unlocked or only read-pinned are snapshotted
//!   right away via `clone_for_checkpoint` (the live pair becomes clean);
//! - objects that cannot be cloned are left `Pending` and are written in
//!   place by whoever first needs to modify them, or by `end_checkpoint`;
//! - pairs write-locked during marking are `Deferred`: the lock holder
//!   snapshots them when it releases the lock, so its critical section is
//!   ordered before the checkpoint.
//!
//! `end_checkpoint` writes everything still pending, lets every file
//! persist its metadata, records completion in the log and trims it.
//!
//! Lock order: the operation lock, then the marking lock, then the table.
//! A thread holding an [`OperationGuard`] must not begin a checkpoint.

use std::sync::Arc;

use ftdisk::Lsn;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, trace, warn};

use crate::cachetable::Shared;
use crate::callbacks::FlushRequest;
use crate::cachefile::FileShared;
use crate::error::{CallbackError, Error, Result};
use crate::log::CheckpointLog;
use crate::pair::{CheckpointMark, Pair, PairState, Snapshot, Value};

pub(crate) struct CheckpointState {
    pub(crate) in_progress: Option<Lsn>,
    pub(crate) last_lsn: Option<Lsn>,
}

pub(crate) struct Checkpointer<V> {
    log: Arc<dyn CheckpointLog>,
    state: Mutex<CheckpointState>,
    idle: Condvar,
    pending: Mutex<Vec<Arc<Pair<V>>>>,
    /// Excludes marking from `put`, so the dependents of a new pair settle
    /// their checkpoint work before the put changes them
    pub(crate) pending_lock: RwLock<()>,
    op_lock: RwLock<()>,
}

/// Shared guard that keeps checkpoint marking out of a multi-pair operation
///
/// Not reentrant: acquire it once, before pinning.
#[must_use = "the operation ends when the guard is dropped"]
pub struct OperationGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl<V> Checkpointer<V> {
    pub(crate) fn new(log: Arc<dyn CheckpointLog>) -> Self {
        Self {
            log,
            state: Mutex::new(CheckpointState {
                in_progress: None,
                last_lsn: None,
            }),
            idle: Condvar::new(),
            pending: Mutex::new(Vec::new()),
            pending_lock: RwLock::new(()),
            op_lock: RwLock::new(()),
        }
    }

    pub(crate) fn begin_operation(&self) -> OperationGuard<'_> {
        OperationGuard {
            _guard: self.op_lock.read_recursive(),
        }
    }

    fn take_pending(&self) -> Vec<Arc<Pair<V>>> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Block until no checkpoint runs; holding the guard keeps it that way
    pub(crate) fn wait_idle(&self) -> MutexGuard<'_, CheckpointState> {
        let mut state = self.state.lock();
        while state.in_progress.is_some() {
            self.idle.wait(&mut state);
        }
        state
    }

    pub(crate) fn in_progress(&self) -> Option<Lsn> {
        self.state.lock().in_progress
    }

    pub(crate) fn last_lsn(&self) -> Option<Lsn> {
        self.state.lock().last_lsn
    }

    fn abandon(&self) {
        self.state.lock().in_progress = None;
        self.idle.notify_all();
    }

    fn finish(&self, lsn: Lsn) {
        let mut state = self.state.lock();
        state.in_progress = None;
        state.last_lsn = Some(lsn);
        drop(state);
        self.idle.notify_all();
    }
}

impl<V: Value> Shared<V> {
    pub(crate) fn begin_checkpoint(&self) -> Result<Lsn> {
        self.check_usable()?;
        let lsn = {
            let mut state = self.checkpoint.state.lock();
            if state.in_progress.is_some() {
                return Err(Error::CheckpointInProgress);
            }
            let lsn = self.checkpoint.log.begin_checkpoint().map_err(Error::Log)?;
            state.in_progress = Some(lsn);
            lsn
        };
        if let Err(err) = self.checkpoint.log.fsync_up_to(lsn) {
            self.checkpoint.abandon();
            return Err(Error::Log(err));
        }

        let marked = self.mark_for_checkpoint();
        let files = self.files.lock().files();
        for file in &files {
            file.callbacks.checkpoint_begun(&file.block, lsn);
        }
        info!("Began checkpoint {} ({} pairs pending)", lsn, marked);
        Ok(lsn)
    }

    /// Mark every resident pair; returns how many carry checkpoint work
    fn mark_for_checkpoint(&self) -> usize {
        let _ops = self.checkpoint.op_lock.write();
        let _marking = self.checkpoint.pending_lock.write();
        let mut marked = Vec::new();

        let table = self.table.read();
        for pair in table.iter() {
            let mut state = pair.state.lock();
            if state.is_gone() {
                continue;
            }
            match pair.value.try_read_recursive() {
                Some(resident) => {
                    if state.dirty {
                        pair.snapshot_for_checkpoint(&mut state, &resident, &self.stats);
                    }
                }
                None => state.mark = CheckpointMark::Deferred,
            }
            if !state.mark.is_clean() {
                trace!("Marked {} {:?}", pair.key, state.mark);
                marked.push(Arc::clone(pair));
            }
        }
        drop(table);

        let count = marked.len();
        self.checkpoint.pending.lock().extend(marked);
        count
    }

    pub(crate) fn end_checkpoint(self: &Arc<Self>) -> Result<()> {
        let lsn = self
            .checkpoint
            .in_progress()
            .ok_or(Error::NoCheckpointInProgress)?;

        let mut written = 0;
        loop {
            let batch = self.checkpoint.take_pending();
            if batch.is_empty() {
                break;
            }
            written += batch.len();

            // Snapshots go to the writer pool; live values are written here,
            // since they may have to wait for a lock held by a pool job
            let (tx, rx) = flume::unbounded();
            let mut live = Vec::new();
            for pair in batch {
                if matches!(pair.state.lock().mark, CheckpointMark::Cloned(_)) {
                    let shared = Arc::clone(self);
                    let tx = tx.clone();
                    self.pool.execute(move || {
                        shared.write_pending(&pair);
                        let _ = tx.send(());
                    });
                } else {
                    live.push(pair);
                }
            }
            drop(tx);
            for pair in &live {
                self.write_pending(pair);
            }
            rx.iter().for_each(drop);
        }

        if let Err(err) = self.check_panicked() {
            self.checkpoint.abandon();
            return Err(err);
        }

        let files = self.files.lock().files();
        for file in &files {
            if let Err(err) = self.persist_file(file, lsn) {
                let err = self.panic(format!(
                    "checkpoint {} of {} failed: {}",
                    lsn,
                    file.path.display(),
                    err
                ));
                self.checkpoint.abandon();
                return Err(err);
            }
        }

        if let Err(err) = self.checkpoint.log.note_checkpoint(lsn) {
            self.checkpoint.abandon();
            return Err(Error::Log(err));
        }
        if let Err(err) = self.checkpoint.log.trim_before(lsn) {
            warn!("Trimming log before {} failed: {}", lsn, err);
        }

        self.checkpoint.finish(lsn);
        self.stats.record_checkpoint();
        for file in &files {
            file.callbacks.checkpoint_ended(&file.block, lsn);
        }
        info!("Checkpoint {} complete ({} pairs written)", lsn, written);
        Ok(())
    }

    fn persist_file(&self, file: &FileShared<V>, lsn: Lsn) -> std::result::Result<(), CallbackError> {
        if file.block.is_read_only() {
            return Ok(());
        }
        file.callbacks.checkpoint_written(&file.block, lsn)?;
        file.block.checkpoint()?;
        debug!("Persisted {} for checkpoint {}", file.path.display(), lsn);
        Ok(())
    }

    /// Complete whatever checkpoint work a pair carries
    pub(crate) fn write_pending(&self, pair: &Pair<V>) {
        let mut state = pair.state.lock();
        wait_written(&mut state);
        match std::mem::replace(&mut state.mark, CheckpointMark::Writing) {
            CheckpointMark::Cloned(snapshot) => {
                drop(state);
                self.write_snapshot(pair, snapshot);
            }
            mark @ (CheckpointMark::Deferred | CheckpointMark::Pending) => {
                state.mark = mark;
                drop(state);
                self.write_live(pair);
            }
            mark => state.mark = mark,
        }
    }

    fn write_snapshot(&self, pair: &Pair<V>, snapshot: Snapshot<V>) {
        let result = pair.file.callbacks.flush(FlushRequest {
            file: &pair.file.block,
            key: pair.key.block,
            value: &snapshot.value,
            disk_data: None,
            attr: snapshot.attr,
            for_checkpoint: true,
            keep_resident: true,
            is_clone: true,
        });
        pair.state.lock().mark = CheckpointMark::Clean;
        self.stats.record_clone_written(snapshot.attr.size);

        match result {
            Ok(_) => {
                self.stats.record_writeback();
                trace!("Wrote snapshot of {}", pair.key);
            }
            Err(err) => {
                self.panic(format!("checkpoint write of {} failed: {}", pair.key, err));
            }
        }
    }

    /// Write a deferred or non-cloneable pair, waiting out any writer
    fn write_live(&self, pair: &Pair<V>) {
        let guard = pair.value.read_arc();
        let mut state = pair.state.lock();
        if matches!(state.mark, CheckpointMark::Deferred) {
            pair.snapshot_for_checkpoint(&mut state, &guard, &self.stats);
        }

        match std::mem::replace(&mut state.mark, CheckpointMark::Writing) {
            CheckpointMark::Cloned(snapshot) => {
                drop(state);
                drop(guard);
                self.write_snapshot(pair, snapshot);
            }
            CheckpointMark::Pending => {
                let attr = state.attr;
                drop(state);
                let result = match guard.value.as_ref() {
                    Some(value) => pair.file.callbacks.flush(FlushRequest {
                        file: &pair.file.block,
                        key: pair.key.block,
                        value,
                        disk_data: guard.disk_data.as_ref(),
                        attr,
                        for_checkpoint: true,
                        keep_resident: true,
                        is_clone: false,
                    }),
                    None => Ok(attr),
                };

                let mut state = pair.state.lock();
                state.mark = CheckpointMark::Clean;
                match result {
                    Ok(new_attr) => {
                        state.dirty = false;
                        self.evictor.resize(state.attr.size, new_attr.size);
                        state.attr = new_attr;
                        drop(state);
                        self.stats.record_writeback();
                        trace!("Wrote {} in place for checkpoint", pair.key);
                    }
                    Err(err) => {
                        drop(state);
                        self.panic(format!("checkpoint write of {} failed: {}", pair.key, err));
                    }
                }
            }
            mark => state.mark = mark,
        }
    }

    /// Write back every dirty pair of a file, keeping them resident
    pub(crate) fn flush_file(&self, file: &FileShared<V>) -> Result<()> {
        self.check_usable()?;
        let pairs = self.table.read().pairs_of(file.id);
        let mut written = 0;

        for pair in &pairs {
            let guard = pair.value.write_arc();
            let mut state = pair.state.lock();
            pair.settle(&mut state, &guard, &self.stats);
            wait_written(&mut state);
            let cloned = matches!(state.mark, CheckpointMark::Cloned(_));
            drop(state);

            // The running checkpoint's copy has to reach the file before
            // the newer live value does
            if cloned {
                self.write_pending(pair);
            }
            let pending_written = self.write_pending_in_place(pair, &guard);

            let mut state = pair.state.lock();
            if let Err(err) = pending_written {
                pair.settle(&mut state, &guard, &self.stats);
                return Err(err);
            }
            if !state.is_ready() || !state.dirty {
                pair.settle(&mut state, &guard, &self.stats);
                continue;
            }
            let attr = state.attr;
            drop(state);

            let result = match guard.value.as_ref() {
                Some(value) => file.callbacks.flush(FlushRequest {
                    file: &file.block,
                    key: pair.key.block,
                    value,
                    disk_data: guard.disk_data.as_ref(),
                    attr,
                    for_checkpoint: false,
                    keep_resident: true,
                    is_clone: false,
                }),
                None => Ok(attr),
            };

            let mut state = pair.state.lock();
            match result {
                Ok(new_attr) => {
                    state.dirty = false;
                    self.evictor.resize(state.attr.size, new_attr.size);
                    state.attr = new_attr;
                    pair.settle(&mut state, &guard, &self.stats);
                    written += 1;
                    self.stats.record_writeback();
                }
                Err(err) => {
                    pair.settle(&mut state, &guard, &self.stats);
                    drop(state);
                    drop(guard);
                    return Err(self.panic(format!("flush of {} failed: {}", pair.key, err)));
                }
            }
        }
        debug!("Flushed {} of {} pairs of {}", written, pairs.len(), file.path.display());
        Ok(())
    }
}

/// Wait out a snapshot write started by another thread
///
/// Snapshot writes hold no value lock, so this may run under one.
fn wait_written<V>(state: &mut MutexGuard<'_, PairState<V>>) {
    while matches!(state.mark, CheckpointMark::Writing) {
        MutexGuard::unlocked(state, std::thread::yield_now);
    }
}
