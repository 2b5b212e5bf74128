//! Pinning protocol
//!
//! A pin is the pair's value lock held in read or write mode, wrapped in a
//! [`PinnedPair`] guard that unpins on drop. Getting there may mean:
//!
//! - a cold miss: the pair is reserved in the table write-locked by the
//!   fetching thread, so concurrent callers block on the same lock and see
//!   the fetched value (or the same fetch error);
//! - a partial fetch, when the resident value lacks what the caller needs;
//! - writing a checkpoint-pending, non-cloneable value in place before a
//!   write pin may change it.
//!
//! The non-blocking variant never waits for any of these. It hands the I/O
//! to the writer pool and returns [`PinOutcome::Busy`] with a token the
//! caller can wait on after releasing whatever it must not hold while
//! blocked.

use std::fmt;
use std::sync::Arc;

use parking_lot::ArcRwLockWriteGuard;
use tracing::{debug, trace};

use crate::cachefile::FileShared;
use crate::cachetable::Shared;
use crate::callbacks::{FetchCallbacks, FetchRequest, FlushRequest, PartialFetchRequest};
use crate::error::{Error, Result};
use crate::pair::{
    BlockKey, CheckpointMark, DiskData, Pair, PairAttr, PairKey, Phase, ReadGuard, Resident,
    Value, WriteGuard,
};

/// Access requested by a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Shared with other readers
    Read,
    /// Exclusive; the only mode that may modify the value
    Write,
}

pub(crate) enum PinGuard<V> {
    Read(ReadGuard<V>),
    Write(WriteGuard<V>),
}

impl<V> PinGuard<V> {
    fn resident(&self) -> &Resident<V> {
        match self {
            PinGuard::Read(guard) => &**guard,
            PinGuard::Write(guard) => &**guard,
        }
    }

    fn mode(&self) -> PinMode {
        match self {
            PinGuard::Read(_) => PinMode::Read,
            PinGuard::Write(_) => PinMode::Write,
        }
    }

    fn value(&self) -> Option<&V> {
        self.resident().value.as_ref()
    }
}

/// A pinned pair; unpins (clean) when dropped
pub struct PinnedPair<V: Value> {
    shared: Arc<Shared<V>>,
    pair: Arc<Pair<V>>,
    guard: Option<PinGuard<V>>,
}

impl<V: Value> PinnedPair<V> {
    fn new(shared: Arc<Shared<V>>, pair: Arc<Pair<V>>, guard: PinGuard<V>) -> Self {
        Self {
            shared,
            pair,
            guard: Some(guard),
        }
    }

    fn guard(&self) -> &PinGuard<V> {
        // INVARIANT: the guard is only taken by unpin/remove, which consume self
        self.guard.as_ref().expect("pinned pair without guard")
    }

    fn write_guard(&mut self) -> Option<&mut WriteGuard<V>> {
        match self.guard.as_mut() {
            Some(PinGuard::Write(guard)) => Some(guard),
            _ => None,
        }
    }

    /// Identity of the pinned pair
    pub fn key(&self) -> PairKey {
        self.pair.key
    }

    /// Block within the cachefile
    pub fn block(&self) -> BlockKey {
        self.pair.key.block
    }

    /// Precomputed identity hash
    pub fn fullhash(&self) -> u32 {
        self.pair.fullhash
    }

    /// Mode the pair is pinned in
    pub fn mode(&self) -> PinMode {
        self.guard().mode()
    }

    /// The pinned value
    pub fn value(&self) -> &V {
        // INVARIANT: a pair is only admitted for pinning once its value is resident
        self.guard().value().expect("pinned pair without value")
    }

    /// Mutable access; `None` for read pins
    pub fn value_mut(&mut self) -> Option<&mut V> {
        self.write_guard().and_then(|guard| guard.value.as_mut())
    }

    /// Auxiliary state produced by fetch
    pub fn disk_data(&self) -> Option<&DiskData> {
        self.guard().resident().disk_data.as_ref()
    }

    /// Mutable auxiliary state; `None` for read pins
    pub fn disk_data_mut(&mut self) -> Option<&mut DiskData> {
        self.write_guard().and_then(|guard| guard.disk_data.as_mut())
    }

    /// Current memory accounting
    pub fn attr(&self) -> PairAttr {
        self.pair.state.lock().attr
    }

    /// Whether the pair needs writing back
    pub fn is_dirty(&self) -> bool {
        self.pair.state.lock().dirty
    }

    /// Release the pin
    ///
    /// # Arguments
    /// * `dirty` - The value was modified; dirtiness is sticky until written
    /// * `attr` - New accounting if the value changed size
    ///
    /// # Returns
    /// * `Err(Panicked)` if the cachetable can no longer write anything back
    pub fn unpin(mut self, dirty: bool, attr: Option<PairAttr>) -> Result<()> {
        if let Some(guard) = self.guard.take() {
            self.shared.release_pin(&self.pair, guard, dirty, attr);
        }
        self.shared.check_panicked()
    }

    /// Unpin and drop the pair without writing it back (e.g. a freed block)
    ///
    /// Checkpoint work pending on the pair is completed first.
    pub fn remove(mut self) -> Result<()> {
        match self.guard.take() {
            Some(PinGuard::Write(guard)) => self.shared.remove_pinned(&self.pair, guard),
            Some(guard) => {
                let key = self.pair.key;
                self.shared.release_pin(&self.pair, guard, false, None);
                Err(Error::NotWritePinned(key))
            }
            None => Ok(()),
        }
    }
}

impl<V: Value> Drop for PinnedPair<V> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.shared.release_pin(&self.pair, guard, false, None);
        }
    }
}

impl<V: Value> fmt::Debug for PinnedPair<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedPair")
            .field("key", &self.pair.key)
            .field("mode", &self.guard.as_ref().map(PinGuard::mode))
            .finish()
    }
}

/// Result of a non-blocking pin
pub enum PinOutcome<V: Value> {
    /// The pair is pinned
    Pinned(PinnedPair<V>),
    /// The pair is busy (fetch, flush, or checkpoint write in flight)
    Busy(RetryToken<V>),
}

impl<V: Value> PinOutcome<V> {
    /// Is this a "try again"?
    pub fn is_busy(&self) -> bool {
        matches!(self, PinOutcome::Busy(_))
    }

    /// The pin, if one was obtained
    pub fn pinned(self) -> Option<PinnedPair<V>> {
        match self {
            PinOutcome::Pinned(pinned) => Some(pinned),
            PinOutcome::Busy(_) => None,
        }
    }
}

impl<V: Value> fmt::Debug for PinOutcome<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinOutcome::Pinned(pinned) => f.debug_tuple("Pinned").field(pinned).finish(),
            PinOutcome::Busy(token) => f.debug_tuple("Busy").field(&token.key()).finish(),
        }
    }
}

/// Handle to wait on the work that made a non-blocking pin busy
pub struct RetryToken<V: Value> {
    shared: Arc<Shared<V>>,
    pair: Arc<Pair<V>>,
    mode: PinMode,
}

impl<V: Value> RetryToken<V> {
    /// Pair the caller was trying to pin
    pub fn key(&self) -> PairKey {
        self.pair.key
    }

    /// Block until the contended pair can be locked in the requested mode
    ///
    /// Call after releasing external locks; then retry the pin.
    pub fn wait(self) {
        match self.mode {
            PinMode::Read => drop(self.pair.value.read_arc()),
            PinMode::Write => {
                let guard = self.pair.value.write_arc();
                self.shared.release_unpinned(&self.pair, guard);
            }
        }
    }
}

/// A pinned pair whose dirtiness is tied to a `put`
pub struct Dependent<'a, V: Value> {
    /// The pinned dependent
    pub pinned: &'a PinnedPair<V>,
    /// Mark it dirty as part of the put
    pub dirty: bool,
}

impl<V: Value> Shared<V> {
    /// Blocking pin
    pub(crate) fn pin(
        self: &Arc<Self>,
        file: &Arc<FileShared<V>>,
        block: BlockKey,
        mode: PinMode,
        fetch: &dyn FetchCallbacks<V>,
    ) -> Result<PinnedPair<V>> {
        let key = PairKey::new(file.id, block);
        loop {
            self.check_usable()?;
            let existing = self.table.read().get(&key);
            let pair = match existing {
                Some(pair) => pair,
                None => {
                    let Some((pair, guard)) = self.reserve(file, block)? else {
                        continue;
                    };
                    self.stats.record_miss();
                    let guard = self.run_fetch(&pair, guard, fetch)?;
                    pair.add_pin();
                    let guard = match mode {
                        PinMode::Read => PinGuard::Read(ArcRwLockWriteGuard::downgrade(guard)),
                        PinMode::Write => PinGuard::Write(guard),
                    };
                    let pinned = PinnedPair::new(Arc::clone(self), pair, guard);
                    self.make_room();
                    return Ok(pinned);
                }
            };

            let guard = match mode {
                PinMode::Read => PinGuard::Read(pair.value.read_arc()),
                PinMode::Write => PinGuard::Write(pair.value.write_arc()),
            };
            if !self.check_phase(&pair)? {
                continue;
            }

            let needs_partial = guard
                .value()
                .map_or(false, |value| fetch.partial_fetch_required(value));
            let (guard, grew) = if needs_partial {
                match self.partial_fetch_locked(&pair, guard, fetch)? {
                    Some(done) => done,
                    None => continue,
                }
            } else {
                (guard, 0)
            };

            if let PinGuard::Write(write) = &guard {
                self.write_pending_in_place(&pair, write)?;
            }
            pair.add_pin();
            self.stats.record_hit();
            let pinned = PinnedPair::new(Arc::clone(self), pair, guard);
            if grew > 0 {
                self.make_room();
            }
            return Ok(pinned);
        }
    }

    /// Non-blocking pin
    pub(crate) fn try_pin(
        self: &Arc<Self>,
        file: &Arc<FileShared<V>>,
        block: BlockKey,
        mode: PinMode,
        fetch: &Arc<dyn FetchCallbacks<V>>,
    ) -> Result<PinOutcome<V>> {
        let key = PairKey::new(file.id, block);
        loop {
            self.check_usable()?;
            let existing = self.table.read().get(&key);
            let Some(pair) = existing else {
                let Some((pair, guard)) = self.reserve(file, block)? else {
                    continue;
                };
                self.stats.record_miss();
                self.spawn_fetch(Arc::clone(&pair), guard, Arc::clone(fetch));
                return Ok(PinOutcome::Busy(self.retry_token(pair, mode)));
            };

            let guard = match mode {
                PinMode::Read => pair.value.try_read_arc().map(PinGuard::Read),
                PinMode::Write => pair.value.try_write_arc().map(PinGuard::Write),
            };
            let Some(guard) = guard else {
                trace!("Pair {} busy", key);
                return Ok(PinOutcome::Busy(self.retry_token(pair, mode)));
            };
            if !self.check_phase(&pair)? {
                continue;
            }

            let needs_partial = guard
                .value()
                .map_or(false, |value| fetch.partial_fetch_required(value));
            if needs_partial {
                self.release_guard(&pair, guard);
                self.spawn_partial_fetch(Arc::clone(&pair), Arc::clone(fetch));
                return Ok(PinOutcome::Busy(self.retry_token(pair, mode)));
            }
            if mode == PinMode::Write
                && matches!(pair.state.lock().mark, CheckpointMark::Pending)
            {
                self.release_guard(&pair, guard);
                self.spawn_checkpoint_write(Arc::clone(&pair));
                return Ok(PinOutcome::Busy(self.retry_token(pair, mode)));
            }

            pair.add_pin();
            self.stats.record_hit();
            return Ok(PinOutcome::Pinned(PinnedPair::new(
                Arc::clone(self),
                pair,
                guard,
            )));
        }
    }

    /// Pin only if resident and usable without any I/O
    pub(crate) fn maybe_pin(
        self: &Arc<Self>,
        file: &Arc<FileShared<V>>,
        block: BlockKey,
        mode: PinMode,
    ) -> Result<Option<PinnedPair<V>>> {
        self.check_usable()?;
        let key = PairKey::new(file.id, block);
        let Some(pair) = self.table.read().get(&key) else {
            return Ok(None);
        };
        let guard = match mode {
            PinMode::Read => pair.value.try_read_arc().map(PinGuard::Read),
            PinMode::Write => pair.value.try_write_arc().map(PinGuard::Write),
        };
        let Some(guard) = guard else {
            return Ok(None);
        };
        {
            let state = pair.state.lock();
            let pending = mode == PinMode::Write && matches!(state.mark, CheckpointMark::Pending);
            if !state.is_ready() || pending {
                drop(state);
                self.release_guard(&pair, guard);
                return Ok(None);
            }
        }
        pair.add_pin();
        self.stats.record_hit();
        Ok(Some(PinnedPair::new(Arc::clone(self), pair, guard)))
    }

    /// Insert a brand-new dirty pair, returned write-pinned
    ///
    /// Runs inside the checkpoint marking exclusion. Dependents that still
    /// owe the running checkpoint a write are snapshotted (or written in
    /// place) first, so that checkpoint gets their state from before the
    /// put. The new pair and the dependents' new dirtiness always belong
    /// to the next checkpoint.
    pub(crate) fn put(
        self: &Arc<Self>,
        file: &Arc<FileShared<V>>,
        block: BlockKey,
        value: V,
        attr: PairAttr,
        dependents: &[Dependent<'_, V>],
    ) -> Result<PinnedPair<V>> {
        self.check_usable()?;
        let key = PairKey::new(file.id, block);

        let pinned = {
            let _marking = self.checkpoint.pending_lock.read();
            for dep in dependents {
                let pair = &dep.pinned.pair;
                let resident = dep.pinned.guard().resident();
                pair.settle(&mut pair.state.lock(), resident, &self.stats);
                self.write_pending_in_place(pair, resident)?;
            }

            let (pair, mut guard) = {
                let mut table = self.table.write();
                if file.is_closing() {
                    return Err(Error::FileClosed);
                }
                let pair = table
                    .insert(key, |handle| {
                        Pair::new(handle, Arc::clone(file), block, Phase::Ready)
                    })
                    .ok_or(Error::DuplicateKey(key))?;
                let guard = pair.value.write_arc();
                (pair, guard)
            };
            guard.value = Some(value);
            {
                let mut state = pair.state.lock();
                state.dirty = true;
                state.attr = attr;
            }
            for dep in dependents.iter().filter(|dep| dep.dirty) {
                dep.pinned.pair.state.lock().dirty = true;
            }

            self.evictor.grow(attr.size);
            pair.add_pin();
            trace!("Put {} ({} bytes, {} dependents)", key, attr.size, dependents.len());
            PinnedPair::new(Arc::clone(self), pair, PinGuard::Write(guard))
        };
        self.make_room();
        Ok(pinned)
    }

    /// Start warming a pair in the background; true if work was started
    pub(crate) fn prefetch(
        self: &Arc<Self>,
        file: &Arc<FileShared<V>>,
        block: BlockKey,
        fetch: Arc<dyn FetchCallbacks<V>>,
    ) -> Result<bool> {
        self.check_usable()?;
        let key = PairKey::new(file.id, block);

        let existing = self.table.read().get(&key);
        if let Some(pair) = existing {
            let Some(guard) = pair.value.try_read_arc() else {
                return Ok(false);
            };
            let needs_partial = matches!(self.check_phase(&pair), Ok(true))
                && guard
                    .value
                    .as_ref()
                    .map_or(false, |value| fetch.partial_fetch_required(value));
            drop(guard);
            if needs_partial {
                self.stats.record_prefetch();
                self.spawn_partial_fetch(pair, fetch);
            }
            return Ok(needs_partial);
        }

        match self.reserve(file, block)? {
            Some((pair, guard)) => {
                self.stats.record_miss();
                self.stats.record_prefetch();
                self.spawn_fetch(pair, guard, fetch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reserve a missing pair, write-locked by the caller
    fn reserve(
        &self,
        file: &Arc<FileShared<V>>,
        block: BlockKey,
    ) -> Result<Option<(Arc<Pair<V>>, WriteGuard<V>)>> {
        let key = PairKey::new(file.id, block);
        let mut table = self.table.write();
        if file.is_closing() {
            return Err(Error::FileClosed);
        }
        let Some(pair) = table.insert(key, |handle| {
            Pair::new(handle, Arc::clone(file), block, Phase::Fetching)
        }) else {
            return Ok(None);
        };
        let guard = pair.value.write_arc();
        Ok(Some((pair, guard)))
    }

    /// Run the fetch callback for a reserved pair
    ///
    /// On failure the pair is marked failed and unlinked; threads already
    /// waiting on its lock get the same error.
    fn run_fetch(
        &self,
        pair: &Pair<V>,
        mut guard: WriteGuard<V>,
        fetch: &dyn FetchCallbacks<V>,
    ) -> Result<WriteGuard<V>> {
        let result = fetch.fetch(FetchRequest {
            file: &pair.file.block,
            key: pair.key.block,
            fullhash: pair.fullhash,
        });

        match result {
            Ok(fetched) => {
                guard.value = Some(fetched.value);
                guard.disk_data = fetched.disk_data;
                let mut state = pair.state.lock();
                state.phase = Phase::Ready;
                state.dirty = fetched.dirty;
                state.attr = fetched.attr;
                pair.settle(&mut state, &guard, &self.stats);
                drop(state);
                self.evictor.grow(fetched.attr.size);
                trace!("Fetched {} ({} bytes)", pair.key, fetched.attr.size);
                Ok(guard)
            }
            Err(source) => {
                let err = Error::Fetch {
                    key: pair.key,
                    source,
                };
                {
                    let mut state = pair.state.lock();
                    state.phase = Phase::FetchFailed(err.clone());
                    state.mark = CheckpointMark::Clean;
                }
                self.table.write().remove(pair);
                drop(guard);
                self.stats.record_fetch_failure();
                debug!("{}", err);
                Err(err)
            }
        }
    }

    fn spawn_fetch(
        self: &Arc<Self>,
        pair: Arc<Pair<V>>,
        guard: WriteGuard<V>,
        fetch: Arc<dyn FetchCallbacks<V>>,
    ) {
        let shared = Arc::clone(self);
        self.pool.execute(move || match shared.run_fetch(&pair, guard, &*fetch) {
            Ok(guard) => {
                drop(guard);
                shared.make_room();
            }
            Err(err) => debug!("Background fetch failed: {}", err),
        });
    }

    fn spawn_partial_fetch(self: &Arc<Self>, pair: Arc<Pair<V>>, fetch: Arc<dyn FetchCallbacks<V>>) {
        let shared = Arc::clone(self);
        self.pool.execute(move || {
            let mut guard = pair.value.write_arc();
            if !matches!(shared.check_phase(&pair), Ok(true)) {
                return;
            }
            match shared.complete_partial_fetch(&pair, &mut guard, &*fetch) {
                Ok(grew) => {
                    drop(guard);
                    if grew > 0 {
                        shared.make_room();
                    }
                }
                Err(err) => {
                    drop(guard);
                    debug!("Background partial fetch failed: {}", err);
                }
            }
        });
    }

    fn spawn_checkpoint_write(self: &Arc<Self>, pair: Arc<Pair<V>>) {
        let shared = Arc::clone(self);
        self.pool.execute(move || shared.write_pending(&pair));
    }

    /// Partial fetch for a blocking pin, returning the guard in its
    /// original mode; `None` if the pair vanished meanwhile
    fn partial_fetch_locked(
        &self,
        pair: &Pair<V>,
        guard: PinGuard<V>,
        fetch: &dyn FetchCallbacks<V>,
    ) -> Result<Option<(PinGuard<V>, usize)>> {
        let mode = guard.mode();
        let mut write = match guard {
            PinGuard::Write(write) => write,
            PinGuard::Read(read) => {
                drop(read);
                let write = pair.value.write_arc();
                if !self.check_phase(pair)? {
                    self.release_unpinned(pair, write);
                    return Ok(None);
                }
                write
            }
        };
        let grew = match self.complete_partial_fetch(pair, &mut write, fetch) {
            Ok(grew) => grew,
            Err(err) => {
                self.release_unpinned(pair, write);
                return Err(err);
            }
        };
        let guard = match mode {
            PinMode::Read => PinGuard::Read(ArcRwLockWriteGuard::downgrade(write)),
            PinMode::Write => PinGuard::Write(write),
        };
        Ok(Some((guard, grew)))
    }

    /// Partial fetch under a write lock; returns the growth in bytes
    fn complete_partial_fetch(
        &self,
        pair: &Pair<V>,
        guard: &mut WriteGuard<V>,
        fetch: &dyn FetchCallbacks<V>,
    ) -> Result<usize> {
        let required = guard
            .value
            .as_ref()
            .map_or(false, |value| fetch.partial_fetch_required(value));
        if !required {
            return Ok(0);
        }

        let before = {
            let mut state = pair.state.lock();
            state.phase = Phase::PartialFetching;
            state.attr
        };
        let result = {
            let resident = &mut **guard;
            match resident.value.as_mut() {
                Some(value) => fetch.partial_fetch(PartialFetchRequest {
                    file: &pair.file.block,
                    key: pair.key.block,
                    value,
                    disk_data: resident.disk_data.as_mut(),
                }),
                None => Ok(before),
            }
        };

        let mut state = pair.state.lock();
        state.phase = Phase::Ready;
        match result {
            Ok(attr) => {
                let grew = self.evictor.resize(state.attr.size, attr.size);
                state.attr = attr;
                pair.settle(&mut state, guard, &self.stats);
                self.stats.record_partial_fetch();
                Ok(grew)
            }
            Err(source) => {
                pair.settle(&mut state, guard, &self.stats);
                Err(Error::PartialFetch {
                    key: pair.key,
                    source,
                })
            }
        }
    }

    /// Write a checkpoint-pending, non-cloneable value before it is changed
    pub(crate) fn write_pending_in_place(&self, pair: &Pair<V>, resident: &Resident<V>) -> Result<()> {
        let attr = {
            let state = pair.state.lock();
            if !matches!(state.mark, CheckpointMark::Pending) {
                return Ok(());
            }
            state.attr
        };
        let Some(value) = resident.value.as_ref() else {
            pair.state.lock().mark = CheckpointMark::Clean;
            return Ok(());
        };

        let result = pair.file.callbacks.flush(FlushRequest {
            file: &pair.file.block,
            key: pair.key.block,
            value,
            disk_data: resident.disk_data.as_ref(),
            attr,
            for_checkpoint: true,
            keep_resident: true,
            is_clone: false,
        });

        let mut state = pair.state.lock();
        match result {
            Ok(new_attr) => {
                state.mark = CheckpointMark::Clean;
                state.dirty = false;
                self.evictor.resize(state.attr.size, new_attr.size);
                state.attr = new_attr;
                drop(state);
                self.stats.record_writeback();
                trace!("Wrote {} in place for checkpoint", pair.key);
                Ok(())
            }
            Err(err) => {
                drop(state);
                Err(self.panic(format!(
                    "checkpoint write of {} failed: {}",
                    pair.key, err
                )))
            }
        }
    }

    /// Is the locked pair usable? `Ok(false)` means it was evicted: retry.
    fn check_phase(&self, pair: &Pair<V>) -> Result<bool> {
        let state = pair.state.lock();
        match &state.phase {
            Phase::Ready => Ok(true),
            Phase::FetchFailed(err) => Err(err.clone()),
            _ => Ok(false),
        }
    }

    pub(crate) fn release_pin(
        self: &Arc<Self>,
        pair: &Pair<V>,
        guard: PinGuard<V>,
        dirty: bool,
        attr: Option<PairAttr>,
    ) {
        let grew = {
            let mut state = pair.state.lock();
            if dirty {
                state.dirty = true;
            }
            let grew = match attr {
                Some(attr) => {
                    let grew = self.evictor.resize(state.attr.size, attr.size);
                    state.attr = attr;
                    grew
                }
                None => 0,
            };
            if let PinGuard::Write(write) = &guard {
                pair.settle(&mut state, write, &self.stats);
            }
            pair.drop_pin();
            grew
        };
        drop(guard);

        if grew > 0 || self.evictor.over_budget() {
            self.make_room();
        }
    }

    /// Drop a lock that was taken without a pin
    fn release_guard(&self, pair: &Pair<V>, guard: PinGuard<V>) {
        match guard {
            PinGuard::Read(read) => drop(read),
            PinGuard::Write(write) => self.release_unpinned(pair, write),
        }
    }

    /// Drop a write lock that was taken without a pin
    pub(crate) fn release_unpinned(&self, pair: &Pair<V>, guard: WriteGuard<V>) {
        let mut state = pair.state.lock();
        pair.settle(&mut state, &guard, &self.stats);
        drop(state);
        drop(guard);
    }

    pub(crate) fn remove_pinned(&self, pair: &Pair<V>, mut guard: WriteGuard<V>) -> Result<()> {
        let pending_write = {
            let mut state = pair.state.lock();
            pair.settle(&mut state, &guard, &self.stats);
            matches!(state.mark, CheckpointMark::Pending)
        };
        let result = if pending_write {
            self.write_pending_in_place(pair, &guard)
        } else {
            Ok(())
        };

        let size = {
            let mut state = pair.state.lock();
            state.phase = Phase::Evicted;
            state.dirty = false;
            if matches!(state.mark, CheckpointMark::Pending) {
                state.mark = CheckpointMark::Clean;
            }
            pair.drop_pin();
            state.attr.size
        };
        self.table.write().remove(pair);
        guard.value = None;
        guard.disk_data = None;
        drop(guard);
        self.evictor.shrink(size);
        trace!("Removed {}", pair.key);
        result
    }

    fn retry_token(self: &Arc<Self>, pair: Arc<Pair<V>>, mode: PinMode) -> RetryToken<V> {
        RetryToken {
            shared: Arc::clone(self),
            pair,
            mode,
        }
    }
}
