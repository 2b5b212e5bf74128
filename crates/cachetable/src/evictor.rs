//! Clock eviction
//!
//! A second-chance sweep over the pair arena. Every pin sets a pair's
//! `referenced` bit; the hand clears set bits and reclaims pairs it finds
//! with the bit already clear, no pins, and no checkpoint work pending.
//!
//! Reclaiming tries a partial eviction first (cheap ones inline, expensive
//! ones on the writer pool). Otherwise a clean pair is dropped on the spot
//! and a dirty one is handed to the writer pool for write-back, staying
//! write-locked (so unpinnable) until the write completes.
//!
//! Running out of candidates while over budget is not an error: the
//! cachetable keeps going over its limit and records the event.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::cachetable::Shared;
use crate::callbacks::{EvictionCost, FlushRequest};
use crate::config::CachetableConfig;
use crate::pair::{Pair, Phase, Value, WriteGuard};

/// Longest a client sleeps above the high watermark per allocation
const MAX_THROTTLE_WAITS: usize = 20;
const THROTTLE_WAIT: Duration = Duration::from_millis(10);

/// Size accounting and the clock hand
#[derive(Debug)]
pub(crate) struct Evictor {
    limit: usize,
    high_watermark: usize,
    size_current: AtomicUsize,
    size_evicting: AtomicUsize,
    hand: Mutex<usize>,
    over_budget: AtomicBool,
    freed_lock: Mutex<()>,
    freed: Condvar,
}

/// Outcome of one attempt at reclaiming a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reclaim {
    Skipped,
    Freed,
    Started,
}

impl Evictor {
    pub(crate) fn new(config: &CachetableConfig) -> Self {
        Self {
            limit: config.size_limit,
            high_watermark: config.high_watermark(),
            size_current: AtomicUsize::new(0),
            size_evicting: AtomicUsize::new(0),
            hand: Mutex::new(0),
            over_budget: AtomicBool::new(false),
            freed_lock: Mutex::new(()),
            freed: Condvar::new(),
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn size_current(&self) -> usize {
        self.size_current.load(Ordering::Acquire)
    }

    pub(crate) fn size_evicting(&self) -> usize {
        self.size_evicting.load(Ordering::Acquire)
    }

    pub(crate) fn grow(&self, bytes: usize) {
        self.size_current.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn shrink(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.size_current.fetch_sub(bytes, Ordering::AcqRel);
        self.freed.notify_all();
    }

    /// Re-account a pair from `old` to `new` bytes; returns the growth
    pub(crate) fn resize(&self, old: usize, new: usize) -> usize {
        if new > old {
            self.grow(new - old);
            new - old
        } else {
            self.shrink(old - new);
            0
        }
    }

    fn begin_evicting(&self, bytes: usize) {
        self.size_evicting.fetch_add(bytes, Ordering::AcqRel);
    }

    fn finish_evicting(&self, bytes: usize) {
        self.size_evicting.fetch_sub(bytes, Ordering::AcqRel);
        self.freed.notify_all();
    }

    /// Resident bytes not already on their way out exceed the limit
    pub(crate) fn over_budget(&self) -> bool {
        self.size_current().saturating_sub(self.size_evicting()) > self.limit
    }

    fn should_throttle(&self) -> bool {
        self.size_current() > self.high_watermark && self.size_evicting() > 0
    }

    fn wait_for_eviction(&self) {
        let mut guard = self.freed_lock.lock();
        self.freed.wait_for(&mut guard, THROTTLE_WAIT);
    }
}

impl<V: Value> Shared<V> {
    /// Inline eviction after the caller grew the cache
    ///
    /// Sweeps until the budget is met (or nothing is reclaimable), then
    /// sleeps briefly while above the high watermark and evictions are
    /// still in flight.
    pub(crate) fn make_room(self: &Arc<Self>) {
        if !self.evictor.over_budget() {
            return;
        }
        self.evict_to_limit();

        let mut waits = 0;
        while self.evictor.should_throttle() && waits < MAX_THROTTLE_WAITS {
            self.evictor.wait_for_eviction();
            waits += 1;
        }
    }

    /// One clock pass down to the budget; returns pairs freed or started
    pub(crate) fn evict_to_limit(self: &Arc<Self>) -> usize {
        let mut reclaimed = 0;
        let mut budget = 2 * self.table.read().len() + 1;

        while self.evictor.over_budget() && budget > 0 {
            budget -= 1;
            let candidate = {
                let table = self.table.read();
                let mut hand = self.evictor.hand.lock();
                table.next_from(&mut hand)
            };
            let Some(pair) = candidate else {
                break;
            };
            if pair.referenced.swap(false, Ordering::AcqRel) {
                continue;
            }
            if self.reclaim(&pair) != Reclaim::Skipped {
                reclaimed += 1;
            }
        }

        self.note_budget();
        reclaimed
    }

    fn note_budget(&self) {
        let stuck = self.evictor.over_budget() && self.evictor.size_evicting() == 0;
        if stuck {
            self.stats.record_over_budget();
            if !self.evictor.over_budget.swap(true, Ordering::AcqRel) {
                warn!(
                    "Cachetable over budget with nothing evictable: {} bytes resident, limit {}",
                    self.evictor.size_current(),
                    self.evictor.limit
                );
            }
        } else if !self.evictor.over_budget() {
            self.evictor.over_budget.store(false, Ordering::Release);
        }
    }

    pub(crate) fn reclaim(self: &Arc<Self>, pair: &Arc<Pair<V>>) -> Reclaim {
        if pair.pin_count() > 0 {
            return Reclaim::Skipped;
        }
        let Some(guard) = pair.value.try_write_arc() else {
            return Reclaim::Skipped;
        };
        let mut state = pair.state.lock();
        if !state.is_ready() || !state.mark.is_clean() || pair.pin_count() > 0 {
            return Reclaim::Skipped;
        }
        let Some(value) = guard.value.as_ref() else {
            return Reclaim::Skipped;
        };

        let (estimate, cost) = pair
            .file
            .callbacks
            .partial_eviction_estimate(value, guard.disk_data.as_ref());
        if estimate > 0 {
            state.phase = Phase::PartialEvicting;
            drop(state);
            return match cost {
                EvictionCost::Cheap => {
                    self.partial_evict(pair, guard, estimate);
                    Reclaim::Freed
                }
                EvictionCost::Expensive => {
                    self.evictor.begin_evicting(estimate);
                    let shared = Arc::clone(self);
                    let pair = Arc::clone(pair);
                    self.pool.execute(move || {
                        shared.partial_evict(&pair, guard, estimate);
                        shared.evictor.finish_evicting(estimate);
                    });
                    Reclaim::Started
                }
            };
        }

        let size = state.attr.size;
        if !state.dirty {
            state.phase = Phase::Evicted;
            drop(state);
            self.discard(pair, guard, size);
            trace!("Evicted clean pair {}", pair.key);
            return Reclaim::Freed;
        }

        state.phase = Phase::Flushing;
        drop(state);
        self.evictor.begin_evicting(size);
        let shared = Arc::clone(self);
        let pair = Arc::clone(pair);
        self.pool.execute(move || {
            shared.write_back_and_evict(&pair, guard);
            shared.evictor.finish_evicting(size);
        });
        Reclaim::Started
    }

    /// Unlink an evicted pair and drop its value
    ///
    /// The caller has already moved the pair to `Evicted` under its write
    /// lock, so waiters that wake up on it retry from the table.
    pub(crate) fn discard(&self, pair: &Pair<V>, mut guard: WriteGuard<V>, size: usize) {
        self.table.write().remove(pair);
        guard.value = None;
        guard.disk_data = None;
        drop(guard);
        self.evictor.shrink(size);
        self.stats.record_eviction();
    }

    fn partial_evict(&self, pair: &Pair<V>, mut guard: WriteGuard<V>, estimate: usize) {
        let freed = {
            let resident = &mut *guard;
            match resident.value.as_mut() {
                Some(value) => pair.file.callbacks.partial_evict(
                    value,
                    resident.disk_data.as_mut(),
                    estimate,
                ),
                None => 0,
            }
        };

        let mut state = pair.state.lock();
        let old = state.attr.size;
        state.attr.size = old.saturating_sub(freed);
        state.phase = Phase::Ready;
        pair.settle(&mut state, &guard, &self.stats);
        let new = state.attr.size;
        drop(state);
        drop(guard);

        self.evictor.shrink(old - new);
        self.stats.record_partial_eviction();
        trace!("Partially evicted {}: {} -> {} bytes", pair.key, old, new);
    }

    fn write_back_and_evict(&self, pair: &Pair<V>, guard: WriteGuard<V>) {
        let attr = pair.state.lock().attr;
        let result = match guard.value.as_ref() {
            Some(value) => pair.file.callbacks.flush(FlushRequest {
                file: &pair.file.block,
                key: pair.key.block,
                value,
                disk_data: guard.disk_data.as_ref(),
                attr,
                for_checkpoint: false,
                keep_resident: false,
                is_clone: false,
            }),
            None => Ok(attr),
        };

        let mut state = pair.state.lock();
        match result {
            Ok(_) => {
                state.phase = Phase::Evicted;
                state.dirty = false;
                pair.settle(&mut state, &guard, &self.stats);
                let size = state.attr.size;
                drop(state);
                self.stats.record_writeback();
                self.discard(pair, guard, size);
                debug!("Wrote back and evicted {}", pair.key);
            }
            Err(err) => {
                state.phase = Phase::Ready;
                pair.settle(&mut state, &guard, &self.stats);
                drop(state);
                drop(guard);
                self.panic(format!("write-back of {} failed: {}", pair.key, err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_reports_growth() {
        let evictor = Evictor::new(&CachetableConfig::with_size_limit(100));

        evictor.grow(40);
        assert_eq!(evictor.resize(40, 70), 30);
        assert_eq!(evictor.size_current(), 70);
        assert_eq!(evictor.resize(70, 10), 0);
        assert_eq!(evictor.size_current(), 10);
    }

    #[test]
    fn test_over_budget_discounts_in_flight() {
        let evictor = Evictor::new(&CachetableConfig::with_size_limit(100));

        evictor.grow(150);
        assert!(evictor.over_budget());
        evictor.begin_evicting(60);
        assert!(!evictor.over_budget());
        evictor.finish_evicting(60);
        assert!(evictor.over_budget());
    }

    #[test]
    fn test_throttle_needs_in_flight_work() {
        let config = CachetableConfig {
            high_watermark_pct: 150,
            ..CachetableConfig::with_size_limit(100)
        };
        let evictor = Evictor::new(&config);

        evictor.grow(200);
        assert!(!evictor.should_throttle());
        evictor.begin_evicting(10);
        assert!(evictor.should_throttle());
    }
}
