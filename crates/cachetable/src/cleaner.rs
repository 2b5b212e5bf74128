//! Cleaner: background maintenance on high-pressure pairs
//!
//! Each iteration looks at a small window of pairs from its own cursor and
//! hands the unpinned one with the highest `cache_pressure` to the file's
//! `cleaner` callback, under the pair's write lock.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::cachetable::Shared;
use crate::callbacks::CleanerRequest;
use crate::pair::{Pair, Value};

const CLEANER_WINDOW: usize = 8;

impl<V: Value> Shared<V> {
    /// Run the configured number of cleaner iterations; returns pairs cleaned
    pub(crate) fn run_cleaner(self: &Arc<Self>) -> usize {
        let mut cleaned = 0;
        for _ in 0..self.config.cleaner_iterations {
            let Some(pair) = self.pick_for_cleaning() else {
                break;
            };
            if self.clean_pair(&pair) {
                cleaned += 1;
            }
        }
        cleaned
    }

    fn pick_for_cleaning(&self) -> Option<Arc<Pair<V>>> {
        let table = self.table.read();
        let mut hand = self.cleaner_hand.lock();
        let mut best: Option<(usize, Arc<Pair<V>>)> = None;

        for _ in 0..CLEANER_WINDOW.min(table.len()) {
            let Some(pair) = table.next_from(&mut hand) else {
                break;
            };
            if pair.pin_count() > 0 {
                continue;
            }
            let pressure = {
                let state = pair.state.lock();
                if !state.is_ready() {
                    continue;
                }
                state.attr.cache_pressure
            };
            if pressure > 0 && best.as_ref().map_or(true, |(top, _)| pressure > *top) {
                best = Some((pressure, pair));
            }
        }
        best.map(|(_, pair)| pair)
    }

    fn clean_pair(self: &Arc<Self>, pair: &Pair<V>) -> bool {
        let Some(mut guard) = pair.value.try_write_arc() else {
            return false;
        };
        if pair.pin_count() > 0 || !pair.state.lock().is_ready() {
            self.release_unpinned(pair, guard);
            return false;
        }
        if self.write_pending_in_place(pair, &guard).is_err() {
            self.release_unpinned(pair, guard);
            return false;
        }

        let result = {
            let resident = &mut *guard;
            match resident.value.as_mut() {
                Some(value) => pair.file.callbacks.cleaner(CleanerRequest {
                    file: &pair.file.block,
                    key: pair.key.block,
                    value,
                    disk_data: resident.disk_data.as_mut(),
                }),
                None => Ok(None),
            }
        };

        let mut state = pair.state.lock();
        let grew = match result {
            Ok(Some(attr)) => {
                state.dirty = true;
                let grew = self.evictor.resize(state.attr.size, attr.size);
                state.attr = attr;
                grew
            }
            Ok(None) => 0,
            Err(err) => {
                warn!("Cleaner on {} failed: {}", pair.key, err);
                0
            }
        };
        pair.settle(&mut state, &guard, &self.stats);
        drop(state);
        drop(guard);

        self.stats.record_cleaner_run();
        trace!("Cleaned {}", pair.key);
        if grew > 0 {
            self.make_room();
        }
        true
    }
}
