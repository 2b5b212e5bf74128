//! Cachetable statistics tracking

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Counters for cachetable activity
#[derive(Debug, Default)]
pub struct CachetableStats {
    hits: AtomicU64,
    misses: AtomicU64,
    prefetches: AtomicU64,
    fetch_failures: AtomicU64,
    partial_fetches: AtomicU64,
    evictions: AtomicU64,
    partial_evictions: AtomicU64,
    writebacks: AtomicU64,
    checkpoints: AtomicU64,
    clones: AtomicU64,
    cleaner_runs: AtomicU64,
    over_budget_events: AtomicU64,
    cloned_size: AtomicUsize,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident, $doc:literal) => {
        #[doc = concat!("Record ", $doc)]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[doc = concat!("Times recorded: ", $doc)]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl CachetableStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_hit, hits, hits, "a pin of a resident pair");
    counter!(record_miss, misses, misses, "a pin or prefetch that had to fetch");
    counter!(record_prefetch, prefetches, prefetches, "a started prefetch");
    counter!(record_fetch_failure, fetch_failures, fetch_failures, "a failed fetch");
    counter!(record_partial_fetch, partial_fetches, partial_fetches, "a partial fetch");
    counter!(record_eviction, evictions, evictions, "a full eviction");
    counter!(record_partial_eviction, partial_evictions, partial_evictions, "a partial eviction");
    counter!(record_writeback, writebacks, writebacks, "a flush of a dirty value");
    counter!(record_checkpoint, checkpoints, checkpoints, "a completed checkpoint");
    counter!(record_cleaner_run, cleaner_runs, cleaner_runs, "a cleaner callback");
    counter!(record_over_budget, over_budget_events, over_budget_events, "a sweep that could not get under budget");

    /// Record a checkpoint clone of `size` bytes
    pub fn record_clone(&self, size: usize) {
        self.clones.fetch_add(1, Ordering::Relaxed);
        self.cloned_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Record that a clone of `size` bytes was written and dropped
    pub fn record_clone_written(&self, size: usize) {
        self.cloned_size.fetch_sub(size, Ordering::Relaxed);
    }

    /// Total clones taken
    pub fn clones(&self) -> u64 {
        self.clones.load(Ordering::Relaxed)
    }

    /// Bytes currently held by unwritten clones
    pub fn cloned_size(&self) -> usize {
        self.cloned_size.load(Ordering::Relaxed)
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all counters (gauges are left alone)
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.prefetches,
            &self.fetch_failures,
            &self.partial_fetches,
            &self.evictions,
            &self.partial_evictions,
            &self.writebacks,
            &self.checkpoints,
            &self.clones,
            &self.cleaner_runs,
            &self.over_budget_events,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of the counters and size gauges
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Pins served from a resident pair
    pub hits: u64,
    /// Pins and prefetches that fetched
    pub misses: u64,
    /// Prefetches started
    pub prefetches: u64,
    /// Failed fetches
    pub fetch_failures: u64,
    /// Partial fetches
    pub partial_fetches: u64,
    /// Full evictions
    pub evictions: u64,
    /// Partial evictions
    pub partial_evictions: u64,
    /// Dirty values written back
    pub writebacks: u64,
    /// Completed checkpoints
    pub checkpoints: u64,
    /// Checkpoint clones taken
    pub clones: u64,
    /// Cleaner callbacks run
    pub cleaner_runs: u64,
    /// Sweeps that ended over budget with nothing reclaimable
    pub over_budget_events: u64,
    /// Resident pairs
    pub pairs: usize,
    /// Bytes of resident pairs
    pub size_current: usize,
    /// Bytes expected back from in-flight evictions
    pub size_evicting: usize,
    /// Bytes held by unwritten clones
    pub size_cloned: usize,
    /// Configured budget
    pub size_limit: usize,
    /// Hits / (hits + misses)
    pub hit_ratio: f64,
}

impl StatsSnapshot {
    pub(crate) fn from_counters(stats: &CachetableStats) -> Self {
        Self {
            hits: stats.hits(),
            misses: stats.misses(),
            prefetches: stats.prefetches(),
            fetch_failures: stats.fetch_failures(),
            partial_fetches: stats.partial_fetches(),
            evictions: stats.evictions(),
            partial_evictions: stats.partial_evictions(),
            writebacks: stats.writebacks(),
            checkpoints: stats.checkpoints(),
            clones: stats.clones(),
            cleaner_runs: stats.cleaner_runs(),
            over_budget_events: stats.over_budget_events(),
            size_cloned: stats.cloned_size(),
            hit_ratio: stats.hit_ratio(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = CachetableStats::new();

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();

        assert_eq!(stats.hits(), 2);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.hit_ratio(), 2.0 / 3.0);
    }

    #[test]
    fn test_stats_reset() {
        let stats = CachetableStats::new();

        stats.record_hit();
        stats.record_eviction();
        stats.record_clone(64);
        stats.reset();

        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.evictions(), 0);
        assert_eq!(stats.clones(), 0);
        assert_eq!(stats.cloned_size(), 64);
        assert_eq!(stats.hit_ratio(), 0.0);
    }

    #[test]
    fn test_clone_gauge() {
        let stats = CachetableStats::new();

        stats.record_clone(100);
        stats.record_clone(20);
        stats.record_clone_written(100);

        assert_eq!(stats.clones(), 2);
        assert_eq!(stats.cloned_size(), 20);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CachetableStats::new();
        stats.record_writeback();

        let snapshot = StatsSnapshot::from_counters(&stats);
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["writebacks"], 1);
        assert_eq!(json["hits"], 0);
    }
}
