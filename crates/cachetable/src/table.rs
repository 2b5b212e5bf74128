//! Pair table
//!
//! Pairs live in an arena of slots addressed by `(index, generation)`.
//! The identity index and per-file membership point into the arena, and
//! the eviction clock is just a cursor over slot indices: it never holds a
//! reference into the table, so inserts and removals under it are safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ahash::RandomState;

use crate::pair::{BlockKey, FileId, Pair, PairKey};

/// Stable address of a pair in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PairHandle {
    index: usize,
    generation: u32,
}

struct Slot<V> {
    generation: u32,
    pair: Option<Arc<Pair<V>>>,
}

pub(crate) struct PairTable<V> {
    slots: Vec<Slot<V>>,
    free_list: Vec<usize>,
    index: HashMap<PairKey, usize, RandomState>,
    by_file: HashMap<FileId, HashSet<BlockKey, RandomState>, RandomState>,
}

impl<V> PairTable<V> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            index: HashMap::with_hasher(RandomState::new()),
            by_file: HashMap::with_hasher(RandomState::new()),
        }
    }

    /// Look up a resident pair
    pub(crate) fn get(&self, key: &PairKey) -> Option<Arc<Pair<V>>> {
        let &idx = self.index.get(key)?;
        self.slots[idx].pair.clone()
    }

    pub(crate) fn contains(&self, key: &PairKey) -> bool {
        self.index.contains_key(key)
    }

    /// Insert a pair built by `make` unless the identity is already present
    pub(crate) fn insert(
        &mut self,
        key: PairKey,
        make: impl FnOnce(PairHandle) -> Pair<V>,
    ) -> Option<Arc<Pair<V>>> {
        if self.index.contains_key(&key) {
            return None;
        }

        let idx = self.alloc_slot();
        let handle = PairHandle {
            index: idx,
            generation: self.slots[idx].generation,
        };
        let pair = Arc::new(make(handle));
        debug_assert_eq!(pair.key, key);

        self.slots[idx].pair = Some(Arc::clone(&pair));
        self.index.insert(key, idx);
        self.by_file
            .entry(key.file)
            .or_insert_with(|| HashSet::with_hasher(RandomState::new()))
            .insert(key.block);
        Some(pair)
    }

    /// Unlink a pair from every index
    ///
    /// Returns false if the slot no longer holds this pair (already removed).
    pub(crate) fn remove(&mut self, pair: &Pair<V>) -> bool {
        let handle = pair.handle;
        let slot = &mut self.slots[handle.index];
        if slot.generation != handle.generation || slot.pair.is_none() {
            return false;
        }
        debug_assert_eq!(pair.pin_count(), 0, "removing pinned pair {}", pair.key);

        slot.pair = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.index.remove(&pair.key);

        if let Some(blocks) = self.by_file.get_mut(&pair.key.file) {
            blocks.remove(&pair.key.block);
            if blocks.is_empty() {
                self.by_file.remove(&pair.key.file);
            }
        }
        true
    }

    /// All resident pairs of one file
    pub(crate) fn pairs_of(&self, file: FileId) -> Vec<Arc<Pair<V>>> {
        let Some(blocks) = self.by_file.get(&file) else {
            return Vec::new();
        };
        let mut pairs: Vec<Arc<Pair<V>>> = blocks
            .iter()
            .filter_map(|block| self.get(&PairKey::new(file, *block)))
            .collect();
        pairs.sort_by_key(|pair| pair.key.block);
        pairs
    }

    /// Number of resident pairs of one file
    pub(crate) fn count_of(&self, file: FileId) -> usize {
        self.by_file.get(&file).map_or(0, HashSet::len)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Pair<V>>> + '_ {
        self.slots.iter().filter_map(|slot| slot.pair.as_ref())
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Advance a clock cursor to the next occupied slot
    pub(crate) fn next_from(&self, hand: &mut usize) -> Option<Arc<Pair<V>>> {
        let n = self.slots.len();
        for _ in 0..n {
            let idx = *hand % n;
            *hand = idx + 1;
            if let Some(pair) = &self.slots[idx].pair {
                return Some(Arc::clone(pair));
            }
        }
        None
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            self.slots.push(Slot {
                generation: 0,
                pair: None,
            });
            self.slots.len() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::FileShared;
    use crate::pair::Phase;
    use tempfile::TempDir;

    fn table_and_file(dir: &TempDir) -> (PairTable<u32>, Arc<FileShared<u32>>) {
        (PairTable::new(), FileShared::for_tests(dir, FileId(1)))
    }

    fn insert(table: &mut PairTable<u32>, file: &Arc<FileShared<u32>>, block: u64) -> Arc<Pair<u32>> {
        let key = PairKey::new(file.id, BlockKey(block));
        table
            .insert(key, |handle| {
                Pair::new(handle, Arc::clone(file), BlockKey(block), Phase::Ready)
            })
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let (mut table, file) = table_and_file(&dir);

        let pair = insert(&mut table, &file, 7);
        let found = table.get(&PairKey::new(FileId(1), BlockKey(7))).unwrap();

        assert!(Arc::ptr_eq(&pair, &found));
        assert_eq!(table.len(), 1);
        assert_eq!(table.count_of(FileId(1)), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut table, file) = table_and_file(&dir);

        insert(&mut table, &file, 1);
        let key = PairKey::new(file.id, BlockKey(1));
        let again = table.insert(key, |handle| {
            Pair::new(handle, Arc::clone(&file), BlockKey(1), Phase::Ready)
        });

        assert!(again.is_none());
    }

    #[test]
    fn test_remove_is_generation_checked() {
        let dir = TempDir::new().unwrap();
        let (mut table, file) = table_and_file(&dir);

        let old = insert(&mut table, &file, 1);
        assert!(table.remove(&old));
        assert!(!table.remove(&old));

        // Slot is reused with a new generation
        let new = insert(&mut table, &file, 2);
        assert_eq!(old.handle.index, new.handle.index);
        assert_ne!(old.handle.generation, new.handle.generation);
        assert!(!table.remove(&old));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_pairs_of_file() {
        let dir = TempDir::new().unwrap();
        let (mut table, file) = table_and_file(&dir);

        for block in [5, 1, 3] {
            insert(&mut table, &file, block);
        }
        let blocks: Vec<u64> = table
            .pairs_of(FileId(1))
            .iter()
            .map(|pair| pair.key.block.0)
            .collect();

        assert_eq!(blocks, vec![1, 3, 5]);
        assert!(table.pairs_of(FileId(9)).is_empty());
    }

    #[test]
    fn test_clock_cursor_skips_holes() {
        let dir = TempDir::new().unwrap();
        let (mut table, file) = table_and_file(&dir);

        let a = insert(&mut table, &file, 1);
        let b = insert(&mut table, &file, 2);
        let c = insert(&mut table, &file, 3);
        table.remove(&b);

        let mut hand = 0;
        assert!(Arc::ptr_eq(&table.next_from(&mut hand).unwrap(), &a));
        assert!(Arc::ptr_eq(&table.next_from(&mut hand).unwrap(), &c));
        assert!(Arc::ptr_eq(&table.next_from(&mut hand).unwrap(), &a));
    }

    #[test]
    fn test_clock_cursor_empty() {
        let table: PairTable<u32> = PairTable::new();
        let mut hand = 3;
        assert!(table.next_from(&mut hand).is_none());
    }
}
