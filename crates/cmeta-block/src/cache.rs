//! Bounded LRU over decoded metadata blocks.
//!
//! Each resident block carries its buffer, its validator, its dirty flag and
//! its lock-table entry. Eviction only ever considers blocks that are neither
//! locked nor dirty; the manager flushes and retries before giving up with
//! `CacheFull`.

use crate::validator::Validator;
use cmeta_types::BlockAddress;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Superblock,
    Normal,
}

/// Lock-table state for one cached block.
///
/// Invariants: `Write` excludes every other holder; `Read(n)` has `n >= 1`;
/// the entry is `Unlocked` once the last holder drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Read(usize),
    Write,
}

impl LockState {
    #[must_use]
    pub fn is_locked(self) -> bool {
        !matches!(self, Self::Unlocked)
    }
}

pub struct CacheEntry {
    pub data: Arc<RwLock<Vec<u8>>>,
    pub validator: Arc<dyn Validator>,
    pub bt: BlockType,
    pub dirty: bool,
    pub lock: LockState,
}

/// LRU cache of [`CacheEntry`] keyed by block address.
///
/// The recency list holds every resident address, least recent at the front.
pub struct BlockCache {
    capacity: usize,
    entries: HashMap<BlockAddress, CacheEntry>,
    lru: VecDeque<BlockAddress>,
}

impl BlockCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    #[must_use]
    pub fn contains(&self, addr: BlockAddress) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn get_mut(&mut self, addr: BlockAddress) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&addr)
    }

    pub fn insert(&mut self, addr: BlockAddress, entry: CacheEntry) {
        debug_assert!(!self.entries.contains_key(&addr));
        self.entries.insert(addr, entry);
        self.lru.push_back(addr);
    }

    /// Move `addr` to the most-recently-used position.
    pub fn touch(&mut self, addr: BlockAddress) {
        if let Some(pos) = self.lru.iter().position(|a| *a == addr) {
            let _ = self.lru.remove(pos);
            self.lru.push_back(addr);
        }
    }

    /// Least-recently-used entry that is neither locked nor dirty.
    #[must_use]
    pub fn evict_candidate(&self) -> Option<BlockAddress> {
        self.lru.iter().copied().find(|addr| {
            self.entries
                .get(addr)
                .is_some_and(|e| !e.lock.is_locked() && !e.dirty)
        })
    }

    pub fn remove(&mut self, addr: BlockAddress) -> Option<CacheEntry> {
        if let Some(pos) = self.lru.iter().position(|a| *a == addr) {
            let _ = self.lru.remove(pos);
        }
        self.entries.remove(&addr)
    }

    /// Number of lock-table entries currently held.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.entries.values().filter(|e| e.lock.is_locked()).count()
    }

    /// Addresses of dirty, unlocked `Normal` blocks in LRU order.
    #[must_use]
    pub fn dirty_normals(&self) -> Vec<BlockAddress> {
        self.lru
            .iter()
            .copied()
            .filter(|addr| {
                self.entries.get(addr).is_some_and(|e| {
                    e.dirty && !e.lock.is_locked() && e.bt == BlockType::Normal
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::noop_validator;

    fn entry(lock: LockState, dirty: bool) -> CacheEntry {
        CacheEntry {
            data: Arc::new(RwLock::new(vec![0_u8; 8])),
            validator: noop_validator(),
            bt: BlockType::Normal,
            dirty,
            lock,
        }
    }

    #[test]
    fn lru_order_drives_eviction() {
        let mut cache = BlockCache::new(3);
        cache.insert(BlockAddress(1), entry(LockState::Unlocked, false));
        cache.insert(BlockAddress(2), entry(LockState::Unlocked, false));
        cache.insert(BlockAddress(3), entry(LockState::Unlocked, false));

        // Touching 1 makes 2 the least recently used.
        cache.touch(BlockAddress(1));
        assert_eq!(cache.evict_candidate(), Some(BlockAddress(2)));
    }

    #[test]
    fn locked_and_dirty_blocks_are_not_candidates() {
        let mut cache = BlockCache::new(3);
        cache.insert(BlockAddress(1), entry(LockState::Read(1), false));
        cache.insert(BlockAddress(2), entry(LockState::Unlocked, true));
        assert_eq!(cache.evict_candidate(), None);

        cache.insert(BlockAddress(3), entry(LockState::Unlocked, false));
        assert_eq!(cache.evict_candidate(), Some(BlockAddress(3)));
    }

    #[test]
    fn held_locks_counts_every_kind() {
        let mut cache = BlockCache::new(4);
        cache.insert(BlockAddress(1), entry(LockState::Read(3), false));
        cache.insert(BlockAddress(2), entry(LockState::Write, true));
        cache.insert(BlockAddress(3), entry(LockState::Unlocked, false));
        assert_eq!(cache.held_locks(), 2);
    }

    #[test]
    fn dirty_normals_skips_locked_entries() {
        let mut cache = BlockCache::new(4);
        cache.insert(BlockAddress(1), entry(LockState::Unlocked, true));
        cache.insert(BlockAddress(2), entry(LockState::Write, true));
        let mut sb = entry(LockState::Unlocked, true);
        sb.bt = BlockType::Superblock;
        cache.insert(BlockAddress(0), sb);

        assert_eq!(cache.dirty_normals(), vec![BlockAddress(1)]);
    }
}
