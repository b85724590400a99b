#![forbid(unsafe_code)]
//! Block manager: reference-counted read/write locks over a bounded cache
//! of metadata blocks, with validator-sealed writes and an ordered flush
//! that makes the superblock the single commit point.
//!
//! # Locking strategy
//!
//! A single `parking_lot::Mutex<BlockCache>` protects the lock table,
//! recency list and dirty flags. The access model is single-threaded
//! cooperative, so the mutex is held across the (synchronous) I/O done by
//! eviction and flush; no other path can observe the intermediate state.
//!
//! # Ordered flush
//!
//! Committing the superblock reference runs the crash-consistency protocol:
//! refuse if any other lock is held, write every dirty normal block through
//! its validator's `prepare`, barrier, write the superblock, barrier. A
//! crash before the superblock write leaves the previous superblock
//! authoritative.

pub mod io;
pub mod validator;

mod cache;

pub use cache::BlockType;
pub use io::{BlockIo, device_length, is_block_or_regular};
pub use validator::{NoopValidator, Validator, noop_validator, page_checksum};

use cache::{BlockCache, CacheEntry, LockState};
use cmeta_error::{MetaError, Result};
use cmeta_types::{BlockAddress, MD_BLOCK_SIZE};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct BlockManager {
    io: BlockIo,
    state: Mutex<BlockCache>,
}

impl BlockManager {
    /// Open the metadata device at `path`. `max_concurrent_locks` bounds
    /// both the number of simultaneously held locks and the cache size.
    pub fn open(
        path: impl AsRef<Path>,
        max_concurrent_locks: usize,
        writable: bool,
    ) -> Result<Self> {
        Ok(Self::new(BlockIo::open(path, writable)?, max_concurrent_locks))
    }

    #[must_use]
    pub fn new(io: BlockIo, max_concurrent_locks: usize) -> Self {
        Self {
            io,
            state: Mutex::new(BlockCache::new(max_concurrent_locks)),
        }
    }

    #[must_use]
    pub fn get_nr_blocks(&self) -> u64 {
        self.io.nr_blocks()
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.io.writable()
    }

    /// Take a shared lock on `location`, fetching and validating the block
    /// if it is not resident. Multiple read locks share one cached block.
    pub fn read_lock(
        &self,
        location: BlockAddress,
        v: Arc<dyn Validator>,
    ) -> Result<ReadRef<'_>> {
        let mut st = self.state.lock();
        if !st.contains(location) {
            self.fetch(&mut st, location, Arc::clone(&v), false, BlockType::Normal)?;
        }
        let Some(entry) = st.get_mut(location) else {
            return Err(corrupt_cache(location));
        };
        match entry.lock {
            LockState::Write => return Err(MetaError::Busy { block: location }),
            LockState::Read(n) => entry.lock = LockState::Read(n + 1),
            LockState::Unlocked => entry.lock = LockState::Read(1),
        }
        entry.validator = v;
        let data = Arc::clone(&entry.data);
        st.touch(location);
        Ok(ReadRef {
            bm: self,
            location,
            data,
        })
    }

    /// Take the exclusive lock on `location`. Fails with `Busy` while any
    /// other holder exists.
    pub fn write_lock(
        &self,
        location: BlockAddress,
        v: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_gen(location, v, false, BlockType::Normal)
    }

    /// As [`Self::write_lock`] but zero the buffer instead of reading it.
    pub fn write_lock_zero(
        &self,
        location: BlockAddress,
        v: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_gen(location, v, true, BlockType::Normal)
    }

    /// Exclusive lock on the superblock. Committing the returned reference
    /// with [`Self::commit_superblock`] runs the ordered flush.
    pub fn superblock(
        &self,
        location: BlockAddress,
        v: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_gen(location, v, false, BlockType::Superblock)
    }

    pub fn superblock_zero(
        &self,
        location: BlockAddress,
        v: Arc<dyn Validator>,
    ) -> Result<WriteRef<'_>> {
        self.write_lock_gen(location, v, true, BlockType::Superblock)
    }

    fn write_lock_gen(
        &self,
        location: BlockAddress,
        v: Arc<dyn Validator>,
        zero: bool,
        bt: BlockType,
    ) -> Result<WriteRef<'_>> {
        if !self.io.writable() {
            return Err(MetaError::ReadOnly);
        }
        let mut st = self.state.lock();
        if !st.contains(location) {
            self.fetch(&mut st, location, Arc::clone(&v), zero, bt)?;
        }
        let Some(entry) = st.get_mut(location) else {
            return Err(corrupt_cache(location));
        };
        if entry.lock.is_locked() {
            return Err(MetaError::Busy { block: location });
        }
        entry.lock = LockState::Write;
        entry.validator = v;
        entry.bt = bt;
        if zero {
            entry.data.write().fill(0);
            entry.dirty = true;
        }
        let data = Arc::clone(&entry.data);
        st.touch(location);
        Ok(WriteRef {
            bm: self,
            location,
            data,
            bt,
        })
    }

    /// Write every dirty, unlocked normal block to disk through its
    /// validator's `prepare`. Does not touch the superblock.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        for addr in st.dirty_normals() {
            self.write_back(&mut st, addr)?;
        }
        Ok(())
    }

    /// The commit point: run the ordered flush protocol and release the
    /// superblock lock.
    ///
    /// Fails with `LocksHeld` (before any write reaches disk) if any other
    /// lock entry remains. On any error the reference is still released and
    /// nothing is reported as committed.
    pub fn commit_superblock(&self, sref: WriteRef<'_>) -> Result<()> {
        assert!(
            sref.bt == BlockType::Superblock,
            "commit_superblock requires a superblock reference"
        );
        {
            let mut st = self.state.lock();
            let held = st.held_locks();
            if held > 1 {
                return Err(MetaError::LocksHeld { held: held - 1 });
            }
            for addr in st.dirty_normals() {
                self.write_back(&mut st, addr)?;
            }
        }
        self.io.barrier()?;
        {
            let mut st = self.state.lock();
            self.write_back(&mut st, sref.location)?;
        }
        self.io.barrier()?;
        debug!(event = "superblock_commit", block = sref.location.0);
        drop(sref);
        Ok(())
    }

    fn fetch(
        &self,
        st: &mut BlockCache,
        location: BlockAddress,
        v: Arc<dyn Validator>,
        zero: bool,
        bt: BlockType,
    ) -> Result<()> {
        self.make_room(st)?;
        let mut buf = vec![0_u8; MD_BLOCK_SIZE];
        if !zero {
            self.io.read(location, &mut buf)?;
            v.check(&buf, location)?;
        }
        trace!(event = "block_fetch", block = location.0, zero);
        st.insert(
            location,
            CacheEntry {
                data: Arc::new(RwLock::new(buf)),
                validator: v,
                bt,
                dirty: zero,
                lock: LockState::Unlocked,
            },
        );
        Ok(())
    }

    fn make_room(&self, st: &mut BlockCache) -> Result<()> {
        if !st.is_full() {
            return Ok(());
        }
        if let Some(victim) = st.evict_candidate() {
            let _ = st.remove(victim);
            trace!(event = "cache_evict", block = victim.0);
            return Ok(());
        }

        // Everything is locked or dirty; flush the dirty unlocked blocks
        // and retry once.
        let dirty = st.dirty_normals();
        if dirty.is_empty() {
            return Err(MetaError::CacheFull);
        }
        debug!(event = "cache_flush_for_eviction", blocks = dirty.len());
        for addr in dirty {
            self.write_back(st, addr)?;
        }
        match st.evict_candidate() {
            Some(victim) => {
                let _ = st.remove(victim);
                trace!(event = "cache_evict", block = victim.0);
                Ok(())
            }
            None => Err(MetaError::CacheFull),
        }
    }

    fn write_back(&self, st: &mut BlockCache, addr: BlockAddress) -> Result<()> {
        let Some(entry) = st.get_mut(addr) else {
            return Ok(());
        };
        let mut data = entry.data.write();
        entry.validator.prepare(&mut data, addr);
        self.io.write(addr, &data)?;
        drop(data);
        entry.dirty = false;
        trace!(event = "block_writeback", block = addr.0);
        Ok(())
    }

    fn release(&self, location: BlockAddress) {
        let mut st = self.state.lock();
        if let Some(entry) = st.get_mut(location) {
            entry.lock = match entry.lock {
                LockState::Read(n) if n > 1 => LockState::Read(n - 1),
                _ => LockState::Unlocked,
            };
        }
    }

    fn mark_dirty(&self, location: BlockAddress) {
        let mut st = self.state.lock();
        if let Some(entry) = st.get_mut(location) {
            entry.dirty = true;
        }
    }

    fn add_read_holder(&self, location: BlockAddress) {
        let mut st = self.state.lock();
        if let Some(entry) = st.get_mut(location)
            && let LockState::Read(n) = entry.lock
        {
            entry.lock = LockState::Read(n + 1);
        }
    }

    /// Number of lock-table entries currently held (test/diagnostic hook).
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.state.lock().held_locks()
    }
}

fn corrupt_cache(location: BlockAddress) -> MetaError {
    MetaError::CorruptStructure {
        block: location,
        detail: "cache entry vanished while the state lock was held".to_string(),
    }
}

/// Scoped shared lock. Cloning adds a holder; dropping the last holder
/// removes the lock-table entry.
pub struct ReadRef<'a> {
    bm: &'a BlockManager,
    location: BlockAddress,
    data: Arc<RwLock<Vec<u8>>>,
}

impl ReadRef<'_> {
    #[must_use]
    pub fn location(&self) -> BlockAddress {
        self.location
    }

    /// Borrow the block contents. Do not hold the guard across other
    /// block-manager calls.
    #[must_use]
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }
}

impl Clone for ReadRef<'_> {
    fn clone(&self) -> Self {
        self.bm.add_read_holder(self.location);
        Self {
            bm: self.bm,
            location: self.location,
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for ReadRef<'_> {
    fn drop(&mut self) {
        self.bm.release(self.location);
    }
}

/// Scoped exclusive lock. Mutating through [`WriteRef::data_mut`] marks the
/// block dirty; the dirty block reaches disk on flush or commit.
pub struct WriteRef<'a> {
    bm: &'a BlockManager,
    location: BlockAddress,
    data: Arc<RwLock<Vec<u8>>>,
    bt: BlockType,
}

impl WriteRef<'_> {
    #[must_use]
    pub fn location(&self) -> BlockAddress {
        self.location
    }

    #[must_use]
    pub fn block_type(&self) -> BlockType {
        self.bt
    }

    #[must_use]
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Borrow the block contents mutably, marking the block dirty.
    #[must_use]
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bm.mark_dirty(self.location);
        self.data.write()
    }
}

impl Drop for WriteRef<'_> {
    fn drop(&mut self) {
        self.bm.release(self.location);
    }
}
