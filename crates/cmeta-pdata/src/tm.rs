//! Copy-on-write transaction manager.
//!
//! Wraps the block manager and space map. All structure mutation goes
//! through [`TransactionManager::shadow`]: a block already shadowed in this
//! transaction (or referenced exactly once) is mutated in place; anything
//! else is copied to a fresh block and the source block's count dropped. The
//! committed tree on disk is never touched until the superblock commit.

use crate::space_map::SpaceMap;
use cmeta_block::{BlockManager, ReadRef, Validator, WriteRef};
use cmeta_error::{MetaError, Result};
use cmeta_types::{BlockAddress, SUPERBLOCK_LOCATION};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

pub struct TransactionManager {
    bm: Arc<BlockManager>,
    sm: Arc<Mutex<SpaceMap>>,
    shadows: Mutex<HashSet<u64>>,
}

impl TransactionManager {
    #[must_use]
    pub fn new(bm: Arc<BlockManager>, sm: Arc<Mutex<SpaceMap>>) -> Self {
        Self {
            bm,
            sm,
            shadows: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn bm(&self) -> &BlockManager {
        &self.bm
    }

    #[must_use]
    pub fn sm(&self) -> Arc<Mutex<SpaceMap>> {
        Arc::clone(&self.sm)
    }

    pub fn read(&self, block: BlockAddress, v: Arc<dyn Validator>) -> Result<ReadRef<'_>> {
        self.bm.read_lock(block, v)
    }

    /// Allocate a fresh metadata block (count set to 1) and return a zeroed
    /// write lock on it.
    pub fn new_block(&self, v: Arc<dyn Validator>) -> Result<WriteRef<'_>> {
        let block = self.sm.lock().new_block()?;
        match self.bm.write_lock_zero(block, v) {
            Ok(wr) => {
                self.shadows.lock().insert(block.0);
                trace!(event = "tm_new_block", block = block.0);
                Ok(wr)
            }
            Err(err) => {
                // Hand the count back; the lock never existed.
                self.sm.lock().dec(block)?;
                Err(err)
            }
        }
    }

    /// Get a writable lock on `block`'s contents, copying on write.
    ///
    /// Returns the reference and whether the data moved to a new address.
    /// In-place mutation is only allowed when nothing else references the
    /// block: count exactly 1, not the superblock, not already read-locked
    /// (the write lock fails `Busy` otherwise).
    pub fn shadow(
        &self,
        block: BlockAddress,
        v: Arc<dyn Validator>,
    ) -> Result<(WriteRef<'_>, bool)> {
        let count = self.sm.lock().get(block)?;
        if count == 0 {
            return Err(MetaError::CorruptStructure {
                block,
                detail: "shadow of an unallocated block".to_string(),
            });
        }

        let shadowed = self.shadows.lock().contains(&block.0);
        if shadowed || (count == 1 && block != SUPERBLOCK_LOCATION) {
            let wr = self.bm.write_lock(block, v)?;
            self.shadows.lock().insert(block.0);
            trace!(event = "tm_shadow_in_place", block = block.0);
            return Ok((wr, false));
        }

        let fresh = self.sm.lock().new_block()?;
        let wr = self.bm.write_lock_zero(fresh, Arc::clone(&v))?;
        {
            let original = self.bm.read_lock(block, v)?;
            wr.data_mut().copy_from_slice(&original.data());
        }
        self.sm.lock().dec(block)?;
        self.shadows.lock().insert(fresh.0);
        trace!(event = "tm_shadow_copy", from = block.0, to = fresh.0);
        Ok((wr, true))
    }

    pub fn inc(&self, block: BlockAddress) -> Result<()> {
        self.sm.lock().inc(block)
    }

    pub fn dec(&self, block: BlockAddress) -> Result<()> {
        self.sm.lock().dec(block)
    }

    pub fn refcount(&self, block: BlockAddress) -> Result<u32> {
        self.sm.lock().get(block)
    }

    /// Reset per-transaction state after a successful superblock commit:
    /// blocks written this transaction are no longer in-place mutable, and
    /// blocks freed by it become allocatable.
    pub fn transaction_committed(&self) {
        self.shadows.lock().clear();
        self.sm.lock().clear_quarantine();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmeta_block::noop_validator;
    use cmeta_types::MD_BLOCK_SIZE;
    use std::io::Write;

    fn fixture(nr_blocks: u64) -> (tempfile::NamedTempFile, TransactionManager) {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(&vec![0_u8; (nr_blocks as usize) * MD_BLOCK_SIZE])
            .expect("fill");
        f.flush().expect("flush");

        let bm = Arc::new(BlockManager::open(f.path(), 16, true).expect("open"));
        let mut sm = SpaceMap::new(nr_blocks);
        sm.inc(SUPERBLOCK_LOCATION).expect("superblock count");
        let tm = TransactionManager::new(bm, Arc::new(Mutex::new(sm)));
        (f, tm)
    }

    #[test]
    fn new_blocks_are_zeroed_and_counted() {
        let (_f, tm) = fixture(8);
        let wr = tm.new_block(noop_validator()).expect("alloc");
        assert_eq!(wr.location(), BlockAddress(1));
        assert!(wr.data().iter().all(|b| *b == 0));
        drop(wr);
        assert_eq!(tm.refcount(BlockAddress(1)).expect("count"), 1);
    }

    #[test]
    fn shadow_of_singly_referenced_block_stays_put() {
        let (_f, tm) = fixture(8);
        let block = {
            let wr = tm.new_block(noop_validator()).expect("alloc");
            wr.data_mut()[100] = 7;
            wr.location()
        };
        tm.transaction_committed();

        let (wr, moved) = tm.shadow(block, noop_validator()).expect("shadow");
        assert!(!moved);
        assert_eq!(wr.location(), block);
        assert_eq!(wr.data()[100], 7);
    }

    #[test]
    fn shadow_of_shared_block_copies_and_decs() {
        let (_f, tm) = fixture(8);
        let block = {
            let wr = tm.new_block(noop_validator()).expect("alloc");
            wr.data_mut()[100] = 7;
            wr.location()
        };
        tm.inc(block).expect("second reference");
        tm.transaction_committed();

        let (wr, moved) = tm.shadow(block, noop_validator()).expect("shadow");
        assert!(moved);
        assert_ne!(wr.location(), block);
        assert_eq!(wr.data()[100], 7, "contents copied");
        drop(wr);

        assert_eq!(tm.refcount(block).expect("count"), 1);
    }

    #[test]
    fn repeated_shadow_in_one_transaction_is_in_place() {
        let (_f, tm) = fixture(8);
        let block = {
            let wr = tm.new_block(noop_validator()).expect("alloc");
            wr.location()
        };
        // Even with a second reference, a block this transaction already
        // owns is mutated in place.
        tm.inc(block).expect("inc");
        let (wr, moved) = tm.shadow(block, noop_validator()).expect("shadow");
        assert!(!moved);
        assert_eq!(wr.location(), block);
    }

    #[test]
    fn shadow_of_free_block_is_corruption() {
        let (_f, tm) = fixture(8);
        assert!(matches!(
            tm.shadow(BlockAddress(5), noop_validator()),
            Err(MetaError::CorruptStructure { .. })
        ));
    }

    #[test]
    fn shadow_respects_outstanding_read_locks() {
        let (_f, tm) = fixture(8);
        let block = {
            let wr = tm.new_block(noop_validator()).expect("alloc");
            wr.location()
        };
        tm.transaction_committed();

        let held = tm.read(block, noop_validator()).expect("read lock");
        assert!(matches!(
            tm.shadow(block, noop_validator()),
            Err(MetaError::Busy { .. })
        ));
        drop(held);
        assert!(tm.shadow(block, noop_validator()).is_ok());
    }
}
