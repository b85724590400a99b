//! Reference counts for every metadata block; the allocator.
//!
//! The in-core table is a plain count per block. On disk it is stored as
//! count pages (packed le32) behind one index page, rewritten from scratch
//! at every commit. The table is self-describing: the pages written at
//! commit are allocated first, so their own counts land in the table they
//! carry.
//!
//! Blocks freed inside a transaction are quarantined until the commit
//! lands, so the committed tree never loses a block it still references.

use crate::pages::{
    ARRAY_PAGE_MAGIC, INDEX_CAPACITY, INDEX_PAGE_MAGIC, PAGE_HEADER_SIZE, PageHeader,
    array_page_validator, entry_offset, index_page_validator,
};
use crate::tm::TransactionManager;
use cmeta_block::BlockManager;
use cmeta_error::{MetaError, Result};
use cmeta_types::{
    BlockAddress, read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Size of the opaque root blob embedded in the superblock.
pub const SPACE_MAP_ROOT_SIZE: usize = 128;

/// le32 reference counts per count page.
pub const COUNTS_PER_PAGE: u64 = (crate::pages::PAGE_PAYLOAD / 4) as u64;

/// Decoded form of the 128-byte root blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceMapRoot {
    pub nr_blocks: u64,
    pub nr_allocated: u64,
    pub index_root: BlockAddress,
}

impl SpaceMapRoot {
    #[must_use]
    pub fn encode(&self) -> [u8; SPACE_MAP_ROOT_SIZE] {
        let mut blob = [0_u8; SPACE_MAP_ROOT_SIZE];
        write_le_u64(&mut blob, 0, self.nr_blocks);
        write_le_u64(&mut blob, 8, self.nr_allocated);
        write_le_u64(&mut blob, 16, self.index_root.0);
        blob
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        Ok(Self {
            nr_blocks: read_le_u64(blob, 0)?,
            nr_allocated: read_le_u64(blob, 8)?,
            index_root: BlockAddress(read_le_u64(blob, 16)?),
        })
    }

    /// A freshly formatted superblock carries an all-zero blob; block 0 can
    /// never hold the index page, so zero means "not written yet".
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.index_root.0 != 0
    }
}

/// In-core reference counts. Count of 0 means free.
pub struct SpaceMap {
    counts: Vec<u32>,
    nr_allocated: u64,
    quarantine: HashSet<u64>,
    generation: u64,
}

impl SpaceMap {
    #[must_use]
    pub fn new(nr_blocks: u64) -> Self {
        Self {
            counts: vec![0; nr_blocks as usize],
            nr_allocated: 0,
            quarantine: HashSet::new(),
            generation: 0,
        }
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u64 {
        self.counts.len() as u64
    }

    #[must_use]
    pub fn nr_allocated(&self) -> u64 {
        self.nr_allocated
    }

    /// Bumped on every mutation; lets the commit path detect that the
    /// table changed underneath a serialization pass.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn slot(&self, block: BlockAddress) -> Result<usize> {
        if block.0 >= self.nr_blocks() {
            return Err(MetaError::OutOfRange {
                context: "space map block",
                value: block.0,
                limit: self.nr_blocks(),
            });
        }
        Ok(block.0 as usize)
    }

    pub fn get(&self, block: BlockAddress) -> Result<u32> {
        Ok(self.counts[self.slot(block)?])
    }

    pub fn inc(&mut self, block: BlockAddress) -> Result<()> {
        let slot = self.slot(block)?;
        if self.counts[slot] == 0 {
            self.nr_allocated += 1;
        }
        self.counts[slot] += 1;
        self.generation += 1;
        trace!(event = "sm_inc", block = block.0, count = self.counts[slot]);
        Ok(())
    }

    pub fn dec(&mut self, block: BlockAddress) -> Result<()> {
        let slot = self.slot(block)?;
        if self.counts[slot] == 0 {
            return Err(MetaError::CorruptStructure {
                block,
                detail: "reference count decremented below zero".to_string(),
            });
        }
        self.counts[slot] -= 1;
        if self.counts[slot] == 0 {
            self.nr_allocated -= 1;
            self.quarantine.insert(block.0);
        }
        self.generation += 1;
        trace!(event = "sm_dec", block = block.0, count = self.counts[slot]);
        Ok(())
    }

    /// Allocate the lowest free block, set its count to 1.
    ///
    /// Blocks freed in the current transaction are skipped until
    /// [`Self::clear_quarantine`].
    pub fn new_block(&mut self) -> Result<BlockAddress> {
        for (slot, count) in self.counts.iter().enumerate() {
            if *count == 0 && !self.quarantine.contains(&(slot as u64)) {
                self.counts[slot] = 1;
                self.nr_allocated += 1;
                self.generation += 1;
                trace!(event = "sm_alloc", block = slot);
                return Ok(BlockAddress(slot as u64));
            }
        }
        Err(MetaError::NoSpace)
    }

    /// Make blocks freed during the finished transaction allocatable again.
    pub fn clear_quarantine(&mut self) {
        self.quarantine.clear();
    }
}

// ── Persistence ─────────────────────────────────────────────────────────────

/// Rebuild the in-core table from its on-disk pages.
pub fn open_space_map(bm: &BlockManager, root: &SpaceMapRoot) -> Result<SpaceMap> {
    let mut sm = SpaceMap::new(root.nr_blocks);

    let index = bm.read_lock(root.index_root, index_page_validator())?;
    let index_data = index.data();
    let index_header = PageHeader::decode(&index_data)?;

    for page in 0..u64::from(index_header.nr_entries) {
        let ptr = read_le_u64(&index_data, entry_offset(page, 8))?;
        let leaf = bm.read_lock(BlockAddress(ptr), array_page_validator())?;
        let leaf_data = leaf.data();
        let leaf_header = PageHeader::decode(&leaf_data)?;
        if leaf_header.value_size != 4 {
            return Err(MetaError::CorruptStructure {
                block: BlockAddress(ptr),
                detail: format!(
                    "space map page with value size {}",
                    leaf_header.value_size
                ),
            });
        }

        let begin = page * COUNTS_PER_PAGE;
        for slot in 0..u64::from(leaf_header.nr_entries) {
            let count = read_le_u32(&leaf_data, entry_offset(slot, 4))?;
            let block = begin + slot;
            if block >= root.nr_blocks {
                break;
            }
            sm.counts[block as usize] = count;
            if count > 0 {
                sm.nr_allocated += 1;
            }
        }
    }

    debug!(
        event = "sm_open",
        nr_blocks = sm.nr_blocks(),
        nr_allocated = sm.nr_allocated()
    );
    Ok(sm)
}

/// Drop the references held by a previous commit's space-map pages.
pub fn release_space_map(
    bm: &BlockManager,
    sm: &Mutex<SpaceMap>,
    root: &SpaceMapRoot,
) -> Result<()> {
    if !root.is_present() {
        return Ok(());
    }

    let mut pages = Vec::new();
    {
        let index = bm.read_lock(root.index_root, index_page_validator())?;
        let index_data = index.data();
        let index_header = PageHeader::decode(&index_data)?;
        for page in 0..u64::from(index_header.nr_entries) {
            pages.push(read_le_u64(&index_data, entry_offset(page, 8))?);
        }
    }

    let mut guard = sm.lock();
    for ptr in pages {
        guard.dec(BlockAddress(ptr))?;
    }
    guard.dec(root.index_root)?;
    Ok(())
}

/// Serialize the table to freshly allocated pages and return the new root.
///
/// The pages are allocated before the counts are written, so the table
/// describes its own storage. If the table changes between allocation and
/// the end of the pass (it cannot today, but the contract allows it), the
/// pages are released and the pass retried once.
pub fn write_space_map(tm: &TransactionManager) -> Result<SpaceMapRoot> {
    let sm = tm.sm();
    let nr_blocks = sm.lock().nr_blocks();
    let nr_pages = nr_blocks.div_ceil(COUNTS_PER_PAGE);
    if nr_pages > INDEX_CAPACITY {
        return Err(MetaError::OutOfRange {
            context: "space map pages",
            value: nr_pages,
            limit: INDEX_CAPACITY,
        });
    }

    for _attempt in 0..2 {
        let mut addrs = Vec::with_capacity(nr_pages as usize + 1);
        for _ in 0..=nr_pages {
            addrs.push(sm.lock().new_block()?);
        }
        let index_addr = addrs[nr_pages as usize];
        let generation = sm.lock().generation();

        for (page, addr) in addrs[..nr_pages as usize].iter().enumerate() {
            let begin = page as u64 * COUNTS_PER_PAGE;
            let nr = COUNTS_PER_PAGE.min(nr_blocks - begin);
            let wr = tm.bm().write_lock_zero(*addr, array_page_validator())?;
            let mut data = wr.data_mut();
            PageHeader {
                magic: ARRAY_PAGE_MAGIC,
                blocknr: addr.0,
                nr_entries: nr as u32,
                value_size: 4,
            }
            .encode(&mut data);
            let guard = sm.lock();
            for slot in 0..nr {
                write_le_u32(
                    &mut data,
                    entry_offset(slot, 4),
                    guard.counts[(begin + slot) as usize],
                );
            }
        }

        {
            let wr = tm.bm().write_lock_zero(index_addr, index_page_validator())?;
            let mut data = wr.data_mut();
            PageHeader {
                magic: INDEX_PAGE_MAGIC,
                blocknr: index_addr.0,
                nr_entries: nr_pages as u32,
                value_size: 8,
            }
            .encode(&mut data);
            for (page, addr) in addrs[..nr_pages as usize].iter().enumerate() {
                write_le_u64(&mut data, PAGE_HEADER_SIZE + page * 8, addr.0);
            }
        }

        if sm.lock().generation() == generation {
            let guard = sm.lock();
            debug!(
                event = "sm_write",
                index_root = index_addr.0,
                pages = nr_pages,
                nr_allocated = guard.nr_allocated()
            );
            return Ok(SpaceMapRoot {
                nr_blocks,
                nr_allocated: guard.nr_allocated(),
                index_root: index_addr,
            });
        }

        warn!(event = "sm_write_retry");
        let mut guard = sm.lock();
        for addr in addrs {
            guard.dec(addr)?;
        }
    }

    Err(MetaError::CorruptStructure {
        block: BlockAddress(0),
        detail: "space map failed to stabilise during commit".to_string(),
    })
}

/// Page addresses referenced by a committed space map (index first).
pub fn space_map_pages(bm: &BlockManager, root: &SpaceMapRoot) -> Result<Vec<BlockAddress>> {
    let mut pages = vec![root.index_root];
    let index = bm.read_lock(root.index_root, index_page_validator())?;
    let index_data = index.data();
    let index_header = PageHeader::decode(&index_data)?;
    for page in 0..u64::from(index_header.nr_entries) {
        pages.push(BlockAddress(read_le_u64(&index_data, entry_offset(page, 8))?));
    }
    Ok(pages)
}
