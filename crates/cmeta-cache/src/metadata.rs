//! Metadata lifecycle: format, open, mutate, commit.
//!
//! A `Metadata` value is one open transaction against the device. Mutations
//! update structure roots in the in-core superblock; nothing is visible on
//! disk until [`Metadata::commit`] rewrites the space map and runs the
//! ordered superblock flush.

use crate::hint::HintArray;
use crate::mapping::{Mapping, MappingArray};
use crate::superblock::{
    MAX_METADATA_VERSION, MIN_METADATA_VERSION, Superblock, read_superblock, write_superblock,
};
use cmeta_block::BlockManager;
use cmeta_error::{MetaError, Result};
use cmeta_pdata::{
    Bitset, SpaceMap, SpaceMapRoot, TransactionManager, open_space_map, release_space_map,
    write_space_map,
};
use cmeta_types::{Cblock, SUPERBLOCK_LOCATION};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Locks (and cached blocks) the metadata tools hold at once.
pub const METADATA_CACHE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetadataVersion {
    V1 = 1,
    V2 = 2,
}

impl MetadataVersion {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            _ => Err(MetaError::VersionUnsupported {
                actual: raw,
                min: MIN_METADATA_VERSION,
                max: MAX_METADATA_VERSION,
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u32 {
        self as u32
    }
}

/// Shape of a freshly formatted metadata device.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub version: MetadataVersion,
    pub cache_blocks: u64,
    pub policy_name: String,
    pub policy_version: [u32; 3],
    /// 0 means no hint array.
    pub policy_hint_size: u32,
    pub discard_block_size: u64,
    /// 0 means no discard bitset.
    pub discard_nr_blocks: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            version: MetadataVersion::V2,
            cache_blocks: 0,
            policy_name: "smq".to_string(),
            policy_version: [2, 0, 0],
            policy_hint_size: 4,
            discard_block_size: 128,
            discard_nr_blocks: 0,
        }
    }
}

pub struct Metadata {
    bm: Arc<BlockManager>,
    tm: TransactionManager,
    sb: Superblock,
}

impl Metadata {
    /// Format `path` as empty cache metadata and commit it.
    pub fn format(path: impl AsRef<Path>, opts: &FormatOptions) -> Result<Self> {
        let bm = Arc::new(BlockManager::open(path, METADATA_CACHE_SIZE, true)?);
        if bm.get_nr_blocks() == 0 {
            return Err(MetaError::OutOfRange {
                context: "metadata device blocks",
                value: 0,
                limit: 1,
            });
        }

        let mut sm = SpaceMap::new(bm.get_nr_blocks());
        sm.inc(SUPERBLOCK_LOCATION)?;
        let tm = TransactionManager::new(Arc::clone(&bm), Arc::new(Mutex::new(sm)));

        let mapping_root = MappingArray::create(&tm, opts.cache_blocks)?.root();
        let dirty_root = match opts.version {
            MetadataVersion::V1 => None,
            MetadataVersion::V2 => Some(Bitset::create(&tm, opts.cache_blocks)?.root()),
        };
        let hint_root = if opts.policy_hint_size > 0 {
            Some(HintArray::create(&tm, opts.policy_hint_size, opts.cache_blocks)?.root())
        } else {
            None
        };
        let discard_root = if opts.discard_nr_blocks > 0 {
            Some(Bitset::create(&tm, opts.discard_nr_blocks)?.root())
        } else {
            None
        };

        let sb = Superblock {
            flags: 0,
            version: opts.version.to_raw(),
            policy_hint_size: opts.policy_hint_size,
            policy_name: opts.policy_name.clone(),
            policy_version: opts.policy_version,
            mapping_root,
            hint_root,
            discard_root,
            discard_block_size: opts.discard_block_size,
            discard_nr_blocks: opts.discard_nr_blocks,
            cache_blocks: opts.cache_blocks,
            dirty_root,
            space_map_root: [0; cmeta_pdata::SPACE_MAP_ROOT_SIZE],
        };

        let mut md = Self { bm, tm, sb };
        md.commit()?;
        info!(
            event = "metadata_format",
            cache_blocks = opts.cache_blocks,
            version = opts.version.to_raw()
        );
        Ok(md)
    }

    /// Open committed metadata.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let bm = Arc::new(BlockManager::open(path, METADATA_CACHE_SIZE, writable)?);
        let sb = read_superblock(&bm)?;
        let _ = MetadataVersion::from_raw(sb.version)?;

        let sm_root = SpaceMapRoot::decode(&sb.space_map_root)?;
        let sm = if sm_root.is_present() {
            open_space_map(&bm, &sm_root)?
        } else {
            SpaceMap::new(bm.get_nr_blocks())
        };
        let tm = TransactionManager::new(Arc::clone(&bm), Arc::new(Mutex::new(sm)));

        debug!(event = "metadata_open", writable, version = sb.version);
        Ok(Self { bm, tm, sb })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn bm(&self) -> &BlockManager {
        &self.bm
    }

    #[must_use]
    pub fn tm(&self) -> &TransactionManager {
        &self.tm
    }

    pub fn version(&self) -> Result<MetadataVersion> {
        MetadataVersion::from_raw(self.sb.version)
    }

    // ── Mapping operations ──────────────────────────────────────────────

    pub fn get_mapping(&self, cblock: Cblock) -> Result<Option<Mapping>> {
        self.mapping_array().lookup(cblock)
    }

    pub fn insert_mapping(&mut self, cblock: Cblock, mapping: Mapping) -> Result<()> {
        let mut ma = self.mapping_array();
        ma.insert(cblock, mapping)?;
        let root = ma.root();
        self.sb.mapping_root = root;
        Ok(())
    }

    pub fn remove_mapping(&mut self, cblock: Cblock) -> Result<()> {
        let mut ma = self.mapping_array();
        ma.remove(cblock)?;
        let root = ma.root();
        self.sb.mapping_root = root;
        Ok(())
    }

    #[must_use]
    pub fn mapping_array(&self) -> MappingArray<'_> {
        MappingArray::open(&self.tm, self.sb.mapping_root, self.sb.cache_blocks)
    }

    // ── Hint operations ─────────────────────────────────────────────────

    pub fn hint_array(&self) -> Result<Option<HintArray<'_>>> {
        match self.sb.hint_root {
            None => Ok(None),
            Some(root) => Ok(Some(HintArray::open(
                &self.tm,
                root,
                self.sb.policy_hint_size,
                self.sb.cache_blocks,
            )?)),
        }
    }

    pub fn set_hint(&mut self, cblock: Cblock, hint: &[u8]) -> Result<()> {
        let Some(mut ha) = self.hint_array()? else {
            return Err(MetaError::OutOfRange {
                context: "hint array record",
                value: u64::from(cblock.0),
                limit: 0,
            });
        };
        ha.set_hint(cblock, hint)?;
        let root = ha.root();
        self.sb.hint_root = Some(root);
        Ok(())
    }

    // ── Dirty and discard bits ──────────────────────────────────────────

    /// Mark a cache block clean or dirty. Version 1 keeps the bit in the
    /// mapping flags; version 2 keeps it in the dirty bitset.
    pub fn set_dirty(&mut self, cblock: Cblock, dirty: bool) -> Result<()> {
        match self.version()? {
            MetadataVersion::V1 => {
                let Some(mapping) = self.get_mapping(cblock)? else {
                    return Err(MetaError::OutOfRange {
                        context: "dirty bit for unmapped cblock",
                        value: u64::from(cblock.0),
                        limit: self.sb.cache_blocks,
                    });
                };
                let flags = if dirty {
                    mapping.flags | crate::mapping::MAPPING_DIRTY
                } else {
                    mapping.flags & !crate::mapping::MAPPING_DIRTY
                };
                self.insert_mapping(
                    cblock,
                    Mapping {
                        oblock: mapping.oblock,
                        flags,
                    },
                )
            }
            MetadataVersion::V2 => {
                let Some(root) = self.sb.dirty_root else {
                    return Err(MetaError::CorruptStructure {
                        block: SUPERBLOCK_LOCATION,
                        detail: "version 2 metadata without a dirty bitset".to_string(),
                    });
                };
                let mut bits = Bitset::open(&self.tm, root, self.sb.cache_blocks);
                bits.set(u64::from(cblock.0), dirty)?;
                let root = bits.root();
                self.sb.dirty_root = Some(root);
                Ok(())
            }
        }
    }

    pub fn set_discard(&mut self, dblock: u64, value: bool) -> Result<()> {
        let Some(root) = self.sb.discard_root else {
            return Err(MetaError::OutOfRange {
                context: "discard bitset index",
                value: dblock,
                limit: 0,
            });
        };
        let mut bits = Bitset::open(&self.tm, root, self.sb.discard_nr_blocks);
        bits.set(dblock, value)?;
        let root = bits.root();
        self.sb.discard_root = Some(root);
        Ok(())
    }

    // ── Flags ───────────────────────────────────────────────────────────

    pub fn set_needs_check(&mut self, value: bool) {
        self.sb.set_needs_check(value);
    }

    // ── Commit ──────────────────────────────────────────────────────────

    /// Make every mutation since open (or the previous commit) durable:
    /// rewrite the space map, then run the ordered superblock flush.
    pub fn commit(&mut self) -> Result<()> {
        let old_sm_root = SpaceMapRoot::decode(&self.sb.space_map_root)?;
        release_space_map(&self.bm, &self.tm.sm(), &old_sm_root)?;
        let sm_root = write_space_map(&self.tm)?;
        self.sb.space_map_root = sm_root.encode();

        write_superblock(&self.bm, &self.sb)?;
        self.tm.transaction_committed();
        debug!(event = "metadata_commit", sm_root = sm_root.index_root.0);
        Ok(())
    }
}

/// Clear the needs-check flag in the committed superblock.
///
/// Used by the checker after a clean run; rewrites only the superblock.
pub fn clear_needs_check(path: impl AsRef<Path>) -> Result<()> {
    let bm = BlockManager::open(path, METADATA_CACHE_SIZE, true)?;
    let mut sb = read_superblock(&bm)?;
    sb.set_needs_check(false);
    write_superblock(&bm, &sb)?;
    info!(event = "needs_check_cleared");
    Ok(())
}
