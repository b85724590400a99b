#![forbid(unsafe_code)]
//! Cache metadata: the on-disk format of a block-level cache device's
//! metadata and its lifecycle.
//!
//! The superblock at block 0 names the roots of every structure: the
//! mapping array (cblock → oblock + flags), the per-cblock policy hint
//! array, the discard bitset, the dirty bitset (version 2) and the space
//! map. All mutation is transactional: copy-on-write through
//! `cmeta_pdata`, committed atomically by the ordered superblock flush.

pub mod hint;
pub mod mapping;
pub mod metadata;
pub mod superblock;

pub use hint::{HintArray, HintDamage, HintVisitor, valid_hint_width};
pub use mapping::{
    MAPPING_DIRTY, MAPPING_VALID, Mapping, MappingArray, MappingDamage, MappingVisitor,
    check_mapping_array, pack_mapping, unpack_mapping,
};
pub use metadata::{
    FormatOptions, METADATA_CACHE_SIZE, Metadata, MetadataVersion, clear_needs_check,
};
pub use superblock::{
    MAX_METADATA_VERSION, MIN_METADATA_VERSION, POLICY_NAME_SIZE, SUPERBLOCK_FLAG_NEEDS_CHECK,
    SUPERBLOCK_MAGIC, Superblock, SuperblockDamage, SuperblockVisitor, check_superblock,
    read_superblock, superblock_validator, write_superblock,
};
