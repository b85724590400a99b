#![forbid(unsafe_code)]
//! Transactional persistent-data structures over the block manager.
//!
//! Layering, bottom up:
//!
//! 1. **Pages**: the shared on-disk page shape (checksummed header +
//!    packed values) and its validators.
//! 2. **Space map**: reference counts for every metadata block; the
//!    allocator. Self-describing: its own pages appear in its own table.
//! 3. **Transaction manager**: copy-on-write shadowing; groups all writes
//!    into a single atomic superblock commit.
//! 4. **Array**: dense fixed-width-entry array (an index page fanning out
//!    to value pages).
//! 5. **Bitset**: packed le64 bit array over the array.

pub mod array;
pub mod bitset;
pub mod pages;
pub mod space_map;
pub mod tm;

pub use array::{Array, ArrayVisitor};
pub use bitset::{Bitset, BitsetVisitor};
pub use pages::{
    ARRAY_PAGE_MAGIC, INDEX_CAPACITY, INDEX_PAGE_MAGIC, PAGE_HEADER_SIZE, PAGE_PAYLOAD,
    PageHeader, array_page_validator, index_page_validator,
};
pub use space_map::{
    COUNTS_PER_PAGE, SPACE_MAP_ROOT_SIZE, SpaceMap, SpaceMapRoot, open_space_map,
    release_space_map, space_map_pages, write_space_map,
};
pub use tm::TransactionManager;
