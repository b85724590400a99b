#![forbid(unsafe_code)]
//! Space-map persistence and conservation across commits.

use cmeta_block::{BlockManager, noop_validator};
use cmeta_pdata::{
    Array, SpaceMap, SpaceMapRoot, TransactionManager, open_space_map, release_space_map,
    space_map_pages, write_space_map,
};
use cmeta_types::{BlockAddress, MD_BLOCK_SIZE, SUPERBLOCK_LOCATION};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

fn metadata_file(nr_blocks: u64) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("temp file");
    f.write_all(&vec![0_u8; (nr_blocks as usize) * MD_BLOCK_SIZE])
        .expect("fill");
    f.flush().expect("flush");
    f
}

fn fresh_tm(path: &std::path::Path, nr_blocks: u64) -> TransactionManager {
    let bm = Arc::new(BlockManager::open(path, 64, true).expect("open"));
    let mut sm = SpaceMap::new(nr_blocks);
    sm.inc(SUPERBLOCK_LOCATION).expect("superblock count");
    TransactionManager::new(bm, Arc::new(Mutex::new(sm)))
}

#[test]
fn written_space_map_reloads_identically() {
    let f = metadata_file(64);
    let tm = fresh_tm(f.path(), 64);

    // Some structure blocks to give the table shape.
    let a = tm.new_block(noop_validator()).expect("a").location();
    let b = tm.new_block(noop_validator()).expect("b").location();
    tm.inc(b).expect("inc");

    let root = write_space_map(&tm).expect("write");
    tm.bm().flush().expect("flush");

    let reopened = open_space_map(tm.bm(), &root).expect("reload");
    assert_eq!(reopened.nr_blocks(), 64);
    assert_eq!(reopened.get(SUPERBLOCK_LOCATION).expect("sb"), 1);
    assert_eq!(reopened.get(a).expect("a"), 1);
    assert_eq!(reopened.get(b).expect("b"), 2);
    assert_eq!(reopened.nr_allocated(), root.nr_allocated);
}

#[test]
fn space_map_is_self_describing() {
    let f = metadata_file(64);
    let tm = fresh_tm(f.path(), 64);
    let root = write_space_map(&tm).expect("write");
    tm.bm().flush().expect("flush");

    // Every page of the table carries a count of 1 inside the table itself.
    let pages = space_map_pages(tm.bm(), &root).expect("pages");
    let reopened = open_space_map(tm.bm(), &root).expect("reload");
    for page in pages {
        assert_eq!(reopened.get(page).expect("count"), 1, "page {page}");
    }
}

#[test]
fn refcounts_equal_reachable_blocks_at_quiescence() {
    let f = metadata_file(128);
    let tm = fresh_tm(f.path(), 128);

    let array = Array::create(&tm, 8, 1000, &0_u64.to_le_bytes()).expect("create");
    let root = write_space_map(&tm).expect("write");
    tm.bm().flush().expect("flush");

    let mut reachable: Vec<BlockAddress> = vec![SUPERBLOCK_LOCATION];
    reachable.extend(array.page_addresses().expect("array pages"));
    reachable.extend(space_map_pages(tm.bm(), &root).expect("sm pages"));
    reachable.sort_unstable();
    reachable.dedup();

    let reopened = open_space_map(tm.bm(), &root).expect("reload");
    let total: u64 = (0..reopened.nr_blocks())
        .map(|b| u64::from(reopened.get(BlockAddress(b)).expect("count")))
        .sum();
    assert_eq!(total, reachable.len() as u64);
    for block in reachable {
        assert_eq!(reopened.get(block).expect("count"), 1);
    }
}

#[test]
fn recommit_releases_the_previous_table() {
    let f = metadata_file(64);
    let tm = fresh_tm(f.path(), 64);

    let first = write_space_map(&tm).expect("first write");
    tm.transaction_committed();

    release_space_map(tm.bm(), &tm.sm(), &first).expect("release");
    let second = write_space_map(&tm).expect("second write");
    tm.bm().flush().expect("flush");
    tm.transaction_committed();

    assert_ne!(first.index_root, second.index_root);
    let reopened = open_space_map(tm.bm(), &second).expect("reload");
    // The first table's pages are free again in the second table.
    for page in space_map_pages(tm.bm(), &second).expect("pages") {
        assert_eq!(reopened.get(page).expect("count"), 1);
    }
    assert_eq!(reopened.get(first.index_root).expect("old root"), 0);
}

#[test]
fn root_blob_survives_the_superblock_slot() {
    let root = SpaceMapRoot {
        nr_blocks: 4096,
        nr_allocated: 321,
        index_root: BlockAddress(17),
    };
    let blob = root.encode();
    assert_eq!(SpaceMapRoot::decode(&blob).expect("decode"), root);
}
