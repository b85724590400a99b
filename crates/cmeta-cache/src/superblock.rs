//! The superblock: fixed-layout root record at block 0.
//!
//! Layout (little-endian):
//!
//! | off | field |
//! |-----|-------|
//! | 0   | csum (u32, CRC-32C of the block with this slot zeroed) |
//! | 4   | flags (u32; bit 0 = needs_check, rest reserved) |
//! | 8   | blocknr (u64, address stamp) |
//! | 16  | magic (u64) |
//! | 24  | version (u32) |
//! | 28  | policy_hint_size (u32) |
//! | 32  | policy_name (char[128], NUL padded) |
//! | 160 | policy_version (u32[3]) |
//! | 176 | mapping_root (u64) |
//! | 184 | hint_root (u64, 0 = absent) |
//! | 192 | discard_root (u64, 0 = absent) |
//! | 200 | discard_block_size (u64) |
//! | 208 | discard_nr_blocks (u64) |
//! | 216 | cache_blocks (u64) |
//! | 224 | dirty_root (u64, version 2) |
//! | 232 | space_map_root (u8[128], owned by the space map) |
//!
//! Reserved flag bits and unknown tail bytes round-trip untouched by the
//! codec; the validator owns csum and blocknr.

use cmeta_block::{BlockManager, Validator, page_checksum};
use cmeta_error::{MetaError, Result};
use cmeta_pdata::SPACE_MAP_ROOT_SIZE;
use cmeta_types::{
    BlockAddress, SUPERBLOCK_LOCATION, read_le_u32, read_le_u64, trim_nul_padded, write_le_u32,
    write_le_u64, write_nul_padded,
};
use std::sync::Arc;

pub const SUPERBLOCK_MAGIC: u64 = 6_142_003;
pub const MIN_METADATA_VERSION: u32 = 1;
pub const MAX_METADATA_VERSION: u32 = 2;
pub const POLICY_NAME_SIZE: usize = 128;

/// Set by the runtime when it suspects corruption; cleared by a successful
/// offline check on request.
pub const SUPERBLOCK_FLAG_NEEDS_CHECK: u32 = 1;

const CSUM_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 4;
const BLOCKNR_OFFSET: usize = 8;
const MAGIC_OFFSET: usize = 16;
const VERSION_OFFSET: usize = 24;
const POLICY_HINT_SIZE_OFFSET: usize = 28;
const POLICY_NAME_OFFSET: usize = 32;
const POLICY_VERSION_OFFSET: usize = 160;
const MAPPING_ROOT_OFFSET: usize = 176;
const HINT_ROOT_OFFSET: usize = 184;
const DISCARD_ROOT_OFFSET: usize = 192;
const DISCARD_BLOCK_SIZE_OFFSET: usize = 200;
const DISCARD_NR_BLOCKS_OFFSET: usize = 208;
const CACHE_BLOCKS_OFFSET: usize = 216;
const DIRTY_ROOT_OFFSET: usize = 224;
const SPACE_MAP_ROOT_OFFSET: usize = 232;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub flags: u32,
    pub version: u32,
    pub policy_hint_size: u32,
    pub policy_name: String,
    pub policy_version: [u32; 3],
    pub mapping_root: BlockAddress,
    pub hint_root: Option<BlockAddress>,
    pub discard_root: Option<BlockAddress>,
    pub discard_block_size: u64,
    pub discard_nr_blocks: u64,
    pub cache_blocks: u64,
    pub dirty_root: Option<BlockAddress>,
    pub space_map_root: [u8; SPACE_MAP_ROOT_SIZE],
}

fn root_of(raw: u64) -> Option<BlockAddress> {
    (raw != 0).then_some(BlockAddress(raw))
}

impl Superblock {
    #[must_use]
    pub fn needs_check(&self) -> bool {
        self.flags & SUPERBLOCK_FLAG_NEEDS_CHECK != 0
    }

    pub fn set_needs_check(&mut self, value: bool) {
        if value {
            self.flags |= SUPERBLOCK_FLAG_NEEDS_CHECK;
        } else {
            self.flags &= !SUPERBLOCK_FLAG_NEEDS_CHECK;
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut space_map_root = [0_u8; SPACE_MAP_ROOT_SIZE];
        space_map_root.copy_from_slice(cmeta_types::ensure_slice(
            data,
            SPACE_MAP_ROOT_OFFSET,
            SPACE_MAP_ROOT_SIZE,
        )?);
        Ok(Self {
            flags: read_le_u32(data, FLAGS_OFFSET)?,
            version: read_le_u32(data, VERSION_OFFSET)?,
            policy_hint_size: read_le_u32(data, POLICY_HINT_SIZE_OFFSET)?,
            policy_name: trim_nul_padded(
                &data[POLICY_NAME_OFFSET..POLICY_NAME_OFFSET + POLICY_NAME_SIZE],
            ),
            policy_version: [
                read_le_u32(data, POLICY_VERSION_OFFSET)?,
                read_le_u32(data, POLICY_VERSION_OFFSET + 4)?,
                read_le_u32(data, POLICY_VERSION_OFFSET + 8)?,
            ],
            mapping_root: BlockAddress(read_le_u64(data, MAPPING_ROOT_OFFSET)?),
            hint_root: root_of(read_le_u64(data, HINT_ROOT_OFFSET)?),
            discard_root: root_of(read_le_u64(data, DISCARD_ROOT_OFFSET)?),
            discard_block_size: read_le_u64(data, DISCARD_BLOCK_SIZE_OFFSET)?,
            discard_nr_blocks: read_le_u64(data, DISCARD_NR_BLOCKS_OFFSET)?,
            cache_blocks: read_le_u64(data, CACHE_BLOCKS_OFFSET)?,
            dirty_root: root_of(read_le_u64(data, DIRTY_ROOT_OFFSET)?),
            space_map_root,
        })
    }

    /// Write every field except csum and blocknr, which the validator's
    /// `prepare` stamps on the way to disk.
    pub fn encode(&self, data: &mut [u8]) {
        write_le_u32(data, FLAGS_OFFSET, self.flags);
        write_le_u64(data, MAGIC_OFFSET, SUPERBLOCK_MAGIC);
        write_le_u32(data, VERSION_OFFSET, self.version);
        write_le_u32(data, POLICY_HINT_SIZE_OFFSET, self.policy_hint_size);
        write_nul_padded(
            &mut data[POLICY_NAME_OFFSET..POLICY_NAME_OFFSET + POLICY_NAME_SIZE],
            &self.policy_name,
        );
        write_le_u32(data, POLICY_VERSION_OFFSET, self.policy_version[0]);
        write_le_u32(data, POLICY_VERSION_OFFSET + 4, self.policy_version[1]);
        write_le_u32(data, POLICY_VERSION_OFFSET + 8, self.policy_version[2]);
        write_le_u64(data, MAPPING_ROOT_OFFSET, self.mapping_root.0);
        write_le_u64(data, HINT_ROOT_OFFSET, self.hint_root.map_or(0, |b| b.0));
        write_le_u64(
            data,
            DISCARD_ROOT_OFFSET,
            self.discard_root.map_or(0, |b| b.0),
        );
        write_le_u64(data, DISCARD_BLOCK_SIZE_OFFSET, self.discard_block_size);
        write_le_u64(data, DISCARD_NR_BLOCKS_OFFSET, self.discard_nr_blocks);
        write_le_u64(data, CACHE_BLOCKS_OFFSET, self.cache_blocks);
        write_le_u64(data, DIRTY_ROOT_OFFSET, self.dirty_root.map_or(0, |b| b.0));
        data[SPACE_MAP_ROOT_OFFSET..SPACE_MAP_ROOT_OFFSET + SPACE_MAP_ROOT_SIZE]
            .copy_from_slice(&self.space_map_root);
    }
}

#[derive(Debug)]
struct SuperblockValidator;

impl Validator for SuperblockValidator {
    fn check(&self, data: &[u8], location: BlockAddress) -> Result<()> {
        let stored = read_le_u32(data, CSUM_OFFSET)?;
        let computed = page_checksum(data, CSUM_OFFSET);
        if stored != computed {
            return Err(MetaError::ChecksumMismatch {
                block: location,
                expected: computed,
                actual: stored,
            });
        }

        let magic = read_le_u64(data, MAGIC_OFFSET)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(MetaError::MagicMismatch {
                block: location,
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }

        let blocknr = read_le_u64(data, BLOCKNR_OFFSET)?;
        if blocknr != location.0 {
            return Err(MetaError::CorruptStructure {
                block: location,
                detail: format!("superblock stamped for block {blocknr}"),
            });
        }

        Ok(())
    }

    fn prepare(&self, data: &mut [u8], location: BlockAddress) {
        write_le_u64(data, BLOCKNR_OFFSET, location.0);
        let csum = page_checksum(data, CSUM_OFFSET);
        write_le_u32(data, CSUM_OFFSET, csum);
    }
}

#[must_use]
pub fn superblock_validator() -> Arc<dyn Validator> {
    Arc::new(SuperblockValidator)
}

/// Read and decode the committed superblock.
pub fn read_superblock(bm: &BlockManager) -> Result<Superblock> {
    let sref = bm.read_lock(SUPERBLOCK_LOCATION, superblock_validator())?;
    let data = sref.data();
    Superblock::decode(&data)
}

/// Encode `sb` into block 0 and run the ordered flush, making it the
/// committed superblock.
pub fn write_superblock(bm: &BlockManager, sb: &Superblock) -> Result<()> {
    let sref = bm.superblock_zero(SUPERBLOCK_LOCATION, superblock_validator())?;
    sb.encode(&mut sref.data_mut());
    bm.commit_superblock(sref)
}

// ── Checking ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SuperblockDamage {
    /// Checksum, magic or address stamp failed; nothing else is trustworthy.
    Corrupt { desc: String },
    /// The record decoded but a field is out of range.
    Invalid { desc: String },
}

pub trait SuperblockVisitor {
    fn visit(&mut self, damage: &SuperblockDamage);
}

/// Validate the superblock and report damage. Structural failure
/// (`Corrupt`) short-circuits the field checks.
pub fn check_superblock(
    bm: &BlockManager,
    nr_metadata_blocks: u64,
    visitor: &mut dyn SuperblockVisitor,
) {
    let sb = match read_superblock(bm) {
        Ok(sb) => sb,
        Err(err) => {
            visitor.visit(&SuperblockDamage::Corrupt {
                desc: err.to_string(),
            });
            return;
        }
    };

    for desc in invalid_fields(&sb, nr_metadata_blocks) {
        visitor.visit(&SuperblockDamage::Invalid { desc });
    }
}

fn invalid_fields(sb: &Superblock, nr_metadata_blocks: u64) -> Vec<String> {
    let mut problems = Vec::new();

    if !(MIN_METADATA_VERSION..=MAX_METADATA_VERSION).contains(&sb.version) {
        problems.push(format!("unsupported metadata version {}", sb.version));
    }

    let mut check_root = |name: &str, root: Option<BlockAddress>| match root {
        Some(block) if block.0 >= nr_metadata_blocks => {
            problems.push(format!(
                "{name} {} beyond end of metadata device ({nr_metadata_blocks} blocks)",
                block.0
            ));
        }
        _ => {}
    };
    check_root("mapping root", Some(sb.mapping_root));
    check_root("hint root", sb.hint_root);
    check_root("discard root", sb.discard_root);
    check_root("dirty bitset root", sb.dirty_root);

    if sb.mapping_root == SUPERBLOCK_LOCATION {
        problems.push("mapping root missing".to_string());
    }
    if sb.version >= 2 && sb.dirty_root.is_none() {
        problems.push("dirty bitset root missing from version 2 metadata".to_string());
    }
    if sb.policy_hint_size != 0 && !crate::hint::valid_hint_width(sb.policy_hint_size) {
        problems.push(format!(
            "policy hint size {} not a multiple of 4 in 4..=128",
            sb.policy_hint_size
        ));
    }
    if sb.hint_root.is_some() && sb.policy_hint_size == 0 {
        problems.push("hint array present but policy hint size is zero".to_string());
    }
    if sb.discard_root.is_some() && sb.discard_nr_blocks == 0 {
        problems.push("discard bitset present but discard_nr_blocks is zero".to_string());
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmeta_types::MD_BLOCK_SIZE;

    fn sample() -> Superblock {
        Superblock {
            flags: SUPERBLOCK_FLAG_NEEDS_CHECK | 0x80,
            version: 2,
            policy_hint_size: 4,
            policy_name: "smq".to_string(),
            policy_version: [2, 1, 0],
            mapping_root: BlockAddress(5),
            hint_root: Some(BlockAddress(9)),
            discard_root: None,
            discard_block_size: 128,
            discard_nr_blocks: 0,
            cache_blocks: 1000,
            dirty_root: Some(BlockAddress(12)),
            space_map_root: [7_u8; SPACE_MAP_ROOT_SIZE],
        }
    }

    #[test]
    fn codec_round_trips_every_field() {
        let sb = sample();
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        sb.encode(&mut data);
        let back = Superblock::decode(&data).expect("decode");
        assert_eq!(back, sb);
        assert!(back.needs_check());
        assert_eq!(back.flags & 0x80, 0x80, "reserved flag bits round-trip");
    }

    #[test]
    fn validator_seals_and_accepts() {
        let v = superblock_validator();
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        sample().encode(&mut data);
        v.prepare(&mut data, SUPERBLOCK_LOCATION);
        assert!(v.check(&data, SUPERBLOCK_LOCATION).is_ok());
    }

    #[test]
    fn validator_rejects_corruption() {
        let v = superblock_validator();
        let mut data = vec![0_u8; MD_BLOCK_SIZE];
        sample().encode(&mut data);
        v.prepare(&mut data, SUPERBLOCK_LOCATION);

        let mut flipped = data.clone();
        flipped[300] ^= 1;
        assert!(matches!(
            v.check(&flipped, SUPERBLOCK_LOCATION),
            Err(MetaError::ChecksumMismatch { .. })
        ));

        let mut wrong_magic = data.clone();
        write_le_u64(&mut wrong_magic, MAGIC_OFFSET, 0xBAD);
        v.prepare(&mut wrong_magic, SUPERBLOCK_LOCATION);
        assert!(matches!(
            v.check(&wrong_magic, SUPERBLOCK_LOCATION),
            Err(MetaError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn field_validation_flags_bad_records() {
        let mut sb = sample();
        sb.version = 9;
        sb.mapping_root = BlockAddress(0);
        sb.policy_hint_size = 3;
        let problems = invalid_fields(&sb, 1024);
        assert!(problems.iter().any(|p| p.contains("version 9")));
        assert!(problems.iter().any(|p| p.contains("mapping root missing")));
        assert!(problems.iter().any(|p| p.contains("hint size 3")));

        let mut sb = sample();
        sb.mapping_root = BlockAddress(4096);
        let problems = invalid_fields(&sb, 1024);
        assert!(problems.iter().any(|p| p.contains("beyond end")));

        assert!(invalid_fields(&sample(), 1024).is_empty());
    }

    #[test]
    fn needs_check_flag_toggles() {
        let mut sb = sample();
        assert!(sb.needs_check());
        sb.set_needs_check(false);
        assert!(!sb.needs_check());
        assert_eq!(sb.flags & 0x80, 0x80, "other flags untouched");
        sb.set_needs_check(true);
        assert!(sb.needs_check());
    }
}
