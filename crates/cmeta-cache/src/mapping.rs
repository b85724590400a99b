//! The mapping array: cblock → (oblock, flags).
//!
//! One packed le64 per cblock: `(oblock << 16) | flags`. A mapping is
//! present iff the VALID flag is set; DIRTY marks a cache copy that differs
//! from the origin (version 1 only; version 2 keeps dirtiness in its own
//! bitset). The remaining flag bits are reserved and round-trip untouched.

use crate::metadata::MetadataVersion;
use cmeta_error::{MetaError, Result};
use cmeta_pdata::{Array, ArrayVisitor, TransactionManager};
use cmeta_types::{BlockAddress, Cblock, KeyRange, MAX_OBLOCK, Oblock};

pub const MAPPING_VALID: u32 = 1;
pub const MAPPING_DIRTY: u32 = 2;
pub const MAPPING_FLAGS_MASK: u32 = 0xFFFF;

const RESERVED_FLAGS: u32 = MAPPING_FLAGS_MASK & !(MAPPING_VALID | MAPPING_DIRTY);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub oblock: Oblock,
    pub flags: u32,
}

impl Mapping {
    #[must_use]
    pub fn valid(&self) -> bool {
        self.flags & MAPPING_VALID != 0
    }

    #[must_use]
    pub fn dirty(&self) -> bool {
        self.flags & MAPPING_DIRTY != 0
    }
}

pub fn pack_mapping(mapping: &Mapping) -> Result<u64> {
    if mapping.oblock.0 > MAX_OBLOCK {
        return Err(MetaError::OutOfRange {
            context: "oblock",
            value: mapping.oblock.0,
            limit: MAX_OBLOCK,
        });
    }
    if mapping.flags > MAPPING_FLAGS_MASK {
        return Err(MetaError::OutOfRange {
            context: "mapping flags",
            value: u64::from(mapping.flags),
            limit: u64::from(MAPPING_FLAGS_MASK),
        });
    }
    Ok(mapping.oblock.0 << 16 | u64::from(mapping.flags))
}

#[must_use]
pub fn unpack_mapping(raw: u64) -> Mapping {
    Mapping {
        oblock: Oblock(raw >> 16),
        flags: (raw & u64::from(MAPPING_FLAGS_MASK)) as u32,
    }
}

pub struct MappingArray<'a> {
    array: Array<'a>,
}

impl<'a> MappingArray<'a> {
    /// Format an array of `nr_cblocks` absent mappings.
    pub fn create(tm: &'a TransactionManager, nr_cblocks: u64) -> Result<Self> {
        Ok(Self {
            array: Array::create(tm, 8, nr_cblocks, &0_u64.to_le_bytes())?,
        })
    }

    #[must_use]
    pub fn open(tm: &'a TransactionManager, root: BlockAddress, nr_cblocks: u64) -> Self {
        Self {
            array: Array::open(tm, root, 8, nr_cblocks),
        }
    }

    #[must_use]
    pub fn root(&self) -> BlockAddress {
        self.array.root()
    }

    #[must_use]
    pub fn nr_cblocks(&self) -> u64 {
        self.array.nr_entries()
    }

    /// The mapping at `cblock`, or `None` while its VALID flag is clear.
    pub fn lookup(&self, cblock: Cblock) -> Result<Option<Mapping>> {
        let mapping = unpack_mapping(self.array.get_u64(u64::from(cblock.0))?);
        Ok(mapping.valid().then_some(mapping))
    }

    /// Install a mapping at `cblock` (the VALID flag is implied).
    pub fn insert(&mut self, cblock: Cblock, mapping: Mapping) -> Result<()> {
        let packed = pack_mapping(&Mapping {
            oblock: mapping.oblock,
            flags: mapping.flags | MAPPING_VALID,
        })?;
        self.array.set_u64(u64::from(cblock.0), packed)
    }

    pub fn remove(&mut self, cblock: Cblock) -> Result<()> {
        self.array.set_u64(u64::from(cblock.0), 0)
    }

    pub fn walk(&self, visitor: &mut dyn ArrayVisitor) {
        self.array.walk(visitor);
    }

    pub fn page_addresses(&self) -> Result<Vec<BlockAddress>> {
        self.array.page_addresses()
    }
}

// ── Checking ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum MappingDamage {
    /// A key range that could not be read back.
    Missing { keys: KeyRange, desc: String },
    /// A record that decoded but cannot be correct.
    Invalid {
        cblock: Cblock,
        mapping: Mapping,
        desc: String,
    },
}

pub trait MappingVisitor {
    fn visit(&mut self, damage: &MappingDamage);
}

struct MappingChecker<'v> {
    visitor: &'v mut dyn MappingVisitor,
    version: MetadataVersion,
}

impl ArrayVisitor for MappingChecker<'_> {
    fn value(&mut self, index: u64, data: &[u8]) {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(data);
        let mapping = unpack_mapping(u64::from_le_bytes(raw));

        let cblock = Cblock(index as u32);
        if mapping.flags & RESERVED_FLAGS != 0 {
            self.visitor.visit(&MappingDamage::Invalid {
                cblock,
                mapping,
                desc: "reserved flag bits set".to_string(),
            });
        }
        if self.version >= MetadataVersion::V2 && mapping.dirty() {
            self.visitor.visit(&MappingDamage::Invalid {
                cblock,
                mapping,
                desc: "dirty flag set in version 2 metadata".to_string(),
            });
        }
    }

    fn missing(&mut self, keys: KeyRange, detail: String) {
        self.visitor
            .visit(&MappingDamage::Missing { keys, desc: detail });
    }
}

/// Walk the whole array, reporting unreadable ranges and invalid records.
pub fn check_mapping_array(
    ma: &MappingArray<'_>,
    visitor: &mut dyn MappingVisitor,
    version: MetadataVersion,
) {
    let mut checker = MappingChecker { visitor, version };
    ma.walk(&mut checker);
}
