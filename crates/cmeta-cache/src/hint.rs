//! The hint array: one fixed-width policy hint record per cblock.
//!
//! The record width is fixed per metadata file (recorded in the
//! superblock) and must be a multiple of 4 in 4..=128.

use cmeta_error::{MetaError, Result};
use cmeta_pdata::{Array, ArrayVisitor, TransactionManager};
use cmeta_types::{BlockAddress, Cblock, KeyRange};

pub const MIN_HINT_WIDTH: u32 = 4;
pub const MAX_HINT_WIDTH: u32 = 128;

#[must_use]
pub fn valid_hint_width(width: u32) -> bool {
    (MIN_HINT_WIDTH..=MAX_HINT_WIDTH).contains(&width) && width % 4 == 0
}

pub struct HintArray<'a> {
    array: Array<'a>,
    width: u32,
}

impl<'a> HintArray<'a> {
    /// Format an array of `nr_cblocks` zeroed hints of `width` bytes.
    pub fn create(tm: &'a TransactionManager, width: u32, nr_cblocks: u64) -> Result<Self> {
        Self::check_width(width)?;
        Ok(Self {
            array: Array::create(tm, width, nr_cblocks, &vec![0_u8; width as usize])?,
            width,
        })
    }

    pub fn open(
        tm: &'a TransactionManager,
        root: BlockAddress,
        width: u32,
        nr_cblocks: u64,
    ) -> Result<Self> {
        Self::check_width(width)?;
        Ok(Self {
            array: Array::open(tm, root, width, nr_cblocks),
            width,
        })
    }

    fn check_width(width: u32) -> Result<()> {
        if !valid_hint_width(width) {
            return Err(MetaError::OutOfRange {
                context: "policy hint size",
                value: u64::from(width),
                limit: u64::from(MAX_HINT_WIDTH),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> BlockAddress {
        self.array.root()
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn get_hint(&self, cblock: Cblock) -> Result<Vec<u8>> {
        let mut hint = vec![0_u8; self.width as usize];
        self.array.get(u64::from(cblock.0), &mut hint)?;
        Ok(hint)
    }

    pub fn set_hint(&mut self, cblock: Cblock, hint: &[u8]) -> Result<()> {
        if hint.len() != self.width as usize {
            return Err(MetaError::OutOfRange {
                context: "hint record length",
                value: hint.len() as u64,
                limit: u64::from(self.width),
            });
        }
        self.array.set(u64::from(cblock.0), hint)
    }

    /// Walk every hint in cblock order, reporting unreadable ranges.
    pub fn check(&self, visitor: &mut dyn HintVisitor) {
        let mut adapter = HintChecker { visitor };
        self.array.walk(&mut adapter);
    }

    pub fn page_addresses(&self) -> Result<Vec<BlockAddress>> {
        self.array.page_addresses()
    }
}

// ── Checking ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum HintDamage {
    Missing { keys: KeyRange, desc: String },
}

pub trait HintVisitor {
    fn visit(&mut self, damage: &HintDamage);
}

struct HintChecker<'v> {
    visitor: &'v mut dyn HintVisitor,
}

impl ArrayVisitor for HintChecker<'_> {
    fn value(&mut self, _index: u64, _data: &[u8]) {}

    fn missing(&mut self, keys: KeyRange, detail: String) {
        self.visitor
            .visit(&HintDamage::Missing { keys, desc: detail });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_validation() {
        assert!(valid_hint_width(4));
        assert!(valid_hint_width(128));
        assert!(!valid_hint_width(0));
        assert!(!valid_hint_width(2));
        assert!(!valid_hint_width(6));
        assert!(!valid_hint_width(132));
    }
}
