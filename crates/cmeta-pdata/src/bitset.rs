//! Packed on-disk bit array.
//!
//! Bits are stored least-significant-first inside le64 words held in an
//! [`Array`]; bit `i` lives in word `i / 64` at bit position `i % 64`.

use crate::array::{Array, ArrayVisitor};
use crate::tm::TransactionManager;
use cmeta_error::{MetaError, Result};
use cmeta_types::{BlockAddress, KeyRange};

/// Walk callback for bitsets. `missing` covers unreadable bit ranges.
pub trait BitsetVisitor {
    fn bit(&mut self, index: u64, value: bool);
    fn missing(&mut self, keys: KeyRange);
}

pub struct Bitset<'a> {
    array: Array<'a>,
    nr_bits: u64,
}

impl<'a> Bitset<'a> {
    /// Format a bitset of `nr_bits` zero bits.
    pub fn create(tm: &'a TransactionManager, nr_bits: u64) -> Result<Self> {
        let nr_words = nr_bits.div_ceil(64);
        let array = Array::create(tm, 8, nr_words, &0_u64.to_le_bytes())?;
        Ok(Self { array, nr_bits })
    }

    #[must_use]
    pub fn open(tm: &'a TransactionManager, root: BlockAddress, nr_bits: u64) -> Self {
        Self {
            array: Array::open(tm, root, 8, nr_bits.div_ceil(64)),
            nr_bits,
        }
    }

    #[must_use]
    pub fn root(&self) -> BlockAddress {
        self.array.root()
    }

    #[must_use]
    pub fn nr_bits(&self) -> u64 {
        self.nr_bits
    }

    fn locate(&self, bit: u64) -> Result<(u64, u64)> {
        if bit >= self.nr_bits {
            return Err(MetaError::OutOfRange {
                context: "bitset index",
                value: bit,
                limit: self.nr_bits,
            });
        }
        Ok((bit / 64, bit % 64))
    }

    pub fn get(&self, bit: u64) -> Result<bool> {
        let (word, offset) = self.locate(bit)?;
        Ok(self.array.get_u64(word)? >> offset & 1 == 1)
    }

    pub fn set(&mut self, bit: u64, value: bool) -> Result<()> {
        let (word, offset) = self.locate(bit)?;
        let mut bits = self.array.get_u64(word)?;
        if value {
            bits |= 1 << offset;
        } else {
            bits &= !(1 << offset);
        }
        self.array.set_u64(word, bits)
    }

    /// Visit every bit in index order.
    pub fn walk(&self, visitor: &mut dyn BitsetVisitor) {
        let mut adapter = WordAdapter {
            inner: visitor,
            nr_bits: self.nr_bits,
        };
        self.array.walk(&mut adapter);
    }

    /// Pages backing this bitset, for the space-map audit.
    pub fn page_addresses(&self) -> Result<Vec<BlockAddress>> {
        self.array.page_addresses()
    }
}

struct WordAdapter<'v> {
    inner: &'v mut dyn BitsetVisitor,
    nr_bits: u64,
}

impl ArrayVisitor for WordAdapter<'_> {
    fn value(&mut self, index: u64, data: &[u8]) {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(data);
        let word = u64::from_le_bytes(raw);
        let begin = index * 64;
        for offset in 0..64 {
            let bit = begin + offset;
            if bit >= self.nr_bits {
                break;
            }
            self.inner.bit(bit, word >> offset & 1 == 1);
        }
    }

    fn missing(&mut self, keys: KeyRange, _detail: String) {
        let begin = (keys.begin * 64).min(self.nr_bits);
        let end = (keys.end * 64).min(self.nr_bits);
        if begin < end {
            self.inner.missing(KeyRange::new(begin, end));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_map::SpaceMap;
    use cmeta_block::BlockManager;
    use cmeta_types::{MD_BLOCK_SIZE, SUPERBLOCK_LOCATION};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::Arc;

    fn fixture(nr_blocks: u64) -> (tempfile::NamedTempFile, TransactionManager) {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(&vec![0_u8; (nr_blocks as usize) * MD_BLOCK_SIZE])
            .expect("fill");
        f.flush().expect("flush");

        let bm = Arc::new(BlockManager::open(f.path(), 64, true).expect("open"));
        let mut sm = SpaceMap::new(nr_blocks);
        sm.inc(SUPERBLOCK_LOCATION).expect("superblock count");
        let tm = TransactionManager::new(bm, Arc::new(Mutex::new(sm)));
        (f, tm)
    }

    struct BitCollector {
        set_bits: Vec<u64>,
        missing: Vec<KeyRange>,
        visited: u64,
    }

    impl BitsetVisitor for BitCollector {
        fn bit(&mut self, index: u64, value: bool) {
            self.visited += 1;
            if value {
                self.set_bits.push(index);
            }
        }

        fn missing(&mut self, keys: KeyRange) {
            self.missing.push(keys);
        }
    }

    #[test]
    fn set_get_round_trip() {
        let (_f, tm) = fixture(32);
        let mut bits = Bitset::create(&tm, 200).expect("create");

        bits.set(0, true).expect("set");
        bits.set(63, true).expect("set");
        bits.set(64, true).expect("set");
        bits.set(199, true).expect("set");
        assert!(bits.get(0).expect("get"));
        assert!(bits.get(63).expect("get"));
        assert!(bits.get(64).expect("get"));
        assert!(bits.get(199).expect("get"));
        assert!(!bits.get(1).expect("get"));
        assert!(!bits.get(65).expect("get"));

        bits.set(63, false).expect("clear");
        assert!(!bits.get(63).expect("get"));
        assert!(bits.get(64).expect("get"), "neighbouring word untouched");

        assert!(matches!(bits.get(200), Err(MetaError::OutOfRange { .. })));
        assert!(matches!(
            bits.set(200, true),
            Err(MetaError::OutOfRange { .. })
        ));
    }

    #[test]
    fn walk_visits_every_bit_once() {
        let (_f, tm) = fixture(32);
        let mut bits = Bitset::create(&tm, 130).expect("create");
        bits.set(7, true).expect("set");
        bits.set(129, true).expect("set");

        let mut collector = BitCollector {
            set_bits: Vec::new(),
            missing: Vec::new(),
            visited: 0,
        };
        bits.walk(&mut collector);
        assert_eq!(collector.visited, 130);
        assert_eq!(collector.set_bits, vec![7, 129]);
        assert!(collector.missing.is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_patterns_round_trip(indices in proptest::collection::btree_set(0_u64..500, 0..40)) {
            let (_f, tm) = fixture(32);
            let mut bits = Bitset::create(&tm, 500).expect("create");
            for i in &indices {
                bits.set(*i, true).expect("set");
            }
            for i in 0..500 {
                prop_assert_eq!(bits.get(i).expect("get"), indices.contains(&i));
            }
        }
    }
}
