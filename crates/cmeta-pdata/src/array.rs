//! Dense fixed-width-entry array over the transaction manager.
//!
//! One index page of child pointers fans out to value pages holding packed
//! entries. Reads validate every page on the way down; writes go through
//! copy-on-write shadowing, so the root address moves as pages move.

use crate::pages::{
    ARRAY_PAGE_MAGIC, INDEX_CAPACITY, INDEX_PAGE_MAGIC, PageHeader, array_page_validator,
    entries_per_page, entry_offset, index_page_validator,
};
use crate::tm::TransactionManager;
use cmeta_error::{MetaError, Result};
use cmeta_types::{BlockAddress, KeyRange, read_le_u64, write_le_u64};

/// Walk callback. Damage never aborts the walk; it is reported through
/// `missing` and the walk continues with the next page.
pub trait ArrayVisitor {
    fn value(&mut self, index: u64, data: &[u8]);
    fn missing(&mut self, keys: KeyRange, detail: String);
}

pub struct Array<'a> {
    tm: &'a TransactionManager,
    root: BlockAddress,
    value_size: u32,
    nr_entries: u64,
}

impl<'a> Array<'a> {
    /// Format a new array of `nr_entries` copies of `fill`.
    pub fn create(
        tm: &'a TransactionManager,
        value_size: u32,
        nr_entries: u64,
        fill: &[u8],
    ) -> Result<Self> {
        debug_assert_eq!(fill.len(), value_size as usize);
        let per_page = entries_per_page(value_size)?;
        let nr_pages = nr_entries.div_ceil(per_page);
        if nr_pages > INDEX_CAPACITY {
            return Err(MetaError::OutOfRange {
                context: "array pages",
                value: nr_pages,
                limit: INDEX_CAPACITY,
            });
        }

        let mut pages = Vec::with_capacity(nr_pages as usize);
        for page in 0..nr_pages {
            let begin = page * per_page;
            let nr = per_page.min(nr_entries - begin);
            let wr = tm.new_block(array_page_validator())?;
            let mut data = wr.data_mut();
            PageHeader {
                magic: ARRAY_PAGE_MAGIC,
                blocknr: wr.location().0,
                nr_entries: nr as u32,
                value_size,
            }
            .encode(&mut data);
            for slot in 0..nr {
                let offset = entry_offset(slot, value_size);
                data[offset..offset + fill.len()].copy_from_slice(fill);
            }
            pages.push(wr.location());
        }

        let index = tm.new_block(index_page_validator())?;
        {
            let mut data = index.data_mut();
            PageHeader {
                magic: INDEX_PAGE_MAGIC,
                blocknr: index.location().0,
                nr_entries: nr_pages as u32,
                value_size: 8,
            }
            .encode(&mut data);
            for (page, addr) in pages.iter().enumerate() {
                write_le_u64(&mut data, entry_offset(page as u64, 8), addr.0);
            }
        }

        Ok(Self {
            tm,
            root: index.location(),
            value_size,
            nr_entries,
        })
    }

    /// View an existing array rooted at `root`.
    #[must_use]
    pub fn open(
        tm: &'a TransactionManager,
        root: BlockAddress,
        value_size: u32,
        nr_entries: u64,
    ) -> Self {
        Self {
            tm,
            root,
            value_size,
            nr_entries,
        }
    }

    #[must_use]
    pub fn root(&self) -> BlockAddress {
        self.root
    }

    #[must_use]
    pub fn nr_entries(&self) -> u64 {
        self.nr_entries
    }

    fn locate(&self, index: u64) -> Result<(u64, u64)> {
        if index >= self.nr_entries {
            return Err(MetaError::OutOfRange {
                context: "array index",
                value: index,
                limit: self.nr_entries,
            });
        }
        let per_page = entries_per_page(self.value_size)?;
        Ok((index / per_page, index % per_page))
    }

    fn check_value_page(&self, header: &PageHeader, block: BlockAddress, slot: u64) -> Result<()> {
        if header.value_size != self.value_size || u64::from(header.nr_entries) <= slot {
            return Err(MetaError::CorruptStructure {
                block,
                detail: format!(
                    "value page holds {} entries of {} bytes, wanted slot {} of {} bytes",
                    header.nr_entries, header.value_size, slot, self.value_size
                ),
            });
        }
        Ok(())
    }

    /// Copy entry `index` into `out` (`out.len()` must equal the value size).
    pub fn get(&self, index: u64, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.value_size as usize);
        let (page, slot) = self.locate(index)?;

        let index_ref = self.tm.read(self.root, index_page_validator())?;
        let ptr = read_le_u64(&index_ref.data(), entry_offset(page, 8))?;

        let leaf = self.tm.read(BlockAddress(ptr), array_page_validator())?;
        let data = leaf.data();
        let header = PageHeader::decode(&data)?;
        self.check_value_page(&header, BlockAddress(ptr), slot)?;

        let offset = entry_offset(slot, self.value_size);
        out.copy_from_slice(&data[offset..offset + out.len()]);
        Ok(())
    }

    /// Write entry `index`, shadowing the pages on the path. The root may
    /// move; read it back with [`Self::root`] before committing.
    pub fn set(&mut self, index: u64, value: &[u8]) -> Result<()> {
        debug_assert_eq!(value.len(), self.value_size as usize);
        let (page, slot) = self.locate(index)?;

        let (index_ref, _) = self.tm.shadow(self.root, index_page_validator())?;
        self.root = index_ref.location();

        let ptr_offset = entry_offset(page, 8);
        let ptr = read_le_u64(&index_ref.data(), ptr_offset)?;

        let (leaf, moved) = self
            .tm
            .shadow(BlockAddress(ptr), array_page_validator())?;
        if moved {
            write_le_u64(&mut index_ref.data_mut(), ptr_offset, leaf.location().0);
        }

        {
            let mut data = leaf.data_mut();
            let header = PageHeader::decode(&data)?;
            self.check_value_page(&header, leaf.location(), slot)?;
            let offset = entry_offset(slot, self.value_size);
            data[offset..offset + value.len()].copy_from_slice(value);
        }
        Ok(())
    }

    /// Convenience accessors for the common le64 entry width.
    pub fn get_u64(&self, index: u64) -> Result<u64> {
        let mut raw = [0_u8; 8];
        self.get(index, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn set_u64(&mut self, index: u64, value: u64) -> Result<()> {
        self.set(index, &value.to_le_bytes())
    }

    /// Visit every entry in index order. Unreadable or malformed pages are
    /// reported as missing key ranges; the walk never fails.
    pub fn walk(&self, visitor: &mut dyn ArrayVisitor) {
        if self.nr_entries == 0 {
            return;
        }
        let Ok(per_page) = entries_per_page(self.value_size) else {
            visitor.missing(
                KeyRange::new(0, self.nr_entries),
                format!("bad value size {}", self.value_size),
            );
            return;
        };
        let nr_pages = self.nr_entries.div_ceil(per_page);

        let index_ref = match self.tm.read(self.root, index_page_validator()) {
            Ok(r) => r,
            Err(err) => {
                visitor.missing(KeyRange::new(0, self.nr_entries), err.to_string());
                return;
            }
        };
        let index_data = index_ref.data();
        let Ok(index_header) = PageHeader::decode(&index_data) else {
            visitor.missing(
                KeyRange::new(0, self.nr_entries),
                "short index page".to_string(),
            );
            return;
        };

        for page in 0..nr_pages {
            let begin = page * per_page;
            let end = self.nr_entries.min(begin + per_page);
            let keys = KeyRange::new(begin, end);

            if page >= u64::from(index_header.nr_entries) {
                visitor.missing(keys, "index page too short".to_string());
                continue;
            }
            let ptr = match read_le_u64(&index_data, entry_offset(page, 8)) {
                Ok(ptr) => ptr,
                Err(err) => {
                    visitor.missing(keys, err.to_string());
                    continue;
                }
            };

            match self.tm.read(BlockAddress(ptr), array_page_validator()) {
                Ok(leaf) => {
                    let data = leaf.data();
                    let header = match PageHeader::decode(&data) {
                        Ok(h) => h,
                        Err(err) => {
                            visitor.missing(keys, err.to_string());
                            continue;
                        }
                    };
                    if header.value_size != self.value_size {
                        visitor.missing(
                            keys,
                            format!("value page with entry size {}", header.value_size),
                        );
                        continue;
                    }
                    let present = (end - begin).min(u64::from(header.nr_entries));
                    for slot in 0..present {
                        let offset = entry_offset(slot, self.value_size);
                        visitor.value(begin + slot, &data[offset..offset + self.value_size as usize]);
                    }
                    if present < end - begin {
                        visitor.missing(
                            KeyRange::new(begin + present, end),
                            "value page too short".to_string(),
                        );
                    }
                }
                Err(err) => visitor.missing(keys, err.to_string()),
            }
        }
    }

    /// Every page referenced by this array (index page first). Used by the
    /// space-map audit.
    pub fn page_addresses(&self) -> Result<Vec<BlockAddress>> {
        let mut pages = vec![self.root];
        let index_ref = self.tm.read(self.root, index_page_validator())?;
        let data = index_ref.data();
        let header = PageHeader::decode(&data)?;
        for page in 0..u64::from(header.nr_entries) {
            pages.push(BlockAddress(read_le_u64(&data, entry_offset(page, 8))?));
        }
        Ok(pages)
    }
}
