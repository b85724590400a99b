//! Per-block-kind integrity policy.
//!
//! A validator is a pair of pure operations: `check` runs after every read
//! from disk and must reject blocks that do not satisfy the structural
//! contract for their kind; `prepare` runs immediately before every write
//! and seals the block (recomputes the checksum, stamps the address).

use cmeta_error::Result;
use cmeta_types::BlockAddress;
use std::sync::Arc;

pub trait Validator: Send + Sync {
    /// Reject `data` if it does not satisfy this block kind's contract.
    ///
    /// Must be total: corruption is reported as an error, never a panic.
    fn check(&self, data: &[u8], location: BlockAddress) -> Result<()>;

    /// Seal `data` for writing at `location`.
    ///
    /// Must be deterministic given `(data, location)`.
    fn prepare(&self, data: &mut [u8], location: BlockAddress);
}

/// The default validator: accepts anything, seals nothing.
#[derive(Debug, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn check(&self, _data: &[u8], _location: BlockAddress) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _data: &mut [u8], _location: BlockAddress) {}
}

#[must_use]
pub fn noop_validator() -> Arc<dyn Validator> {
    Arc::new(NoopValidator)
}

/// Checksum of a metadata page: standard CRC-32C over the page with the
/// 4-byte checksum slot at `csum_offset` zeroed.
#[must_use]
pub fn page_checksum(data: &[u8], csum_offset: usize) -> u32 {
    let mut csum = crc32c::crc32c(&data[..csum_offset]);
    csum = crc32c::crc32c_append(csum, &[0, 0, 0, 0]);
    crc32c::crc32c_append(csum, &data[csum_offset + 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmeta_types::MD_BLOCK_SIZE;

    #[test]
    fn noop_accepts_everything() {
        let v = NoopValidator;
        let mut data = vec![0xFF_u8; MD_BLOCK_SIZE];
        assert!(v.check(&data, BlockAddress(0)).is_ok());
        v.prepare(&mut data, BlockAddress(0));
        assert!(data.iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn page_checksum_ignores_the_csum_slot() {
        let mut a = vec![7_u8; 64];
        let mut b = a.clone();
        a[8..12].copy_from_slice(&[1, 2, 3, 4]);
        b[8..12].copy_from_slice(&[5, 6, 7, 8]);
        assert_eq!(page_checksum(&a, 8), page_checksum(&b, 8));
    }

    #[test]
    fn page_checksum_sees_every_other_byte() {
        let a = vec![7_u8; 64];
        let mut b = a.clone();
        b[63] = 8;
        assert_ne!(page_checksum(&a, 8), page_checksum(&b, 8));
    }
}
