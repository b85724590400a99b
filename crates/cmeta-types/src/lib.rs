#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Metadata block size. The whole format is defined in terms of 4 KiB pages.
pub const MD_BLOCK_SIZE: usize = 4096;

/// The superblock always lives at block 0.
pub const SUPERBLOCK_LOCATION: BlockAddress = BlockAddress(0);

/// Index into the metadata device, in units of [`MD_BLOCK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddress(pub u64);

/// Cache-device block index; primary key of the mapping and hint arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cblock(pub u32);

/// Origin (backing-device) block index.
///
/// Stored on disk in 48 bits; see [`MAX_OBLOCK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oblock(pub u64);

/// Largest oblock representable in the packed mapping encoding.
pub const MAX_OBLOCK: u64 = (1 << 48) - 1;

/// Half-open range of array/bitset keys, used in damage reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: u64,
    pub end: u64,
}

impl KeyRange {
    #[must_use]
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Cblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Oblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl BlockAddress {
    /// Byte offset of this block on the metadata device.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(MD_BLOCK_SIZE as u64)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(CodecError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(CodecError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, CodecError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, CodecError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Decode a NUL-padded fixed-width name field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Encode a name into a NUL-padded fixed-width field, truncating if needed.
pub fn write_nul_padded(dest: &mut [u8], name: &str) {
    dest.fill(0);
    let src = name.as_bytes();
    let n = src.len().min(dest.len());
    dest[..n].copy_from_slice(&src[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u32(&mut buf, 0, 0x1234_5678);
        write_le_u64(&mut buf, 8, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(read_le_u32(&buf, 0).expect("u32"), 0x1234_5678);
        assert_eq!(read_le_u64(&buf, 8).expect("u64"), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn le_helpers_bounds() {
        let buf = [0_u8; 4];
        assert!(read_le_u32(&buf, 0).is_ok());
        assert!(read_le_u32(&buf, 1).is_err());
        assert!(read_le_u64(&buf, 0).is_err());
    }

    #[test]
    fn nul_padded_round_trip() {
        let mut field = [0xFF_u8; 16];
        write_nul_padded(&mut field, "smq");
        assert_eq!(trim_nul_padded(&field), "smq");
        assert!(field[3..].iter().all(|b| *b == 0));

        write_nul_padded(&mut field, "a-policy-name-that-is-too-long");
        assert_eq!(trim_nul_padded(&field), "a-policy-name-th");
    }

    #[test]
    fn key_range_display() {
        let r = KeyRange::new(4, 10);
        assert_eq!(r.to_string(), "[4, 10)");
        assert_eq!(r.len(), 6);
        assert!(!r.is_empty());
        assert!(KeyRange::new(7, 7).is_empty());
    }

    #[test]
    fn block_address_byte_offset() {
        assert_eq!(BlockAddress(0).to_byte_offset(), Some(0));
        assert_eq!(BlockAddress(2).to_byte_offset(), Some(8192));
        assert_eq!(BlockAddress(u64::MAX).to_byte_offset(), None);
    }
}
