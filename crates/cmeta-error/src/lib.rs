#![forbid(unsafe_code)]
//! Error types for the cache metadata tools.
//!
//! Defines `MetaError` and a `Result<T>` alias used throughout the
//! workspace.

use cmeta_types::{BlockAddress, CodecError};
use thiserror::Error;

/// Unified error type for all metadata operations.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write attempted through a read-only handle")]
    ReadOnly,

    #[error("block {block} is locked by another holder")]
    Busy { block: BlockAddress },

    #[error("superblock commit attempted with {held} lock(s) still held")]
    LocksHeld { held: usize },

    #[error("block cache is full: every entry is locked or dirty")]
    CacheFull,

    #[error("checksum mismatch at block {block}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        block: BlockAddress,
        expected: u32,
        actual: u32,
    },

    #[error("bad magic at block {block}: expected {expected:#x}, got {actual:#x}")]
    MagicMismatch {
        block: BlockAddress,
        expected: u64,
        actual: u64,
    },

    #[error("unsupported metadata version {actual} (supported: {min}..={max})")]
    VersionUnsupported { actual: u32, min: u32, max: u32 },

    #[error("out of range: {context} ({value} >= {limit})")]
    OutOfRange {
        context: &'static str,
        value: u64,
        limit: u64,
    },

    #[error("corrupt structure at block {block}: {detail}")]
    CorruptStructure { block: BlockAddress, detail: String },

    #[error("no free metadata blocks")]
    NoSpace,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result alias using `MetaError`.
pub type Result<T> = std::result::Result<T, MetaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_block() {
        let err = MetaError::ChecksumMismatch {
            block: BlockAddress(7),
            expected: 0xAABB_CCDD,
            actual: 0x1122_3344,
        };
        let text = err.to_string();
        assert!(text.contains("block 7"));
        assert!(text.contains("0xaabbccdd"));

        let err = MetaError::Busy {
            block: BlockAddress(3),
        };
        assert!(err.to_string().contains("block 3"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: MetaError = io.into();
        assert!(matches!(err, MetaError::Io(_)));
    }
}
