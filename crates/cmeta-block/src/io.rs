//! Raw block I/O on the metadata device.
//!
//! `pread`/`pwrite` style fixed-size block transfers via
//! `std::os::unix::fs::FileExt`; no shared seek position, no buffering.

use cmeta_error::{MetaError, Result};
use cmeta_types::{BlockAddress, MD_BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;
use tracing::trace;

/// True if `path` names something the tools will open as a metadata device.
pub fn is_block_or_regular(path: impl AsRef<Path>) -> Result<bool> {
    let meta = std::fs::metadata(path.as_ref())?;
    let ft = meta.file_type();
    Ok(ft.is_file() || ft.is_block_device())
}

/// Length of the file or block device in bytes.
///
/// `metadata().len()` is zero for block devices, so the length is taken by
/// seeking to the end.
pub fn device_length(path: impl AsRef<Path>) -> Result<u64> {
    let mut file = File::open(path.as_ref())?;
    Ok(file.seek(SeekFrom::End(0))?)
}

/// Fixed-size block transfers against one open metadata device.
///
/// The writable flag is fixed at open time; `write` on a read-only handle
/// fails with `ReadOnly`. The descriptor is owned for the lifetime of this
/// value and closed on drop.
#[derive(Debug)]
pub struct BlockIo {
    file: File,
    nr_blocks: u64,
    writable: bool,
}

impl BlockIo {
    /// Open `path` and size it in metadata blocks (trailing partial blocks
    /// are not addressable).
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let mut file = if writable {
            OpenOptions::new().read(true).write(true).open(path.as_ref())?
        } else {
            OpenOptions::new().read(true).open(path.as_ref())?
        };
        let len = file.seek(SeekFrom::End(0))?;
        let nr_blocks = len / MD_BLOCK_SIZE as u64;
        trace!(
            event = "device_open",
            path = %path.as_ref().display(),
            nr_blocks,
            writable
        );
        Ok(Self {
            file,
            nr_blocks,
            writable,
        })
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    fn offset_of(&self, block: BlockAddress) -> Result<u64> {
        if block.0 >= self.nr_blocks {
            return Err(MetaError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block {} beyond end of metadata device (nr_blocks={})",
                    block.0, self.nr_blocks
                ),
            )));
        }
        block
            .to_byte_offset()
            .ok_or_else(|| MetaError::Io(io::Error::other("block offset overflows u64")))
    }

    /// Read exactly one block into `buf`. `buf.len()` must be `MD_BLOCK_SIZE`.
    pub fn read(&self, block: BlockAddress, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), MD_BLOCK_SIZE);
        let offset = self.offset_of(block)?;
        self.file.read_exact_at(buf, offset)?;
        trace!(event = "block_read", block = block.0);
        Ok(())
    }

    /// Write exactly one block from `buf`. `buf.len()` must be `MD_BLOCK_SIZE`.
    pub fn write(&self, block: BlockAddress, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), MD_BLOCK_SIZE);
        if !self.writable {
            return Err(MetaError::ReadOnly);
        }
        let offset = self.offset_of(block)?;
        self.file.write_all_at(buf, offset)?;
        trace!(event = "block_write", block = block.0);
        Ok(())
    }

    /// Durability barrier: everything written before this call is stable
    /// before anything written after it.
    pub fn barrier(&self) -> Result<()> {
        self.file.sync_all()?;
        trace!(event = "barrier");
        Ok(())
    }
}
