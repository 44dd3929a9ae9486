//! File Abstraction
//!
//! Executables and memory-mapped files are read through the kernel's file
//! layer. Every handle has its own cursor, so the manager only uses the
//! positional `read_at`/`write_at` calls and never disturbs a process's
//! own file position.

use alloc::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::mm::address::PAGE_SIZE;

/// An open file.
///
/// Callers serialize access through the kernel's [`FsLock`](crate::sync::FsLock).
pub trait File: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`; returns bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write up to `buf.len()` bytes starting at `offset`; returns bytes
    /// written. Writes to a file with writes denied return 0.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// File length in bytes.
    fn length(&self) -> u64;

    /// Open a new, independent handle to the same file.
    fn reopen(&self) -> Option<FileHandle>;

    /// Refuse writes while the file backs a running program.
    fn deny_write(&self);

    /// Undo one `deny_write`.
    fn allow_write(&self);
}

/// A reference-counted open file; the file closes with its last handle.
pub type FileHandle = Arc<dyn File>;

/// The slice of a file that backs one virtual page.
#[derive(Clone)]
pub struct FileSegment {
    /// File the page is read from.
    pub file: FileHandle,
    /// Byte offset of the page in the file.
    pub offset: u64,
    /// Bytes read from the file; the rest of the page is zero-filled.
    pub read_bytes: usize,
    /// Trailing zero bytes, `PAGE_SIZE - read_bytes`.
    pub zero_bytes: usize,
    /// Dirty content goes back to the file (memory-mapped files) rather
    /// than to swap (executable segments).
    pub shared: bool,
}

impl FileSegment {
    /// Describe the page at `offset` of `file`.
    pub fn new(file: FileHandle, offset: u64, read_bytes: usize, shared: bool) -> Self {
        debug_assert!(read_bytes <= PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
            shared,
        }
    }

    /// Fill `page` from the file, zeroing the tail.
    pub(crate) fn load(&self, page: &mut [u8]) -> VmResult<()> {
        let (head, tail) = page.split_at_mut(self.read_bytes);
        if self.file.read_at(head, self.offset) != self.read_bytes {
            return Err(VmError::BackingStore);
        }
        tail.fill(0);
        Ok(())
    }

    /// Write the file-backed part of `page` back to the file.
    pub(crate) fn store(&self, page: &[u8]) -> VmResult<()> {
        if self.file.write_at(&page[..self.read_bytes], self.offset) != self.read_bytes {
            return Err(VmError::BackingStore);
        }
        Ok(())
    }
}

impl core::fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileSegment")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .field("shared", &self.shared)
            .finish()
    }
}
