//! Virtual Memory Errors
//!
//! Every recoverable failure of the manager is a [`VmError`]. Bookkeeping
//! corruption is not an error value: it panics at the point of detection.

use crate::drivers::block::BlockError;
use crate::mm::paging::MappingError;

/// Error type for virtual memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Fault on an address with no page descriptor that is not a stack
    /// access, on a kernel address, or a write to a read-only page.
    AddressViolation,
    /// No frame could be obtained, even after eviction.
    AllocationExhausted,
    /// No free slot left in the swap area.
    SwapExhausted,
    /// A file or swap transfer moved fewer bytes than required.
    BackingStore,
    /// The hardware page directory refused a mapping.
    Mapping(MappingError),
    /// A new mapping or segment is null, misaligned, empty, outside user
    /// space, or overlaps an existing page.
    MappingConflict,
}

impl VmError {
    /// Whether this error must terminate the process that triggered it.
    ///
    /// Only `MappingConflict` is reported back to the caller instead.
    pub const fn is_fatal_to_process(self) -> bool {
        !matches!(self, Self::MappingConflict)
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AddressViolation => write!(f, "invalid user memory access"),
            Self::AllocationExhausted => write!(f, "no evictable frame"),
            Self::SwapExhausted => write!(f, "swap area full"),
            Self::BackingStore => write!(f, "short transfer on backing store"),
            Self::Mapping(e) => write!(f, "page directory: {}", e),
            Self::MappingConflict => write!(f, "invalid or overlapping mapping"),
        }
    }
}

impl From<MappingError> for VmError {
    fn from(e: MappingError) -> Self {
        Self::Mapping(e)
    }
}

impl From<BlockError> for VmError {
    fn from(_: BlockError) -> Self {
        Self::BackingStore
    }
}

/// Result alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;
