//! Block Device Interface
//!
//! The swap area lives on a block device addressed in fixed-size sectors.
//! A page occupies [`SECTORS_PER_PAGE`] consecutive sectors.

use crate::mm::address::PAGE_SIZE;

/// Size of one device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors needed to hold one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);

/// Index of a sector on a block device.
pub type SectorId = u32;

/// Error type for block device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector lies beyond the end of the device.
    OutOfRange,
    /// The device reported a transfer failure.
    Io,
}

impl core::fmt::Display for BlockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "sector out of range"),
            Self::Io => write!(f, "device i/o error"),
        }
    }
}

/// A sector-addressed block device.
///
/// Transfers block the calling thread until they complete; the swap
/// manager never holds a lock across them.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sector_count(&self) -> SectorId;

    /// Read one sector into `buf` (`SECTOR_SIZE` bytes).
    fn read(&self, sector: SectorId, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write one sector from `buf` (`SECTOR_SIZE` bytes).
    fn write(&self, sector: SectorId, buf: &[u8]) -> Result<(), BlockError>;
}
