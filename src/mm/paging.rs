//! Hardware Page Table Adapter
//!
//! The virtual memory manager never walks page tables itself. Each process
//! owns a [`PageDirectory`] supplied by the kernel, and the manager installs,
//! removes and inspects user mappings through it.
//!
//! [`PageTableEntry`] and [`PteFlags`] give the i386 encoding of a leaf
//! entry, for kernels whose directory implementation stores raw entries.

use bitflags::bitflags;

use super::address::{PhysAddr, VirtAddr};

bitflags! {
    /// Leaf page table entry flags (i386 layout).
    ///
    /// `ACCESSED` and `DIRTY` are set by the MMU and cleared by software.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Entry maps a frame.
        const PRESENT = 1 << 0;
        /// Page may be written.
        const WRITABLE = 1 << 1;
        /// Page is reachable from user mode.
        const USER = 1 << 2;
        /// Page has been read or written since the bit was last cleared.
        const ACCESSED = 1 << 5;
        /// Page has been written since the bit was last cleared.
        const DIRTY = 1 << 6;
    }
}

/// A single leaf page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Address mask for page table entries (bits [31:12]).
    const ADDR_MASK: u32 = 0xFFFF_F000;

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Create a present user entry mapping `frame`.
    #[inline]
    pub fn user_page(frame: PhysAddr, writable: bool) -> Self {
        debug_assert!(frame.is_aligned());
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        Self((frame.as_usize() as u32 & Self::ADDR_MASK) | flags.bits())
    }

    /// Check if the entry is valid (present).
    #[inline]
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Check if the page was written through this entry.
    #[inline]
    pub fn is_dirty(self) -> bool {
        self.flags().contains(PteFlags::DIRTY)
    }

    /// Get the physical frame from this entry.
    #[inline]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new((self.0 & Self::ADDR_MASK) as usize)
    }

    /// Get the flags from this entry.
    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    /// Set or clear some flags, keeping the frame.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags, value: bool) {
        let mut current = self.flags();
        current.set(flags, value);
        self.0 = (self.0 & Self::ADDR_MASK) | current.bits();
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE(frame={}, flags={:?})", self.frame(), self.flags())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// No physical memory available for page tables.
    OutOfMemory,
    /// The address is not properly aligned.
    MisalignedAddress,
    /// Attempted to map a kernel address with user permissions.
    KernelAddress,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::OutOfMemory => write!(f, "out of memory for page tables"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
            Self::KernelAddress => write!(f, "kernel address in user mapping"),
        }
    }
}

/// A process's hardware page directory.
///
/// Implementations provide their own synchronization: the manager calls
/// these methods from any thread, sometimes while holding its own locks,
/// so an implementation must never call back into the manager.
pub trait PageDirectory: Send + Sync {
    /// Map user page `upage` to `frame`.
    fn map(&self, upage: VirtAddr, frame: PhysAddr, writable: bool) -> Result<(), MappingError>;

    /// Remove the mapping for `upage`, if any, and flush it from the TLB.
    ///
    /// Returns the removed entry. Its accessed and dirty bits are final: the
    /// MMU can no longer set them once the entry is gone.
    fn unmap(&self, upage: VirtAddr) -> Option<PageTableEntry>;

    /// The frame `upage` currently maps to.
    fn translate(&self, upage: VirtAddr) -> Option<PhysAddr>;

    /// Check the hardware dirty bit. Unmapped pages are clean.
    fn is_dirty(&self, upage: VirtAddr) -> bool;

    /// Set or clear the hardware dirty bit.
    fn set_dirty(&self, upage: VirtAddr, dirty: bool);

    /// Check the hardware accessed bit. Unmapped pages are not accessed.
    fn is_accessed(&self, upage: VirtAddr) -> bool;

    /// Set or clear the hardware accessed bit.
    fn set_accessed(&self, upage: VirtAddr, accessed: bool);
}
