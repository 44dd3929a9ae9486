//! Physical and Virtual Address Types
//!
//! Type-safe wrappers for memory addresses that prevent mixing
//! physical frames and user virtual pages at compile time.
//!
//! # Layout
//! - User space: `[0, PHYS_BASE)`
//! - The user stack grows down from `PHYS_BASE`, at most `STACK_LIMIT` bytes
//! - Kernel space: `[PHYS_BASE, ..)`, never paged by this crate

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// First kernel virtual address; everything below belongs to user space.
pub const PHYS_BASE: usize = 0xC000_0000;

/// Maximum size of a user stack (8 MiB).
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// How far below the stack pointer a push may legitimately fault.
///
/// `PUSHA` writes 32 bytes below `esp` before adjusting it.
pub const STACK_SLACK: usize = 32;

/// A physical frame address.
///
/// Physical addresses cannot be dereferenced directly; frame contents are
/// reached through the [`UserPool`](super::frame::UserPool) that owns them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A virtual address in some process's address space.
///
/// Supplemental page table keys are always page-aligned `VirtAddr`s,
/// normalized with [`VirtAddr::page`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// The page containing this address.
    #[inline]
    pub const fn page(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Check if this is a user address (below `PHYS_BASE`).
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < PHYS_BASE
    }

    /// Add an offset to this address, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Add a page-count offset to this address.
    ///
    /// # Panics
    /// Panics on address-space overflow.
    #[inline]
    pub const fn add_pages(self, pages: usize) -> Self {
        Self(self.0 + pages * PAGE_SIZE)
    }

    /// Iterate over the `count` consecutive pages starting at this page.
    pub fn pages(self, count: usize) -> impl Iterator<Item = VirtAddr> {
        let base = self.page();
        (0..count).map(move |i| base.add_pages(i))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
pub const fn pages_spanned(bytes: usize) -> usize {
    (bytes + PAGE_MASK) >> PAGE_SHIFT
}
