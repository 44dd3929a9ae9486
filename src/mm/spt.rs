//! Supplemental Page Table
//!
//! Per-process map from user page to the descriptor saying where that
//! page's content lives. The hardware page directory only knows about
//! resident pages; this table knows about all of them.
//!
//! # Design
//! - Keys are page-aligned user addresses, unique per table
//! - A descriptor has exactly one [`PageStatus`] at a time
//! - `busy` marks a descriptor whose content is in transit (being loaded
//!   or written back). Its status must not be acted on until it clears
//! - Removing a descriptor releases the frame or swap slot it holds

use alloc::collections::BTreeMap;

use super::address::{PhysAddr, VirtAddr};
use super::frame::FrameTable;
use super::swap::{SwapSlot, SwapSpace};
use crate::error::{VmError, VmResult};
use crate::fs::FileSegment;

/// Where a page's content currently lives.
#[derive(Debug, Clone)]
pub enum PageStatus {
    /// Never touched; materializes as a zeroed page.
    Zero,
    /// Loaded on demand from a file.
    FileBacked(FileSegment),
    /// Written out to the swap area.
    Swapped(SwapSlot),
    /// In a physical frame.
    ///
    /// `file` is kept for file-backed pages so that a clean eviction can
    /// return the page to [`PageStatus::FileBacked`].
    Resident {
        frame: PhysAddr,
        file: Option<FileSegment>,
    },
}

impl PageStatus {
    /// The frame of a resident page.
    #[inline]
    pub fn frame(&self) -> Option<PhysAddr> {
        match self {
            Self::Resident { frame, .. } => Some(*frame),
            _ => None,
        }
    }

    /// Check if the page is in a physical frame.
    #[inline]
    pub fn is_resident(&self) -> bool {
        matches!(self, Self::Resident { .. })
    }
}

/// Supplemental page table entry for one user page.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    /// Page-aligned user address.
    pub upage: VirtAddr,
    /// Page may be written by the process.
    pub writable: bool,
    /// Where the content lives.
    pub status: PageStatus,
    /// Content is in transit.
    pub(crate) busy: bool,
}

impl PageDescriptor {
    fn new(upage: VirtAddr, writable: bool, status: PageStatus) -> Self {
        debug_assert!(upage.is_aligned());
        Self {
            upage,
            writable,
            status,
            busy: false,
        }
    }

    /// Check if the content is being loaded or written back.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

/// A process's supplemental page table.
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtAddr, PageDescriptor>,
}

impl SupplementalPageTable {
    /// Create an empty table.
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Register a page that materializes as zeroes.
    pub fn insert_zero(&mut self, upage: VirtAddr, writable: bool) -> VmResult<()> {
        self.insert(PageDescriptor::new(upage, writable, PageStatus::Zero))
    }

    /// Register a page loaded on demand from `segment`.
    pub fn insert_file_backed(
        &mut self,
        upage: VirtAddr,
        segment: FileSegment,
        writable: bool,
    ) -> VmResult<()> {
        self.insert(PageDescriptor::new(
            upage,
            writable,
            PageStatus::FileBacked(segment),
        ))
    }

    /// Register a page that is already in `frame` and mapped.
    pub fn insert_resident(
        &mut self,
        upage: VirtAddr,
        frame: PhysAddr,
        writable: bool,
    ) -> VmResult<()> {
        self.insert(PageDescriptor::new(
            upage,
            writable,
            PageStatus::Resident { frame, file: None },
        ))
    }

    fn insert(&mut self, desc: PageDescriptor) -> VmResult<()> {
        if !desc.upage.is_aligned() || !desc.upage.is_user() {
            return Err(VmError::MappingConflict);
        }
        if self.pages.contains_key(&desc.upage) {
            return Err(VmError::MappingConflict);
        }
        self.pages.insert(desc.upage, desc);
        Ok(())
    }

    /// Descriptor of the page containing `addr`.
    pub fn lookup(&self, addr: VirtAddr) -> Option<&PageDescriptor> {
        self.pages.get(&addr.page())
    }

    /// Mutable descriptor of the page containing `addr`.
    pub fn lookup_mut(&mut self, addr: VirtAddr) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&addr.page())
    }

    /// Check if the page containing `addr` is registered.
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.pages.contains_key(&addr.page())
    }

    /// Check if any of the `count` pages from `upage` is registered.
    pub fn overlaps(&self, upage: VirtAddr, count: usize) -> bool {
        let end = upage.page().add_pages(count);
        self.pages.range(upage.page()..end).next().is_some()
    }

    /// Remove a descriptor, releasing the frame or swap slot it holds.
    ///
    /// A resident page loses its hardware mapping. The caller must wait for
    /// the descriptor to be idle first.
    pub fn remove(
        &mut self,
        upage: VirtAddr,
        frames: &FrameTable,
        swap: &SwapSpace,
    ) -> Option<PageDescriptor> {
        let desc = self.pages.remove(&upage.page())?;
        debug_assert!(!desc.busy, "removing in-flight page {}", desc.upage);
        release(&desc, frames, swap);
        Some(desc)
    }

    /// Remove every descriptor, releasing frames and swap slots.
    ///
    /// In-flight descriptors are dropped without releasing anything: the
    /// thread moving their content finds them gone and cleans up itself.
    pub fn destroy_all(&mut self, frames: &FrameTable, swap: &SwapSpace) {
        for (_, desc) in core::mem::take(&mut self.pages) {
            if !desc.busy {
                release(&desc, frames, swap);
            }
        }
    }

    /// Number of registered pages.
    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check if no page is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterate over descriptors in address order.
    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages.values()
    }
}

fn release(desc: &PageDescriptor, frames: &FrameTable, swap: &SwapSpace) {
    match desc.status {
        PageStatus::Resident { frame, .. } => frames.free(frame),
        PageStatus::Swapped(slot) => swap.free(slot),
        PageStatus::Zero | PageStatus::FileBacked(_) => {}
    }
}
