//! Page Fault Resolution
//!
//! Demand paging entry point. A not-present fault on a registered page
//! gets a frame, the page's content, and a hardware mapping. A fault just
//! below the stack pointer grows the stack. Anything else kills the
//! faulting process.
//!
//! Also home to the load-time registrations that feed the fault path: the
//! initial stack page and lazily loaded program segments.

use alloc::sync::Arc;

use log::{trace, warn};

use super::address::{pages_spanned, VirtAddr, PAGE_SIZE, PHYS_BASE};
use super::spt::PageStatus;
use super::VmManager;
use crate::error::{VmError, VmResult};
use crate::fs::{FileHandle, FileSegment};
use crate::mm::address::PhysAddr;
use crate::process::{AddressSpace, EXIT_FAILURE};

/// A page fault as reported by the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address.
    pub addr: VirtAddr,
    /// User stack pointer at the time of the fault.
    pub esp: VirtAddr,
    /// The access was a write.
    pub write: bool,
    /// The page was not present (as opposed to a protection violation).
    pub not_present: bool,
}

impl PageFault {
    /// A not-present fault.
    pub const fn not_present(addr: VirtAddr, esp: VirtAddr, write: bool) -> Self {
        Self {
            addr,
            esp,
            write,
            not_present: true,
        }
    }
}

impl VmManager {
    /// Handle a page fault on behalf of the process owning `space`.
    ///
    /// Returns whether the faulting access can be retried. Process-fatal
    /// errors terminate the process through the process context.
    ///
    /// # Panics
    /// Panics if the user pool has no frames at all.
    pub fn handle_page_fault(&self, space: &Arc<AddressSpace>, fault: PageFault) -> bool {
        match self.resolve_fault(space, fault) {
            Ok(()) => true,
            Err(VmError::AllocationExhausted) => {
                panic!("vm: pid {} fault at {}: user pool has no frames", space.pid(), fault.addr)
            }
            Err(e) => {
                warn!(
                    "vm: pid {} fault at {} (esp {}): {}",
                    space.pid(),
                    fault.addr,
                    fault.esp,
                    e
                );
                if e.is_fatal_to_process() {
                    self.context.terminate(space.pid(), EXIT_FAILURE);
                }
                false
            }
        }
    }

    /// Make the page containing `fault.addr` resident and mapped.
    ///
    /// File pages are loaded with the file system lock held from before the
    /// page turns busy until the read is done. The lock is only ever waited
    /// for with no frame pinned and no page busy.
    pub fn resolve_fault(&self, space: &Arc<AddressSpace>, fault: PageFault) -> VmResult<()> {
        if !fault.addr.is_user() || !fault.not_present {
            return Err(VmError::AddressViolation);
        }
        let upage = fault.addr.page();
        trace!("vm: pid {} fault at {}", space.pid(), fault.addr);

        let mut fs = None;
        let (frame, status, writable) = loop {
            {
                let mut spt = space.spt.lock();
                if !spt.contains(upage) {
                    if !self.is_stack_access(&fault) {
                        return Err(VmError::AddressViolation);
                    }
                    trace!("vm: pid {} stack grows to {}", space.pid(), upage);
                    spt.insert_zero(upage, true)?;
                }
                let desc = spt.lookup_mut(upage).ok_or(VmError::AddressViolation)?;

                if desc.busy {
                    drop(spt);
                    core::hint::spin_loop();
                    continue;
                }
                if fault.write && !desc.writable {
                    return Err(VmError::AddressViolation);
                }
                if let PageStatus::Resident { frame, .. } = desc.status {
                    if space.page_dir().translate(upage) == Some(frame) {
                        // Another thread brought it in first.
                        return Ok(());
                    }
                    panic!(
                        "vm: pid {} page {} resident in {} but not mapped",
                        space.pid(),
                        upage,
                        frame
                    );
                }
                if matches!(desc.status, PageStatus::FileBacked(_)) && fs.is_none() {
                    drop(spt);
                    fs = Some(self.fs_lock.acquire(self.context.current_tid()));
                    continue;
                }
            }

            let frame = self.allocate_frame(space, upage)?;

            let mut spt = space.spt.lock();
            let Some(desc) = spt.lookup_mut(upage) else {
                drop(spt);
                self.frames.free(frame);
                return Err(VmError::AddressViolation);
            };
            let stale = desc.busy
                || desc.status.is_resident()
                || (matches!(desc.status, PageStatus::FileBacked(_)) && fs.is_none());
            if stale {
                // The page moved on while we looked for a frame.
                drop(spt);
                self.frames.free(frame);
                continue;
            }
            desc.busy = true;
            break (frame, desc.status.clone(), desc.writable);
        };

        let loaded = self.materialize(&status, frame);
        drop(fs);
        if let Err(e) = loaded {
            self.abandon_fault(space, upage, frame, None);
            return Err(e);
        }

        if let Err(e) = space.page_dir().map(upage, frame, writable) {
            // Swap content now only lives in the doomed frame.
            let lost = matches!(status, PageStatus::Swapped(_)).then_some(PageStatus::Zero);
            self.abandon_fault(space, upage, frame, lost);
            return Err(e.into());
        }

        let file = match status {
            PageStatus::FileBacked(seg) => Some(seg),
            _ => None,
        };
        let mut spt = space.spt.lock();
        match spt.lookup_mut(upage).filter(|desc| desc.busy) {
            Some(desc) => {
                desc.status = PageStatus::Resident { frame, file };
                desc.busy = false;
                self.frames.unpin(frame);
                Ok(())
            }
            None => {
                // Torn down while we loaded.
                drop(spt);
                self.frames.free(frame);
                Err(VmError::AddressViolation)
            }
        }
    }

    /// Copy a page's content into its freshly allocated frame.
    ///
    /// File loads expect the caller to hold the file system lock.
    fn materialize(&self, status: &PageStatus, frame: PhysAddr) -> VmResult<()> {
        // SAFETY: The frame is pinned to us and not yet mapped.
        let page = unsafe { self.frames.page_mut(frame) };
        match status {
            // Frames arrive zeroed.
            PageStatus::Zero => Ok(()),
            PageStatus::FileBacked(seg) => seg.load(page),
            PageStatus::Swapped(slot) => self.swap.swap_in(*slot, page),
            PageStatus::Resident { .. } => unreachable!("resident pages are never loaded"),
        }
    }

    /// Undo a fault that could not complete: release the frame and let
    /// other threads at the page again, optionally with a new status.
    fn abandon_fault(
        &self,
        space: &AddressSpace,
        upage: VirtAddr,
        frame: PhysAddr,
        status: Option<PageStatus>,
    ) {
        self.frames.free(frame);
        let mut spt = space.spt.lock();
        if let Some(desc) = spt.lookup_mut(upage).filter(|desc| desc.busy) {
            if let Some(status) = status {
                desc.status = status;
            }
            desc.busy = false;
        }
    }

    /// Check if a fault on an unregistered page is a stack access.
    fn is_stack_access(&self, fault: &PageFault) -> bool {
        let addr = fault.addr.as_usize();
        let bottom = PHYS_BASE.saturating_sub(self.config.stack_limit);
        (bottom..PHYS_BASE).contains(&addr)
            && addr + self.config.stack_slack >= fault.esp.as_usize()
    }

    /// Give a new process its first stack page.
    ///
    /// Returns the initial stack pointer.
    pub fn setup_stack(&self, space: &Arc<AddressSpace>) -> VmResult<VirtAddr> {
        let upage = VirtAddr::new(PHYS_BASE - PAGE_SIZE);
        let frame = self.allocate_frame(space, upage)?;
        if let Err(e) = space.page_dir().map(upage, frame, true) {
            self.frames.free(frame);
            return Err(e.into());
        }

        let mut spt = space.spt.lock();
        if let Err(e) = spt.insert_resident(upage, frame, true) {
            drop(spt);
            self.frames.free(frame);
            return Err(e);
        }
        self.frames.unpin(frame);
        trace!("vm: pid {} stack at {} in {}", space.pid(), upage, frame);
        Ok(VirtAddr::new(PHYS_BASE))
    }

    /// Register a program segment for lazy loading.
    ///
    /// The `read_bytes + zero_bytes` bytes starting at `upage` are filled
    /// from `file` at `offset`, then zeroes. Nothing is read until the
    /// first fault; dirty pages go to swap, never back to the program.
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        space: &Arc<AddressSpace>,
        file: &FileHandle,
        offset: u64,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<()> {
        let total = read_bytes + zero_bytes;
        if upage.is_null() || !upage.is_aligned() || total % PAGE_SIZE != 0 {
            return Err(VmError::MappingConflict);
        }
        let pages = pages_spanned(total);
        match upage.checked_add(total) {
            Some(end) if end.as_usize() <= PHYS_BASE => {}
            _ => return Err(VmError::MappingConflict),
        }

        let mut spt = space.spt.lock();
        if spt.overlaps(upage, pages) {
            return Err(VmError::MappingConflict);
        }
        for (i, page) in upage.pages(pages).enumerate() {
            let done = i * PAGE_SIZE;
            let page_read = read_bytes.saturating_sub(done).min(PAGE_SIZE);
            if page_read == 0 {
                spt.insert_zero(page, writable)?;
            } else {
                let seg = FileSegment::new(Arc::clone(file), offset + done as u64, page_read, false);
                spt.insert_file_backed(page, seg, writable)?;
            }
        }
        trace!(
            "vm: pid {} segment {} +{} pages ({} from file)",
            space.pid(),
            upage,
            pages,
            read_bytes
        );
        Ok(())
    }
}
