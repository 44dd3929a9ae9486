//! Frame Allocation and Eviction
//!
//! When the user pool runs dry, a clock (second-chance) scan over the frame
//! table picks a victim. The victim's content is discarded, written back to
//! its file, or written to swap, and the frame moves to the new owner.
//!
//! # Eviction steps
//! 1. Under the frame table lock: pick an unpinned frame whose accessed bit
//!    is clear, and pin it.
//! 2. Under the victim's page table lock: check the descriptor still maps
//!    that frame, take the file system lock if the page may go back to its
//!    file, remove the hardware mapping, decide from the removed entry where
//!    the content goes, and mark the descriptor busy.
//! 3. With no VM lock held: write the content out.
//! 4. Under the victim's page table lock again: record the new status.
//! 5. Under the frame table lock: register the frame to its new owner.
//!
//! The pin keeps other evictors away from the frame throughout; the busy
//! flag keeps the victim's own process from faulting the page back in
//! before its content is safe. An evictor never waits for the file system
//! lock while holding a pin: it gives the victim up and scans again.

use alloc::sync::Arc;

use log::{debug, warn};

use super::address::VirtAddr;
use super::frame::{Selection, Victim};
use super::paging::{PageDirectory, PageTableEntry};
use super::spt::PageStatus;
use super::swap::SwapSlot;
use super::VmManager;
use crate::error::{VmError, VmResult};
use crate::fs::FileSegment;
use crate::mm::address::PhysAddr;
use crate::process::AddressSpace;

/// Where an evicted page's content goes.
enum WriteBack {
    /// Clean file page; reload from the file later.
    Discard(FileSegment),
    /// Dirty memory-mapped page; write to the file.
    File(FileSegment),
    /// Anything else; write to this reserved slot.
    Swap(SwapSlot),
}

impl WriteBack {
    /// Status of the page once its content is safe.
    fn into_status(self) -> PageStatus {
        match self {
            Self::Discard(seg) | Self::File(seg) => PageStatus::FileBacked(seg),
            Self::Swap(slot) => PageStatus::Swapped(slot),
        }
    }
}

/// Put an evicted page's mapping back after its eviction was abandoned.
fn restore_mapping(dir: &dyn PageDirectory, victim: &Victim, writable: bool, dirty: bool) {
    if dir.map(victim.upage, victim.frame, writable).is_err() {
        panic!(
            "vm: cannot restore mapping of pid {} page {}",
            victim.pid, victim.upage
        );
    }
    dir.set_dirty(victim.upage, dirty);
}

impl VmManager {
    /// Get a zeroed frame for `upage` of `owner`, evicting if needed.
    ///
    /// Waits while every frame is pinned: pins only last as long as one
    /// transfer. The frame is pinned until the caller unpins it.
    pub(crate) fn allocate_frame(
        &self,
        owner: &Arc<AddressSpace>,
        upage: VirtAddr,
    ) -> VmResult<PhysAddr> {
        loop {
            if let Some(frame) = self.frames.try_allocate(owner, upage) {
                return Ok(frame);
            }
            if let Some(frame) = self.evict(owner, upage)? {
                return Ok(frame);
            }
            core::hint::spin_loop();
        }
    }

    /// Evict one frame and hand it to `upage` of `owner`.
    ///
    /// `Ok(None)` means no frame was reclaimed this time (it lost a race, or
    /// every frame is pinned) and the caller should try again.
    fn evict(&self, owner: &Arc<AddressSpace>, upage: VirtAddr) -> VmResult<Option<PhysAddr>> {
        let victim = match self.frames.select_victim() {
            Selection::Victim(victim) => victim,
            Selection::AllPinned => return Ok(None),
            Selection::Empty if self.frames.capacity() == 0 => {
                warn!("vm: pid {}: user pool has no frames", owner.pid());
                return Err(VmError::AllocationExhausted);
            }
            // Frames were freed since the allocation attempt.
            Selection::Empty => return Ok(None),
        };

        let Some(space) = victim.owner.upgrade() else {
            // Owner dropped without teardown: nothing to save.
            victim.page_dir.unmap(victim.upage);
            return Ok(self.frames.reassign(&victim, owner, upage));
        };

        if !self.write_back(&space, &victim)? {
            return Ok(None);
        }
        Ok(self.frames.reassign(&victim, owner, upage))
    }

    /// Move the victim's content out of its frame.
    ///
    /// Returns `false`, with the pin released, if the victim turned out to be
    /// in flight or already gone, or its file is busy.
    fn write_back(&self, space: &Arc<AddressSpace>, victim: &Victim) -> VmResult<bool> {
        let upage = victim.upage;
        let dir = space.page_dir();

        let (plan, dirty, fs) = {
            let mut spt = space.spt.lock();
            let desc = match spt.lookup_mut(upage) {
                Some(desc)
                    if !desc.busy
                        && desc.status.frame() == Some(victim.frame)
                        && self.frames.is_current(victim) =>
                {
                    desc
                }
                _ => {
                    self.frames.unpin_victim(victim);
                    return Ok(false);
                }
            };

            let file = match &desc.status {
                PageStatus::Resident { file, .. } => file.clone(),
                _ => None,
            };
            // Taken before the page turns busy so that a lock holder never
            // waits on a page that waits on the lock.
            let fs = match &file {
                Some(seg) if seg.shared => {
                    match self.fs_lock.try_acquire(self.context.current_tid()) {
                        Some(guard) => Some(guard),
                        None => {
                            self.frames.unpin_victim(victim);
                            return Ok(false);
                        }
                    }
                }
                _ => None,
            };

            let dirty = dir.unmap(upage).is_some_and(PageTableEntry::is_dirty);
            let plan = match file {
                Some(seg) if !dirty => WriteBack::Discard(seg),
                Some(seg) if seg.shared => WriteBack::File(seg),
                _ => match self.swap.reserve() {
                    Some(slot) => WriteBack::Swap(slot),
                    None => {
                        restore_mapping(dir, victim, desc.writable, dirty);
                        self.frames.unpin_victim(victim);
                        warn!("vm: swap full evicting pid {} page {}", victim.pid, upage);
                        return Err(VmError::SwapExhausted);
                    }
                },
            };

            desc.busy = true;
            (plan, dirty, fs)
        };

        // SAFETY: The frame is pinned to us and its descriptor is busy, so
        // nobody else reads or writes it until we clear the flag.
        let page = unsafe { self.frames.page(victim.frame) };
        let result = match &plan {
            WriteBack::Discard(_) => Ok(()),
            WriteBack::File(seg) => seg.store(page),
            WriteBack::Swap(slot) => self.swap.write_slot(*slot, page),
        };
        drop(fs);

        let mut spt = space.spt.lock();
        let Some(desc) = spt.lookup_mut(upage).filter(|desc| desc.busy) else {
            // Torn down while we wrote; the frame is ours regardless.
            if let WriteBack::Swap(slot) = plan {
                self.swap.free(slot);
            }
            return Ok(true);
        };

        if let Err(e) = result {
            restore_mapping(dir, victim, desc.writable, dirty);
            desc.busy = false;
            if let WriteBack::Swap(slot) = plan {
                self.swap.free(slot);
            }
            self.frames.unpin_victim(victim);
            warn!("vm: write-back of pid {} page {} failed: {}", victim.pid, upage, e);
            return Err(e);
        }

        debug!(
            "vm: evicted pid {} page {} from {} ({})",
            victim.pid,
            upage,
            victim.frame,
            match plan {
                WriteBack::Discard(_) => "discarded",
                WriteBack::File(_) => "written to file",
                WriteBack::Swap(_) => "swapped",
            }
        );
        desc.status = plan.into_status();
        desc.busy = false;
        Ok(true)
    }
}
