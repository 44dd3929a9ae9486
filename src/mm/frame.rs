//! Frame Table
//!
//! Tracks every frame of the user pool: which are free, and for each
//! allocated frame which process page it backs.
//!
//! # Design
//! - A bitmap marks allocated frames; `entries[i]` describes frame `i`
//! - An entry is pinned from allocation until its page becomes resident,
//!   and while it is being evicted. Pinned frames are never chosen as
//!   victims
//! - Every registration gets a fresh ticket, so a thread holding a stale
//!   view of an entry can tell it was freed and reused meanwhile
//! - Frames are zeroed before they reach a new owner
//! - Freeing a frame with no entry is bookkeeping corruption and panics

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{compiler_fence, Ordering};

use log::trace;
use spin::Mutex;

use super::address::{PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
use super::bitmap::Bitmap;
use super::paging::PageDirectory;
use crate::process::{AddressSpace, Pid};

/// The user frame pool handed over by the kernel's page allocator.
///
/// Frames are physically contiguous from `phys_base` and reachable by the
/// kernel at `base`.
pub struct UserPool {
    base: NonNull<u8>,
    phys_base: PhysAddr,
    frames: usize,
}

// SAFETY: The pool is plain memory. Access to each frame is serialized by
// the frame table protocol (pinning and busy descriptors).
unsafe impl Send for UserPool {}
// SAFETY: See above.
unsafe impl Sync for UserPool {}

impl UserPool {
    /// Take over `frames` frames mapped at `base`.
    ///
    /// # Safety
    /// `base` must point to `frames * PAGE_SIZE` bytes of memory that
    /// nothing else accesses for the lifetime of the pool, and `phys_base`
    /// must be page-aligned.
    pub unsafe fn new(base: NonNull<u8>, phys_base: PhysAddr, frames: usize) -> Self {
        assert!(phys_base.is_aligned(), "unaligned pool base {}", phys_base);
        Self {
            base,
            phys_base,
            frames,
        }
    }

    /// Take over a static region; trailing bytes short of a page are unused.
    pub fn from_static(memory: &'static mut [u8], phys_base: PhysAddr) -> Self {
        let frames = memory.len() / PAGE_SIZE;
        let base = NonNull::from(memory).cast::<u8>();
        // SAFETY: The exclusive 'static borrow covers `frames` whole pages.
        unsafe { Self::new(base, phys_base, frames) }
    }

    /// Number of frames in the pool.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames
    }

    /// Check if the pool has no frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    #[inline]
    fn frame_at(&self, index: usize) -> PhysAddr {
        PhysAddr::new(self.phys_base.as_usize() + (index << PAGE_SHIFT))
    }

    /// Pool index of `frame`.
    ///
    /// # Panics
    /// Panics if the frame is unaligned or outside the pool.
    fn index_of(&self, frame: PhysAddr) -> usize {
        if !frame.is_aligned() {
            panic!("unaligned frame {}", frame);
        }
        let index = frame
            .as_usize()
            .checked_sub(self.phys_base.as_usize())
            .map(|off| off >> PAGE_SHIFT)
            .filter(|&i| i < self.frames);
        match index {
            Some(i) => i,
            None => panic!("frame {} outside the user pool", frame),
        }
    }

    fn page_ptr(&self, frame: PhysAddr) -> *mut u8 {
        let index = self.index_of(frame);
        // SAFETY: index < frames, so the offset stays inside the pool.
        unsafe { self.base.as_ptr().add(index * PAGE_SIZE) }
    }
}

/// Bookkeeping for one allocated frame.
#[derive(Clone)]
struct FrameEntry {
    owner: Weak<AddressSpace>,
    page_dir: Arc<dyn PageDirectory>,
    pid: Pid,
    upage: VirtAddr,
    pinned: bool,
    ticket: u64,
}

/// A frame chosen for eviction, pinned on behalf of the evicting thread.
pub(crate) struct Victim {
    pub frame: PhysAddr,
    pub owner: Weak<AddressSpace>,
    pub page_dir: Arc<dyn PageDirectory>,
    pub pid: Pid,
    pub upage: VirtAddr,
    pub ticket: u64,
}

/// Result of a clock scan.
pub(crate) enum Selection {
    Victim(Victim),
    /// Every allocated frame is pinned.
    AllPinned,
    /// No frame is allocated at all.
    Empty,
}

struct FrameTableInner {
    used: Bitmap,
    entries: Vec<Option<FrameEntry>>,
    /// Clock hand, an index into `entries`.
    hand: usize,
    next_ticket: u64,
}

impl FrameTableInner {
    fn entry(&self, index: usize) -> Option<&FrameEntry> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    fn register(&mut self, index: usize, owner: &Arc<AddressSpace>, upage: VirtAddr) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.entries[index] = Some(FrameEntry {
            owner: Arc::downgrade(owner),
            page_dir: owner.page_dir_handle(),
            pid: owner.pid(),
            upage,
            pinned: true,
            ticket,
        });
        ticket
    }

    /// Advance the clock hand to the next victim, pin it and return its
    /// index. `Err(true)` means every frame is pinned, `Err(false)` that
    /// none is allocated.
    fn select_victim(&mut self) -> Result<(usize, FrameEntry), bool> {
        let len = self.entries.len();
        let live = self.used.used();
        if live == 0 {
            return Err(false);
        }

        // Two sweeps: the first may only clear accessed bits.
        for _ in 0..2 * len {
            let index = self.hand;
            self.hand = (self.hand + 1) % len;

            let Some(entry) = self.entries[index].as_mut() else {
                continue;
            };
            if entry.pinned {
                continue;
            }
            let orphaned = entry.owner.strong_count() == 0;
            if !orphaned && live > 1 && entry.page_dir.is_accessed(entry.upage) {
                entry.page_dir.set_accessed(entry.upage, false);
                continue;
            }

            entry.pinned = true;
            return Ok((index, entry.clone()));
        }

        Err(true)
    }
}

/// The table of user frames.
pub struct FrameTable {
    pool: UserPool,
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    /// Manage every frame of `pool`; all start free.
    pub fn new(pool: UserPool) -> Self {
        let count = pool.len();
        let mut entries = Vec::with_capacity(count);
        entries.resize_with(count, || None);
        Self {
            pool,
            inner: Mutex::new(FrameTableInner {
                used: Bitmap::new(count),
                entries,
                hand: 0,
                next_ticket: 1,
            }),
        }
    }

    /// Take a free frame for `upage` of `owner`, without evicting.
    ///
    /// The frame comes back zeroed and pinned.
    pub(crate) fn try_allocate(
        &self,
        owner: &Arc<AddressSpace>,
        upage: VirtAddr,
    ) -> Option<PhysAddr> {
        let frame = {
            let mut inner = self.inner.lock();
            let index = inner.used.scan_and_flip()?;
            inner.register(index, owner, upage);
            self.pool.frame_at(index)
        };
        self.clear(frame);
        trace!("frame: {} -> pid {} page {}", frame, owner.pid(), upage);
        Some(frame)
    }

    /// Release `frame` to the pool, clearing its owner's mapping.
    ///
    /// # Panics
    /// Panics if the frame is not allocated.
    pub fn free(&self, frame: PhysAddr) {
        let index = self.pool.index_of(frame);
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries[index].take() else {
            panic!("frame: freeing unallocated frame {}", frame);
        };
        // The page may already be mapped to another frame by a racing fault.
        if entry.page_dir.translate(entry.upage) == Some(frame) {
            entry.page_dir.unmap(entry.upage);
        }
        inner.used.set(index, false);
        drop(inner);
        trace!("frame: {} released by pid {}", frame, entry.pid);
    }

    /// Make a frame eligible for eviction again.
    pub(crate) fn unpin(&self, frame: PhysAddr) {
        let index = self.pool.index_of(frame);
        if let Some(entry) = self.inner.lock().entries[index].as_mut() {
            entry.pinned = false;
        }
    }

    /// Release the pin taken by a clock scan, unless the frame changed hands.
    pub(crate) fn unpin_victim(&self, victim: &Victim) {
        let index = self.pool.index_of(victim.frame);
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries[index].as_mut() {
            if entry.ticket == victim.ticket {
                entry.pinned = false;
            }
        }
    }

    /// Check that the victim's registration is still the live one.
    pub(crate) fn is_current(&self, victim: &Victim) -> bool {
        let index = self.pool.index_of(victim.frame);
        self.inner
            .lock()
            .entry(index)
            .is_some_and(|entry| entry.ticket == victim.ticket)
    }

    /// Hand an evicted frame to its new owner, still pinned, and zero it.
    ///
    /// Returns `None` if the victim's registration was freed meanwhile.
    pub(crate) fn reassign(
        &self,
        victim: &Victim,
        owner: &Arc<AddressSpace>,
        upage: VirtAddr,
    ) -> Option<PhysAddr> {
        let index = self.pool.index_of(victim.frame);
        {
            let mut inner = self.inner.lock();
            if !inner
                .entry(index)
                .is_some_and(|entry| entry.ticket == victim.ticket)
            {
                return None;
            }
            inner.register(index, owner, upage);
        }
        self.clear(victim.frame);
        trace!(
            "frame: {} moved from pid {} to pid {} page {}",
            victim.frame,
            victim.pid,
            owner.pid(),
            upage
        );
        Some(victim.frame)
    }

    /// Run the clock until it stops on an unpinned frame, and pin it.
    pub(crate) fn select_victim(&self) -> Selection {
        let picked = self.inner.lock().select_victim();
        match picked {
            Ok((index, entry)) => Selection::Victim(Victim {
                frame: self.pool.frame_at(index),
                owner: entry.owner,
                page_dir: entry.page_dir,
                pid: entry.pid,
                upage: entry.upage,
                ticket: entry.ticket,
            }),
            Err(true) => Selection::AllPinned,
            Err(false) => Selection::Empty,
        }
    }

    /// Contents of `frame`.
    ///
    /// # Safety
    /// The caller must own the frame's content for the borrow: the frame
    /// is pinned to it, or backs a busy descriptor it marked, or is mapped
    /// by a descriptor whose table lock it holds.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn page_mut(&self, frame: PhysAddr) -> &mut [u8] {
        // SAFETY: page_ptr points to PAGE_SIZE bytes of the pool; exclusivity
        // is the caller's contract.
        unsafe { core::slice::from_raw_parts_mut(self.pool.page_ptr(frame), PAGE_SIZE) }
    }

    /// Read-only contents of `frame`.
    ///
    /// # Safety
    /// Same contract as [`page_mut`](Self::page_mut).
    pub(crate) unsafe fn page(&self, frame: PhysAddr) -> &[u8] {
        // SAFETY: See page_mut.
        unsafe { core::slice::from_raw_parts(self.pool.page_ptr(frame), PAGE_SIZE) }
    }

    /// Zero a frame that was just registered to a new owner.
    fn clear(&self, frame: PhysAddr) {
        let ptr = self.pool.page_ptr(frame);
        // SAFETY: The frame is pinned to the caller and not mapped yet.
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
        compiler_fence(Ordering::SeqCst);
    }

    /// Number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    /// Number of free frames.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().used.free()
    }

    /// Number of allocated frames.
    pub fn allocated_frames(&self) -> usize {
        self.inner.lock().used.used()
    }

    /// `(frame, pid, upage, pinned)` for every allocated frame.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<(PhysAddr, Pid, VirtAddr, bool)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                e.as_ref()
                    .map(|e| (self.pool.frame_at(i), e.pid, e.upage, e.pinned))
            })
            .collect()
    }
}
