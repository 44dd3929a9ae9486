//! Virtual memory management
//!
//! Provides:
//! - The user frame table and its clock eviction policy
//! - Per-process supplemental page tables
//! - Swap space
//! - Demand paging, stack growth and memory-mapped files
//!
//! # Locking
//! Locks are always taken in this order, each optional:
//! 1. the file system lock
//! 2. a process's mapping table
//! 3. a process's supplemental page table (never two at once)
//! 4. the frame table
//! 5. a page directory or the swap bitmap
//!
//! Only the file system lock and `munmap`'s mapping table are held across
//! I/O. A thread waits for the file system lock only while it has no frame
//! pinned and no page marked busy; an evictor that needs it with a victim
//! pinned tries once and otherwise scans again. Every file transfer
//! happens with the lock taken before its page turned busy, so a lock holder
//! that runs into a busy page only ever waits for swap or discard work.

pub mod address;
pub mod bitmap;
mod evict;
mod fault;
pub mod frame;
#[cfg(test)]
mod invariants;
pub mod mmap;
pub mod paging;
pub mod spt;
pub mod swap;

use alloc::sync::Arc;

use log::debug;

use self::address::{STACK_LIMIT, STACK_SLACK};
use self::frame::{FrameTable, UserPool};
use self::mmap::MapId;
use self::paging::PageDirectory;
use self::swap::SwapSpace;
use crate::drivers::block::BlockDevice;
use crate::process::{AddressSpace, Pid, ProcessContext};
use crate::sync::FsLock;

pub use self::fault::PageFault;

/// Runtime tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum size of a user stack in bytes.
    pub stack_limit: usize,
    /// How far below the stack pointer a fault still grows the stack.
    pub stack_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_limit: STACK_LIMIT,
            stack_slack: STACK_SLACK,
        }
    }
}

/// The virtual memory manager: one per kernel.
pub struct VmManager {
    pub(crate) config: VmConfig,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapSpace,
    pub(crate) fs_lock: Arc<FsLock>,
    pub(crate) context: Arc<dyn ProcessContext>,
}

impl VmManager {
    /// Take over the user frame pool and the swap device.
    ///
    /// `fs_lock` is the kernel's file system lock; the manager takes it
    /// around every file read and write it performs.
    pub fn new(
        pool: UserPool,
        swap_device: Arc<dyn BlockDevice>,
        fs_lock: Arc<FsLock>,
        context: Arc<dyn ProcessContext>,
        config: VmConfig,
    ) -> Self {
        debug!("vm: {} user frames", pool.len());
        Self {
            config,
            frames: FrameTable::new(pool),
            swap: SwapSpace::new(swap_device),
            fs_lock,
            context,
        }
    }

    /// Create the empty address space of a new process.
    pub fn create_address_space(
        &self,
        pid: Pid,
        page_dir: Arc<dyn PageDirectory>,
    ) -> Arc<AddressSpace> {
        Arc::new(AddressSpace::new(pid, page_dir))
    }

    /// Release everything a terminating process holds.
    ///
    /// Every live mapping is unmapped (dirty pages are written back), then
    /// every remaining page gives up its frame or swap slot.
    pub fn destroy_address_space(&self, space: &Arc<AddressSpace>) {
        let ids: alloc::vec::Vec<MapId> = space.mappings.lock().ids().collect();
        for id in ids {
            self.munmap(space, id);
        }
        space.spt.lock().destroy_all(&self.frames, &self.swap);
        debug!("vm: pid {} torn down", space.pid());
    }

    /// Number of unallocated user frames.
    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    /// Number of user frames backing some page.
    pub fn resident_frames(&self) -> usize {
        self.frames.allocated_frames()
    }

    /// Number of swap slots holding page content.
    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.slots_in_use()
    }

    /// Total number of swap slots.
    pub fn swap_slots(&self) -> usize {
        self.swap.slot_count()
    }
}
