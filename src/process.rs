//! Process Context
//!
//! The manager does not create processes or threads. The host kernel
//! identifies them with [`Pid`]/[`Tid`], supplies a [`ProcessContext`] for
//! the current thread and for termination, and hands each process's page
//! directory over when its [`AddressSpace`] is created.

use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::mm::address::VirtAddr;
use crate::mm::mmap::MmapTable;
use crate::mm::paging::PageDirectory;
use crate::mm::spt::{PageStatus, SupplementalPageTable};

/// Exit status of a process killed by the manager.
pub const EXIT_FAILURE: i32 = -1;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// Create a process id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u32);

impl Tid {
    /// Create a thread id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw id as a machine word.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hooks into the host kernel's process layer.
pub trait ProcessContext: Send + Sync {
    /// Thread id of the caller.
    fn current_tid(&self) -> Tid;

    /// Kill process `pid` with exit `status`.
    ///
    /// Called from the page fault path; the host is expected to unwind the
    /// faulting thread and later call
    /// [`VmManager::destroy_address_space`](crate::mm::VmManager::destroy_address_space).
    fn terminate(&self, pid: Pid, status: i32);
}

/// The virtual memory state of one process.
///
/// Lock order inside a space: `mappings` before `spt`.
pub struct AddressSpace {
    pid: Pid,
    page_dir: Arc<dyn PageDirectory>,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    pub(crate) mappings: Mutex<MmapTable>,
}

impl AddressSpace {
    pub(crate) fn new(pid: Pid, page_dir: Arc<dyn PageDirectory>) -> Self {
        Self {
            pid,
            page_dir,
            spt: Mutex::new(SupplementalPageTable::new()),
            mappings: Mutex::new(MmapTable::new()),
        }
    }

    /// Owning process.
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The hardware page directory of this process.
    #[inline]
    pub fn page_dir(&self) -> &dyn PageDirectory {
        &*self.page_dir
    }

    pub(crate) fn page_dir_handle(&self) -> Arc<dyn PageDirectory> {
        Arc::clone(&self.page_dir)
    }

    /// Number of registered pages.
    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }

    /// Current status of the page containing `addr`.
    pub fn status_of(&self, addr: VirtAddr) -> Option<PageStatus> {
        self.spt.lock().lookup(addr.page()).map(|desc| desc.status.clone())
    }

    /// Number of live memory mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace").field("pid", &self.pid).finish_non_exhaustive()
    }
}
