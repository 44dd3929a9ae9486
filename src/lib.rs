//! vmcore - Demand-Paged Virtual Memory for a Teaching Kernel
//!
//! Gives every user process an address space larger than physical memory.
//! Pages are materialized on first touch from zero-fill, program files,
//! memory-mapped files or swap, and a clock policy reclaims frames under
//! pressure.
//!
//! # Components
//! - Frame table over the user frame pool, with clock eviction
//! - Per-process supplemental page tables
//! - Swap area on a block device
//! - Fault resolver, stack growth and lazy segment loading
//! - `mmap` / `munmap`
//!
//! # Host Interface
//! The kernel supplies the hardware pieces as traits: a
//! [`PageDirectory`](mm::paging::PageDirectory) per process, the swap
//! [`BlockDevice`](drivers::block::BlockDevice), [`File`](fs::File)s, and a
//! [`ProcessContext`](process::ProcessContext). All diagnostics go through
//! the `log` facade.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod drivers;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sync;

#[cfg(test)]
mod testutil;

pub use error::{VmError, VmResult};
pub use fs::{File, FileHandle, FileSegment};
pub use mm::address::{PhysAddr, VirtAddr, PAGE_SIZE, PHYS_BASE};
pub use mm::frame::UserPool;
pub use mm::mmap::MapId;
pub use mm::spt::PageStatus;
pub use mm::{PageFault, VmConfig, VmManager};
pub use process::{AddressSpace, Pid, ProcessContext, Tid, EXIT_FAILURE};
pub use sync::FsLock;
