//! File System Lock
//!
//! The kernel serializes every file system call behind one lock. Page
//! faults can happen while a system call already holds it (a `read` into a
//! not-yet-loaded user buffer), so the lock is reentrant: the owning thread
//! may acquire it again and must release it as many times.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::process::Tid;

/// Owner value meaning "not held".
const UNOWNED: usize = usize::MAX;

/// A reentrant spin lock keyed by kernel thread id.
#[derive(Debug)]
pub struct FsLock {
    /// Owning thread id, or `UNOWNED`.
    owner: AtomicUsize,
    /// Nesting depth; only touched by the owner.
    depth: AtomicUsize,
}

impl FsLock {
    /// Create a new unlocked file system lock.
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            depth: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock on behalf of thread `tid`, spinning until available.
    ///
    /// Succeeds immediately if `tid` already holds it.
    pub fn acquire(&self, tid: Tid) -> FsLockGuard<'_> {
        loop {
            if let Some(guard) = self.try_acquire(tid) {
                return guard;
            }
            while self.owner.load(Ordering::Relaxed) != UNOWNED {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock on behalf of thread `tid` if no other thread holds it.
    pub fn try_acquire(&self, tid: Tid) -> Option<FsLockGuard<'_>> {
        let me = tid.as_usize();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Some(FsLockGuard { lock: self });
        }
        self.owner
            .compare_exchange(UNOWNED, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        self.depth.store(1, Ordering::Relaxed);
        Some(FsLockGuard { lock: self })
    }

    /// Check if thread `tid` holds the lock.
    pub fn is_held_by(&self, tid: Tid) -> bool {
        self.owner.load(Ordering::Acquire) == tid.as_usize()
    }

    fn release(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

impl Default for FsLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases one level of [`FsLock`] ownership on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FsLockGuard<'a> {
    lock: &'a FsLock,
}

impl Drop for FsLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
