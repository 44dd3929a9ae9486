//! Memory-Mapped Files
//!
//! `mmap` registers one lazily loaded, writable page per page of a file.
//! Dirty pages are written back to the file when evicted and when the
//! mapping goes away.
//!
//! # Design
//! - Mapping ids start at 1 and are never reused within a process, so a
//!   stale id stays invalid forever
//! - Every mapping owns its own reopened file handle
//! - A rejected `mmap` registers nothing

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use log::{debug, warn};

use super::address::{pages_spanned, VirtAddr, PAGE_SIZE, PHYS_BASE};
use super::paging::PageTableEntry;
use super::spt::PageStatus;
use super::VmManager;
use crate::error::{VmError, VmResult};
use crate::fs::{FileHandle, FileSegment};
use crate::process::AddressSpace;

/// Identifier of a memory mapping within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(i32);

impl MapId {
    /// The id reported to user programs for a failed `mmap`.
    pub const INVALID: Self = Self(-1);

    /// Get the raw id handed to user programs.
    #[inline]
    pub const fn to_raw(self) -> i32 {
        self.0
    }

    /// Interpret a raw id from a user program.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Collapse an `mmap` result into the id a user program sees.
    pub fn from_result(result: VmResult<MapId>) -> Self {
        result.unwrap_or(Self::INVALID)
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live mapping.
struct Mapping {
    /// Keeps the file open for the mapping's lifetime.
    _file: FileHandle,
    base: VirtAddr,
    pages: usize,
}

/// A process's live mappings.
pub struct MmapTable {
    mappings: BTreeMap<MapId, Mapping>,
    next_id: i32,
}

impl MmapTable {
    /// Create an empty table; the first id handed out is 1.
    pub const fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, mapping: Mapping) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        self.mappings.insert(id, mapping);
        id
    }

    fn remove(&mut self, id: MapId) -> Option<Mapping> {
        self.mappings.remove(&id)
    }

    /// Ids of all live mappings.
    pub fn ids(&self) -> impl Iterator<Item = MapId> + '_ {
        self.mappings.keys().copied()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Check if there is no live mapping.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VmManager {
    /// Map `file` at `addr` in `space`.
    ///
    /// Fails with [`VmError::MappingConflict`] if `addr` is null or
    /// unaligned, the file is empty or cannot be reopened, or the file's
    /// span leaves user space or overlaps a registered page.
    pub fn mmap(
        &self,
        space: &Arc<AddressSpace>,
        file: &FileHandle,
        addr: VirtAddr,
    ) -> VmResult<MapId> {
        if addr.is_null() || !addr.is_aligned() {
            return Err(VmError::MappingConflict);
        }

        let (file, length) = {
            let _fs = self.fs_lock.acquire(self.context.current_tid());
            let length = usize::try_from(file.length()).map_err(|_| VmError::MappingConflict)?;
            if length == 0 {
                return Err(VmError::MappingConflict);
            }
            (file.reopen().ok_or(VmError::MappingConflict)?, length)
        };

        let pages = pages_spanned(length);
        match addr.checked_add(pages * PAGE_SIZE) {
            Some(end) if end.as_usize() <= PHYS_BASE => {}
            _ => return Err(VmError::MappingConflict),
        }

        let mut mappings = space.mappings.lock();
        let mut spt = space.spt.lock();
        if spt.overlaps(addr, pages) {
            return Err(VmError::MappingConflict);
        }
        for (i, upage) in addr.pages(pages).enumerate() {
            let offset = i * PAGE_SIZE;
            let read_bytes = (length - offset).min(PAGE_SIZE);
            let seg = FileSegment::new(Arc::clone(&file), offset as u64, read_bytes, true);
            spt.insert_file_backed(upage, seg, true)?;
        }
        drop(spt);

        let id = mappings.insert(Mapping {
            _file: file,
            base: addr,
            pages,
        });
        debug!("vm: pid {} mmap {} at {} ({} pages)", space.pid(), id, addr, pages);
        Ok(id)
    }

    /// Remove mapping `id`, writing dirty pages back to the file.
    ///
    /// Returns `false` for an id that is not live.
    pub fn munmap(&self, space: &Arc<AddressSpace>, id: MapId) -> bool {
        // Held across the whole unmap, and taken before any page turns busy.
        let _fs = self.fs_lock.acquire(self.context.current_tid());
        let mut mappings = space.mappings.lock();
        let Some(mapping) = mappings.remove(id) else {
            return false;
        };
        for upage in mapping.base.pages(mapping.pages) {
            self.unmap_page(space, upage);
        }
        debug!("vm: pid {} munmap {}", space.pid(), id);
        true
    }

    /// Drop one page of a mapping, saving its content if it was modified.
    ///
    /// The caller holds the file system lock.
    fn unmap_page(&self, space: &AddressSpace, upage: VirtAddr) {
        let dir = space.page_dir();
        loop {
            let mut spt = space.spt.lock();
            let Some(desc) = spt.lookup_mut(upage) else {
                return;
            };
            if desc.busy {
                drop(spt);
                core::hint::spin_loop();
                continue;
            }

            let dirty_file = match &desc.status {
                PageStatus::Resident {
                    frame,
                    file: Some(seg),
                } => dir
                    .unmap(upage)
                    .is_some_and(PageTableEntry::is_dirty)
                    .then(|| (*frame, seg.clone())),
                _ => None,
            };

            if let Some((frame, seg)) = dirty_file {
                desc.busy = true;
                drop(spt);

                // SAFETY: The descriptor is busy and unmapped; nobody else
                // touches the frame until it is released below.
                let page = unsafe { self.frames.page(frame) };
                if let Err(e) = seg.store(page) {
                    warn!("vm: pid {} lost write-back of {}: {}", space.pid(), upage, e);
                }

                spt = space.spt.lock();
                match spt.lookup_mut(upage) {
                    Some(desc) => desc.busy = false,
                    None => {
                        // Torn down meanwhile; the frame was left to us.
                        drop(spt);
                        self.frames.free(frame);
                        return;
                    }
                }
            }

            spt.remove(upage, &self.frames, &self.swap);
            return;
        }
    }
}
