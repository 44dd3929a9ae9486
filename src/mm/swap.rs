//! Swap Space
//!
//! The swap device is divided into page-sized slots numbered from 0. A
//! bitmap tracks which slots hold live content.
//!
//! # Design
//! - A slot is used from the moment it is reserved for a write until its
//!   content is read back or its owner is destroyed
//! - The bitmap lock is never held across device I/O
//! - Freeing a free slot is bookkeeping corruption and panics

use alloc::sync::Arc;
use core::fmt;

use log::debug;
use spin::Mutex;

use super::address::PAGE_SIZE;
use super::bitmap::Bitmap;
use crate::drivers::block::{BlockDevice, SectorId, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::error::{VmError, VmResult};

/// Index of a page-sized slot in the swap area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u32);

impl SwapSlot {
    /// Get the slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// First device sector of the slot.
    #[inline]
    fn first_sector(self) -> SectorId {
        self.0 * SECTORS_PER_PAGE as SectorId
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// The swap area and its slot bitmap.
pub struct SwapSpace {
    device: Arc<dyn BlockDevice>,
    slots: Mutex<Bitmap>,
}

impl SwapSpace {
    /// Use every whole page of `device` as swap.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let count = device.sector_count() as usize / SECTORS_PER_PAGE;
        debug!("swap: {} slots", count);
        Self {
            device,
            slots: Mutex::new(Bitmap::new(count)),
        }
    }

    /// Write a page to a free slot and return the slot.
    pub fn swap_out(&self, page: &[u8]) -> VmResult<SwapSlot> {
        let slot = self.reserve().ok_or(VmError::SwapExhausted)?;
        if let Err(e) = self.write_slot(slot, page) {
            self.free(slot);
            return Err(e);
        }
        Ok(slot)
    }

    /// Read `slot` into `page` and release it.
    ///
    /// On a device error the slot stays allocated to its owner.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> VmResult<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let first = slot.first_sector();
        for (i, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read(first + i as SectorId, sector)?;
        }
        self.free(slot);
        debug!("swap: read back {}", slot);
        Ok(())
    }

    /// Release a slot without reading it.
    ///
    /// # Panics
    /// Panics if the slot is already free.
    pub fn free(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        if !slots.test(slot.index()) {
            panic!("swap: double free of {}", slot);
        }
        slots.set(slot.index(), false);
    }

    /// Mark a free slot used, to be filled by [`write_slot`](Self::write_slot).
    pub(crate) fn reserve(&self) -> Option<SwapSlot> {
        self.slots
            .lock()
            .scan_and_flip()
            .map(|index| SwapSlot(index as u32))
    }

    /// Write a page into a reserved slot.
    pub(crate) fn write_slot(&self, slot: SwapSlot, page: &[u8]) -> VmResult<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let first = slot.first_sector();
        for (i, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write(first + i as SectorId, sector)?;
        }
        debug!("swap: wrote {}", slot);
        Ok(())
    }

    /// Check if a slot holds live content.
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.slots.lock().test(slot.index())
    }

    /// Total number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of slots holding live content.
    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().used()
    }
}
