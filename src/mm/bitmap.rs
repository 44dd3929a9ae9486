//! Allocation Bitmap
//!
//! One bit per slot: frames in the user pool, or page-sized slots in the
//! swap area.
//!
//! # Design
//! - Bit = 0: slot is free
//! - Bit = 1: slot is in use
//! - Scans skip fully-used bytes before testing individual bits

use alloc::vec;
use alloc::vec::Vec;

/// A fixed-length bitmap of used/free slots.
#[derive(Debug, Clone)]
pub struct Bitmap {
    /// Backing bytes (1 = used, 0 = free).
    bytes: Vec<u8>,
    /// Number of slots tracked.
    len: usize,
    /// Number of bits currently set.
    used: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` free slots.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len.div_ceil(8)],
            len,
            used: 0,
        }
    }

    /// Number of slots tracked.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the bitmap tracks no slots at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots in use.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of free slots.
    #[inline]
    pub fn free(&self) -> usize {
        self.len - self.used
    }

    /// Check if a slot is in use. Out-of-range slots count as used.
    #[inline]
    pub fn test(&self, index: usize) -> bool {
        if index >= self.len {
            return true;
        }
        (self.bytes[index / 8] >> (index % 8)) & 1 == 1
    }

    /// Mark a slot used or free.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize, used: bool) {
        assert!(index < self.len, "bitmap index {} out of range", index);

        let was_used = self.test(index);
        let byte = &mut self.bytes[index / 8];
        if used {
            *byte |= 1 << (index % 8);
        } else {
            *byte &= !(1 << (index % 8));
        }

        match (was_used, used) {
            (false, true) => self.used += 1,
            (true, false) => self.used -= 1,
            _ => {}
        }
    }

    /// Find the first free slot, mark it used, and return its index.
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        if self.used == self.len {
            return None;
        }

        for byte_idx in 0..self.bytes.len() {
            if self.bytes[byte_idx] == 0xFF {
                continue;
            }
            for bit_idx in 0..8 {
                let index = byte_idx * 8 + bit_idx;
                if index >= self.len {
                    return None;
                }
                if !self.test(index) {
                    self.set(index, true);
                    return Some(index);
                }
            }
        }

        None
    }
}
