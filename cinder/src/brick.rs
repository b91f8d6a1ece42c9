//! Brick table: constant-time mapping from an interior pointer to the
//! object containing it.
//!
//! The heap is divided into fixed [`BRICK_SIZE`] pages. Each page holds one
//! i16 slot:
//!
//! * `UNINITIALIZED`: nothing recorded for this page yet.
//! * `>= 0`: byte offset within the page of the first object header that
//!   starts in it.
//! * `< 0`: no header starts here; add the (negative) value to the page
//!   index to move toward one that has. Backtrack distance is clamped, so
//!   resolving a pointer into a huge object takes a few hops instead of a
//!   page-by-page crawl.
//!
//! Slots are atomic so concurrent allocations on different segments can
//! publish without a table lock.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::memory::HeapAddr;

/// Bytes covered by one brick.
pub const BRICK_SIZE: u32 = 2048;

const UNINITIALIZED: i16 = i16::MAX;
/// Longest single backward hop recorded in a spanned page.
const MAX_BACKTRACK: i32 = 128;

pub struct BrickTable {
    slots: Box<[AtomicU16]>,
}

impl BrickTable {
    /// Table covering a heap of `heap_size` bytes.
    pub fn new(heap_size: u32) -> Self {
        let count = (heap_size as usize).div_ceil(BRICK_SIZE as usize);
        let slots = (0..count)
            .map(|_| AtomicU16::new(UNINITIALIZED as u16))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    #[inline(always)]
    fn get(&self, page: usize) -> i16 {
        self.slots[page].load(Ordering::Acquire) as i16
    }

    /// Records an object whose header starts at `header` and spans `size`
    /// bytes.
    pub fn mark_object(&self, header: HeapAddr, size: u32) {
        let page = (header.0 / BRICK_SIZE) as usize;
        let offset = (header.0 % BRICK_SIZE) as i16;

        // Keep the smallest header offset per page: a slot loses only to an
        // earlier header in the same page.
        let slot = &self.slots[page];
        let mut current = slot.load(Ordering::Acquire) as i16;
        while current == UNINITIALIZED || current < 0 || current > offset {
            match slot.compare_exchange_weak(
                current as u16,
                offset as u16,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual as i16,
            }
        }

        // Pages the object spans get backtrack hints, clamped. Only an
        // empty or weaker hint is replaced; a real header offset wins.
        let last_page = ((header.0 + size - 1) / BRICK_SIZE) as usize;
        for spanned in (page + 1)..=last_page {
            let delta = (spanned - page) as i32;
            let hint = -delta.min(MAX_BACKTRACK) as i16;
            let slot = &self.slots[spanned];
            let mut current = slot.load(Ordering::Acquire) as i16;
            while current == UNINITIALIZED || (current < 0 && current > hint) {
                match slot.compare_exchange_weak(
                    current as u16,
                    hint as u16,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual as i16,
                }
            }
        }
    }

    /// Finds the header address of the last recorded object at or below
    /// `ptr`. `None` when nothing is recorded below it.
    pub fn find_lower_bound(&self, ptr: HeapAddr) -> Option<HeapAddr> {
        let mut page = (ptr.0 / BRICK_SIZE) as i64;
        while page >= 0 {
            let slot = self.get(page as usize);
            if slot == UNINITIALIZED {
                page -= 1;
            } else if slot >= 0 {
                let candidate = HeapAddr(page as u32 * BRICK_SIZE + slot as u32);
                if candidate <= ptr {
                    return Some(candidate);
                }
                page -= 1;
            } else {
                page += slot as i64;
            }
        }
        None
    }

    /// Clears every slot; the sweep re-publishes survivors.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(UNINITIALIZED as u16, Ordering::Release);
        }
    }
}
