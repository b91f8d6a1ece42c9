//! Bounds-checked view over the mapped heap region.
//!
//! Every managed address is a [`HeapAddr`]: a word-aligned byte offset into
//! one contiguous mapped range. All reads and writes go through
//! [`HeapMemory`], which bounds-checks each access; higher-level code never
//! touches raw pointers. Words are accessed atomically because header words
//! are mutated concurrently by mutator threads.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::bugcheck::{self, StopCode};
use crate::system;

/// Size of one heap word in bytes.
pub const WORD_SIZE: u32 = 4;

/// A word-aligned byte offset into the managed range.
///
/// Offset zero is reserved and never handed out, so it doubles as the null
/// reference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapAddr(pub u32);

impl HeapAddr {
    pub const NULL: HeapAddr = HeapAddr(0);

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn offset(self, bytes: u32) -> HeapAddr {
        HeapAddr(self.0 + bytes)
    }

    #[inline(always)]
    pub fn back(self, bytes: u32) -> HeapAddr {
        debug_assert!(self.0 >= bytes, "address underflow");
        HeapAddr(self.0 - bytes)
    }

    /// Byte distance from `start` (which must not exceed `self`).
    #[inline(always)]
    pub fn distance_from(self, start: HeapAddr) -> u32 {
        debug_assert!(start.0 <= self.0, "negative range");
        self.0 - start.0
    }
}

impl fmt::Debug for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapAddr({:#x})", self.0)
    }
}

/// Rounds `size` up to the next word boundary.
#[inline(always)]
pub const fn align_word(size: u32) -> u32 {
    (size + (WORD_SIZE - 1)) & !(WORD_SIZE - 1)
}

/// The mapped managed range.
///
/// Owns one anonymous mapping for the whole heap. Accessors take `&self`;
/// word access is atomic, so headers can be updated from any thread while
/// other words are read.
pub struct HeapMemory {
    base: NonNull<u8>,
    size: u32,
}

// SAFETY: all word access goes through atomics; the mapping itself is
// immutable after construction.
unsafe impl Send for HeapMemory {}
// SAFETY: see above.
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    /// Maps a fresh zeroed region of `size` bytes (word aligned).
    pub fn map(size: u32) -> Self {
        let size = align_word(size);
        let base = match system::map_memory(size as usize) {
            Some(base) => base,
            None => bugcheck::raise(StopCode::NoMemory),
        };
        Self { base, size }
    }

    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, addr: HeapAddr) -> bool {
        (addr.0 as u64) + (WORD_SIZE as u64) <= self.size as u64
    }

    /// Atomic view of the word at `addr`.
    #[inline(always)]
    pub fn word(&self, addr: HeapAddr) -> &AtomicU32 {
        bugcheck::ensure(
            addr.0 % WORD_SIZE == 0 && self.contains(addr),
            StopCode::NotAMemoryReference,
        );
        // SAFETY: in-bounds and word aligned (checked above); the mapping
        // outlives `self`, and AtomicU32 has the same layout as u32.
        unsafe { &*(self.base.as_ptr().add(addr.0 as usize) as *const AtomicU32) }
    }

    #[inline(always)]
    pub fn load(&self, addr: HeapAddr) -> u32 {
        self.word(addr).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store(&self, addr: HeapAddr, value: u32) {
        self.word(addr).store(value, Ordering::Relaxed);
    }

    /// Fills `[start, end)` with the given word.
    pub fn fill(&self, start: HeapAddr, end: HeapAddr, word: u32) {
        let mut addr = start;
        while addr < end {
            self.store(addr, word);
            addr = addr.offset(WORD_SIZE);
        }
    }

    /// Zeroes `[start, end)`.
    pub fn zero(&self, start: HeapAddr, end: HeapAddr) {
        self.fill(start, end, 0);
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.size as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_word_rounds_up() {
        assert_eq!(align_word(0), 0);
        assert_eq!(align_word(1), 4);
        assert_eq!(align_word(4), 4);
        assert_eq!(align_word(13), 16);
    }

    #[test]
    fn store_then_load_round_trips() {
        let mem = HeapMemory::map(4096);
        mem.store(HeapAddr(8), 0xDEAD_BEEF);
        assert_eq!(mem.load(HeapAddr(8)), 0xDEAD_BEEF);
        assert_eq!(mem.load(HeapAddr(12)), 0, "fresh mapping must be zeroed");
    }

    #[test]
    fn fill_covers_exactly_the_range() {
        let mem = HeapMemory::map(4096);
        mem.fill(HeapAddr(16), HeapAddr(32), 0x11);
        assert_eq!(mem.load(HeapAddr(12)), 0);
        assert_eq!(mem.load(HeapAddr(16)), 0x11);
        assert_eq!(mem.load(HeapAddr(28)), 0x11);
        assert_eq!(mem.load(HeapAddr(32)), 0);
    }

    #[test]
    #[should_panic(expected = "bugcheck: NotAMemoryReference")]
    fn out_of_bounds_access_is_fatal() {
        let mem = HeapMemory::map(64);
        mem.load(HeapAddr(64));
    }

    #[test]
    #[should_panic(expected = "bugcheck: NotAMemoryReference")]
    fn unaligned_access_is_fatal() {
        let mem = HeapMemory::map(64);
        mem.load(HeapAddr(6));
    }
}
