//! Segmented free-list allocator.
//!
//! A segment is one contiguous sub-range of the heap holding a chain of
//! entities: objects, free blocks and gap plugs. Walking headers from
//! `first_block` and skipping each entity's size reaches every entity in
//! address order, always.
//!
//! Free blocks are dressed as arrays of raw words so the chain walk needs
//! no special case:
//!
//! ```text
//! +0   multi-use word, state = FREE_BLOCK
//! +4   FREE_BLOCK_TYPE
//! +8   length in raw words   (total bytes = 12 + 4 * length)
//! +12  next free block       (doubly-linked, address ordered)
//! +16  previous free block
//! ```
//!
//! Gaps too small for that dressing (under [`MIN_FREE_BLOCK`] bytes) are
//! filled with single [`GAP_PLUG_WORD`]s instead and absorbed into a
//! neighbor when one is freed.

use crate::bugcheck::{self, StopCode};
use crate::header::{GAP_PLUG_WORD, GcState, HEADER_SIZE, ObjectHeader};
use crate::memory::{HeapAddr, HeapMemory, WORD_SIZE, align_word};
use crate::types::{FREE_BLOCK_TYPE, TypeRegistry};

/// Smallest region representable as a linked free block: header, length
/// word and the two link words.
pub const MIN_FREE_BLOCK: u32 = 20;

const NEXT_OFFSET: u32 = 12;
const PREV_OFFSET: u32 = 16;

/// One contiguous allocation range of the heap.
#[derive(Debug)]
pub struct MemorySegment {
    beginning: HeapAddr,
    end: HeapAddr,
    first_block: HeapAddr,
    first_free: HeapAddr,
    last_free: HeapAddr,
}

impl MemorySegment {
    /// Initializes `[beginning, end)` as one segment holding a single free
    /// block spanning the whole range.
    pub fn initialize(mem: &HeapMemory, beginning: HeapAddr, end: HeapAddr) -> Self {
        bugcheck::ensure(
            beginning.0 % WORD_SIZE == 0
                && end.0 % WORD_SIZE == 0
                && end.distance_from(beginning) >= MIN_FREE_BLOCK,
            StopCode::InvalidOperation,
        );
        let mut segment = Self {
            beginning,
            end,
            first_block: beginning,
            first_free: HeapAddr::NULL,
            last_free: HeapAddr::NULL,
        };
        segment.write_free_block(mem, beginning, end);
        segment.link(mem, HeapAddr::NULL, beginning);
        segment
    }

    #[inline(always)]
    pub fn beginning(&self) -> HeapAddr {
        self.beginning
    }

    #[inline(always)]
    pub fn end(&self) -> HeapAddr {
        self.end
    }

    #[inline(always)]
    pub fn first_block(&self) -> HeapAddr {
        self.first_block
    }

    /// Whether `addr` (any byte, interior included) falls in this segment.
    #[inline(always)]
    pub fn contains(&self, addr: HeapAddr) -> bool {
        self.beginning <= addr && addr < self.end
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Carves `size` bytes (word aligned) out of the first fitting free
    /// block. Returns the zeroed region's start, which becomes the new
    /// entity's header address. `None` when no block fits.
    pub fn allocate(&mut self, mem: &HeapMemory, size: u32) -> Option<HeapAddr> {
        let size = align_word(size.max(HEADER_SIZE));
        let mut block = self.first_free;
        while !block.is_null() {
            let block_size = self.block_size(mem, block);
            if block_size >= size {
                let remainder = block_size - size;
                let previous = self.block_prev(mem, block);
                let next = self.block_next(mem, block);
                self.unlink(mem, block);
                if remainder >= MIN_FREE_BLOCK {
                    let tail = block.offset(size);
                    self.write_free_block(mem, tail, block.offset(block_size));
                    self.relink(mem, previous, tail, next);
                } else if remainder > 0 {
                    mem.fill(block.offset(size), block.offset(block_size), GAP_PLUG_WORD);
                }
                mem.zero(block, block.offset(size));
                return Some(block);
            }
            block = self.block_next(mem, block);
        }
        None
    }

    // ── Release ─────────────────────────────────────────────────────────

    /// Returns the entity at `header` to the free list, absorbing adjacent
    /// gap plugs and coalescing with neighboring free blocks.
    pub fn release(&mut self, mem: &HeapMemory, types: &TypeRegistry, header: ObjectHeader) {
        let kind = header.gc_state(mem).kind();
        bugcheck::ensure(
            kind != GcState::FREE_BLOCK && kind != GcState::GAP_PLUG,
            StopCode::DoubleFree,
        );
        let mut start = header.addr();
        let mut end = header.next_object(mem, types);
        bugcheck::ensure(self.contains(start) && end <= self.end, StopCode::NotAMemoryReference);

        let (previous, next) = self.free_neighbors(mem, start);

        // Forward plugs are trusted: `end` is an entity boundary by
        // construction, so a plug word there really is a plug.
        while end < self.end && mem.load(end) == GAP_PLUG_WORD {
            end = end.offset(WORD_SIZE);
        }

        // Backward a raw scan can false-positive on an object payload word
        // that happens to equal the plug pattern. The word below is only a
        // hint; a plug run is absorbed only after a chain walk from the
        // nearest known boundary confirms it really ends at `start`.
        if start > self.first_block && mem.load(start.back(WORD_SIZE)) == GAP_PLUG_WORD {
            let anchor = match previous.is_null() {
                true => self.first_block,
                false => self.block_end(mem, previous),
            };
            let mut cursor = anchor;
            let mut run_start = HeapAddr::NULL;
            while cursor < start {
                if mem.load(cursor) == GAP_PLUG_WORD {
                    if run_start.is_null() {
                        run_start = cursor;
                    }
                    cursor = cursor.offset(WORD_SIZE);
                } else {
                    run_start = HeapAddr::NULL;
                    cursor = ObjectHeader::at(cursor).next_object(mem, types);
                }
            }
            bugcheck::ensure(cursor == start, StopCode::HeapCorruption);
            if !run_start.is_null() {
                start = run_start;
            }
        }

        let mut link_previous = previous;
        if !previous.is_null() && self.block_end(mem, previous) == start {
            start = previous;
            link_previous = self.block_prev(mem, previous);
            self.unlink(mem, previous);
        }
        if !next.is_null() && end == next {
            end = self.block_end(mem, next);
            self.unlink(mem, next);
        }

        if end.distance_from(start) >= MIN_FREE_BLOCK {
            self.write_free_block(mem, start, end);
            self.link(mem, link_previous, start);
        } else {
            mem.fill(start, end, GAP_PLUG_WORD);
        }
    }

    // ── Sweep support ───────────────────────────────────────────────────

    /// Appends `[start, end)` as free space during a sweep rebuild. The
    /// sweep hands ranges in strictly increasing address order, so the new
    /// range either extends the last block or follows it.
    pub fn link_new_free_block(&mut self, mem: &HeapMemory, start: HeapAddr, end: HeapAddr) {
        if !self.last_free.is_null() && self.block_end(mem, self.last_free) == start {
            self.write_free_block(mem, self.last_free, end);
            return;
        }
        if end.distance_from(start) >= MIN_FREE_BLOCK {
            self.write_free_block(mem, start, end);
            self.link(mem, self.last_free, start);
        } else {
            mem.fill(start, end, GAP_PLUG_WORD);
        }
    }

    /// Drops all free-list state ahead of a sweep rebuild.
    pub fn reset_free_list(&mut self) {
        self.first_free = HeapAddr::NULL;
        self.last_free = HeapAddr::NULL;
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Bytes spanned by the segment, free or not.
    #[inline(always)]
    pub fn total_memory(&self) -> u32 {
        self.end.distance_from(self.beginning)
    }

    /// Sum of all free block payloads, in bytes.
    pub fn available_memory(&self, mem: &HeapMemory) -> u32 {
        let mut total = 0;
        let mut block = self.first_free;
        while !block.is_null() {
            total += self.block_size(mem, block);
            block = self.block_next(mem, block);
        }
        total
    }

    /// Whether `object` (a data address) is the payload of a live object
    /// in this segment. Walks the entity chain, so it cannot be fooled by
    /// a pointer into the middle of something.
    pub fn is_object_alive(&self, mem: &HeapMemory, types: &TypeRegistry, object: HeapAddr) -> bool {
        if object.0 < HEADER_SIZE {
            return false;
        }
        let target = object.back(HEADER_SIZE);
        if !self.contains(target) {
            return false;
        }
        let mut cursor = self.first_block;
        while cursor < self.end {
            if mem.load(cursor) == GAP_PLUG_WORD {
                cursor = cursor.offset(WORD_SIZE);
                continue;
            }
            let header = ObjectHeader::at(cursor);
            if cursor == target {
                return header.gc_state(mem).kind() != GcState::FREE_BLOCK;
            }
            if cursor > target {
                return false;
            }
            cursor = header.next_object(mem, types);
        }
        false
    }

    /// Walks the whole segment verifying the entity chain and the free
    /// list in both directions. Any inconsistency is fatal.
    pub fn consistency_check(&self, mem: &HeapMemory, types: &TypeRegistry) {
        let mut cursor = self.first_block;
        let mut expected_free = self.first_free;
        let mut previous_free = HeapAddr::NULL;
        let mut previous_was_free = false;
        let mut previous_was_plug = false;
        while cursor < self.end {
            if mem.load(cursor) == GAP_PLUG_WORD {
                // a plug bordering a free block must have been absorbed
                bugcheck::ensure(!previous_was_free, StopCode::HeapCorruption);
                previous_was_plug = true;
                cursor = cursor.offset(WORD_SIZE);
                continue;
            }
            let header = ObjectHeader::at(cursor);
            let kind = header.gc_state(mem).kind();
            if kind == GcState::FREE_BLOCK {
                // Adjacent free space must have been coalesced or absorbed,
                // and both link directions must agree with the walk.
                bugcheck::ensure(!previous_was_free && !previous_was_plug, StopCode::HeapCorruption);
                bugcheck::ensure(cursor == expected_free, StopCode::HeapCorruption);
                bugcheck::ensure(
                    self.block_prev(mem, cursor) == previous_free,
                    StopCode::HeapCorruption,
                );
                expected_free = self.block_next(mem, cursor);
                previous_free = cursor;
                previous_was_free = true;
            } else {
                previous_was_free = false;
            }
            previous_was_plug = false;
            let next = header.next_object(mem, types);
            bugcheck::ensure(next > cursor && next <= self.end, StopCode::HeapCorruption);
            cursor = next;
        }
        bugcheck::ensure(cursor == self.end, StopCode::HeapCorruption);
        bugcheck::ensure(expected_free.is_null(), StopCode::HeapCorruption);
        bugcheck::ensure(self.last_free == previous_free, StopCode::HeapCorruption);
    }

    // ── Free block plumbing ─────────────────────────────────────────────

    fn write_free_block(&self, mem: &HeapMemory, start: HeapAddr, end: HeapAddr) {
        let size = end.distance_from(start);
        debug_assert!(size >= MIN_FREE_BLOCK);
        mem.store(start, GcState::FREE_BLOCK.bits());
        mem.store(start.offset(4), FREE_BLOCK_TYPE.0);
        mem.store(start.offset(8), (size - 12) / WORD_SIZE);
    }

    #[inline(always)]
    fn block_size(&self, mem: &HeapMemory, block: HeapAddr) -> u32 {
        12 + mem.load(block.offset(8)) * WORD_SIZE
    }

    #[inline(always)]
    fn block_end(&self, mem: &HeapMemory, block: HeapAddr) -> HeapAddr {
        block.offset(self.block_size(mem, block))
    }

    #[inline(always)]
    fn block_next(&self, mem: &HeapMemory, block: HeapAddr) -> HeapAddr {
        HeapAddr(mem.load(block.offset(NEXT_OFFSET)))
    }

    #[inline(always)]
    fn block_prev(&self, mem: &HeapMemory, block: HeapAddr) -> HeapAddr {
        HeapAddr(mem.load(block.offset(PREV_OFFSET)))
    }

    /// Free-list neighbors of `addr`: the last block below it and the first
    /// block above it. The list is address ordered.
    fn free_neighbors(&self, mem: &HeapMemory, addr: HeapAddr) -> (HeapAddr, HeapAddr) {
        let mut previous = HeapAddr::NULL;
        let mut cursor = self.first_free;
        while !cursor.is_null() && cursor < addr {
            previous = cursor;
            cursor = self.block_next(mem, cursor);
        }
        (previous, cursor)
    }

    /// Inserts `block` after `previous` (after the head when null).
    fn link(&mut self, mem: &HeapMemory, previous: HeapAddr, block: HeapAddr) {
        let next = match previous.is_null() {
            true => self.first_free,
            false => self.block_next(mem, previous),
        };
        self.relink(mem, previous, block, next);
    }

    fn relink(&mut self, mem: &HeapMemory, previous: HeapAddr, block: HeapAddr, next: HeapAddr) {
        mem.store(block.offset(NEXT_OFFSET), next.0);
        mem.store(block.offset(PREV_OFFSET), previous.0);
        match previous.is_null() {
            true => self.first_free = block,
            false => mem.store(previous.offset(NEXT_OFFSET), block.0),
        }
        match next.is_null() {
            true => self.last_free = block,
            false => mem.store(next.offset(PREV_OFFSET), block.0),
        }
    }

    fn unlink(&mut self, mem: &HeapMemory, block: HeapAddr) {
        let previous = self.block_prev(mem, block);
        let next = self.block_next(mem, block);
        match previous.is_null() {
            true => self.first_free = next,
            false => mem.store(previous.offset(NEXT_OFFSET), next.0),
        }
        match next.is_null() {
            true => self.last_free = previous,
            false => mem.store(next.offset(PREV_OFFSET), previous.0),
        }
    }
}
