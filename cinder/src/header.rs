//! The bit-packed object header preceding every heap object.
//!
//! Two 32-bit words sit immediately before an object's data:
//!
//! ```text
//! word 0 (multi-use, atomic):
//!   bits 0..8   GC state: Marked bit plus one mutually exclusive kind
//!   bits 8..10  extension kind (Empty | HashCode | SyncBlockIndex | ReferenceCount)
//!   bits 10..32 extension payload (22 bits)
//! word 1:       TypeId of the object
//! ```
//!
//! The multi-use word is the one location mutated concurrently by mutator
//! threads: extension updates are compare-and-swap retry loops, reference
//! counts are atomic adds scoped to the payload bit range.

use std::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::bugcheck::{self, StopCode};
use crate::memory::{HeapAddr, HeapMemory, align_word};
use crate::types::{TypeId, TypeRegistry};

/// Bytes occupied by the header words.
pub const HEADER_SIZE: u32 = 8;

bitflags! {
    /// GC state byte of the multi-use word. `MARKED` is orthogonal; the
    /// remaining bits are mutually exclusive kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcState: u32 {
        const MARKED = 1 << 0;
        const FREE_BLOCK = 1 << 1;
        const GAP_PLUG = 1 << 2;
        const READ_ONLY = 1 << 3;
        const UNRECLAIMABLE = 1 << 4;
        const NORMAL = 1 << 5;
        const SPECIAL_HANDLER = 1 << 6;
    }
}

impl GcState {
    #[inline(always)]
    pub fn kind(self) -> GcState {
        self.difference(GcState::MARKED)
    }
}

const GC_STATE_MASK: u32 = 0xFF;
const EXTENSION_KIND_SHIFT: u32 = 8;
const EXTENSION_KIND_MASK: u32 = 0b11 << EXTENSION_KIND_SHIFT;
const PAYLOAD_SHIFT: u32 = 10;
const PAYLOAD_MASK: u32 = !(GC_STATE_MASK | EXTENSION_KIND_MASK);
/// Exclusive upper bound of an extension payload (22 bits).
pub const PAYLOAD_LIMIT: u32 = 1 << 22;

/// Sentinel word written repeatedly over unreclaimable fragmentation
/// filler. Not a real header: each plug word is skipped individually.
pub const GAP_PLUG_WORD: u32 = GcState::GAP_PLUG.bits();

/// What the extension slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtensionKind {
    Empty = 0,
    HashCode = 1,
    SyncBlockIndex = 2,
    ReferenceCount = 3,
}

impl ExtensionKind {
    #[inline(always)]
    fn from_bits(bits: u32) -> ExtensionKind {
        match bits {
            0 => ExtensionKind::Empty,
            1 => ExtensionKind::HashCode,
            2 => ExtensionKind::SyncBlockIndex,
            _ => ExtensionKind::ReferenceCount,
        }
    }
}

/// Handle to a header at a fixed heap address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    addr: HeapAddr,
}

impl ObjectHeader {
    /// Views the header located at `addr`.
    #[inline(always)]
    pub fn at(addr: HeapAddr) -> Self {
        Self { addr }
    }

    /// Recovers the header from an object (data) address.
    #[inline(always)]
    pub fn unpack(object: HeapAddr) -> Self {
        Self {
            addr: object.back(HEADER_SIZE),
        }
    }

    /// The object (data) address this header precedes.
    #[inline(always)]
    pub fn pack(self) -> HeapAddr {
        self.addr.offset(HEADER_SIZE)
    }

    #[inline(always)]
    pub fn addr(self) -> HeapAddr {
        self.addr
    }

    /// Stamps a fresh header. Not atomic; only valid on memory no other
    /// thread can observe yet.
    pub fn initialize(self, mem: &HeapMemory, state: GcState, type_id: TypeId) {
        mem.store(self.addr, state.bits() & GC_STATE_MASK);
        mem.store(self.addr.offset(4), type_id.0);
    }

    #[inline(always)]
    pub fn type_id(self, mem: &HeapMemory) -> TypeId {
        TypeId(mem.load(self.addr.offset(4)))
    }

    #[inline(always)]
    pub fn gc_state(self, mem: &HeapMemory) -> GcState {
        GcState::from_bits_truncate(mem.load(self.addr) & GC_STATE_MASK)
    }

    /// Replaces the GC state byte, preserving the extension bits.
    pub fn set_gc_state(self, mem: &HeapMemory, state: GcState) {
        let word = mem.word(self.addr);
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let next = (current & !GC_STATE_MASK) | (state.bits() & GC_STATE_MASK);
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline(always)]
    pub fn is_marked(self, mem: &HeapMemory) -> bool {
        self.gc_state(mem).contains(GcState::MARKED)
    }

    #[inline(always)]
    pub fn extension_kind(self, mem: &HeapMemory) -> ExtensionKind {
        ExtensionKind::from_bits((mem.load(self.addr) & EXTENSION_KIND_MASK) >> EXTENSION_KIND_SHIFT)
    }

    #[inline(always)]
    pub fn extension_payload(self, mem: &HeapMemory) -> u32 {
        (mem.load(self.addr) & PAYLOAD_MASK) >> PAYLOAD_SHIFT
    }

    /// Atomically replaces the extension kind and payload, preserving the
    /// GC state byte. The one concurrent in-place header mutation.
    pub fn update_extension(self, mem: &HeapMemory, kind: ExtensionKind, payload: u32) {
        bugcheck::ensure(payload < PAYLOAD_LIMIT, StopCode::InvalidOperation);
        let word = mem.word(self.addr);
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let next = (current & GC_STATE_MASK)
                | ((kind as u32) << EXTENSION_KIND_SHIFT)
                | (payload << PAYLOAD_SHIFT);
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically replaces kind and payload only while the current kind is
    /// `expected`. Returns false if another thread got there first.
    pub fn try_update_extension(
        self,
        mem: &HeapMemory,
        expected: ExtensionKind,
        kind: ExtensionKind,
        payload: u32,
    ) -> bool {
        bugcheck::ensure(payload < PAYLOAD_LIMIT, StopCode::InvalidOperation);
        let word = mem.word(self.addr);
        let mut current = word.load(Ordering::Relaxed);
        loop {
            if ExtensionKind::from_bits((current & EXTENSION_KIND_MASK) >> EXTENSION_KIND_SHIFT)
                != expected
            {
                return false;
            }
            let next = (current & GC_STATE_MASK)
                | ((kind as u32) << EXTENSION_KIND_SHIFT)
                | (payload << PAYLOAD_SHIFT);
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline(always)]
    pub fn has_reference_count(self, mem: &HeapMemory) -> bool {
        self.extension_kind(mem) == ExtensionKind::ReferenceCount
    }

    /// Atomic increment scoped to the payload bit range. Valid only while
    /// the extension kind is `ReferenceCount`.
    pub fn add_reference(self, mem: &HeapMemory) {
        bugcheck::ensure(self.has_reference_count(mem), StopCode::InvalidOperation);
        let previous = mem
            .word(self.addr)
            .fetch_add(1 << PAYLOAD_SHIFT, Ordering::AcqRel);
        bugcheck::ensure(
            (previous & PAYLOAD_MASK) >> PAYLOAD_SHIFT < PAYLOAD_LIMIT - 1,
            StopCode::InvalidOperation,
        );
    }

    /// Atomic decrement of the reference count; reports reaching zero.
    pub fn decrement_reference_count(self, mem: &HeapMemory) -> bool {
        bugcheck::ensure(self.has_reference_count(mem), StopCode::InvalidOperation);
        let previous = mem
            .word(self.addr)
            .fetch_sub(1 << PAYLOAD_SHIFT, Ordering::AcqRel);
        let count = (previous & PAYLOAD_MASK) >> PAYLOAD_SHIFT;
        bugcheck::ensure(count > 0, StopCode::InvalidOperation);
        count == 1
    }

    /// Element count for array objects: the length word is the first data
    /// word.
    #[inline(always)]
    pub fn element_count(self, mem: &HeapMemory) -> u32 {
        mem.load(self.pack())
    }

    /// Total object size in bytes from the header start, word aligned:
    /// `base_size + element_size * element_count`.
    pub fn total_size(self, mem: &HeapMemory, types: &TypeRegistry) -> u32 {
        let descriptor = types.get(self.type_id(mem));
        let mut size = descriptor.base_size;
        if descriptor.is_array {
            size += descriptor.element_size * self.element_count(mem);
        }
        align_word(size)
    }

    /// Header address of the next entity in the segment chain.
    #[inline(always)]
    pub fn next_object(self, mem: &HeapMemory, types: &TypeRegistry) -> HeapAddr {
        self.addr.offset(self.total_size(mem, types))
    }
}
