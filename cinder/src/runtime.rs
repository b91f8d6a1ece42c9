//! The heap runtime: owns the mapped memory, the segments, the brick
//! table, the sync block table and the finalizer, and exposes the
//! allocation surface.
//!
//! Object references handed out and stored in fields are always *data*
//! addresses; the two header words sit immediately below. `HeapAddr::NULL`
//! is the null reference, which is why the first segment starts past
//! offset zero.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::brick::BrickTable;
use crate::bugcheck::{self, StopCode};
use crate::finalizer::Finalizer;
use crate::header::{ExtensionKind, GAP_PLUG_WORD, GcState, HEADER_SIZE, ObjectHeader};
use crate::memory::{HeapAddr, HeapMemory, WORD_SIZE, align_word};
use crate::segment::MemorySegment;
use crate::sync_block::SyncBlockTable;
use crate::types::{HandlerKind, TypeId, TypeRegistry};

/// Tunables fixed at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Total bytes mapped for the managed heap.
    pub heap_size: u32,
    /// Run a full segment consistency check after every release and
    /// collection. Expensive; meant for tests and debugging.
    pub validate_heap: bool,
    /// Capacity of the release cascade's object stack.
    pub release_stack_objects: usize,
    /// Capacity of the release cascade's array stack.
    pub release_stack_arrays: usize,
    /// Capacity of the collector's object mark stack.
    pub mark_stack_objects: usize,
    /// Capacity of the collector's array mark stack.
    pub mark_stack_arrays: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            heap_size: 4 * 1024 * 1024,
            validate_heap: false,
            release_stack_objects: 1024,
            release_stack_arrays: 128,
            mark_stack_objects: 1024,
            mark_stack_arrays: 128,
        }
    }
}

impl RuntimeSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size % WORD_SIZE != 0 {
            return Err("heap_size must be word aligned");
        }
        if self.heap_size < 4096 {
            return Err("heap_size must be at least one page");
        }
        if self.release_stack_objects == 0 || self.release_stack_arrays == 0 {
            return Err("release stacks must have nonzero capacity");
        }
        if self.mark_stack_objects == 0 || self.mark_stack_arrays == 0 {
            return Err("mark stacks must have nonzero capacity");
        }
        Ok(())
    }
}

/// Outcome of resolving an address against the entity chain.
pub(crate) enum Resolved {
    Found(HeapAddr),
    NotAnObject,
    BadAnchor,
}

pub struct HeapRuntime {
    settings: RuntimeSettings,
    memory: Arc<HeapMemory>,
    types: Arc<TypeRegistry>,
    segments: Mutex<Vec<MemorySegment>>,
    brick: BrickTable,
    sync_blocks: Arc<SyncBlockTable>,
    finalizer: Arc<Finalizer>,
}

impl HeapRuntime {
    pub fn new(settings: RuntimeSettings, types: TypeRegistry) -> Result<Self, &'static str> {
        settings.validate()?;
        let memory = Arc::new(HeapMemory::map(settings.heap_size));
        let types = Arc::new(types);
        // offset zero stays the null reference
        let segment = MemorySegment::initialize(
            &memory,
            HeapAddr(HEADER_SIZE),
            HeapAddr(settings.heap_size),
        );
        let brick = BrickTable::new(settings.heap_size);
        let sync_blocks = Arc::new(SyncBlockTable::new(memory.clone()));
        let finalizer = Arc::new(Finalizer::new(memory.clone(), types.clone()));
        log::info!(
            "heap runtime up: {} bytes, {} types",
            settings.heap_size,
            types.len()
        );
        Ok(Self {
            settings,
            memory,
            types,
            segments: Mutex::new(vec![segment]),
            brick,
            sync_blocks,
            finalizer,
        })
    }

    #[inline(always)]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn memory(&self) -> &Arc<HeapMemory> {
        &self.memory
    }

    #[inline(always)]
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    #[inline(always)]
    pub(crate) fn segments(&self) -> &Mutex<Vec<MemorySegment>> {
        &self.segments
    }

    #[inline(always)]
    pub(crate) fn brick(&self) -> &BrickTable {
        &self.brick
    }

    #[inline(always)]
    pub fn sync_blocks(&self) -> &Arc<SyncBlockTable> {
        &self.sync_blocks
    }

    #[inline(always)]
    pub fn finalizer(&self) -> &Arc<Finalizer> {
        &self.finalizer
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocates a plain object of `ty`, returning its data address.
    /// `None` when no segment has room.
    pub fn allocate_object(&self, ty: TypeId) -> Option<HeapAddr> {
        let descriptor = self.types.get(ty);
        bugcheck::ensure(!descriptor.is_array, StopCode::InvalidOperation);
        let state = match descriptor.handler {
            Some(_) => GcState::SPECIAL_HANDLER,
            None => GcState::NORMAL,
        };
        self.allocate_raw(ty, align_word(descriptor.base_size), state, 0)
    }

    /// Allocates an object that no collection will ever reclaim.
    pub fn allocate_unreclaimable(&self, ty: TypeId) -> Option<HeapAddr> {
        let descriptor = self.types.get(ty);
        bugcheck::ensure(!descriptor.is_array, StopCode::InvalidOperation);
        self.allocate_raw(ty, align_word(descriptor.base_size), GcState::UNRECLAIMABLE, 0)
    }

    /// Allocates an array of `length` elements of `ty`.
    pub fn allocate_array(&self, ty: TypeId, length: u32) -> Option<HeapAddr> {
        let descriptor = self.types.get(ty);
        bugcheck::ensure(descriptor.is_array, StopCode::InvalidOperation);
        let bytes =
            descriptor.base_size as u64 + descriptor.element_size as u64 * length as u64;
        if bytes > self.settings.heap_size as u64 {
            log::warn!("array of {bytes} bytes exceeds the heap");
            return None;
        }
        self.allocate_raw(ty, align_word(bytes as u32), GcState::NORMAL, length)
    }

    fn allocate_raw(
        &self,
        ty: TypeId,
        size: u32,
        state: GcState,
        array_length: u32,
    ) -> Option<HeapAddr> {
        let mut segments = self.segments.lock();
        let mut allocated = None;
        for segment in segments.iter_mut() {
            if let Some(header_addr) = segment.allocate(&self.memory, size) {
                let header = ObjectHeader::at(header_addr);
                header.initialize(&self.memory, state, ty);
                let data = header.pack();
                if self.types.get(ty).is_array {
                    self.memory.store(data, array_length);
                }
                self.brick.mark_object(header_addr, size);
                allocated = Some(data);
                break;
            }
        }
        drop(segments);
        match allocated {
            Some(data) => {
                if self.types.get(ty).handler == Some(HandlerKind::Finalizer) {
                    self.finalizer.register(data);
                }
                Some(data)
            }
            None => {
                log::warn!("allocation of {size} bytes failed: heap exhausted");
                None
            }
        }
    }

    // ── Release ─────────────────────────────────────────────────────────

    /// Returns `object` (a data address) to its segment's free list.
    pub fn release(&self, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let mut segments = self.segments.lock();
        let segment = segments
            .iter_mut()
            .find(|segment| segment.contains(header.addr()))
            .unwrap_or_else(|| bugcheck::raise(StopCode::NotAMemoryReference));
        segment.release(&self.memory, &self.types, header);
        if self.settings.validate_heap {
            segment.consistency_check(&self.memory, &self.types);
        }
    }

    /// Marks a freshly published object as reference counted, starting at
    /// one reference. Only legal before any hash or lock was requested.
    pub fn adopt_reference_counting(&self, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let adopted = header.try_update_extension(
            &self.memory,
            ExtensionKind::Empty,
            ExtensionKind::ReferenceCount,
            1,
        );
        bugcheck::ensure(adopted, StopCode::InvalidOperation);
    }

    // ── Field access ────────────────────────────────────────────────────

    /// Reads a reference field at `word` words past the object's data.
    #[inline(always)]
    pub fn read_field(&self, object: HeapAddr, word: u32) -> HeapAddr {
        HeapAddr(self.memory.load(object.offset(word * WORD_SIZE)))
    }

    /// Writes a reference field.
    #[inline(always)]
    pub fn write_field(&self, object: HeapAddr, word: u32, value: HeapAddr) {
        self.memory.store(object.offset(word * WORD_SIZE), value.0);
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Bytes spanned by all segments.
    pub fn total_memory(&self) -> u32 {
        let segments = self.segments.lock();
        segments.iter().map(|segment| segment.total_memory()).sum()
    }

    /// Bytes currently sitting on free lists.
    pub fn available_memory(&self) -> u32 {
        let segments = self.segments.lock();
        segments
            .iter()
            .map(|segment| segment.available_memory(&self.memory))
            .sum()
    }

    /// Resolves any heap address, interior bytes included, to the data
    /// address of the live object containing it.
    pub fn find_object(&self, ptr: HeapAddr) -> Option<HeapAddr> {
        let segments = self.segments.lock();
        let segment = segments.iter().find(|segment| segment.contains(ptr))?;
        // Brick hints can go stale when free-list coalescing swallows a
        // recorded header; a hinted walk that desyncs falls back to the
        // authoritative chain walk from the segment start.
        let anchor = self
            .brick
            .find_lower_bound(ptr)
            .filter(|&anchor| anchor >= segment.first_block())
            .unwrap_or_else(|| segment.first_block());
        match self.resolve(segment, anchor, ptr) {
            Resolved::Found(object) => Some(object),
            Resolved::NotAnObject => None,
            Resolved::BadAnchor => match self.resolve(segment, segment.first_block(), ptr) {
                Resolved::Found(object) => Some(object),
                _ => None,
            },
        }
    }

    pub(crate) fn resolve(
        &self,
        segment: &MemorySegment,
        anchor: HeapAddr,
        ptr: HeapAddr,
    ) -> Resolved {
        const ENTITY_KINDS: [GcState; 5] = [
            GcState::FREE_BLOCK,
            GcState::READ_ONLY,
            GcState::UNRECLAIMABLE,
            GcState::NORMAL,
            GcState::SPECIAL_HANDLER,
        ];
        let mut cursor = anchor;
        while cursor <= ptr && cursor < segment.end() {
            if self.memory.load(cursor) == GAP_PLUG_WORD {
                if cursor == ptr {
                    return Resolved::NotAnObject;
                }
                cursor = cursor.offset(WORD_SIZE);
                continue;
            }
            let header = ObjectHeader::at(cursor);
            let kind = header.gc_state(&self.memory).kind();
            if !ENTITY_KINDS.contains(&kind)
                || header.type_id(&self.memory).0 as usize >= self.types.len()
            {
                return Resolved::BadAnchor;
            }
            let next = header.next_object(&self.memory, &self.types);
            if next <= cursor || next > segment.end() {
                return Resolved::BadAnchor;
            }
            if ptr < next {
                return if kind == GcState::FREE_BLOCK {
                    Resolved::NotAnObject
                } else {
                    Resolved::Found(header.pack())
                };
            }
            cursor = next;
        }
        Resolved::NotAnObject
    }

    /// Walks every segment verifying chain and free-list integrity.
    pub fn consistency_check(&self) {
        let segments = self.segments.lock();
        for segment in segments.iter() {
            segment.consistency_check(&self.memory, &self.types);
        }
    }

    // ── Identity and finalization passthroughs ──────────────────────────

    pub fn get_hash_code(&self, object: HeapAddr) -> u32 {
        self.sync_blocks.get_hash_code(object)
    }

    pub fn monitor_lock(&self, object: HeapAddr) -> Arc<parking_lot::Mutex<()>> {
        self.sync_blocks.get_lock(object)
    }

    pub fn suppress_finalize(&self, object: HeapAddr) {
        self.finalizer.suppress_finalize(object);
    }

    pub fn re_register_for_finalize(&self, object: HeapAddr) {
        self.finalizer.re_register_for_finalize(object);
    }

    pub fn wait_for_pending_finalizers(&self) {
        self.finalizer.wait_for_pending_finalizers();
    }
}
