//! Mark and sweep collection with an extension-handler protocol.
//!
//! A collection is stop-the-world with respect to the heap: the segment
//! lock is held for the whole cycle, so allocation and release wait.
//! Marking runs on two fixed-capacity explicit stacks (objects and array
//! cursors), mirroring the release cascade. The sweep walks every segment's
//! entity chain, rebuilds the free lists and the brick table, and clears
//! mark bits on survivors.
//!
//! Subsystems that track objects without owning references participate
//! through [`GcExtensionHandler`]: the finalizer promotes and resurrects
//! unreachable tracked objects at the end of the mark phase, and the sync
//! block table snapshots owner liveness there and recycles dead slots after
//! the sweep. The registry is closed; handlers run in registration order,
//! which puts the finalizer's resurrection before the liveness snapshot.

use std::sync::Arc;
use std::time::Instant;

use crate::bugcheck::{self, StopCode};
use crate::finalizer::Finalizer;
use crate::header::{GAP_PLUG_WORD, GcState, ObjectHeader};
use crate::memory::{HeapAddr, HeapMemory, WORD_SIZE};
use crate::runtime::{HeapRuntime, Resolved};
use crate::segment::MemorySegment;
use crate::sync_block::SyncBlockTable;
use crate::types::{HandlerKind, PointerKind, TypeId};

/// Liveness view handed to extension handlers during a collection.
pub trait CollectorContext {
    /// Whether `object` survives this collection. Null, read-only and
    /// unreclaimable objects always count as live.
    fn is_marked(&self, object: HeapAddr) -> bool;

    /// Marks `object` and everything reachable from it, keeping it alive
    /// through the coming sweep.
    fn extend_marking(&mut self, object: HeapAddr);
}

/// Callbacks a subsystem can hook into the collection cycle. All bodies
/// default to no-ops.
///
/// The per-object callbacks fire for objects tagged `SPECIAL_HANDLER`
/// whose type descriptor names this handler's kind. A handler whose state
/// lives in its own table, keyed by owner address, can leave them as
/// no-ops and work entirely from the phase callbacks; the sync block table
/// does exactly that.
pub trait GcExtensionHandler {
    fn start_of_collection(&self, _ctx: &mut dyn CollectorContext) {}

    /// A special-handler object of this handler's kind was reached during
    /// marking.
    fn mark_special_object(&self, _ctx: &mut dyn CollectorContext, _object: HeapAddr) {}

    fn end_of_mark_phase(&self, _ctx: &mut dyn CollectorContext) {}

    fn start_of_sweep_phase(&self, _ctx: &mut dyn CollectorContext) {}

    /// A special-handler object of this handler's kind survived the sweep.
    fn sweep_special_object(&self, _ctx: &mut dyn CollectorContext, _object: HeapAddr) {}

    fn end_of_sweep_phase(&self, _ctx: &mut dyn CollectorContext) {}

    fn end_of_collection(&self, _ctx: &mut dyn CollectorContext) {}
}

/// The closed set of handler registrations.
pub enum ExtensionHandler {
    /// Participates through the phase callbacks only: its records live in
    /// the table keyed by owner, so no type descriptor carries
    /// [`HandlerKind::SyncBlock`] and its per-object callbacks stay no-ops.
    SyncBlock(Arc<SyncBlockTable>),
    Finalizer(Arc<Finalizer>),
}

impl ExtensionHandler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            ExtensionHandler::SyncBlock(_) => HandlerKind::SyncBlock,
            ExtensionHandler::Finalizer(_) => HandlerKind::Finalizer,
        }
    }

    fn handler(&self) -> &dyn GcExtensionHandler {
        match self {
            ExtensionHandler::SyncBlock(table) => table.as_ref(),
            ExtensionHandler::Finalizer(finalizer) => finalizer.as_ref(),
        }
    }
}

/// Per-cycle accounting, logged and returned after each collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectionStats {
    pub live_objects: u32,
    pub live_bytes: u32,
    pub reclaimed_objects: u32,
    pub reclaimed_bytes: u32,
    pub marked_objects: u32,
    pub swept_special_objects: u32,
    pub free_blocks: u32,
    pub largest_free: u32,
}

pub struct Collector {
    handlers: Vec<ExtensionHandler>,
}

impl Collector {
    /// Registers the runtime's handlers. The finalizer comes first so its
    /// resurrections are visible to the sync block liveness snapshot.
    pub fn new(rt: &HeapRuntime) -> Self {
        Self {
            handlers: vec![
                ExtensionHandler::Finalizer(rt.finalizer().clone()),
                ExtensionHandler::SyncBlock(rt.sync_blocks().clone()),
            ],
        }
    }

    /// Runs one full mark/sweep cycle over `roots` (exact object
    /// references; nulls are permitted and skipped).
    pub fn collect(&mut self, rt: &HeapRuntime, roots: &[HeapAddr]) -> CollectionStats {
        let started = Instant::now();
        let mut segments = rt.segments().lock();
        let mut cycle = Cycle::new(rt, &mut segments);

        for handler in &self.handlers {
            handler.handler().start_of_collection(&mut cycle);
        }

        for &root in roots {
            cycle.extend_marking(root);
        }
        self.offer_special_objects(&mut cycle);
        for handler in &self.handlers {
            handler.handler().end_of_mark_phase(&mut cycle);
        }
        self.offer_special_objects(&mut cycle);

        for handler in &self.handlers {
            handler.handler().start_of_sweep_phase(&mut cycle);
        }
        let survivors = cycle.sweep();
        self.sweep_special_objects(&mut cycle, survivors);
        for handler in &self.handlers {
            handler.handler().end_of_sweep_phase(&mut cycle);
        }

        for handler in &self.handlers {
            handler.handler().end_of_collection(&mut cycle);
        }

        let stats = cycle.stats;
        if rt.settings().validate_heap {
            for segment in segments.iter() {
                segment.consistency_check(rt.memory(), rt.types());
            }
        }
        log::debug!(
            "collection: {} live ({} bytes), {} reclaimed ({} bytes) in {:?}",
            stats.live_objects,
            stats.live_bytes,
            stats.reclaimed_objects,
            stats.reclaimed_bytes,
            started.elapsed(),
        );
        stats
    }

    /// Hands every special object reached so far to its handler, repeating
    /// while the callbacks keep extending the marking.
    fn offer_special_objects(&self, cycle: &mut Cycle<'_>) {
        while let Some(object) = cycle.pending_special.pop() {
            let header = ObjectHeader::unpack(object);
            let descriptor = cycle.rt.types().get(header.type_id(cycle.rt.memory()));
            let Some(kind) = descriptor.handler else {
                bugcheck::raise(StopCode::HeapCorruption);
            };
            for handler in &self.handlers {
                if handler.kind() == kind {
                    handler.handler().mark_special_object(cycle, object);
                }
            }
        }
    }

    /// Hands every special object that survived the sweep to its handler.
    fn sweep_special_objects(&self, cycle: &mut Cycle<'_>, objects: Vec<HeapAddr>) {
        for object in objects {
            let header = ObjectHeader::unpack(object);
            let descriptor = cycle.rt.types().get(header.type_id(cycle.rt.memory()));
            let Some(kind) = descriptor.handler else {
                bugcheck::raise(StopCode::HeapCorruption);
            };
            for handler in &self.handlers {
                if handler.kind() == kind {
                    handler.handler().sweep_special_object(cycle, object);
                }
            }
            cycle.stats.swept_special_objects += 1;
        }
    }
}

/// One array being traced, cursor walking backward from the last element.
struct MarkFrame {
    cursor: HeapAddr,
    remaining: u32,
    stride: u32,
    /// Element type for embedded value elements with traced fields; `None`
    /// when every element is itself a reference.
    element_values: Option<TypeId>,
}

/// State of one collection cycle. Implements the context handlers see.
struct Cycle<'a> {
    rt: &'a HeapRuntime,
    segments: &'a mut Vec<MemorySegment>,
    objects: Vec<HeapAddr>,
    arrays: Vec<MarkFrame>,
    pending_special: Vec<HeapAddr>,
    stats: CollectionStats,
}

impl<'a> Cycle<'a> {
    fn new(rt: &'a HeapRuntime, segments: &'a mut Vec<MemorySegment>) -> Self {
        Self {
            rt,
            segments,
            objects: Vec::with_capacity(rt.settings().mark_stack_objects),
            arrays: Vec::with_capacity(rt.settings().mark_stack_arrays),
            pending_special: Vec::new(),
            stats: CollectionStats::default(),
        }
    }

    // ── Marking ─────────────────────────────────────────────────────────

    /// Marks one object and queues its fields for tracing.
    fn visit(&mut self, object: HeapAddr) {
        if object.is_null() {
            return;
        }
        let mem = self.rt.memory();
        let header = ObjectHeader::unpack(object);
        let state = header.gc_state(mem);
        if state.contains(GcState::MARKED) {
            return;
        }
        let kind = state.kind();
        // read-only objects are never swept and cannot point into the heap
        if kind == GcState::READ_ONLY {
            return;
        }
        // a live reference to free space is corruption
        bugcheck::ensure(
            kind == GcState::UNRECLAIMABLE
                || kind == GcState::NORMAL
                || kind == GcState::SPECIAL_HANDLER,
            StopCode::HeapCorruption,
        );
        header.set_gc_state(mem, state.union(GcState::MARKED));
        self.stats.marked_objects += 1;
        if kind == GcState::SPECIAL_HANDLER {
            self.pending_special.push(object);
        }
        self.push_fields(object);
    }

    fn push_fields(&mut self, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let descriptor = self.rt.types().get(header.type_id(self.rt.memory()));
        if descriptor.is_array {
            let length = header.element_count(self.rt.memory());
            if length == 0 {
                return;
            }
            let element_values = match descriptor.contained {
                Some(contained) => {
                    let element = self.rt.types().get(contained);
                    if element.is_value_type {
                        if element.pointers.is_empty() {
                            return;
                        }
                        Some(contained)
                    } else {
                        None
                    }
                }
                None => None,
            };
            bugcheck::ensure(
                self.arrays.len() < self.rt.settings().mark_stack_arrays,
                StopCode::NoMarkStack,
            );
            let stride = descriptor.element_size;
            let first_element = object.offset(WORD_SIZE);
            self.arrays.push(MarkFrame {
                cursor: first_element.offset((length - 1) * stride),
                remaining: length,
                stride,
                element_values,
            });
        } else if !descriptor.pointers.is_empty() {
            bugcheck::ensure(
                self.objects.len() < self.rt.settings().mark_stack_objects,
                StopCode::NoMarkStack,
            );
            self.objects.push(object);
        }
    }

    fn drain(&mut self) {
        while !self.objects.is_empty() || !self.arrays.is_empty() {
            if let Some(object) = self.objects.pop() {
                self.trace_object(object);
            } else {
                self.step_array();
            }
        }
    }

    fn trace_object(&mut self, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let descriptor = self.rt.types().get(header.type_id(self.rt.memory()));
        for pointer in &descriptor.pointers {
            let value = self.rt.read_field(object, pointer.offset_words);
            self.mark_value(value, pointer.kind);
        }
    }

    fn step_array(&mut self) {
        let Some(frame) = self.arrays.last_mut() else {
            return;
        };
        if frame.remaining == 0 {
            self.arrays.pop();
            return;
        }
        let cursor = frame.cursor;
        let element_values = frame.element_values;
        frame.remaining -= 1;
        if frame.remaining > 0 {
            frame.cursor = frame.cursor.back(frame.stride);
        }
        match element_values {
            None => {
                let value = HeapAddr(self.rt.memory().load(cursor));
                self.mark_value(value, PointerKind::Heap);
            }
            Some(contained) => {
                for pointer in &self.rt.types().get(contained).pointers {
                    let value = HeapAddr(
                        self.rt
                            .memory()
                            .load(cursor.offset(pointer.offset_words * WORD_SIZE)),
                    );
                    self.mark_value(value, pointer.kind);
                }
            }
        }
    }

    fn mark_value(&mut self, value: HeapAddr, kind: PointerKind) {
        if value.is_null() {
            return;
        }
        match kind {
            PointerKind::Heap => self.visit(value),
            PointerKind::Interior => {
                if let Some(object) = self.resolve_interior(value) {
                    self.visit(object);
                }
            }
        }
    }

    /// Resolves an interior pointer to its containing object through the
    /// brick table and the entity chain.
    fn resolve_interior(&self, ptr: HeapAddr) -> Option<HeapAddr> {
        let segment = self.segments.iter().find(|segment| segment.contains(ptr))?;
        let anchor = self
            .rt
            .brick()
            .find_lower_bound(ptr)
            .filter(|&anchor| anchor >= segment.first_block())
            .unwrap_or_else(|| segment.first_block());
        match self.rt.resolve(segment, anchor, ptr) {
            Resolved::Found(object) => Some(object),
            Resolved::NotAnObject => None,
            Resolved::BadAnchor => match self.rt.resolve(segment, segment.first_block(), ptr) {
                Resolved::Found(object) => Some(object),
                _ => None,
            },
        }
    }

    // ── Sweep ───────────────────────────────────────────────────────────

    /// Walks every segment, turning unmarked objects and existing gaps
    /// into fresh free lists, clearing survivor marks and re-publishing
    /// survivors in the brick table. Returns the surviving special objects
    /// so their handlers can be told they made it through.
    fn sweep(&mut self) -> Vec<HeapAddr> {
        let mem = self.rt.memory();
        let types = self.rt.types();
        self.rt.brick().reset();
        let mut survivors = Vec::new();
        // free run sizes bucketed by power of two, logged after the walk
        let mut histogram = [0u32; 16];
        for segment in self.segments.iter_mut() {
            segment.reset_free_list();
            let mut cursor = segment.first_block();
            let mut free_start = HeapAddr::NULL;
            while cursor < segment.end() {
                if mem.load(cursor) == GAP_PLUG_WORD {
                    if free_start.is_null() {
                        free_start = cursor;
                    }
                    cursor = cursor.offset(WORD_SIZE);
                    continue;
                }
                let header = ObjectHeader::at(cursor);
                let state = header.gc_state(mem);
                let size = header.total_size(mem, types);
                let next = header.next_object(mem, types);
                bugcheck::ensure(next > cursor && next <= segment.end(), StopCode::HeapCorruption);
                let kind = state.kind();
                if kind == GcState::FREE_BLOCK {
                    if free_start.is_null() {
                        free_start = cursor;
                    }
                } else if kind == GcState::UNRECLAIMABLE {
                    free_start = Self::close_free_run(
                        segment,
                        mem,
                        free_start,
                        cursor,
                        &mut self.stats,
                        &mut histogram,
                    );
                    header.set_gc_state(mem, GcState::UNRECLAIMABLE);
                    self.rt.brick().mark_object(cursor, size);
                    self.stats.live_objects += 1;
                    self.stats.live_bytes += size;
                } else if kind == GcState::NORMAL || kind == GcState::SPECIAL_HANDLER {
                    if state.contains(GcState::MARKED) {
                        free_start = Self::close_free_run(
                            segment,
                            mem,
                            free_start,
                            cursor,
                            &mut self.stats,
                            &mut histogram,
                        );
                        header.set_gc_state(mem, state.difference(GcState::MARKED));
                        self.rt.brick().mark_object(cursor, size);
                        if kind == GcState::SPECIAL_HANDLER {
                            survivors.push(header.pack());
                        }
                        self.stats.live_objects += 1;
                        self.stats.live_bytes += size;
                    } else {
                        if free_start.is_null() {
                            free_start = cursor;
                        }
                        self.stats.reclaimed_objects += 1;
                        self.stats.reclaimed_bytes += size;
                    }
                } else {
                    // read-only objects never live inside a segment
                    bugcheck::raise(StopCode::HeapCorruption);
                }
                cursor = next;
            }
            let end = segment.end();
            Self::close_free_run(segment, mem, free_start, end, &mut self.stats, &mut histogram);
        }
        if log::log_enabled!(log::Level::Debug) {
            let buckets: Vec<String> = histogram
                .iter()
                .enumerate()
                .filter(|(_, count)| **count > 0)
                .map(|(bucket, count)| format!("<{}B:{count}", 1u32 << (bucket + 1)))
                .collect();
            log::debug!("sweep free blocks: {}", buckets.join(" "));
        }
        survivors
    }

    fn close_free_run(
        segment: &mut MemorySegment,
        mem: &HeapMemory,
        free_start: HeapAddr,
        cursor: HeapAddr,
        stats: &mut CollectionStats,
        histogram: &mut [u32; 16],
    ) -> HeapAddr {
        if !free_start.is_null() {
            let size = cursor.distance_from(free_start);
            segment.link_new_free_block(mem, free_start, cursor);
            stats.free_blocks += 1;
            stats.largest_free = stats.largest_free.max(size);
            histogram[(size.ilog2() as usize).min(histogram.len() - 1)] += 1;
        }
        HeapAddr::NULL
    }
}

impl CollectorContext for Cycle<'_> {
    fn is_marked(&self, object: HeapAddr) -> bool {
        if object.is_null() {
            return true;
        }
        let state = ObjectHeader::unpack(object).gc_state(self.rt.memory());
        let kind = state.kind();
        if kind == GcState::READ_ONLY || kind == GcState::UNRECLAIMABLE {
            true
        } else if kind == GcState::NORMAL || kind == GcState::SPECIAL_HANDLER {
            state.contains(GcState::MARKED)
        } else {
            false
        }
    }

    fn extend_marking(&mut self, object: HeapAddr) {
        self.visit(object);
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapMemory;
    use crate::runtime::RuntimeSettings;
    use crate::types::{GcPointer, RAW_WORD_TYPE, TypeDescriptor, TypeRegistry};

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            heap_size: 128 * 1024,
            validate_heap: true,
            ..RuntimeSettings::default()
        }
    }

    fn runtime(register: impl FnOnce(&mut TypeRegistry) -> Vec<TypeId>) -> (HeapRuntime, Vec<TypeId>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut types = TypeRegistry::new();
        let ids = register(&mut types);
        let rt = HeapRuntime::new(settings(), types).expect("settings are valid");
        (rt, ids)
    }

    #[test]
    fn unreferenced_objects_are_reclaimed() {
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("leaf", 2, &[]))]
        });
        let before = rt.available_memory();
        let a = rt.allocate_object(ids[0]).expect("room");
        let _b = rt.allocate_object(ids[0]).expect("room");
        let mut collector = Collector::new(&rt);
        let stats = collector.collect(&rt, &[a]);
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.reclaimed_objects, 1);
        assert!(rt.find_object(a).is_some());
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.reclaimed_objects, 1, "a dies without a root");
        assert_eq!(rt.available_memory(), before);
    }

    #[test]
    fn marking_is_transitive() {
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("node", 1, &[0]))]
        });
        let c = rt.allocate_object(ids[0]).expect("room");
        let b = rt.allocate_object(ids[0]).expect("room");
        let a = rt.allocate_object(ids[0]).expect("room");
        rt.write_field(a, 0, b);
        rt.write_field(b, 0, c);
        let mut collector = Collector::new(&rt);
        let stats = collector.collect(&rt, &[a]);
        assert_eq!(stats.live_objects, 3);
        assert_eq!(stats.reclaimed_objects, 0);
    }

    #[test]
    fn survivor_marks_are_cleared_for_the_next_cycle() {
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("leaf", 2, &[]))]
        });
        let a = rt.allocate_object(ids[0]).expect("room");
        let mut collector = Collector::new(&rt);
        collector.collect(&rt, &[a]);
        let header = ObjectHeader::unpack(a);
        assert!(!header.is_marked(rt.memory()));
        let stats = collector.collect(&rt, &[a]);
        assert_eq!(stats.live_objects, 1);
    }

    #[test]
    fn array_elements_survive_through_the_array() {
        let (rt, ids) = runtime(|types| {
            let leaf = types.register(TypeDescriptor::object("leaf", 2, &[]));
            let array = types.register(TypeDescriptor::array("leaves", leaf, 4));
            vec![leaf, array]
        });
        let array = rt.allocate_array(ids[1], 3).expect("room");
        for index in 0..3 {
            let leaf = rt.allocate_object(ids[0]).expect("room");
            rt.write_field(array, 1 + index, leaf);
        }
        let stray = rt.allocate_object(ids[0]).expect("room");
        let mut collector = Collector::new(&rt);
        let stats = collector.collect(&rt, &[array]);
        assert_eq!(stats.live_objects, 4);
        assert_eq!(stats.reclaimed_objects, 1);
        assert!(rt.find_object(stray).is_none());
    }

    #[test]
    fn interior_pointers_keep_the_containing_object_alive() {
        let (rt, ids) = runtime(|types| {
            let bytes = types.register(TypeDescriptor::array("bytes", RAW_WORD_TYPE, 1));
            let mut holder = TypeDescriptor::object("holder", 1, &[]);
            holder.pointers.push(GcPointer {
                offset_words: 0,
                kind: PointerKind::Interior,
            });
            vec![bytes, types.register(holder)]
        });
        let bytes = rt.allocate_array(ids[0], 3000).expect("room");
        let holder = rt.allocate_object(ids[1]).expect("room");
        // points 2400 bytes into the array, past a brick page boundary
        rt.write_field(holder, 0, HeapAddr(bytes.0 + 2400));
        let mut collector = Collector::new(&rt);
        let stats = collector.collect(&rt, &[holder]);
        assert_eq!(stats.live_objects, 2);
        assert!(rt.find_object(bytes).is_some());
    }

    #[test]
    fn unreclaimable_objects_survive_with_no_roots() {
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("pinned", 2, &[]))]
        });
        let pinned = rt.allocate_unreclaimable(ids[0]).expect("room");
        let mut collector = Collector::new(&rt);
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.live_objects, 1);
        assert!(rt.find_object(pinned).is_some());
    }

    #[test]
    fn dead_sync_block_slots_are_recycled() {
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("leaf", 2, &[]))]
        });
        let a = rt.allocate_object(ids[0]).expect("room");
        let b = rt.allocate_object(ids[0]).expect("room");
        let _lock_a = rt.monitor_lock(a);
        let _lock_b = rt.monitor_lock(b);
        assert_eq!(rt.sync_blocks().live_slots(), 2);
        let mut collector = Collector::new(&rt);
        collector.collect(&rt, &[b]);
        assert_eq!(rt.sync_blocks().live_slots(), 1, "a's slot is recycled");
    }

    #[test]
    fn finalizable_object_is_resurrected_then_reclaimed() {
        const STAMP: u32 = 0xF1A1;
        fn stamp(memory: &HeapMemory, object: HeapAddr) {
            memory.store(object, STAMP);
        }
        let (rt, ids) = runtime(|types| {
            vec![types.register(
                TypeDescriptor::object("closeable", 1, &[]).with_finalizer(stamp),
            )]
        });
        let before = rt.available_memory();
        let object = rt.allocate_object(ids[0]).expect("room");
        let mut collector = Collector::new(&rt);

        // first cycle: unreachable but promoted, so it survives the sweep
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.reclaimed_objects, 0);
        rt.wait_for_pending_finalizers();
        assert_eq!(rt.memory().load(object), STAMP);

        // second cycle: finalized and untracked, reclaimed normally
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.reclaimed_objects, 1);
        assert_eq!(rt.available_memory(), before);
    }

    #[test]
    fn surviving_special_objects_are_offered_to_their_handler() {
        fn noop(_: &HeapMemory, _: HeapAddr) {}
        let (rt, ids) = runtime(|types| {
            vec![
                types.register(TypeDescriptor::object("closeable", 1, &[]).with_finalizer(noop)),
                types.register(TypeDescriptor::object("leaf", 2, &[])),
            ]
        });
        let object = rt.allocate_object(ids[0]).expect("room");
        let _plain = rt.allocate_object(ids[1]).expect("room");
        let mut collector = Collector::new(&rt);

        // rooted: the live special object reaches its handler, the plain
        // object does not
        let stats = collector.collect(&rt, &[object]);
        assert_eq!(stats.swept_special_objects, 1);

        // unrooted: resurrection keeps it special for one more sweep
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.swept_special_objects, 1);
        rt.wait_for_pending_finalizers();

        // finalized and reclaimed: nothing left to offer
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.swept_special_objects, 0);
    }

    #[test]
    fn suppressed_finalizable_object_dies_immediately() {
        fn noop(_: &HeapMemory, _: HeapAddr) {}
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("closeable", 1, &[]).with_finalizer(noop))]
        });
        let object = rt.allocate_object(ids[0]).expect("room");
        rt.suppress_finalize(object);
        let mut collector = Collector::new(&rt);
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.reclaimed_objects, 1);
    }

    #[test]
    fn sweep_rebuilds_a_single_free_block_from_many_corpses() {
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("leaf", 2, &[]))]
        });
        let before = rt.available_memory();
        for _ in 0..100 {
            rt.allocate_object(ids[0]).expect("room");
        }
        let mut collector = Collector::new(&rt);
        collector.collect(&rt, &[]);
        assert_eq!(rt.available_memory(), before);
        rt.consistency_check();
        let after = rt
            .allocate_object(ids[0])
            .expect("allocation after sweep succeeds");
        assert!(rt.find_object(after).is_some());
    }

    #[test]
    fn cycles_do_not_keep_objects_alive() {
        let (rt, ids) = runtime(|types| {
            vec![types.register(TypeDescriptor::object("node", 1, &[0]))]
        });
        let a = rt.allocate_object(ids[0]).expect("room");
        let b = rt.allocate_object(ids[0]).expect("room");
        rt.write_field(a, 0, b);
        rt.write_field(b, 0, a);
        let mut collector = Collector::new(&rt);
        let stats = collector.collect(&rt, &[]);
        assert_eq!(stats.reclaimed_objects, 2);
    }

    #[test]
    #[should_panic(expected = "bugcheck: NoMarkStack")]
    fn overflowing_the_mark_stack_is_fatal() {
        let mut config = settings();
        config.mark_stack_objects = 2;
        let mut types = TypeRegistry::new();
        let node = types.register(TypeDescriptor::object("node", 1, &[0]));
        let fanout = types.register(TypeDescriptor::object("fanout", 4, &[0, 1, 2, 3]));
        let rt = HeapRuntime::new(config, types).expect("settings are valid");

        let parent = rt.allocate_object(fanout).expect("room");
        for index in 0..4 {
            let child = rt.allocate_object(node).expect("room");
            rt.write_field(parent, index, child);
        }
        let mut collector = Collector::new(&rt);
        collector.collect(&rt, &[parent]);
    }
}
