//! Deferred finalization.
//!
//! Finalizable objects are tracked from allocation. When a collection finds
//! a tracked object unreachable, the object is resurrected (kept alive one
//! more cycle) and promoted to the pending queue; a dedicated worker thread
//! later runs its finalize hook outside any collection. Once finalized the
//! object is no longer tracked and the next collection reclaims it
//! normally.
//!
//! The worker is spawned lazily on the first batch of work and drains one
//! object at a time, holding no lock while a finalize hook runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::bugcheck::{self, StopCode};
use crate::collector::{CollectorContext, GcExtensionHandler};
use crate::header::ObjectHeader;
use crate::memory::{HeapAddr, HeapMemory};
use crate::types::TypeRegistry;

struct FinalizerState {
    /// Registered, not yet promoted.
    tracked: Vec<HeapAddr>,
    /// Promoted, awaiting the worker.
    pending: VecDeque<HeapAddr>,
    /// Objects currently inside a finalize hook.
    in_flight: usize,
    shutdown: bool,
}

struct FinalizerShared {
    memory: Arc<HeapMemory>,
    types: Arc<TypeRegistry>,
    state: Mutex<FinalizerState>,
    work_available: Condvar,
    drained: Condvar,
}

pub struct Finalizer {
    shared: Arc<FinalizerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Finalizer {
    pub fn new(memory: Arc<HeapMemory>, types: Arc<TypeRegistry>) -> Self {
        Self {
            shared: Arc::new(FinalizerShared {
                memory,
                types,
                state: Mutex::new(FinalizerState {
                    tracked: Vec::new(),
                    pending: VecDeque::new(),
                    in_flight: 0,
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                drained: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts tracking `object`. Called by the allocator for every object
    /// whose type carries a finalize hook.
    pub fn register(&self, object: HeapAddr) {
        let mut state = self.shared.state.lock();
        if !state.tracked.contains(&object) {
            state.tracked.push(object);
        }
    }

    /// Stops tracking `object`; it will be reclaimed without finalization.
    pub fn suppress_finalize(&self, object: HeapAddr) {
        let mut state = self.shared.state.lock();
        state.tracked.retain(|&tracked| tracked != object);
    }

    /// Undoes a suppression.
    pub fn re_register_for_finalize(&self, object: HeapAddr) {
        self.register(object);
    }

    /// Kicks the worker after a collection promoted objects. Spawns it on
    /// first use; signalling an already-running worker is cheap.
    pub fn restart_execution(&self) {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name("cinder-finalizer".into())
                .spawn(move || Finalizer::worker_loop(shared))
                .unwrap_or_else(|_| bugcheck::raise(StopCode::FinalizerCorruption));
            *worker = Some(handle);
        }
        self.shared.work_available.notify_one();
    }

    /// Blocks until every promoted object has been finalized.
    pub fn wait_for_pending_finalizers(&self) {
        self.restart_execution();
        let mut state = self.shared.state.lock();
        while !state.pending.is_empty() || state.in_flight > 0 {
            self.shared.drained.wait(&mut state);
        }
    }

    /// Tracked objects not yet promoted. Diagnostic.
    pub fn tracked_count(&self) -> usize {
        self.shared.state.lock().tracked.len()
    }

    fn worker_loop(shared: Arc<FinalizerShared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.pending.pop_front() {
                Some(object) => {
                    state.in_flight += 1;
                    drop(state);
                    Finalizer::finalize_object(&shared, object);
                    state = shared.state.lock();
                    state.in_flight -= 1;
                    if state.pending.is_empty() && state.in_flight == 0 {
                        shared.drained.notify_all();
                    }
                }
                None => shared.work_available.wait(&mut state),
            }
        }
    }

    fn finalize_object(shared: &FinalizerShared, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let descriptor = shared.types.get(header.type_id(&shared.memory));
        match descriptor.finalize {
            Some(finalize) => finalize(&shared.memory, object),
            None => bugcheck::raise(StopCode::FinalizerCorruption),
        }
    }
}

impl GcExtensionHandler for Finalizer {
    /// Promotes unreachable tracked objects: each is resurrected so it
    /// survives this cycle, then queued for the worker. Runs before other
    /// handlers inspect liveness.
    fn end_of_mark_phase(&self, ctx: &mut dyn CollectorContext) {
        let mut state = self.shared.state.lock();
        let mut index = 0;
        while index < state.tracked.len() {
            let object = state.tracked[index];
            if ctx.is_marked(object) {
                index += 1;
                continue;
            }
            ctx.extend_marking(object);
            state.tracked.swap_remove(index);
            state.pending.push_back(object);
        }
        if !state.pending.is_empty() {
            log::debug!("finalizer: {} objects promoted", state.pending.len());
        }
    }

    fn end_of_collection(&self, _ctx: &mut dyn CollectorContext) {
        let pending = !self.shared.state.lock().pending.is_empty();
        if pending {
            self.restart_execution();
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_available.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{GcState, HEADER_SIZE};
    use crate::types::TypeDescriptor;
    use std::collections::HashSet;

    const FINALIZED_STAMP: u32 = 0xF1A1;

    fn stamp_finalized(memory: &HeapMemory, object: HeapAddr) {
        memory.store(object, FINALIZED_STAMP);
    }

    struct FakeContext {
        marked: HashSet<HeapAddr>,
    }

    impl CollectorContext for FakeContext {
        fn is_marked(&self, object: HeapAddr) -> bool {
            self.marked.contains(&object)
        }

        fn extend_marking(&mut self, object: HeapAddr) {
            self.marked.insert(object);
        }
    }

    fn setup() -> (Arc<HeapMemory>, Finalizer, HeapAddr) {
        let _ = env_logger::builder().is_test(true).try_init();
        let memory = Arc::new(HeapMemory::map(4096));
        let mut types = TypeRegistry::new();
        let ty = types
            .register(TypeDescriptor::object("closeable", 1, &[]).with_finalizer(stamp_finalized));
        let types = Arc::new(types);
        let header = ObjectHeader::at(HeapAddr(8));
        header.initialize(&memory, GcState::SPECIAL_HANDLER, ty);
        let finalizer = Finalizer::new(memory.clone(), types);
        (memory, finalizer, HeapAddr(8 + HEADER_SIZE))
    }

    #[test]
    fn unreachable_object_is_promoted_and_resurrected() {
        let (_memory, finalizer, object) = setup();
        finalizer.register(object);
        let mut ctx = FakeContext { marked: HashSet::new() };
        finalizer.end_of_mark_phase(&mut ctx);
        assert!(ctx.is_marked(object), "promotion must resurrect the object");
        assert_eq!(finalizer.tracked_count(), 0);
    }

    #[test]
    fn reachable_object_stays_tracked() {
        let (_memory, finalizer, object) = setup();
        finalizer.register(object);
        let mut ctx = FakeContext {
            marked: [object].into_iter().collect(),
        };
        finalizer.end_of_mark_phase(&mut ctx);
        assert_eq!(finalizer.tracked_count(), 1);
    }

    #[test]
    fn worker_runs_the_finalize_hook() {
        let (memory, finalizer, object) = setup();
        finalizer.register(object);
        let mut ctx = FakeContext { marked: HashSet::new() };
        finalizer.end_of_mark_phase(&mut ctx);
        finalizer.end_of_collection(&mut ctx);
        finalizer.wait_for_pending_finalizers();
        assert_eq!(memory.load(object), FINALIZED_STAMP);
    }

    #[test]
    fn suppressed_object_is_never_finalized() {
        let (memory, finalizer, object) = setup();
        finalizer.register(object);
        finalizer.suppress_finalize(object);
        let mut ctx = FakeContext { marked: HashSet::new() };
        finalizer.end_of_mark_phase(&mut ctx);
        finalizer.wait_for_pending_finalizers();
        assert_ne!(memory.load(object), FINALIZED_STAMP);
        assert!(!ctx.is_marked(object), "nothing to resurrect");
    }

    #[test]
    fn re_registration_restores_tracking() {
        let (_memory, finalizer, object) = setup();
        finalizer.register(object);
        finalizer.suppress_finalize(object);
        finalizer.re_register_for_finalize(object);
        assert_eq!(finalizer.tracked_count(), 1);
    }

    #[test]
    fn finalization_happens_once() {
        let (memory, finalizer, object) = setup();
        finalizer.register(object);
        let mut ctx = FakeContext { marked: HashSet::new() };
        finalizer.end_of_mark_phase(&mut ctx);
        finalizer.wait_for_pending_finalizers();
        assert_eq!(memory.load(object), FINALIZED_STAMP);

        // a later cycle finds it unreachable again, but it is untracked now
        memory.store(object, 0);
        let mut ctx = FakeContext { marked: HashSet::new() };
        finalizer.end_of_mark_phase(&mut ctx);
        finalizer.wait_for_pending_finalizers();
        assert_eq!(memory.load(object), 0);
    }

    #[test]
    fn wait_with_no_work_returns_immediately() {
        let (_memory, finalizer, _object) = setup();
        finalizer.wait_for_pending_finalizers();
    }

    #[test]
    fn wait_drains_the_earlier_batch_despite_concurrent_promotions() {
        fn count_finalization(memory: &HeapMemory, object: HeapAddr) {
            memory.store(object, memory.load(object) + 1);
        }
        let _ = env_logger::builder().is_test(true).try_init();
        let memory = Arc::new(HeapMemory::map(4096));
        let mut types = TypeRegistry::new();
        let ty = types
            .register(TypeDescriptor::object("counter", 1, &[]).with_finalizer(count_finalization));
        let finalizer = Arc::new(Finalizer::new(memory.clone(), Arc::new(types)));

        let make = |index: u32| {
            let header = ObjectHeader::at(HeapAddr(8 + index * 16));
            header.initialize(&memory, GcState::SPECIAL_HANDLER, ty);
            header.pack()
        };
        let promote = |objects: &[HeapAddr]| {
            for &object in objects {
                finalizer.register(object);
            }
            let mut ctx = FakeContext { marked: HashSet::new() };
            finalizer.end_of_mark_phase(&mut ctx);
        };

        let first: Vec<HeapAddr> = (0..16).map(make).collect();
        promote(&first);

        let waiter = {
            let finalizer = finalizer.clone();
            std::thread::spawn(move || finalizer.wait_for_pending_finalizers())
        };

        // a second batch arrives while the wait is in progress
        let second: Vec<HeapAddr> = (16..32).map(make).collect();
        promote(&second);
        finalizer.restart_execution();

        waiter.join().expect("waiter thread panicked");
        for &object in &first {
            assert_eq!(memory.load(object), 1, "queued before the wait, run exactly once");
        }

        finalizer.wait_for_pending_finalizers();
        for &object in &second {
            assert_eq!(memory.load(object), 1);
        }
    }
}
