//! Reference-count release cascade.
//!
//! Dropping the last reference to an object may transitively drop the last
//! reference to everything it points at. Doing that recursively would
//! consume unbounded call stack, so the cascade runs on two fixed-capacity
//! explicit stacks instead: one of dead objects whose fields still need
//! visiting, one of array frames with a cursor walking the elements
//! backward from the end. An array frame costs O(1) regardless of the
//! array's length.
//!
//! Objects without traced fields, and arrays without traced elements, are
//! deleted on the spot and never consume a stack slot.

use crate::bugcheck::{self, StopCode};
use crate::header::ObjectHeader;
use crate::memory::{HeapAddr, WORD_SIZE};
use crate::runtime::{HeapRuntime, RuntimeSettings};
use crate::types::TypeId;

/// One partially visited array.
struct ArrayFrame {
    /// The array object itself, deleted once the frame drains.
    array: HeapAddr,
    /// Address of the next element to visit; walks toward the array start.
    cursor: HeapAddr,
    remaining: u32,
    stride: u32,
    /// Element type when elements are embedded values with traced fields;
    /// `None` means every element is itself a reference.
    element_values: Option<TypeId>,
}

pub struct ReleaseReferenceHelper {
    objects: Vec<HeapAddr>,
    arrays: Vec<ArrayFrame>,
    object_capacity: usize,
    array_capacity: usize,
}

impl ReleaseReferenceHelper {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            objects: Vec::with_capacity(settings.release_stack_objects),
            arrays: Vec::with_capacity(settings.release_stack_arrays),
            object_capacity: settings.release_stack_objects,
            array_capacity: settings.release_stack_arrays,
        }
    }

    /// Drops one reference to `object`. When the count reaches zero the
    /// object and everything it transitively owned is returned to the free
    /// lists before this returns. No-op for null and for objects not under
    /// reference counting.
    pub fn release_reference(&mut self, rt: &HeapRuntime, object: HeapAddr) {
        if object.is_null() {
            return;
        }
        let header = ObjectHeader::unpack(object);
        if !header.has_reference_count(rt.memory()) {
            return;
        }
        if header.decrement_reference_count(rt.memory()) {
            self.push_dead(rt, object);
            self.drain(rt);
        }
    }

    /// Routes a dead object to the right stack, or deletes it on the spot
    /// when it has nothing to visit.
    fn push_dead(&mut self, rt: &HeapRuntime, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let descriptor = rt.types().get(header.type_id(rt.memory()));
        if descriptor.is_array {
            let length = header.element_count(rt.memory());
            let element_values = match descriptor.contained {
                Some(contained) => {
                    let element = rt.types().get(contained);
                    if element.is_value_type {
                        if element.pointers.is_empty() {
                            // nothing traced inside the elements
                            Self::delete(rt, object);
                            return;
                        }
                        Some(contained)
                    } else {
                        None
                    }
                }
                None => None,
            };
            if length == 0 {
                Self::delete(rt, object);
                return;
            }
            bugcheck::ensure(self.arrays.len() < self.array_capacity, StopCode::NoReleaseStack);
            let stride = descriptor.element_size;
            let first_element = object.offset(WORD_SIZE);
            self.arrays.push(ArrayFrame {
                array: object,
                cursor: first_element.offset((length - 1) * stride),
                remaining: length,
                stride,
                element_values,
            });
        } else if descriptor.pointers.is_empty() {
            Self::delete(rt, object);
        } else {
            bugcheck::ensure(self.objects.len() < self.object_capacity, StopCode::NoReleaseStack);
            self.objects.push(object);
        }
    }

    fn drain(&mut self, rt: &HeapRuntime) {
        while !self.objects.is_empty() || !self.arrays.is_empty() {
            // objects first so nested discoveries finish before the array
            // cursor advances
            if let Some(object) = self.objects.pop() {
                self.visit_object(rt, object);
            } else {
                self.step_array(rt);
            }
        }
    }

    fn visit_object(&mut self, rt: &HeapRuntime, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let descriptor = rt.types().get(header.type_id(rt.memory()));
        for pointer in &descriptor.pointers {
            let value = rt.read_field(object, pointer.offset_words);
            self.drop_reference_to(rt, value);
        }
        Self::delete(rt, object);
    }

    /// Visits one element of the topmost array frame.
    fn step_array(&mut self, rt: &HeapRuntime) {
        let Some(frame) = self.arrays.last_mut() else {
            return;
        };
        if frame.remaining == 0 {
            let array = frame.array;
            self.arrays.pop();
            Self::delete(rt, array);
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
                let value = HeapAddr(rt.memory().load(cursor));
                self.drop_reference_to(rt, value);
            }
            Some(contained) => {
                for pointer in &rt.types().get(contained).pointers {
                    let value =
                        HeapAddr(rt.memory().load(cursor.offset(pointer.offset_words * WORD_SIZE)));
                    self.drop_reference_to(rt, value);
                }
            }
        }
    }

    fn drop_reference_to(&mut self, rt: &HeapRuntime, value: HeapAddr) {
        if value.is_null() {
            return;
        }
        let header = ObjectHeader::unpack(value);
        if !header.has_reference_count(rt.memory()) {
            return;
        }
        if header.decrement_reference_count(rt.memory()) {
            self.push_dead(rt, value);
        }
    }

    fn delete(rt: &HeapRuntime, object: HeapAddr) {
        let header = ObjectHeader::unpack(object);
        let descriptor = rt.types().get(header.type_id(rt.memory()));
        if let Some(finalize) = descriptor.finalize {
            // last reference gone: finalize synchronously, nothing can
            // resurrect the object now
            rt.suppress_finalize(object);
            finalize(rt.memory(), object);
        }
        rt.release(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeDescriptor, TypeRegistry};

    fn runtime(
        settings: RuntimeSettings,
        register: impl FnOnce(&mut TypeRegistry) -> Vec<TypeId>,
    ) -> (HeapRuntime, Vec<TypeId>) {
        let mut types = TypeRegistry::new();
        let ids = register(&mut types);
        let runtime = HeapRuntime::new(settings, types).expect("settings are valid");
        (runtime, ids)
    }

    fn settings(heap_size: u32) -> RuntimeSettings {
        RuntimeSettings {
            heap_size,
            validate_heap: true,
            ..RuntimeSettings::default()
        }
    }

    #[test]
    fn last_release_frees_the_object() {
        let (rt, ids) = runtime(settings(64 * 1024), |types| {
            vec![types.register(TypeDescriptor::object("leaf", 2, &[]))]
        });
        let before = rt.available_memory();
        let object = rt.allocate_object(ids[0]).expect("room");
        rt.adopt_reference_counting(object);
        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, object);
        assert_eq!(rt.available_memory(), before);
    }

    #[test]
    fn shared_object_survives_until_the_last_owner_lets_go() {
        let (rt, ids) = runtime(settings(64 * 1024), |types| {
            vec![types.register(TypeDescriptor::object("leaf", 2, &[]))]
        });
        let object = rt.allocate_object(ids[0]).expect("room");
        rt.adopt_reference_counting(object);
        ObjectHeader::unpack(object).add_reference(rt.memory());

        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, object);
        assert!(rt.find_object(object).is_some(), "one owner remains");
        helper.release_reference(&rt, object);
        assert!(rt.find_object(object).is_none());
    }

    #[test]
    fn non_counted_objects_are_untouched() {
        let (rt, ids) = runtime(settings(64 * 1024), |types| {
            vec![types.register(TypeDescriptor::object("leaf", 2, &[]))]
        });
        let object = rt.allocate_object(ids[0]).expect("room");
        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, object);
        assert!(rt.find_object(object).is_some());
    }

    #[test]
    fn deep_chain_cascades_within_a_tiny_stack() {
        let depth = 20_000u32;
        let mut config = settings(2 * 1024 * 1024);
        config.release_stack_objects = 8;
        config.validate_heap = false; // the per-release walk is quadratic
        let (rt, ids) = runtime(config, |types| {
            vec![types.register(TypeDescriptor::object("node", 1, &[0]))]
        });
        let before = rt.available_memory();

        let mut head = HeapAddr::NULL;
        for _ in 0..depth {
            let node = rt.allocate_object(ids[0]).expect("room for the chain");
            rt.adopt_reference_counting(node);
            rt.write_field(node, 0, head);
            head = node;
        }

        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, head);
        assert_eq!(rt.available_memory(), before, "the whole chain is gone");
        rt.consistency_check();
    }

    #[test]
    fn array_of_references_releases_its_elements() {
        let (rt, ids) = runtime(settings(64 * 1024), |types| {
            let leaf = types.register(TypeDescriptor::object("leaf", 2, &[]));
            let array = types.register(TypeDescriptor::array("leaves", leaf, 4));
            vec![leaf, array]
        });
        let before = rt.available_memory();
        let array = rt.allocate_array(ids[1], 10).expect("room");
        rt.adopt_reference_counting(array);
        for index in 0..10 {
            let leaf = rt.allocate_object(ids[0]).expect("room");
            rt.adopt_reference_counting(leaf);
            // word 0 is the length
            rt.write_field(array, 1 + index, leaf);
        }
        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, array);
        assert_eq!(rt.available_memory(), before);
    }

    #[test]
    fn value_element_array_traces_embedded_fields() {
        let (rt, ids) = runtime(settings(64 * 1024), |types| {
            let leaf = types.register(TypeDescriptor::object("leaf", 2, &[]));
            // two-word value element whose second word is a reference
            let element = types.register(TypeDescriptor {
                is_value_type: true,
                ..TypeDescriptor::object("entry", 0, &[1])
            });
            let array = types.register(TypeDescriptor::array("entries", element, 8));
            vec![leaf, array]
        });
        let before = rt.available_memory();
        let array = rt.allocate_array(ids[1], 4).expect("room");
        rt.adopt_reference_counting(array);
        for index in 0..4 {
            let leaf = rt.allocate_object(ids[0]).expect("room");
            rt.adopt_reference_counting(leaf);
            rt.write_field(array, 1 + index * 2 + 1, leaf);
        }
        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, array);
        assert_eq!(rt.available_memory(), before);
    }

    #[test]
    fn empty_array_is_deleted_without_a_frame() {
        let (rt, ids) = runtime(settings(64 * 1024), |types| {
            let leaf = types.register(TypeDescriptor::object("leaf", 2, &[]));
            vec![types.register(TypeDescriptor::array("leaves", leaf, 4))]
        });
        let before = rt.available_memory();
        let array = rt.allocate_array(ids[0], 0).expect("room");
        rt.adopt_reference_counting(array);
        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, array);
        assert_eq!(rt.available_memory(), before);
    }

    #[test]
    fn finalizable_object_is_finalized_synchronously() {
        const STAMP: u32 = 0xC105ED;
        fn mark_closed(memory: &crate::memory::HeapMemory, object: HeapAddr) {
            memory.store(object, STAMP);
        }
        let (rt, ids) = runtime(settings(64 * 1024), |types| {
            vec![types.register(
                TypeDescriptor::object("closeable", 1, &[]).with_finalizer(mark_closed),
            )]
        });
        let object = rt.allocate_object(ids[0]).expect("room");
        rt.adopt_reference_counting(object);
        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, object);
        assert_eq!(rt.memory().load(object), STAMP);
        assert_eq!(rt.finalizer().tracked_count(), 0);
    }

    #[test]
    #[should_panic(expected = "bugcheck: NoReleaseStack")]
    fn overflowing_the_object_stack_is_fatal() {
        let mut config = settings(64 * 1024);
        config.release_stack_objects = 4;
        let (rt, ids) = runtime(config, |types| {
            let node = types.register(TypeDescriptor::object("node", 1, &[0]));
            vec![node, types.register(TypeDescriptor::object("fanout", 8, &[0, 1, 2, 3, 4, 5, 6, 7]))]
        });
        let parent = rt.allocate_object(ids[1]).expect("room");
        rt.adopt_reference_counting(parent);
        for index in 0..8 {
            let child = rt.allocate_object(ids[0]).expect("room");
            rt.adopt_reference_counting(child);
            rt.write_field(parent, index, child);
        }
        let mut helper = ReleaseReferenceHelper::new(rt.settings());
        helper.release_reference(&rt, parent);
    }
}
