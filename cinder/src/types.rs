//! Type metadata supplied by the "virtual table" collaborator.
//!
//! The compiler that decides object layout is out of scope; this registry
//! carries just the facts the heap needs: sizes, array shape, the GC
//! pointer map, the contained element type, an optional finalize hook and
//! the extension-handler kind for special objects. Type ids are plain
//! indices so a header's second word never stores a host pointer.

use crate::bugcheck::{self, StopCode};
use crate::memory::{HeapAddr, HeapMemory};

/// Index into the [`TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// Well-known type of the array shim wrapped around free blocks.
pub const FREE_BLOCK_TYPE: TypeId = TypeId(0);
/// Well-known element type of free-block arrays: one raw word, no pointers.
pub const RAW_WORD_TYPE: TypeId = TypeId(1);

/// Invoked when a finalizable object is reclaimed; receives the object
/// (data) address.
pub type FinalizeFn = fn(&HeapMemory, HeapAddr);

/// How a traced field is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// Points at the start of an object's data.
    Heap,
    /// May point anywhere inside an object; resolved through the brick table.
    Interior,
}

/// One entry of a type's GC pointer map.
#[derive(Debug, Clone, Copy)]
pub struct GcPointer {
    /// Word offset of the field from the start of the object's data.
    pub offset_words: u32,
    pub kind: PointerKind,
}

/// The closed set of mark/sweep extension participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    SyncBlock,
    Finalizer,
}

/// Layout and GC facts for one managed type.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: &'static str,
    /// Object size in bytes measured from the header, including the header
    /// itself and, for arrays, the length word.
    pub base_size: u32,
    /// Per-element size for arrays; zero otherwise.
    pub element_size: u32,
    pub is_array: bool,
    /// Value types are embedded in arrays rather than referenced.
    pub is_value_type: bool,
    /// Element type for arrays.
    pub contained: Option<TypeId>,
    /// Traced fields, offsets relative to the object data.
    pub pointers: Vec<GcPointer>,
    pub finalize: Option<FinalizeFn>,
    pub handler: Option<HandlerKind>,
}

impl TypeDescriptor {
    /// A plain object of `field_words` untyped words, with heap references
    /// at the given word offsets.
    pub fn object(name: &'static str, field_words: u32, pointer_offsets: &[u32]) -> Self {
        Self {
            name,
            base_size: crate::header::HEADER_SIZE + field_words * 4,
            element_size: 0,
            is_array: false,
            is_value_type: false,
            contained: None,
            pointers: pointer_offsets
                .iter()
                .map(|&offset_words| GcPointer {
                    offset_words,
                    kind: PointerKind::Heap,
                })
                .collect(),
            finalize: None,
            handler: None,
        }
    }

    /// An array whose elements are `contained` values of `element_size`
    /// bytes each.
    pub fn array(name: &'static str, contained: TypeId, element_size: u32) -> Self {
        Self {
            name,
            // header + length word
            base_size: crate::header::HEADER_SIZE + 4,
            element_size,
            is_array: true,
            is_value_type: false,
            contained: Some(contained),
            pointers: Vec::new(),
            finalize: None,
            handler: None,
        }
    }

    pub fn with_finalizer(mut self, finalize: FinalizeFn) -> Self {
        self.finalize = Some(finalize);
        self.handler = Some(HandlerKind::Finalizer);
        self
    }
}

/// Registry of all type descriptors, frozen before the runtime starts.
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeDescriptor>,
}

impl TypeRegistry {
    /// Creates a registry pre-populated with the well-known types the
    /// allocator itself depends on.
    pub fn new() -> Self {
        let mut registry = Self { types: Vec::new() };

        let free_block = registry.register(TypeDescriptor::array("free-block", RAW_WORD_TYPE, 4));
        debug_assert_eq!(free_block, FREE_BLOCK_TYPE);

        let raw_word = registry.register(TypeDescriptor {
            name: "raw-word",
            base_size: 4,
            element_size: 0,
            is_array: false,
            is_value_type: true,
            contained: None,
            pointers: Vec::new(),
            finalize: None,
            handler: None,
        });
        debug_assert_eq!(raw_word, RAW_WORD_TYPE);

        registry
    }

    pub fn register(&mut self, descriptor: TypeDescriptor) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(descriptor);
        id
    }

    pub fn get(&self, id: TypeId) -> &TypeDescriptor {
        match self.types.get(id.0 as usize) {
            Some(descriptor) => descriptor,
            None => bugcheck::raise(StopCode::HeapCorruption),
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
