//! Managed heap runtime for a statically compiled object environment.
//!
//! The heap is one mapped range divided into segments of chained entities
//! (objects, free blocks, gap plugs), allocated first-fit from per-segment
//! free lists. Every object carries a two-word bit-packed header whose
//! extension slot holds an identity hash, a sync block index or a
//! reference count. Reclamation comes in two flavors that share the free
//! lists: an explicit reference-count release cascade and a stop-the-world
//! mark/sweep collector with an extension-handler protocol for the sync
//! block table and the deferred finalizer.

mod brick;
mod bugcheck;
mod collector;
mod finalizer;
mod header;
mod memory;
mod release;
mod runtime;
mod segment;
mod sync_block;
mod system;
mod types;

pub use brick::{BRICK_SIZE, BrickTable};
pub use bugcheck::StopCode;
pub use collector::{
    CollectionStats, Collector, CollectorContext, ExtensionHandler, GcExtensionHandler,
};
pub use finalizer::Finalizer;
pub use header::{ExtensionKind, GAP_PLUG_WORD, GcState, HEADER_SIZE, ObjectHeader, PAYLOAD_LIMIT};
pub use memory::{HeapAddr, HeapMemory, WORD_SIZE, align_word};
pub use release::ReleaseReferenceHelper;
pub use runtime::{HeapRuntime, RuntimeSettings};
pub use segment::{MIN_FREE_BLOCK, MemorySegment};
pub use sync_block::SyncBlockTable;
pub use system::{OS_PAGE_SIZE, map_memory, unmap_memory};
pub use types::{
    FREE_BLOCK_TYPE, FinalizeFn, GcPointer, HandlerKind, PointerKind, RAW_WORD_TYPE,
    TypeDescriptor, TypeId, TypeRegistry,
};
