//! Identity hash codes and monitor locks for managed objects.
//!
//! Most objects never need either; the ones that do first store the hash
//! inline in the header extension, then escalate to a table slot when a
//! lock is requested and the extension must carry both. Read-only objects
//! (whose headers may live in write-protected memory) and reference-counted
//! objects (whose extension already carries the count) always use a table
//! slot, found by owner scan.
//!
//! The table participates in collections as an extension handler: at the
//! end of the mark phase it snapshots which owners survived, after the
//! sweep it recycles the slots of the dead ones. A recycled slot hands out
//! a fresh hash to its next owner.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::bugcheck::{self, StopCode};
use crate::collector::{CollectorContext, GcExtensionHandler};
use crate::header::{ExtensionKind, GcState, ObjectHeader, PAYLOAD_LIMIT};
use crate::memory::{HeapAddr, HeapMemory};

/// Slot growth granularity.
const SYNC_BLOCK_CLUSTER: usize = 16;

struct SyncBlock {
    owner: HeapAddr,
    hash_code: u32,
    lock: Arc<Mutex<()>>,
    in_use: bool,
    live: bool,
}

struct TableState {
    slots: Vec<SyncBlock>,
    free: Vec<u32>,
}

pub struct SyncBlockTable {
    memory: Arc<HeapMemory>,
    state: Mutex<TableState>,
    next_hash: AtomicU32,
}

impl SyncBlockTable {
    pub fn new(memory: Arc<HeapMemory>) -> Self {
        Self {
            memory,
            state: Mutex::new(TableState {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            next_hash: AtomicU32::new(1),
        }
    }

    /// Stable identity hash for `object`, assigned on first request.
    pub fn get_hash_code(&self, object: HeapAddr) -> u32 {
        let header = ObjectHeader::unpack(object);
        loop {
            match header.extension_kind(&self.memory) {
                ExtensionKind::HashCode => return header.extension_payload(&self.memory),
                ExtensionKind::SyncBlockIndex => {
                    let index = header.extension_payload(&self.memory);
                    let state = self.state.lock();
                    return self.slot(&state, index).hash_code;
                }
                ExtensionKind::ReferenceCount => {
                    // The extension carries the count; the hash lives in a slot.
                    let mut state = self.state.lock();
                    let index = self.find_or_allocate_slot(&mut state, object);
                    return state.slots[index as usize].hash_code;
                }
                ExtensionKind::Empty => {
                    if header.gc_state(&self.memory).kind() == GcState::READ_ONLY {
                        let mut state = self.state.lock();
                        let index = self.find_or_allocate_slot(&mut state, object);
                        return state.slots[index as usize].hash_code;
                    }
                    let hash = self.fresh_hash();
                    if header.try_update_extension(
                        &self.memory,
                        ExtensionKind::Empty,
                        ExtensionKind::HashCode,
                        hash,
                    ) {
                        return hash;
                    }
                    // lost the race, re-read whatever won
                }
            }
        }
    }

    /// Monitor lock for `object`, escalating its hash to a table slot if
    /// the extension currently holds one inline.
    pub fn get_lock(&self, object: HeapAddr) -> Arc<Mutex<()>> {
        let header = ObjectHeader::unpack(object);
        if header.extension_kind(&self.memory) == ExtensionKind::SyncBlockIndex {
            let index = header.extension_payload(&self.memory);
            let state = self.state.lock();
            return self.slot(&state, index).lock.clone();
        }

        let mut state = self.state.lock();
        // Re-check under the table lock; another thread may have escalated.
        match header.extension_kind(&self.memory) {
            ExtensionKind::SyncBlockIndex => {
                let index = header.extension_payload(&self.memory);
                self.slot(&state, index).lock.clone()
            }
            ExtensionKind::ReferenceCount => {
                let index = self.find_or_allocate_slot(&mut state, object);
                state.slots[index as usize].lock.clone()
            }
            kind => {
                if header.gc_state(&self.memory).kind() == GcState::READ_ONLY {
                    let index = self.find_or_allocate_slot(&mut state, object);
                    return state.slots[index as usize].lock.clone();
                }
                let index = self.allocate_slot(&mut state, object);
                if kind == ExtensionKind::HashCode {
                    // Migrate the inline hash so it stays stable.
                    state.slots[index as usize].hash_code =
                        header.extension_payload(&self.memory);
                }
                header.update_extension(&self.memory, ExtensionKind::SyncBlockIndex, index);
                state.slots[index as usize].lock.clone()
            }
        }
    }

    /// Slots currently in use. Diagnostic.
    pub fn live_slots(&self) -> usize {
        self.state.lock().slots.iter().filter(|slot| slot.in_use).count()
    }

    fn slot<'a>(&self, state: &'a TableState, index: u32) -> &'a SyncBlock {
        match state.slots.get(index as usize) {
            Some(slot) if slot.in_use => slot,
            _ => bugcheck::raise(StopCode::SyncBlockCorruption),
        }
    }

    fn find_or_allocate_slot(&self, state: &mut TableState, object: HeapAddr) -> u32 {
        if let Some(index) = state
            .slots
            .iter()
            .position(|slot| slot.in_use && slot.owner == object)
        {
            return index as u32;
        }
        self.allocate_slot(state, object)
    }

    fn allocate_slot(&self, state: &mut TableState, object: HeapAddr) -> u32 {
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                let base = state.slots.len();
                bugcheck::ensure(
                    base + SYNC_BLOCK_CLUSTER <= PAYLOAD_LIMIT as usize,
                    StopCode::NoMemory,
                );
                for _ in 0..SYNC_BLOCK_CLUSTER {
                    state.slots.push(SyncBlock {
                        owner: HeapAddr::NULL,
                        hash_code: 0,
                        lock: Arc::new(Mutex::new(())),
                        in_use: false,
                        live: false,
                    });
                    state.free.push(state.slots.len() as u32 - 1);
                }
                state.free.pop().unwrap_or_else(|| {
                    bugcheck::raise(StopCode::SyncBlockCorruption)
                })
            }
        };
        let hash = self.fresh_hash();
        let slot = &mut state.slots[index as usize];
        slot.owner = object;
        slot.hash_code = hash;
        slot.in_use = true;
        slot.live = false;
        index
    }

    /// Nonzero 22-bit hash.
    fn fresh_hash(&self) -> u32 {
        loop {
            let hash = self.next_hash.fetch_add(1, Ordering::Relaxed) & (PAYLOAD_LIMIT - 1);
            if hash != 0 {
                return hash;
            }
        }
    }
}

impl GcExtensionHandler for SyncBlockTable {
    fn end_of_mark_phase(&self, ctx: &mut dyn CollectorContext) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut().filter(|slot| slot.in_use) {
            slot.live = ctx.is_marked(slot.owner);
        }
    }

    fn end_of_sweep_phase(&self, _ctx: &mut dyn CollectorContext) {
        let mut state = self.state.lock();
        for index in 0..state.slots.len() {
            let slot = &mut state.slots[index];
            if slot.in_use && !slot.live {
                slot.in_use = false;
                slot.owner = HeapAddr::NULL;
                slot.hash_code = 0;
                slot.lock = Arc::new(Mutex::new(()));
                state.free.push(index as u32);
            }
        }
    }
}
