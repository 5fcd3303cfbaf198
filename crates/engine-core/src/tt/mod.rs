//! Shared transposition table
//!
//! Single-table, direct-mapped design with lock-free entry publication.
//! Entries are racy by construction: the cluster exchange handlers and
//! the search threads of this rank all write concurrently, and an entry
//! that loses a race is simply overwritten. The table is a hint, not a
//! contract.
//!
//! Memory ordering (reader/writer contract):
//! - Reader (probe): `key.load(Acquire)`, then `data.load(Relaxed)`.
//! - Writer (save): `data.store(Release)`, then `key.store(Release)`.
//!
//! A torn read can therefore pair a new key with an old data word; the
//! search tolerates that the same way it tolerates a key collision.

pub mod entry;

pub use entry::{TtEntry, ENTRY_WIRE_SIZE};

use crate::types::{Bound, Depth, Key, Move, Value};
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot {
    key: AtomicU64,
    data: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            key: AtomicU64::new(0),
            data: AtomicU64::new(0),
        }
    }
}

/// Lock-free shared transposition table.
pub struct TranspositionTable {
    slots: Vec<Slot>,
    mask: usize,
}

impl TranspositionTable {
    /// Create a table with at least `entries` slots, rounded up to a
    /// power of two.
    pub fn new(entries: usize) -> Self {
        let n = entries.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            slots.push(Slot::empty());
        }
        TranspositionTable { slots, mask: n - 1 }
    }

    /// Create a table sized to roughly `mb` megabytes.
    pub fn with_mb(mb: usize) -> Self {
        Self::new(mb * 1024 * 1024 / ENTRY_WIRE_SIZE)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn index(&self, key: Key) -> usize {
        key as usize & self.mask
    }

    /// Look up `key`. Returns the stored entry when the slot holds it.
    pub fn probe(&self, key: Key) -> Option<TtEntry> {
        let slot = &self.slots[self.index(key)];
        let stored_key = slot.key.load(Ordering::Acquire);
        if stored_key != key || stored_key == 0 {
            return None;
        }
        Some(TtEntry::from_raw(stored_key, slot.data.load(Ordering::Relaxed)))
    }

    /// Store an entry, replacing whatever the slot holds unless the
    /// incumbent belongs to a different position and is strictly deeper.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        key: Key,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
    ) {
        let slot = &self.slots[self.index(key)];
        let stored_key = slot.key.load(Ordering::Acquire);
        if stored_key != 0 && stored_key != key {
            let incumbent = TtEntry::from_raw(stored_key, slot.data.load(Ordering::Relaxed));
            if incumbent.depth() > depth {
                return;
            }
        }
        let e = TtEntry::new(key, value, is_pv, bound, depth, mv, eval);
        slot.data.store(e.data(), Ordering::Release);
        slot.key.store(e.key(), Ordering::Release);
    }

    /// Drop every entry. Called on `ucinewgame`.
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.data.store(0, Ordering::Release);
            slot.key.store(0, Ordering::Release);
        }
    }
}
