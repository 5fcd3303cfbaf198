//! Outbound TT entry caches and the ring-exchange engine
//!
//! Each search thread owns a [`ThreadTtCache`] holding the deepest
//! entries it has saved since the last flush, and a [`ClusterCache`]
//! that rotates those entries around the rank ring. The searcher never
//! waits on the network: a round runs only when both outstanding handles
//! have completed, and otherwise the attempt is silently dropped.

use crate::cluster::transport::{Comm, Rank, RecvRequest, SendRequest, Tag};
use crate::tt::{TranspositionTable, TtEntry, ENTRY_WIRE_SIZE};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Entries shipped per thread per round.
pub const TT_CACHE_SIZE: usize = 16;

/// Base tag of the ring exchange. Thread 0 (the main search thread)
/// exchanges on exactly this tag; helper threads offset by their id so
/// concurrent per-thread pipelines never share a FIFO.
pub const TT_EXCHANGE_TAG: Tag = 42;

/// Bounded min-heap of keyed TT entries awaiting shipment, ordered by
/// depth so `front()` is the shallowest. The heap starts filled with
/// empty sentinels (depth 0), so the first `capacity` admissions always
/// succeed.
pub struct ThreadTtCache {
    heap: SmallVec<[TtEntry; TT_CACHE_SIZE]>,
    counter: u64,
}

impl Default for ThreadTtCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTtCache {
    pub fn new() -> Self {
        Self::with_capacity(TT_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        let mut heap = SmallVec::with_capacity(capacity);
        heap.resize(capacity, TtEntry::default());
        ThreadTtCache { heap, counter: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.heap.len()
    }

    /// Attempted replacements since the last flush, successful or not.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// The shallowest entry currently held.
    pub fn front(&self) -> &TtEntry {
        &self.heap[0]
    }

    /// True once enough replacements have been attempted to justify a
    /// communication attempt.
    pub fn is_full(&self) -> bool {
        self.counter >= self.heap.len() as u64
    }

    /// Admit `e` if it is deeper than the current shallowest entry,
    /// evicting that entry. Duplicate keys are not deduplicated; the
    /// receiving rank's TT replace policy resolves overwrites.
    pub fn replace(&mut self, e: TtEntry) -> bool {
        self.counter += 1;
        if e.depth() <= self.heap[0].depth() {
            return false;
        }
        self.heap[0] = e;
        self.sift_down(0);
        true
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < n && self.heap[right].depth() < self.heap[left].depth() {
                child = right;
            }
            if self.heap[child].depth() >= self.heap[i].depth() {
                break;
            }
            self.heap.swap(i, child);
            i = child;
        }
    }

    /// Copy the cache into `slot` and reset to the flushed state
    /// (sentinels everywhere, counter zeroed).
    pub fn drain_into(&mut self, slot: &mut [TtEntry]) {
        debug_assert_eq!(slot.len(), self.heap.len());
        slot.copy_from_slice(&self.heap);
        self.heap.fill(TtEntry::default());
        self.counter = 0;
    }

    /// Current contents, heap-ordered. Test hook.
    pub fn entries(&self) -> &[TtEntry] {
        &self.heap
    }
}

/// Per-thread ring-exchange engine: double-buffered send/recv windows of
/// `capacity × size` entries rotated one neighbour per round.
pub struct ClusterCache {
    comm: Comm,
    tag: Tag,
    bufs: [Vec<TtEntry>; 2],
    slot_len: usize,
    posted: u64,
    recv_req: Option<RecvRequest>,
    send_req: Option<SendRequest>,
    rounds_total: Arc<AtomicU64>,
}

impl ClusterCache {
    pub(crate) fn new(
        comm: Comm,
        thread_id: usize,
        slot_len: usize,
        rounds_total: Arc<AtomicU64>,
    ) -> Self {
        let len = slot_len * comm.size();
        ClusterCache {
            tag: TT_EXCHANGE_TAG + thread_id as Tag,
            bufs: [vec![TtEntry::default(); len], vec![TtEntry::default(); len]],
            slot_len,
            posted: 0,
            recv_req: None,
            send_req: None,
            rounds_total,
            comm,
        }
    }

    fn upstream(&self) -> Rank {
        (self.comm.rank() + self.comm.size() - 1) % self.comm.size()
    }

    fn downstream(&self) -> Rank {
        (self.comm.rank() + 1) % self.comm.size()
    }

    /// Rounds this engine has posted.
    pub fn posted(&self) -> u64 {
        self.posted
    }

    /// Test both outstanding handles; when the receive completes its
    /// payload lands in the active buffer. The send is tested first so
    /// an incomplete pipeline consumes nothing.
    fn exchange_ready(&mut self) -> bool {
        if let Some(send) = &mut self.send_req {
            if !send.test() {
                return false;
            }
        }
        match &mut self.recv_req {
            None => {
                self.send_req = None;
                true
            }
            Some(recv) => match recv.test() {
                Some(bytes) => {
                    let p = (self.posted % 2) as usize;
                    decode_entries(&bytes, &mut self.bufs[p]);
                    self.recv_req = None;
                    self.send_req = None;
                    true
                }
                None => false,
            },
        }
    }

    /// Attempt one exchange round. Returns false without blocking when
    /// the previous round is still in flight; the cache stays full and
    /// the next save retries.
    pub(crate) fn try_round(&mut self, cache: &mut ThreadTtCache, tt: &TranspositionTable) -> bool {
        if !self.exchange_ready() {
            return false;
        }
        self.handle_buffer(cache, tt);
        self.post();
        true
    }

    /// One completed round: refill our slot from the thread cache and
    /// offer every foreign entry to the external TT, whose replace
    /// policy decides what stays.
    fn handle_buffer(&mut self, cache: &mut ThreadTtCache, tt: &TranspositionTable) {
        let p = (self.posted % 2) as usize;
        let rank = self.comm.rank();
        for irank in 0..self.comm.size() {
            let slot = irank * self.slot_len..(irank + 1) * self.slot_len;
            if irank == rank {
                cache.drain_into(&mut self.bufs[p][slot]);
            } else {
                for e in &self.bufs[p][slot] {
                    if e.is_empty() {
                        continue;
                    }
                    let _ = tt.probe(e.key());
                    tt.save(
                        e.key(),
                        e.value(),
                        e.is_pv(),
                        e.bound(),
                        e.depth(),
                        e.mv(),
                        e.eval(),
                    );
                }
            }
        }
    }

    /// Advance the pipeline: receive the next window from upstream into
    /// the buffer of the new parity, send the window just refilled to
    /// downstream.
    fn post(&mut self) {
        self.posted += 1;
        self.rounds_total.fetch_add(1, Ordering::Relaxed);
        let send_idx = ((self.posted + 1) % 2) as usize;
        self.recv_req = Some(self.comm.irecv(self.upstream(), self.tag));
        let bytes = encode_entries(&self.bufs[send_idx]);
        self.send_req = Some(self.comm.isend(self.downstream(), self.tag, &bytes));
    }

    fn wait_both(&mut self) {
        if let Some(send) = self.send_req.take() {
            send.wait();
        }
        if let Some(recv) = self.recv_req.take() {
            let bytes = recv.wait();
            let p = (self.posted % 2) as usize;
            decode_entries(&bytes, &mut self.bufs[p]);
        }
    }

    /// End-of-search drain. Ranks agree on the maximum number of posted
    /// rounds; anyone behind keeps the ring moving with pure forwarding
    /// rounds (received windows are passed downstream, not folded into
    /// the TT; losing those entries is benign) until every pipeline has
    /// posted the same count, then both handles are waited out.
    pub(crate) fn sync(&mut self, move_comm: &Comm) {
        let global = move_comm.allreduce(&[self.posted], crate::cluster::transport::ReduceOp::Max)[0];
        while self.posted < global {
            self.wait_both();
            self.post();
        }
        debug_assert_eq!(self.posted, global);
        self.wait_both();
    }
}

fn encode_entries(entries: &[TtEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_WIRE_SIZE);
    for e in entries {
        out.extend_from_slice(&e.to_wire());
    }
    out
}

fn decode_entries(bytes: &[u8], into: &mut [TtEntry]) {
    debug_assert_eq!(bytes.len(), into.len() * ENTRY_WIRE_SIZE);
    for (e, chunk) in into.iter_mut().zip(bytes.chunks_exact(ENTRY_WIRE_SIZE)) {
        *e = TtEntry::from_wire(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bound, Move};

    fn entry(key: u64, depth: i32) -> TtEntry {
        TtEntry::new(key, 100, false, Bound::Exact, depth, Move::new(1, 2), 50)
    }

    #[test]
    fn first_capacity_admissions_always_succeed() {
        let mut cache = ThreadTtCache::new();
        for i in 0..TT_CACHE_SIZE as u64 {
            assert!(cache.replace(entry(i + 1, 4 + i as i32)));
        }
        assert_eq!(cache.counter(), TT_CACHE_SIZE as u64);
        assert!(cache.is_full());
    }

    #[test]
    fn keeps_the_deepest_entries_seen() {
        let mut cache = ThreadTtCache::with_capacity(4);
        for depth in [5, 9, 7, 11, 6, 12, 4, 10] {
            cache.replace(entry(depth as u64, depth));
        }
        let mut depths: Vec<i32> = cache.entries().iter().map(|e| e.depth()).collect();
        depths.sort_unstable();
        assert_eq!(depths, vec![9, 10, 11, 12]);
    }

    #[test]
    fn heap_property_holds_after_every_mutation() {
        let mut cache = ThreadTtCache::with_capacity(8);
        for depth in [13, 5, 21, 8, 17, 9, 30, 4, 26, 15, 11, 19] {
            cache.replace(entry(depth as u64, depth));
            let h = cache.entries();
            for i in 0..h.len() {
                for child in [2 * i + 1, 2 * i + 2] {
                    if child < h.len() {
                        assert!(h[i].depth() <= h[child].depth());
                    }
                }
            }
        }
    }

    #[test]
    fn rejects_entries_not_deeper_than_front() {
        let mut cache = ThreadTtCache::with_capacity(2);
        assert!(cache.replace(entry(1, 10)));
        assert!(cache.replace(entry(2, 12)));
        // Front is now depth 10; an equal depth loses the admission test.
        assert!(!cache.replace(entry(3, 10)));
        assert_eq!(cache.counter(), 3);
    }

    #[test]
    fn single_cell_cache_degenerates_to_max() {
        let mut cache = ThreadTtCache::with_capacity(1);
        assert!(cache.replace(entry(1, 5)));
        assert!(!cache.replace(entry(2, 5)));
        assert!(cache.replace(entry(3, 6)));
        assert_eq!(cache.front().depth(), 6);
    }

    #[test]
    fn drain_resets_to_flushed_state() {
        let mut cache = ThreadTtCache::with_capacity(4);
        for i in 0..4 {
            cache.replace(entry(i + 1, 10 + i as i32));
        }
        let mut slot = vec![TtEntry::default(); 4];
        cache.drain_into(&mut slot);
        assert!(slot.iter().all(|e| !e.is_empty()));
        assert_eq!(cache.counter(), 0);
        assert!(cache.entries().iter().all(|e| e.is_empty()));
        assert_eq!(cache.front().depth(), 0);
    }

    #[test]
    fn duplicate_keys_are_not_deduplicated() {
        let mut cache = ThreadTtCache::with_capacity(4);
        assert!(cache.replace(entry(9, 10)));
        assert!(cache.replace(entry(9, 11)));
        let held = cache.entries().iter().filter(|e| e.key() == 9).count();
        assert_eq!(held, 2);
    }
}
