//! In-process group-collective fabric
//!
//! Thin message layer the coordination code is written against: ranks,
//! point-to-point send/recv, and non-blocking broadcast/all-reduce/gather
//! with test/wait primitives. Endpoints are handed out once per rank and
//! duplicate the world into isolated communicators; a message posted on
//! one communicator is never matched by a receive on another.
//!
//! Ordering: messages between one (sender, receiver) pair with the same
//! tag on the same communicator are FIFO. Collectives rely on exactly
//! that: every rank issues collectives on a given communicator in the
//! same order, so matching by queue position is sound.
//!
//! Sends are eager: the payload is buffered into the destination queue at
//! post time and the send handle completes immediately. Receives complete
//! when the matching payload has arrived.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Rank of a peer within a communicator.
pub type Rank = usize;

/// Message tag. Non-negative tags are for public point-to-point traffic;
/// negative tags are reserved for collectives.
pub type Tag = i32;

const ALLREDUCE_TAG: Tag = -1;
const BCAST_TAG: Tag = -2;
const GATHER_TAG: Tag = -3;

/// Concurrency level the fabric provides to its callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadLevel {
    /// Only one thread per rank may enter the transport.
    Single,
    /// Any thread may enter the transport at any time.
    Multiple,
}

/// Element-wise combiner for all-reduce.
#[derive(Clone, Copy, Debug)]
pub enum ReduceOp {
    Sum,
    Max,
}

type QueueKey = (Rank, Rank, Tag);

/// One isolated message space. Queues are created lazily per
/// (sender, receiver, tag) triple and never torn down while the space
/// lives, so a posted message cannot be lost.
struct MessageSpace {
    queues: Mutex<HashMap<QueueKey, (Sender<Vec<u8>>, Receiver<Vec<u8>>)>>,
}

impl MessageSpace {
    fn new() -> Self {
        MessageSpace {
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, key: QueueKey) -> Sender<Vec<u8>> {
        let mut map = self.queues.lock().unwrap();
        map.entry(key).or_insert_with(unbounded).0.clone()
    }

    fn receiver(&self, key: QueueKey) -> Receiver<Vec<u8>> {
        let mut map = self.queues.lock().unwrap();
        map.entry(key).or_insert_with(unbounded).1.clone()
    }
}

struct FabricShared {
    size: usize,
    // Communicator spaces indexed by duplication order. Every endpoint
    // duplicates in the same order, so index i names the same space on
    // all ranks.
    spaces: Mutex<Vec<Arc<MessageSpace>>>,
}

impl FabricShared {
    fn space(&self, index: usize) -> Arc<MessageSpace> {
        let mut spaces = self.spaces.lock().unwrap();
        while spaces.len() <= index {
            spaces.push(Arc::new(MessageSpace::new()));
        }
        Arc::clone(&spaces[index])
    }
}

/// The process-local cluster fabric. Create one per logical cluster and
/// hand each rank its endpoint.
pub struct Fabric {
    shared: Arc<FabricShared>,
}

impl Fabric {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a cluster has at least one rank");
        Fabric {
            shared: Arc::new(FabricShared {
                size,
                spaces: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Hand out one endpoint per rank, in rank order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        (0..self.shared.size)
            .map(|rank| Endpoint {
                rank,
                shared: Arc::clone(&self.shared),
                dups: 0,
            })
            .collect()
    }
}

/// A rank's attachment to the fabric. Communicators are carved off it
/// with [`Endpoint::dup`].
pub struct Endpoint {
    rank: Rank,
    shared: Arc<FabricShared>,
    dups: usize,
}

impl Endpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Concurrency level of this fabric. The in-process fabric always
    /// supports entry from any thread.
    pub fn thread_level(&self) -> ThreadLevel {
        ThreadLevel::Multiple
    }

    /// Duplicate the world into a fresh communicator with an isolated
    /// message space. Collective: all ranks must duplicate in the same
    /// order for the spaces to line up.
    pub fn dup(&mut self) -> Comm {
        let space = self.shared.space(self.dups);
        self.dups += 1;
        Comm {
            rank: self.rank,
            size: self.shared.size,
            space,
        }
    }
}

/// A communicator: the world membership with its own message space.
#[derive(Clone)]
pub struct Comm {
    rank: Rank,
    size: usize,
    space: Arc<MessageSpace>,
}

impl Comm {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Eager buffered send.
    pub fn send(&self, dst: Rank, tag: Tag, payload: &[u8]) {
        debug_assert!(dst < self.size);
        let tx = self.space.sender((self.rank, dst, tag));
        if tx.send(payload.to_vec()).is_err() {
            // Queues are owned by the space itself, so this cannot fire
            // while the fabric lives; a dead fabric mid-search is fatal.
            fatal("send on a torn-down communicator");
        }
    }

    /// Blocking receive of the next message from `src` with `tag`.
    pub fn recv(&self, src: Rank, tag: Tag) -> Vec<u8> {
        match self.space.receiver((src, self.rank, tag)).recv() {
            Ok(payload) => payload,
            Err(_) => fatal("recv on a torn-down communicator"),
        }
    }

    /// Post a non-blocking receive.
    pub fn irecv(&self, src: Rank, tag: Tag) -> RecvRequest {
        RecvRequest {
            rx: self.space.receiver((src, self.rank, tag)),
        }
    }

    /// Post a non-blocking send. Eager: completes at post time.
    pub fn isend(&self, dst: Rank, tag: Tag, payload: &[u8]) -> SendRequest {
        self.send(dst, tag, payload);
        SendRequest { _posted: () }
    }

    /// Post a non-blocking all-reduce of a u64 vector.
    pub fn iallreduce(&self, contribution: &[u64], op: ReduceOp) -> AllReduceRequest {
        let bytes = encode_u64s(contribution);
        let mut pending = Vec::with_capacity(self.size.saturating_sub(1));
        for peer in 0..self.size {
            if peer == self.rank {
                continue;
            }
            self.send(peer, ALLREDUCE_TAG, &bytes);
            pending.push(self.irecv(peer, ALLREDUCE_TAG));
        }
        AllReduceRequest {
            acc: contribution.to_vec(),
            pending,
            op,
        }
    }

    /// Blocking all-reduce.
    pub fn allreduce(&self, contribution: &[u64], op: ReduceOp) -> Vec<u64> {
        let mut req = self.iallreduce(contribution, op);
        req.wait();
        req.into_result()
    }

    /// Post a non-blocking broadcast from `root`. Non-root ranks ignore
    /// `payload` and receive the root's bytes through the request.
    pub fn ibcast(&self, root: Rank, payload: &[u8]) -> BcastRequest {
        if self.rank == root {
            for peer in 0..self.size {
                if peer != root {
                    self.send(peer, BCAST_TAG, payload);
                }
            }
            BcastRequest {
                req: None,
                data: payload.to_vec(),
            }
        } else {
            BcastRequest {
                req: Some(self.irecv(root, BCAST_TAG)),
                data: Vec::new(),
            }
        }
    }

    /// Blocking broadcast; every rank returns the root's payload.
    pub fn bcast(&self, root: Rank, payload: &[u8]) -> Vec<u8> {
        let mut req = self.ibcast(root, payload);
        req.wait();
        req.into_data()
    }

    /// Blocking gather to `root`. The root receives one payload per rank
    /// in rank order; other ranks get `None`.
    pub fn gather(&self, root: Rank, payload: &[u8]) -> Option<Vec<Vec<u8>>> {
        if self.rank == root {
            let mut rows = Vec::with_capacity(self.size);
            for peer in 0..self.size {
                if peer == root {
                    rows.push(payload.to_vec());
                } else {
                    rows.push(self.recv(peer, GATHER_TAG));
                }
            }
            Some(rows)
        } else {
            self.send(root, GATHER_TAG, payload);
            None
        }
    }
}

/// Outstanding non-blocking receive.
pub struct RecvRequest {
    rx: Receiver<Vec<u8>>,
}

impl RecvRequest {
    /// Complete the receive if the payload has arrived, consuming it.
    pub fn test(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Block until the payload arrives.
    pub fn wait(self) -> Vec<u8> {
        match self.rx.recv() {
            Ok(payload) => payload,
            Err(_) => fatal("wait on a torn-down communicator"),
        }
    }
}

/// Outstanding non-blocking send. Sends are eager, so the request exists
/// only to keep the post/test/wait state machine uniform at call sites.
pub struct SendRequest {
    _posted: (),
}

impl SendRequest {
    pub fn test(&mut self) -> bool {
        true
    }

    pub fn wait(self) {}
}

/// Outstanding non-blocking all-reduce over a u64 vector.
pub struct AllReduceRequest {
    acc: Vec<u64>,
    pending: Vec<RecvRequest>,
    op: ReduceOp,
}

impl AllReduceRequest {
    /// Fold in whatever contributions have arrived; true once complete.
    pub fn test(&mut self) -> bool {
        let op = self.op;
        let mut i = 0;
        while i < self.pending.len() {
            if let Some(bytes) = self.pending[i].test() {
                fold(&mut self.acc, &bytes, op);
                self.pending.swap_remove(i);
            } else {
                i += 1;
            }
        }
        self.pending.is_empty()
    }

    /// Block until every contribution has arrived.
    pub fn wait(&mut self) {
        let op = self.op;
        for req in self.pending.drain(..) {
            let bytes = req.wait();
            fold(&mut self.acc, &bytes, op);
        }
    }

    /// The reduced vector. Only meaningful once complete.
    pub fn result(&self) -> &[u64] {
        debug_assert!(self.pending.is_empty());
        &self.acc
    }

    pub fn into_result(self) -> Vec<u64> {
        debug_assert!(self.pending.is_empty());
        self.acc
    }
}

/// Outstanding non-blocking broadcast.
pub struct BcastRequest {
    req: Option<RecvRequest>,
    data: Vec<u8>,
}

impl BcastRequest {
    pub fn test(&mut self) -> bool {
        match &mut self.req {
            None => true,
            Some(r) => {
                if let Some(bytes) = r.test() {
                    self.data = bytes;
                    self.req = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn wait(&mut self) {
        if let Some(r) = self.req.take() {
            self.data = r.wait();
        }
    }

    /// The broadcast payload. Only meaningful once complete.
    pub fn data(&self) -> &[u8] {
        debug_assert!(self.req.is_none());
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        debug_assert!(self.req.is_none());
        self.data
    }
}

fn fold(acc: &mut [u64], bytes: &[u8], op: ReduceOp) {
    debug_assert_eq!(bytes.len(), acc.len() * 8);
    for (i, a) in acc.iter_mut().enumerate() {
        let v = u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        match op {
            ReduceOp::Sum => *a += v,
            ReduceOp::Max => *a = (*a).max(v),
        }
    }
}

fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// A transport failure mid-search is catastrophic: a silent bad result is
/// worse than a crash in a tournament process.
fn fatal(msg: &str) -> ! {
    log::error!("cluster transport failure: {msg}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(Endpoint) -> T + Send + Sync,
    {
        let fabric = Fabric::new(size);
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = fabric
                .endpoints()
                .into_iter()
                .map(|ep| s.spawn(move || f(ep)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn point_to_point_is_fifo_per_tag() {
        run_ranks(2, |mut ep| {
            let comm = ep.dup();
            if ep.rank() == 0 {
                for i in 0u8..10 {
                    comm.send(1, 7, &[i]);
                }
            } else {
                for i in 0u8..10 {
                    assert_eq!(comm.recv(0, 7), vec![i]);
                }
            }
        });
    }

    #[test]
    fn tags_do_not_cross() {
        run_ranks(2, |mut ep| {
            let comm = ep.dup();
            if ep.rank() == 0 {
                comm.send(1, 1, b"one");
                comm.send(1, 2, b"two");
            } else {
                // Receive in the opposite order of the sends.
                assert_eq!(comm.recv(0, 2), b"two");
                assert_eq!(comm.recv(0, 1), b"one");
            }
        });
    }

    #[test]
    fn communicators_are_isolated() {
        run_ranks(2, |mut ep| {
            let a = ep.dup();
            let b = ep.dup();
            if ep.rank() == 0 {
                a.send(1, 0, b"on a");
                b.send(1, 0, b"on b");
            } else {
                assert_eq!(b.recv(0, 0), b"on b");
                assert_eq!(a.recv(0, 0), b"on a");
            }
        });
    }

    #[test]
    fn allreduce_sum_and_max() {
        let results = run_ranks(4, |mut ep| {
            let comm = ep.dup();
            let r = ep.rank() as u64;
            let sum = comm.allreduce(&[r, 1], ReduceOp::Sum);
            let max = comm.allreduce(&[r], ReduceOp::Max);
            (sum, max)
        });
        for (sum, max) in results {
            assert_eq!(sum, vec![6, 4]);
            assert_eq!(max, vec![3]);
        }
    }

    #[test]
    fn iallreduce_chains_match_by_round() {
        let results = run_ranks(3, |mut ep| {
            let comm = ep.dup();
            let mut totals = Vec::new();
            for round in 0..5u64 {
                let mut req = comm.iallreduce(&[round + 1], ReduceOp::Sum);
                req.wait();
                totals.push(req.into_result()[0]);
            }
            totals
        });
        for totals in results {
            assert_eq!(totals, vec![3, 6, 9, 12, 15]);
        }
    }

    #[test]
    fn bcast_delivers_root_payload() {
        let results = run_ranks(4, |mut ep| {
            let comm = ep.dup();
            let payload = if ep.rank() == 0 { b"hello".to_vec() } else { Vec::new() };
            comm.bcast(0, &payload)
        });
        for r in results {
            assert_eq!(r, b"hello");
        }
    }

    #[test]
    fn gather_collects_in_rank_order() {
        let results = run_ranks(3, |mut ep| {
            let comm = ep.dup();
            comm.gather(0, &[ep.rank() as u8 * 10])
        });
        assert_eq!(results[0].as_ref().unwrap(), &vec![vec![0], vec![10], vec![20]]);
        assert!(results[1].is_none());
        assert!(results[2].is_none());
    }

    #[test]
    fn single_rank_collectives_complete_immediately() {
        run_ranks(1, |mut ep| {
            let comm = ep.dup();
            let mut req = comm.iallreduce(&[5, 7], ReduceOp::Sum);
            assert!(req.test());
            assert_eq!(req.result(), &[5, 7]);
            assert_eq!(comm.bcast(0, b"x"), b"x");
            assert_eq!(comm.gather(0, b"y").unwrap(), vec![b"y".to_vec()]);
        });
    }
}
