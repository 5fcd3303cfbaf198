//! Counter aggregation between ranks
//!
//! One non-blocking sum-all-reduce of four counters is kept in flight
//! per rank: nodes searched, stop flag, tablebase hits, and TT saves.
//! The main thread's periodic check hook drives the chain; nothing here
//! ever blocks outside the end-of-search sync.

use crate::cluster::transport::{AllReduceRequest, Comm, ReduceOp};
use crate::search::ThreadPool;

pub(crate) const SIG_NODES: usize = 0;
pub(crate) const SIG_STOP: usize = 1;
pub(crate) const SIG_TB: usize = 2;
pub(crate) const SIG_TTS: usize = 3;
pub(crate) const SIG_NB: usize = 4;

/// Deltas published after each completed reduction round.
pub(crate) struct SignalTotals {
    pub nodes_others: u64,
    pub tb_others: u64,
    pub tts_others: u64,
    pub stop_posted: u64,
}

/// State of the signal loop. Touched only by the main thread; the
/// derived totals live in atomics on the coordinator so the accessors
/// never take this state's lock.
pub(crate) struct SignalState {
    send: [u64; SIG_NB],
    recv: [u64; SIG_NB],
    req: Option<AllReduceRequest>,
    calls: u64,
}

impl SignalState {
    pub(crate) fn new() -> Self {
        SignalState {
            send: [0; SIG_NB],
            recv: [0; SIG_NB],
            req: None,
            calls: 0,
        }
    }

    /// Zero everything at search start.
    pub(crate) fn reset(&mut self) {
        self.send = [0; SIG_NB];
        self.recv = [0; SIG_NB];
        self.calls = 0;
    }

    pub(crate) fn calls(&self) -> u64 {
        self.calls
    }

    /// Snapshot the thread-pool totals and post the next reduction.
    pub(crate) fn send_round(&mut self, threads: &ThreadPool, comm: &Comm) {
        self.send[SIG_NODES] = threads.nodes_searched();
        self.send[SIG_STOP] = threads.stop() as u64;
        self.send[SIG_TB] = threads.tb_hits();
        self.send[SIG_TTS] = threads.tt_saves();
        self.req = Some(comm.iallreduce(&self.send, ReduceOp::Sum));
        self.calls += 1;
    }

    /// Test the outstanding reduction, folding the result into `recv`
    /// on completion. A never-posted request tests as complete with the
    /// vector unchanged, mirroring a null handle.
    pub(crate) fn test(&mut self) -> bool {
        match &mut self.req {
            None => true,
            Some(req) => {
                if req.test() {
                    self.recv.copy_from_slice(req.result());
                    self.req = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Block until the outstanding reduction (if any) completes.
    pub(crate) fn wait(&mut self) {
        if let Some(mut req) = self.req.take() {
            req.wait();
            self.recv.copy_from_slice(req.result());
        }
    }

    /// Derive the cluster-wide view from the last completed round and
    /// propagate a remote stop. Subtracting our own contribution keeps
    /// `nodes_searched()` equal to the live local counter plus a
    /// slightly stale snapshot of everyone else, so a single rank is
    /// bit-identical to the non-distributed engine.
    pub(crate) fn process(&self, threads: &ThreadPool) -> SignalTotals {
        if self.recv[SIG_STOP] > 0 {
            threads.request_stop();
        }
        SignalTotals {
            nodes_others: self.recv[SIG_NODES] - self.send[SIG_NODES],
            tb_others: self.recv[SIG_TB] - self.send[SIG_TB],
            tts_others: self.recv[SIG_TTS] - self.send[SIG_TTS],
            stop_posted: self.recv[SIG_STOP],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::transport::Fabric;

    #[test]
    fn process_after_send_with_zero_delta_is_idempotent() {
        let fabric = Fabric::new(1);
        let mut ep = fabric.endpoints().remove(0);
        let comm = ep.dup();
        let threads = ThreadPool::new(1);
        threads.counters(0).add_nodes(1234);

        let mut st = SignalState::new();
        st.send_round(&threads, &comm);
        assert!(st.test());
        let first = st.process(&threads);
        assert_eq!(first.nodes_others, 0);

        // No local progress between rounds: others stays unchanged.
        st.send_round(&threads, &comm);
        assert!(st.test());
        let second = st.process(&threads);
        assert_eq!(second.nodes_others, first.nodes_others);
        assert_eq!(second.tb_others, first.tb_others);
        assert_eq!(st.calls(), 2);
    }

    #[test]
    fn stop_contribution_raises_the_pool_flag() {
        let fabric = Fabric::new(1);
        let mut ep = fabric.endpoints().remove(0);
        let comm = ep.dup();
        let threads = ThreadPool::new(1);
        threads.request_stop();

        let mut st = SignalState::new();
        st.send_round(&threads, &comm);
        assert!(st.test());
        let totals = st.process(&threads);
        assert_eq!(totals.stop_posted, 1);
        assert!(threads.stop());
    }

    #[test]
    fn null_request_tests_complete_with_recv_unchanged() {
        let threads = ThreadPool::new(1);
        let mut st = SignalState::new();
        assert!(st.test());
        let totals = st.process(&threads);
        assert_eq!(totals.nodes_others, 0);
        assert_eq!(totals.stop_posted, 0);
        assert!(!threads.stop());
    }
}
