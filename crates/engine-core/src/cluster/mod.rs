//! Distributed coordination layer
//!
//! Lets N peer ranks, each running a full multi-threaded searcher over
//! the same root position, behave as one cooperative search: deep TT
//! entries rotate around the rank ring while the search runs, per-rank
//! counters are lazily summed into cluster totals, the root's stdin is
//! relayed to every rank, and at end of search the ranks vote on a
//! single answer.
//!
//! Everything on the search path is non-blocking: progress is driven by
//! threads that are awake anyway, and a communication attempt that finds
//! the previous one still in flight is simply dropped. The only blocking
//! sites are the end-of-search syncs and the root's line read.

pub mod cache;
pub mod input;
pub mod moves;
pub mod signals;
pub mod transport;

pub use cache::{ClusterCache, ThreadTtCache, TT_CACHE_SIZE, TT_EXCHANGE_TAG};
pub use moves::{MoveInfo, MOVE_INFO_WIRE_SIZE};
pub use transport::{Comm, Endpoint, Fabric, ReduceOp, ThreadLevel};

use crate::search::{ThreadPool, Worker};
use crate::tt::TranspositionTable;
use crate::types::{Bound, Depth, Key, Move, Value, DEPTH_CLUSTER_SHIP};
use signals::SignalState;
use std::fmt;
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Tag of the PV transfer from the winning rank to root.
const PV_TAG: transport::Tag = 42;

/// Startup failures of the coordination layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The transport refused concurrent entry from multiple threads.
    /// Search, main, and UCI threads all touch it concurrently, so
    /// anything short of full thread support is unusable.
    ThreadSupport(ThreadLevel),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::ThreadSupport(level) => {
                write!(f, "transport provides {level:?} thread support, need Multiple")
            }
        }
    }
}

impl std::error::Error for ClusterError {}

/// The four channels. Identical membership, isolated message spaces, so
/// concurrent non-blocking collectives from different threads never
/// cross-match.
struct Comms {
    input: Comm,
    tt: Comm,
    mv: Comm,
    signals: Comm,
}

/// Process-wide coordinator. Construct once at startup, finalize once at
/// shutdown.
pub struct Cluster {
    comms: Option<Comms>,
    rank: usize,
    size: usize,
    signals: Mutex<SignalState>,
    nodes_others: AtomicU64,
    tb_others: AtomicU64,
    tts_others: AtomicU64,
    stop_signals_posted: AtomicU64,
    tt_rounds: Arc<AtomicU64>,
}

impl Cluster {
    /// Bring up the distributed flavour on a fabric endpoint: check
    /// thread support, fix rank and size, and duplicate the world into
    /// the four channels.
    pub fn init(mut endpoint: Endpoint) -> Result<Self, ClusterError> {
        let level = endpoint.thread_level();
        if level < ThreadLevel::Multiple {
            return Err(ClusterError::ThreadSupport(level));
        }
        let rank = endpoint.rank();
        let size = endpoint.size();
        let comms = Comms {
            input: endpoint.dup(),
            tt: endpoint.dup(),
            mv: endpoint.dup(),
            signals: endpoint.dup(),
        };
        log::info!("cluster rank {rank} of {size} up");
        Ok(Self::with_comms(Some(comms), rank, size))
    }

    /// Single-rank flavour with no transport at all: counter accessors
    /// return the local pool totals and every other call collapses to a
    /// pass-through or no-op.
    pub fn standalone() -> Self {
        Self::with_comms(None, 0, 1)
    }

    fn with_comms(comms: Option<Comms>, rank: usize, size: usize) -> Self {
        Cluster {
            comms,
            rank,
            size,
            signals: Mutex::new(SignalState::new()),
            nodes_others: AtomicU64::new(0),
            tb_others: AtomicU64::new(0),
            tts_others: AtomicU64::new(0),
            stop_signals_posted: AtomicU64::new(0),
            tt_rounds: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Tear down the channels. The fabric itself outlives its endpoints.
    pub fn finalize(self) {
        if self.comms.is_some() {
            log::info!("cluster rank {} of {} down", self.rank, self.size);
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Ring-exchange engine for one search thread, None when running
    /// standalone.
    pub fn tt_link(&self, thread_id: usize) -> Option<ClusterCache> {
        self.comms.as_ref().map(|c| {
            ClusterCache::new(c.tt.clone(), thread_id, TT_CACHE_SIZE, Arc::clone(&self.tt_rounds))
        })
    }

    /// Shared replacement for a plain line read on the UCI thread. The
    /// root reads its input; every rank returns the same line and the
    /// same stream state.
    pub fn getline(&self, stdin: &mut dyn BufRead, out: &mut String) -> bool {
        match &self.comms {
            None => input::read_trimmed_line(stdin, out),
            Some(c) => input::relay_getline(&c.input, stdin, out),
        }
    }

    /// Hot-path TT save. Stores locally, then queues entries worth
    /// shipping and, when the owning thread's cache has filled, attempts
    /// one non-blocking exchange round. Never waits on the network.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        worker: &mut Worker,
        tt: &TranspositionTable,
        threads: &ThreadPool,
        key: Key,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Move,
        eval: Value,
    ) {
        tt.save(key, value, is_pv, bound, depth, mv, eval);
        worker.counters.add_tt_saves(1);

        if self.comms.is_none() || depth <= DEPTH_CLUSTER_SHIP {
            return;
        }
        worker.tt_cache.replace(crate::tt::TtEntry::new(key, value, is_pv, bound, depth, mv, eval));
        if !worker.tt_cache.is_full() {
            return;
        }
        if let Some(link) = &mut worker.link {
            if link.try_round(&mut worker.tt_cache, tt) && worker.id == 0 {
                // Fold the cost of the round into the time-check budget.
                threads.main().force_time_check();
            }
        }
    }

    /// Drain one thread's ring exchange at end of search. All ranks
    /// agree on the maximum posted round count and the stragglers
    /// forward until the pipeline is level.
    pub fn sendrecv_sync(&self, worker: &mut Worker) {
        let Some(comms) = &self.comms else {
            return;
        };
        if let Some(link) = &mut worker.link {
            link.sync(&comms.mv);
        }
    }

    /// Zero the signal state at search start.
    pub fn signals_init(&self) {
        self.signals.lock().unwrap().reset();
        self.nodes_others.store(0, Ordering::Relaxed);
        self.tb_others.store(0, Ordering::Relaxed);
        self.tts_others.store(0, Ordering::Relaxed);
        self.stop_signals_posted.store(0, Ordering::Relaxed);
    }

    fn apply_totals(&self, totals: signals::SignalTotals) {
        self.nodes_others.store(totals.nodes_others, Ordering::Relaxed);
        self.tb_others.store(totals.tb_others, Ordering::Relaxed);
        self.tts_others.store(totals.tts_others, Ordering::Relaxed);
        self.stop_signals_posted.store(totals.stop_posted, Ordering::Relaxed);
    }

    /// Drive the signal loop from the main thread's periodic check hook:
    /// if the outstanding reduction has completed, publish its totals
    /// and chain the next round.
    pub fn signals_poll(&self, threads: &ThreadPool) {
        let Some(comms) = &self.comms else {
            return;
        };
        let mut st = self.signals.lock().unwrap();
        if st.test() {
            self.apply_totals(st.process(threads));
            st.send_round(threads, &comms.signals);
        }
    }

    /// Terminate the signal loop deterministically after search. Spins
    /// until every rank has contributed a stop, then reconciles call
    /// counts: a rank that issued one fewer reduction catches up with a
    /// single extra send. On exit every rank agrees on the call count
    /// and no handle is outstanding.
    pub fn signals_sync(&self, threads: &ThreadPool) {
        let Some(comms) = &self.comms else {
            return;
        };
        while self.stop_signals_posted.load(Ordering::Relaxed) < self.size as u64 {
            self.signals_poll(threads);
            std::thread::yield_now();
        }

        let mut st = self.signals.lock().unwrap();
        let global = comms.mv.allreduce(&[st.calls()], ReduceOp::Max)[0];
        if st.calls() < global {
            // The stale round is waited out but not processed; only the
            // catch-up round below feeds the final totals.
            st.wait();
            st.send_round(threads, &comms.signals);
        }
        debug_assert_eq!(st.calls(), global);
        st.wait();
        self.apply_totals(st.process(threads));
    }

    /// Signal rounds issued so far.
    pub fn signals_calls(&self) -> u64 {
        self.signals.lock().unwrap().calls()
    }

    /// Stop contributions visible in the last completed round.
    pub fn stop_signals_posted(&self) -> u64 {
        self.stop_signals_posted.load(Ordering::Relaxed)
    }

    /// Cluster-wide move selection. Candidates are gathered on the move
    /// channel, the root tallies the weighted vote, the winner is
    /// broadcast, and a non-root winner ships its PV to the root.
    pub fn pick_moves(&self, mi: &mut MoveInfo, pv: &mut String) {
        let Some(comms) = &self.comms else {
            return;
        };
        if let Some(rows) = comms.mv.gather(0, &mi.to_wire()) {
            let infos: Vec<MoveInfo> = rows.iter().map(|r| MoveInfo::from_wire(r)).collect();
            *mi = moves::tally_votes(&infos);
        }
        *mi = MoveInfo::from_wire(&comms.mv.bcast(0, &mi.to_wire()));

        if mi.rank != 0 && mi.rank == self.rank as i32 {
            let bytes = pv.as_bytes();
            comms.mv.send(0, PV_TAG, &(bytes.len() as i32).to_le_bytes());
            comms.mv.send(0, PV_TAG, bytes);
        }
        if mi.rank != 0 && self.is_root() {
            let len = i32::from_le_bytes(
                comms.mv.recv(mi.rank as usize, PV_TAG).try_into().unwrap(),
            ) as usize;
            let bytes = comms.mv.recv(mi.rank as usize, PV_TAG);
            debug_assert_eq!(bytes.len(), len);
            *pv = String::from_utf8_lossy(&bytes).into_owned();
        }
    }

    /// Cluster-wide nodes searched: the live local total plus the last
    /// snapshot of everyone else. Exact when `size == 1`.
    pub fn nodes_searched(&self, threads: &ThreadPool) -> u64 {
        self.nodes_others.load(Ordering::Relaxed) + threads.nodes_searched()
    }

    pub fn tb_hits(&self, threads: &ThreadPool) -> u64 {
        self.tb_others.load(Ordering::Relaxed) + threads.tb_hits()
    }

    pub fn tt_saves(&self, threads: &ThreadPool) -> u64 {
        self.tts_others.load(Ordering::Relaxed) + threads.tt_saves()
    }

    /// One diagnostic line in UCI `info` form, with per-second rates.
    pub fn cluster_info(&self, threads: &ThreadPool, depth: Depth, elapsed_ms: u64) -> String {
        let ms = elapsed_ms.max(1);
        let signals = self.signals_calls();
        let send_recvs = self.tt_rounds.load(Ordering::Relaxed);
        let tt_saves = self.tt_saves(threads);
        format!(
            "info depth {depth} cluster signals {signals} sps {} sendRecvs {send_recvs} srpps {} TTSaves {tt_saves} TTSavesps {}",
            signals * 1000 / ms,
            send_recvs * 1000 / ms,
            tt_saves * 1000 / ms,
        )
    }
}
