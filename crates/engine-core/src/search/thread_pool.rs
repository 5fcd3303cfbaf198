//! Thread pool accounting shared with the cluster layer
//!
//! The searcher itself lives elsewhere; what the coordination layer
//! needs from the pool is the per-thread counters it aggregates across
//! ranks, the global stop flag, and the main thread's time-check
//! counter. Everything here is lock-free: counters are bumped from the
//! owning search thread and read from anywhere.

use crate::cluster::cache::{ClusterCache, ThreadTtCache};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// How many search iterations pass between time checks when nothing
/// forces an earlier one.
const TIME_CHECK_INTERVAL: u64 = 1024;

/// Counters owned by one search thread.
#[derive(Default)]
pub struct ThreadCounters {
    nodes: AtomicU64,
    tb_hits: AtomicU64,
    tt_saves: AtomicU64,
}

impl ThreadCounters {
    pub fn add_nodes(&self, n: u64) {
        self.nodes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tb_hits(&self, n: u64) {
        self.tb_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tt_saves(&self, n: u64) {
        self.tt_saves.fetch_add(n, Ordering::Relaxed);
    }

    pub fn nodes(&self) -> u64 {
        self.nodes.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.nodes.store(0, Ordering::Relaxed);
        self.tb_hits.store(0, Ordering::Relaxed);
        self.tt_saves.store(0, Ordering::Relaxed);
    }
}

/// The main search thread's slice of pool state. `calls_cnt` amortises
/// time checks: it counts down and a check runs when it hits zero, so
/// storing zero forces a check on the next occasion.
pub struct MainThread {
    calls_cnt: AtomicU64,
}

impl MainThread {
    fn new() -> Self {
        MainThread {
            calls_cnt: AtomicU64::new(TIME_CHECK_INTERVAL),
        }
    }

    /// Countdown hook called once per iteration batch; true when a time
    /// check is due.
    pub fn tick(&self) -> bool {
        let prev = self.calls_cnt.load(Ordering::Relaxed);
        if prev <= 1 {
            self.calls_cnt.store(TIME_CHECK_INTERVAL, Ordering::Relaxed);
            return true;
        }
        self.calls_cnt.store(prev - 1, Ordering::Relaxed);
        false
    }

    /// Make the next `tick` report a due check immediately.
    pub fn force_time_check(&self) {
        self.calls_cnt.store(0, Ordering::Relaxed);
    }
}

/// Accounting hub for all search threads of this rank.
pub struct ThreadPool {
    counters: Vec<Arc<ThreadCounters>>,
    stop: AtomicBool,
    main: MainThread,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0);
        ThreadPool {
            counters: (0..num_threads).map(|_| Arc::new(ThreadCounters::default())).collect(),
            stop: AtomicBool::new(false),
            main: MainThread::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.counters.len()
    }

    pub fn counters(&self, thread_id: usize) -> &Arc<ThreadCounters> {
        &self.counters[thread_id]
    }

    /// Bundle per-thread state for one search thread. `link` is this
    /// thread's ring-exchange engine, absent in the single-rank flavour.
    pub fn attach(&self, thread_id: usize, link: Option<ClusterCache>) -> Worker {
        Worker {
            id: thread_id,
            counters: Arc::clone(&self.counters[thread_id]),
            tt_cache: ThreadTtCache::new(),
            link,
        }
    }

    /// Nodes searched by every thread of this rank.
    pub fn nodes_searched(&self) -> u64 {
        self.counters.iter().map(|c| c.nodes.load(Ordering::Relaxed)).sum()
    }

    pub fn tb_hits(&self) -> u64 {
        self.counters.iter().map(|c| c.tb_hits.load(Ordering::Relaxed)).sum()
    }

    pub fn tt_saves(&self) -> u64 {
        self.counters.iter().map(|c| c.tt_saves.load(Ordering::Relaxed)).sum()
    }

    pub fn stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Reset counters and the stop flag for a new search.
    pub fn new_search(&self) {
        for c in &self.counters {
            c.reset();
        }
        self.stop.store(false, Ordering::Release);
    }

    pub fn main(&self) -> &MainThread {
        &self.main
    }
}

/// Per-thread search state the cluster layer needs on the hot path.
/// Owned exclusively by one search thread; no locking.
pub struct Worker {
    pub id: usize,
    pub counters: Arc<ThreadCounters>,
    pub tt_cache: ThreadTtCache,
    pub link: Option<ClusterCache>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_across_threads() {
        let pool = ThreadPool::new(3);
        pool.counters(0).add_nodes(100);
        pool.counters(1).add_nodes(50);
        pool.counters(2).add_nodes(7);
        pool.counters(1).add_tb_hits(3);
        pool.counters(2).add_tt_saves(9);
        assert_eq!(pool.nodes_searched(), 157);
        assert_eq!(pool.tb_hits(), 3);
        assert_eq!(pool.tt_saves(), 9);
    }

    #[test]
    fn new_search_clears_counters_and_stop() {
        let pool = ThreadPool::new(2);
        pool.counters(0).add_nodes(10);
        pool.request_stop();
        pool.new_search();
        assert_eq!(pool.nodes_searched(), 0);
        assert!(!pool.stop());
    }

    #[test]
    fn forced_time_check_fires_on_next_tick() {
        let pool = ThreadPool::new(1);
        assert!(!pool.main().tick());
        pool.main().force_time_check();
        assert!(pool.main().tick());
        // Interval restored after the forced check.
        assert!(!pool.main().tick());
    }
}
