//! UCI front-end
//!
//! Thin protocol shell around the coordination layer. Every line is read
//! through `Cluster::getline`, so in a multi-rank deployment only the
//! root touches the terminal and every rank sees the same command
//! stream. This build runs the single-rank flavour.

use anyhow::Result;
use engine_core::uci::uci_println;
use engine_core::{Cluster, SearchClock, ThreadPool, TranspositionTable};
use std::io;

const ENGINE_NAME: &str = "rchess";
const ENGINE_AUTHOR: &str = "rchess developers";

/// Transposition table size in entries (~16 MB).
const TT_ENTRIES: usize = 1 << 20;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cluster = Cluster::standalone();
    let threads = ThreadPool::new(1);
    let tt = TranspositionTable::new(TT_ENTRIES);
    let clock = SearchClock::start();

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut line = String::new();

    while cluster.getline(&mut input, &mut line) {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("uci") => {
                uci_println(&format!("id name {ENGINE_NAME}"));
                uci_println(&format!("id author {ENGINE_AUTHOR}"));
                uci_println("uciok");
            }
            Some("isready") => uci_println("readyok"),
            Some("ucinewgame") => {
                tt.clear();
                threads.new_search();
                cluster.signals_init();
            }
            Some("cluster") => {
                let depth = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
                uci_println(&cluster.cluster_info(&threads, depth, clock.elapsed_ms()));
            }
            Some("stop") => threads.request_stop(),
            Some("quit") => break,
            Some(cmd) => log::debug!("ignoring unknown command: {cmd}"),
            None => {}
        }
    }

    cluster.finalize();
    Ok(())
}
