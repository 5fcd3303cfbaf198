//! Search-side scaffolding consumed by the coordination layer

pub mod thread_pool;

pub use thread_pool::{MainThread, ThreadCounters, ThreadPool, Worker};
