//! Admission-path benchmarks for the outbound TT cache.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engine_core::cluster::ThreadTtCache;
use engine_core::types::{Bound, Move};
use engine_core::TtEntry;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro128PlusPlus;

fn entry(key: u64, depth: i32) -> TtEntry {
    TtEntry::new(key, 50, false, Bound::Exact, depth, Move::new(10, 18), 25)
}

fn bench_replace(c: &mut Criterion) {
    let mut rng = Xoshiro128PlusPlus::seed_from_u64(0x5EED);
    let entries: Vec<TtEntry> =
        (0..4096).map(|i| entry(i, rng.gen_range(0..=30))).collect();

    c.bench_function("ttcache_replace_mixed_depths", |b| {
        b.iter(|| {
            let mut cache = ThreadTtCache::new();
            let mut admitted = 0u32;
            for e in &entries {
                if cache.replace(black_box(*e)) {
                    admitted += 1;
                }
            }
            black_box(admitted)
        })
    });

    c.bench_function("ttcache_replace_ascending", |b| {
        b.iter(|| {
            let mut cache = ThreadTtCache::new();
            for d in 0..256 {
                cache.replace(black_box(entry(d as u64, d)));
            }
            black_box(cache.front().depth())
        })
    });
}

criterion_group!(benches, bench_replace);
criterion_main!(benches);
