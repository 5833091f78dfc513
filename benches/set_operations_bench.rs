// Copyright (c) 2025 Syncset Contributors
//
// Criterion comparison of the set variants under the insert/remove
// workload, single-threaded and contended.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::thread;
use syncset::core::{ConcurrentSet, Key};
use syncset::hash::{ChainHash, ConcurrentCuckooHash, StripedHash};
use syncset::list::{CoarseList, HarrisList, LazyList};
use syncset::skiplist::{LazySkiplist, LockFreeSkiplist};

fn variants() -> Vec<(&'static str, Arc<dyn ConcurrentSet>)> {
    vec![
        ("coarse-list", Arc::new(CoarseList::new())),
        ("lazy-list", Arc::new(LazyList::new())),
        ("harris-list", Arc::new(HarrisList::new())),
        (
            "lazy-skiplist",
            Arc::new(LazySkiplist::new(8, Key::MIN, Key::MAX).unwrap()),
        ),
        (
            "lockfree-skiplist",
            Arc::new(LockFreeSkiplist::new(8, Key::MIN, Key::MAX).unwrap()),
        ),
        ("chain-hash", Arc::new(ChainHash::new(64).unwrap())),
        ("striped-hash", Arc::new(StripedHash::new(64).unwrap())),
        (
            "concurrent-cuckoo-hash",
            Arc::new(ConcurrentCuckooHash::new(8, 4, 2).unwrap()),
        ),
    ]
}

fn bench_single_thread_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread_insert_remove");
    for (name, set) in variants() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &set, |b, set| {
            b.iter(|| {
                for k in 1..=200i64 {
                    set.insert(k, k);
                }
                for k in 1..=200i64 {
                    set.remove(k);
                }
            });
        });
    }
    group.finish();
}

fn bench_contended_cycle(c: &mut Criterion) {
    let threads = num_cpus::get().min(8) as i64;
    let mut group = c.benchmark_group("contended_insert_remove");
    group.sample_size(20);

    for (name, set) in variants() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &set, |b, set| {
            b.iter(|| {
                let mut handles = vec![];
                for t in 0..threads {
                    let set = Arc::clone(set);
                    handles.push(thread::spawn(move || {
                        let lo = t * 100 + 1;
                        let hi = (t + 1) * 100;
                        for k in lo..=hi {
                            set.insert(k, k);
                        }
                        for k in lo..=hi {
                            set.remove(k);
                        }
                    }));
                }
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_thread_cycle, bench_contended_cycle);
criterion_main!(benches);
