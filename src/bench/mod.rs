// Copyright (c) 2025 Syncset Contributors
//
// Workload driver
//
// Seeds a container, spawns N workers that rendezvous on a barrier, has
// worker t insert and then remove the disjoint key range
// [t*M + 1, (t+1)*M] with value = key, and verifies the global key-sum
// identity sum == NM(NM+1)/2 from the values the removes returned.

use crate::core::{ConcurrentQueue, ConcurrentSet};
use crate::error::{Result, SetError};
use std::sync::Barrier;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Hard limit on worker threads, matching the original workbench
pub const MAX_THREADS: usize = 200;

/// Hard limit on items per thread
pub const MAX_ITEMS: usize = 30000;

pub const DEFAULT_THREADS: usize = 10;
pub const DEFAULT_ITEMS: usize = 1000;

/// Parameters of one workload run
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of worker threads
    pub threads: usize,
    /// Keys inserted and removed per thread
    pub items: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            items: DEFAULT_ITEMS,
        }
    }
}

impl WorkloadConfig {
    pub fn new(threads: usize, items: usize) -> Result<Self> {
        if threads == 0 {
            return Err(SetError::Config("thread count must be positive".into()));
        }
        if items == 0 {
            return Err(SetError::Config("item count must be positive".into()));
        }
        let mut config = Self { threads, items };
        if config.threads > MAX_THREADS {
            warn!(
                requested = config.threads,
                clamped = MAX_THREADS,
                "thread count clamped"
            );
            config.threads = MAX_THREADS;
        }
        if config.items > MAX_ITEMS {
            warn!(
                requested = config.items,
                clamped = MAX_ITEMS,
                "item count clamped"
            );
            config.items = MAX_ITEMS;
        }
        Ok(config)
    }

    fn expected_total(&self) -> i64 {
        let nm = (self.threads * self.items) as i64;
        nm * (nm + 1) / 2
    }
}

/// Result of a workload run
#[derive(Debug)]
pub struct WorkloadReport {
    /// Whether the key-sum identity held and no operation misbehaved
    pub passed: bool,
    /// Sum of all values returned by removes/dequeues
    pub total: i64,
    /// The value the sum must equal: NM(NM+1)/2
    pub expected: i64,
    /// Operations that returned the wrong answer (failed insert, missing
    /// or mismatched remove)
    pub op_errors: u64,
    /// Per-worker wall time
    pub per_thread: Vec<Duration>,
    /// Wall time of the whole run
    pub elapsed: Duration,
}

impl WorkloadReport {
    /// The checksum identity as a hard error, for callers that want to
    /// propagate instead of branching on `passed`.
    pub fn verify(&self) -> Result<()> {
        if self.passed {
            Ok(())
        } else {
            Err(SetError::Verification {
                expected: self.expected,
                actual: self.total,
            })
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.per_thread.iter().copied().min().unwrap_or_default()
    }

    pub fn max_interval(&self) -> Duration {
        self.per_thread.iter().copied().max().unwrap_or_default()
    }

    pub fn avg_interval(&self) -> Duration {
        if self.per_thread.is_empty() {
            return Duration::default();
        }
        self.per_thread.iter().sum::<Duration>() / self.per_thread.len() as u32
    }
}

struct WorkerStat {
    sum: i64,
    errors: u64,
    interval: Duration,
}

/// Drive a set through the insert-then-remove workload.
pub fn run_set_workload(set: &dyn ConcurrentSet, config: &WorkloadConfig) -> Result<WorkloadReport> {
    let cores = num_cpus::get();
    if config.threads > cores * 4 {
        warn!(
            threads = config.threads,
            cores, "spawning far more workers than cores"
        );
    }

    let barrier = Barrier::new(config.threads);
    let items = config.items as i64;
    let started = Instant::now();

    let stats = run_workers(config.threads, |t| {
        barrier.wait();
        let begin = Instant::now();
        let t = t as i64;
        let lo = t * items + 1;
        let hi = (t + 1) * items;

        let mut errors = 0u64;
        for key in lo..=hi {
            debug!(worker = t, key, "insert");
            if !set.insert(key, key) {
                error!(worker = t, key, "insert failed unexpectedly");
                errors += 1;
            }
        }

        let mut sum = 0i64;
        for key in lo..=hi {
            match set.remove(key) {
                Some(val) => {
                    if val != key {
                        error!(worker = t, key, val, "remove returned wrong value");
                        errors += 1;
                    }
                    sum += val;
                }
                None => {
                    error!(worker = t, key, "remove failed unexpectedly");
                    errors += 1;
                }
            }
        }

        WorkerStat {
            sum,
            errors,
            interval: begin.elapsed(),
        }
    })?;

    Ok(summarize(stats, started.elapsed(), config))
}

/// Drive a queue through the enqueue-then-drain workload: every worker
/// enqueues its disjoint key range, then each worker dequeues exactly its
/// share, and the dequeued values must cover 1..=NM.
pub fn run_queue_workload(
    queue: &dyn ConcurrentQueue,
    config: &WorkloadConfig,
) -> Result<WorkloadReport> {
    let barrier = Barrier::new(config.threads);
    let items = config.items as i64;
    let started = Instant::now();

    let stats = run_workers(config.threads, |t| {
        barrier.wait();
        let begin = Instant::now();
        let t = t as i64;
        let lo = t * items + 1;
        let hi = (t + 1) * items;

        for key in lo..=hi {
            debug!(worker = t, key, "enqueue");
            if !queue.enqueue(key) {
                error!(worker = t, key, "enqueue failed unexpectedly");
            }
        }

        barrier.wait();

        let mut sum = 0i64;
        let mut taken = 0i64;
        while taken < items {
            match queue.dequeue() {
                Some(val) => {
                    sum += val;
                    taken += 1;
                }
                None => {
                    // All NM items are in the queue by the barrier, but a
                    // racing dequeuer may momentarily be ahead of us.
                    std::thread::yield_now();
                }
            }
        }

        WorkerStat {
            sum,
            errors: 0,
            interval: begin.elapsed(),
        }
    })?;

    Ok(summarize(stats, started.elapsed(), config))
}

fn run_workers<F>(threads: usize, work: F) -> Result<Vec<WorkerStat>>
where
    F: Fn(usize) -> WorkerStat + Sync,
{
    let work = &work;
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| scope.spawn(move || work(t)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| SetError::Worker("worker panicked".into()))
            })
            .collect()
    })
}

fn summarize(stats: Vec<WorkerStat>, elapsed: Duration, config: &WorkloadConfig) -> WorkloadReport {
    let total: i64 = stats.iter().map(|stat| stat.sum).sum();
    let op_errors: u64 = stats.iter().map(|stat| stat.errors).sum();
    let expected = config.expected_total();
    let per_thread: Vec<Duration> = stats.iter().map(|stat| stat.interval).collect();

    for (t, interval) in per_thread.iter().enumerate() {
        debug!(worker = t, ?interval, "worker finished");
    }
    info!(total, expected, op_errors, ?elapsed, "workload complete");

    WorkloadReport {
        passed: total == expected && op_errors == 0,
        total,
        expected,
        op_errors,
        per_thread,
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ChainHash;
    use crate::list::LazyList;
    use crate::queue::MsQueue;

    #[test]
    fn test_config_clamps() {
        let config = WorkloadConfig::new(1000, 100_000).unwrap();
        assert_eq!(config.threads, MAX_THREADS);
        assert_eq!(config.items, MAX_ITEMS);
        assert!(WorkloadConfig::new(0, 10).is_err());
        assert!(WorkloadConfig::new(10, 0).is_err());
    }

    #[test]
    fn test_set_workload_checksum() {
        let list = LazyList::new();
        let config = WorkloadConfig::new(4, 50).unwrap();
        let report = run_set_workload(&list, &config).unwrap();
        assert!(report.passed);
        assert_eq!(report.total, 200 * 201 / 2);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_set_workload_on_hash() {
        let ht = ChainHash::new(4).unwrap();
        let config = WorkloadConfig::new(4, 100).unwrap();
        let report = run_set_workload(&ht, &config).unwrap();
        assert!(report.passed);
        assert_eq!(ht.len(), 0);
    }

    #[test]
    fn test_queue_workload_checksum() {
        let queue = MsQueue::new();
        let config = WorkloadConfig::new(4, 100).unwrap();
        let report = run_queue_workload(&queue, &config).unwrap();
        assert!(report.passed);
        assert_eq!(queue.dequeue(), None);
    }
}
