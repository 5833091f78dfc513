// Copyright (c) 2025 Syncset Contributors
//
// Striped hash table
//
// The lock array is fixed at construction; the bucket array doubles on
// resize. A bucket maps to its stripe by index modulo the stripe count, so
// every operation takes exactly one stripe and a resize takes all of them
// in ascending order. Operations re-read the table after locking and retry
// if a resize slipped in between; the table pointer itself is swung under
// all stripes and retired through the epoch scheme so un-locked readers of
// the pointer never see freed memory.

use super::{bucket_index, BucketList};
use crate::concurrent::epoch::{Atomic, Epoch, EpochGuard, Owned};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use crate::error::{Result, SetError};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

struct StripedTable {
    buckets: Vec<UnsafeCell<BucketList>>,
}

// Safety: chains are only touched while holding the stripe that covers
// the bucket; the table is only replaced while holding every stripe.
unsafe impl Send for StripedTable {}
unsafe impl Sync for StripedTable {}

/// Hash set with a fixed array of stripe locks over a growing bucket array
pub struct StripedHash {
    locks: Box<[Mutex<()>]>,
    table: Atomic<StripedTable>,
    set_size: AtomicUsize,
    resizes: AtomicUsize,
}

impl StripedHash {
    /// The initial bucket count also fixes the stripe count for the
    /// lifetime of the table.
    pub fn new(bucket_count: usize) -> Result<Self> {
        if bucket_count == 0 {
            return Err(SetError::Config(
                "bucket count must be positive".to_string(),
            ));
        }
        let locks = (0..bucket_count)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let table = StripedTable {
            buckets: (0..bucket_count)
                .map(|_| UnsafeCell::new(BucketList::new()))
                .collect(),
        };
        Ok(Self {
            locks,
            table: Atomic::new(table),
            set_size: AtomicUsize::new(0),
            resizes: AtomicUsize::new(0),
        })
    }

    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::Relaxed)
    }

    /// Run `f` on the bucket for `key` with its stripe held, retrying if a
    /// resize replaced the table in between.
    fn with_bucket<R>(
        &self,
        key: Key,
        guard: &EpochGuard,
        f: impl FnOnce(&mut BucketList) -> R,
    ) -> (R, usize) {
        loop {
            let table = self.table.load(Ordering::Acquire, guard);
            let table_ref = table.as_ref().expect("table is never null");
            let size = table_ref.buckets.len();
            let bucket = bucket_index(key, size);
            let stripe = bucket % self.locks.len();

            let stripe_guard = self.locks[stripe].lock();
            if self.table.load(Ordering::Acquire, guard) != table {
                drop(stripe_guard);
                continue;
            }
            // Safety: the stripe for this bucket is held
            let chain = unsafe { &mut *table_ref.buckets[bucket].get() };
            return (f(chain), size);
        }
    }

    /// Double the bucket array, keeping the stripe array untouched.
    fn resize(&self, expected_size: usize, guard: &EpochGuard) {
        let _stripe_guards: Vec<_> = self.locks.iter().map(|lock| lock.lock()).collect();

        let table = self.table.load(Ordering::Acquire, guard);
        let table_ref = table.as_ref().expect("table is never null");
        if table_ref.buckets.len() != expected_size {
            // Another thread already resized
            return;
        }

        let new_size = expected_size * 2;
        let new_table = StripedTable {
            buckets: (0..new_size)
                .map(|_| UnsafeCell::new(BucketList::new()))
                .collect(),
        };
        for cell in &table_ref.buckets {
            // Safety: all stripes are held
            let chain = unsafe { &mut *cell.get() };
            while let Some(node) = chain.pop_head() {
                let key = unsafe { (*node).key };
                let target = bucket_index(key, new_size);
                // Safety: the new table is still private to this thread
                unsafe { (*new_table.buckets[target].get()).relink_sorted(node) };
            }
        }

        self.table
            .store(Owned::new(new_table).into_shared(), Ordering::Release);
        Epoch::defer(table.as_ptr());
        self.resizes.fetch_add(1, Ordering::Relaxed);
        debug!(old_size = expected_size, new_size, "striped hash resized");
    }
}

impl ConcurrentSet for StripedHash {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        let guard = Epoch::pin();
        let (inserted, table_size) =
            self.with_bucket(key, &guard, |chain| chain.insert_sorted(key, val));
        if !inserted {
            return false;
        }
        let new_count = self.set_size.fetch_add(1, Ordering::Relaxed) + 1;
        if new_count / table_size > 4 {
            self.resize(table_size, &guard);
        }
        true
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let guard = Epoch::pin();
        let (removed, _) = self.with_bucket(key, &guard, |chain| chain.remove(key));
        if removed.is_some() {
            self.set_size.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    fn contains(&self, key: Key) -> bool {
        let guard = Epoch::pin();
        let (found, _) = self.with_bucket(key, &guard, |chain| chain.contains(key));
        found
    }

    fn len(&self) -> usize {
        self.set_size.load(Ordering::Relaxed)
    }
}

impl Drop for StripedHash {
    fn drop(&mut self) {
        let guard = Epoch::pin();
        let table = self.table.load(Ordering::Acquire, &guard);
        if !table.is_null() {
            // Safety: exclusive access during drop; older tables were
            // already retired through the epoch scheme
            unsafe { drop(Box::from_raw(table.as_ptr())) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_ops() {
        let ht = StripedHash::new(4).unwrap();
        assert!(ht.insert(1, 10));
        assert!(ht.insert(5, 50));
        assert!(!ht.insert(1, 99));
        assert!(ht.contains(5));
        assert_eq!(ht.remove(1), Some(10));
        assert_eq!(ht.remove(1), None);
        assert_eq!(ht.len(), 1);
    }

    #[test]
    fn test_resize_keeps_entries() {
        let ht = StripedHash::new(2).unwrap();
        for k in 1..=100 {
            assert!(ht.insert(k, k));
        }
        assert!(ht.resize_count() >= 1);
        for k in 1..=100 {
            assert!(ht.contains(k));
        }
        assert_eq!(ht.len(), 100);
    }

    #[test]
    fn test_concurrent_inserts_during_resize() {
        let ht = Arc::new(StripedHash::new(2).unwrap());
        let mut handles = vec![];

        for t in 0..8i64 {
            let ht = Arc::clone(&ht);
            handles.push(thread::spawn(move || {
                let lo = t * 500 + 1;
                let hi = (t + 1) * 500;
                for k in lo..=hi {
                    assert!(ht.insert(k, k));
                }
                for k in lo..=hi {
                    assert!(ht.contains(k));
                }
                let mut sum = 0;
                for k in lo..=hi {
                    sum += ht.remove(k).unwrap();
                }
                assert_eq!(sum, (lo + hi) * 500 / 2);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ht.len(), 0);
    }
}
