// Copyright (c) 2025 Syncset Contributors
//
// Refinable hash table
//
// Lock granularity follows the bucket array: every bucket owns a lock.
// When the table doubles, buckets below the old size keep their existing
// lock handle and new buckets get fresh ones, so a lock may end up shared
// by two buckets of the new table. That sharing is harmless: operations
// re-read the table pointer after locking and retry if a resize happened
// between hashing and acquisition.

use super::{bucket_index, BucketList};
use crate::concurrent::epoch::{Atomic, Epoch, EpochGuard, Owned};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use crate::error::{Result, SetError};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

struct RefBucket {
    lock: Arc<Mutex<()>>,
    chain: UnsafeCell<BucketList>,
}

struct RefinableTable {
    buckets: Vec<RefBucket>,
}

// Safety: chains are only touched while holding their bucket lock; the
// table is only replaced while holding every bucket lock of the current
// table.
unsafe impl Send for RefinableTable {}
unsafe impl Sync for RefinableTable {}

/// Hash set whose per-bucket locks are inherited across resizes
pub struct RefinableHash {
    table: Atomic<RefinableTable>,
    set_size: AtomicUsize,
    resizes: AtomicUsize,
}

impl RefinableHash {
    pub fn new(bucket_count: usize) -> Result<Self> {
        if bucket_count == 0 {
            return Err(SetError::Config(
                "bucket count must be positive".to_string(),
            ));
        }
        let table = RefinableTable {
            buckets: (0..bucket_count)
                .map(|_| RefBucket {
                    lock: Arc::new(Mutex::new(())),
                    chain: UnsafeCell::new(BucketList::new()),
                })
                .collect(),
        };
        Ok(Self {
            table: Atomic::new(table),
            set_size: AtomicUsize::new(0),
            resizes: AtomicUsize::new(0),
        })
    }

    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::Relaxed)
    }

    /// Run `f` on the bucket for `key` under that bucket's lock, retrying
    /// when the table was resized between hashing and locking.
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

            let bucket_guard = table_ref.buckets[bucket].lock.lock();
            if self.table.load(Ordering::Acquire, guard) != table {
                // Resize happened between hashing and locking
                drop(bucket_guard);
                continue;
            }
            // Safety: this bucket's lock is held and the table is current
            let chain = unsafe { &mut *table_ref.buckets[bucket].chain.get() };
            return (f(chain), size);
        }
    }

    /// Double the table, inheriting lock handles for the old index range.
    fn resize(&self, expected_size: usize, guard: &EpochGuard) {
        let table = self.table.load(Ordering::Acquire, guard);
        let table_ref = table.as_ref().expect("table is never null");
        if table_ref.buckets.len() != expected_size {
            return;
        }

        // Acquire every bucket lock of the current table in index order
        let bucket_guards: Vec<_> = table_ref
            .buckets
            .iter()
            .map(|bucket| bucket.lock.lock())
            .collect();
        if self.table.load(Ordering::Acquire, guard) != table {
            // Lost the race against another resize
            return;
        }

        let new_size = expected_size * 2;
        let new_table = RefinableTable {
            buckets: (0..new_size)
                .map(|i| RefBucket {
                    lock: if i < expected_size {
                        Arc::clone(&table_ref.buckets[i].lock)
                    } else {
                        Arc::new(Mutex::new(()))
                    },
                    chain: UnsafeCell::new(BucketList::new()),
                })
                .collect(),
        };
        for bucket in &table_ref.buckets {
            // Safety: all bucket locks are held
            let chain = unsafe { &mut *bucket.chain.get() };
            while let Some(node) = chain.pop_head() {
                let key = unsafe { (*node).key };
                let target = bucket_index(key, new_size);
                // Safety: the new table is still private to this thread
                unsafe { (*new_table.buckets[target].chain.get()).relink_sorted(node) };
            }
        }

        self.table
            .store(Owned::new(new_table).into_shared(), Ordering::Release);
        Epoch::defer(table.as_ptr());
        self.resizes.fetch_add(1, Ordering::Relaxed);
        debug!(old_size = expected_size, new_size, "refinable hash resized");
        drop(bucket_guards);
    }
}

impl ConcurrentSet for RefinableHash {
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

impl Drop for RefinableHash {
    fn drop(&mut self) {
        let guard = Epoch::pin();
        let table = self.table.load(Ordering::Acquire, &guard);
        if !table.is_null() {
            // Safety: exclusive access during drop
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
        let ht = RefinableHash::new(4).unwrap();
        assert!(ht.insert(3, 30));
        assert!(!ht.insert(3, 31));
        assert!(ht.contains(3));
        assert_eq!(ht.remove(3), Some(30));
        assert!(!ht.contains(3));
    }

    #[test]
    fn test_lock_inheritance_across_resize() {
        let ht = RefinableHash::new(2).unwrap();
        for k in 1..=50 {
            assert!(ht.insert(k, k));
        }
        assert!(ht.resize_count() >= 1);
        // Operations after resize still agree on membership
        for k in 1..=50 {
            assert!(ht.contains(k));
            assert_eq!(ht.remove(k), Some(k));
        }
        assert_eq!(ht.len(), 0);
    }

    #[test]
    fn test_concurrent_workload_with_resizes() {
        let ht = Arc::new(RefinableHash::new(2).unwrap());
        let mut handles = vec![];

        for t in 0..8i64 {
            let ht = Arc::clone(&ht);
            handles.push(thread::spawn(move || {
                let lo = t * 400 + 1;
                let hi = (t + 1) * 400;
                for k in lo..=hi {
                    assert!(ht.insert(k, k));
                }
                let mut sum = 0;
                for k in lo..=hi {
                    sum += ht.remove(k).unwrap();
                }
                assert_eq!(sum, (lo + hi) * 400 / 2);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ht.len(), 0);
        assert!(ht.resize_count() >= 1);
    }
}
