// Copyright (c) 2025 Syncset Contributors
//
// Concurrent cuckoo hash table (Herlihy-Shavit style)
//
// Two tables of short probe lists guarded by two fixed stripe-lock
// arrays. An operation on key k always takes stripe h0(k) of table 0 and
// then stripe h1(k) of table 1, in that order, so every single-key
// operation sees a consistent snapshot of both candidate buckets and lock
// acquisition order is global. Table sizes are always a multiple of the
// stripe count, which makes "bucket index mod stripe count" a stable
// mapping from bucket to stripe across resizes.
//
// Buckets have a soft capacity (`threshold`) and a hard one
// (`probe_size`). Insertion above the soft capacity triggers `relocate`,
// which moves the head of the overfull bucket to its alternate side;
// insertion above the hard capacity (or a failed relocate) escalates to a
// full resize under every stripe of both tables.

use super::{cuckoo_hash0, cuckoo_hash1, BucketList};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use crate::error::{Result, SetError};
use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Largest supported size exponent, from the original workbench
const MAX_SIZE_EXP: usize = 16;

/// Rounds a single relocate call may attempt before the caller resizes
const RELOCATE_LIMIT: usize = 8;

struct CuckooTables {
    sets: [Vec<BucketList>; 2],
}

impl CuckooTables {
    fn size(&self) -> usize {
        self.sets[0].len()
    }
}

/// Concurrent cuckoo hash set with striped locks and probe lists
pub struct ConcurrentCuckooHash {
    stripes: [Box<[Mutex<()>]>; 2],
    tables: UnsafeCell<CuckooTables>,
    set_size: AtomicUsize,
    resizes: AtomicUsize,
    relocations: AtomicUsize,
    probe_size: usize,
    threshold: usize,
}

/// Occupancy and maintenance counters
#[derive(Debug, Clone, Copy)]
pub struct CuckooStats {
    pub len: usize,
    pub resizes: usize,
    pub relocations: usize,
}

// Safety: `tables` is read while holding at least one stripe that covers
// the touched bucket and replaced only while holding every stripe of both
// arrays; the stripe arrays themselves are immutable.
unsafe impl Send for ConcurrentCuckooHash {}
unsafe impl Sync for ConcurrentCuckooHash {}

fn side_hash(side: usize, key: Key, size: usize) -> usize {
    if side == 0 {
        cuckoo_hash0(key, size)
    } else {
        cuckoo_hash1(key, size)
    }
}

impl ConcurrentCuckooHash {
    /// `size_exp` fixes both the initial table size (2^size_exp buckets
    /// per side) and, permanently, the stripe count.
    pub fn new(size_exp: usize, probe_size: usize, threshold: usize) -> Result<Self> {
        if size_exp == 0 || size_exp > MAX_SIZE_EXP {
            return Err(SetError::Config(format!(
                "size exponent must be in 1..={MAX_SIZE_EXP}, got {size_exp}"
            )));
        }
        if probe_size == 0 || threshold == 0 || threshold > probe_size {
            return Err(SetError::Config(format!(
                "need 0 < threshold <= probe_size, got threshold={threshold} probe_size={probe_size}"
            )));
        }
        let size = 1 << size_exp;
        let make_stripes = || {
            (0..size)
                .map(|_| Mutex::new(()))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };
        let make_buckets = || (0..size).map(|_| BucketList::new()).collect::<Vec<_>>();
        Ok(Self {
            stripes: [make_stripes(), make_stripes()],
            tables: UnsafeCell::new(CuckooTables {
                sets: [make_buckets(), make_buckets()],
            }),
            set_size: AtomicUsize::new(0),
            resizes: AtomicUsize::new(0),
            relocations: AtomicUsize::new(0),
            probe_size,
            threshold,
        })
    }

    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CuckooStats {
        CuckooStats {
            len: self.set_size.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
        }
    }

    fn stripe_count(&self) -> usize {
        self.stripes[0].len()
    }

    /// Both stripes covering `key`, always table 0 before table 1
    fn acquire(&self, key: Key) -> (MutexGuard<'_, ()>, MutexGuard<'_, ()>) {
        let s = self.stripe_count();
        let g0 = self.stripes[0][cuckoo_hash0(key, s)].lock();
        let g1 = self.stripes[1][cuckoo_hash1(key, s)].lock();
        (g0, g1)
    }

    /// Every stripe of table 0, then every stripe of table 1
    fn acquire_all(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(self.stripe_count() * 2);
        for side in 0..2 {
            for stripe in self.stripes[side].iter() {
                guards.push(stripe.lock());
            }
        }
        guards
    }

    /// Access the tables. Caller must hold a stripe covering whatever it
    /// touches (or all stripes for structural changes).
    #[allow(clippy::mut_from_ref)]
    unsafe fn tables(&self) -> &mut CuckooTables {
        &mut *self.tables.get()
    }

    fn contains_in(tables: &CuckooTables, key: Key) -> bool {
        let size = tables.size();
        (0..2).any(|side| tables.sets[side][side_hash(side, key, size)].contains(key))
    }

    /// Move the head of `table[side][bucket]` to its alternate bucket,
    /// cascading for a bounded number of rounds. Returns false if the
    /// caller should resize. Must be called with no stripes held.
    fn relocate(&self, mut side: usize, mut bucket: usize) -> bool {
        let stripe_count = self.stripe_count();

        for _round in 0..RELOCATE_LIMIT {
            // Peek at the overfull bucket's head under its own stripe to
            // learn which key to move; both stripes of that key are then
            // taken in canonical order.
            let head_key = {
                let _peek = self.stripes[side][bucket % stripe_count].lock();
                // Safety: one stripe covering `bucket` is held
                let tables = unsafe { self.tables() };
                if bucket >= tables.size() {
                    // A resize rebuilt everything; nothing left to fix
                    return true;
                }
                match tables.sets[side][bucket].head_key() {
                    Some(key) => key,
                    None => return true,
                }
            };

            let other = 1 - side;
            let (_g0, _g1) = self.acquire(head_key);
            // Safety: both stripes for head_key are held
            let tables = unsafe { self.tables() };
            let size = tables.size();
            let from = side_hash(side, head_key, size);
            let to = side_hash(other, head_key, size);

            match tables.sets[side][from].detach(head_key) {
                Some(node) => {
                    let to_len = tables.sets[other][to].len();
                    if to_len < self.threshold {
                        tables.sets[other][to].append_node(node);
                        self.relocations.fetch_add(1, Ordering::Relaxed);
                        return true;
                    } else if to_len < self.probe_size {
                        tables.sets[other][to].append_node(node);
                        self.relocations.fetch_add(1, Ordering::Relaxed);
                        side = other;
                        bucket = to;
                    } else {
                        // Alternate side is at the hard cap; put the head
                        // back and let the caller resize.
                        tables.sets[side][from].append_node(node);
                        return false;
                    }
                }
                None => {
                    // Someone else moved or removed the head first
                    if tables.sets[side][from].len() < self.threshold {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Double both tables under every stripe. A no-op if another thread
    /// already resized past `expected_size`.
    fn resize(&self, expected_size: usize) {
        let _all = self.acquire_all();
        // Safety: every stripe of both tables is held
        let tables = unsafe { self.tables() };
        if tables.size() != expected_size {
            return;
        }

        let new_size = expected_size * 2;
        let mut new_sets = [
            (0..new_size).map(|_| BucketList::new()).collect::<Vec<_>>(),
            (0..new_size).map(|_| BucketList::new()).collect::<Vec<_>>(),
        ];

        for side in 0..2 {
            for bucket in 0..expected_size {
                while let Some(node) = tables.sets[side][bucket].pop_head() {
                    // Safety: node detached, exclusively owned
                    let key = unsafe { (*node).key };
                    let h0 = cuckoo_hash0(key, new_size);
                    let h1 = cuckoo_hash1(key, new_size);
                    let (len0, len1) = (new_sets[0][h0].len(), new_sets[1][h1].len());
                    if len0 < self.threshold {
                        new_sets[0][h0].append_node(node);
                    } else if len1 < self.threshold {
                        new_sets[1][h1].append_node(node);
                    } else if len0 < self.probe_size {
                        new_sets[0][h0].append_node(node);
                    } else if len1 < self.probe_size {
                        new_sets[1][h1].append_node(node);
                    } else {
                        // Transiently exceed the hard cap on the shorter
                        // side; subsequent relocates will thin it out.
                        warn!(key, "both candidate buckets full during resize");
                        if len0 <= len1 {
                            new_sets[0][h0].append_node(node);
                        } else {
                            new_sets[1][h1].append_node(node);
                        }
                    }
                }
            }
        }

        tables.sets = new_sets;
        self.resizes.fetch_add(1, Ordering::Relaxed);
        debug!(old_size = expected_size, new_size, "concurrent cuckoo resized");
    }

    /// Longest probe list currently in either table (diagnostic)
    pub fn max_probe_list_len(&self) -> usize {
        let _all = self.acquire_all();
        // Safety: every stripe is held
        let tables = unsafe { self.tables() };
        tables
            .sets
            .iter()
            .flat_map(|side| side.iter().map(|bucket| bucket.len()))
            .max()
            .unwrap_or(0)
    }
}

impl ConcurrentSet for ConcurrentCuckooHash {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        loop {
            let (placement, size) = {
                let (_g0, _g1) = self.acquire(key);
                // Safety: both stripes for key are held
                let tables = unsafe { self.tables() };
                if Self::contains_in(tables, key) {
                    return false;
                }
                let size = tables.size();
                let h0 = cuckoo_hash0(key, size);
                let h1 = cuckoo_hash1(key, size);
                let (len0, len1) = (tables.sets[0][h0].len(), tables.sets[1][h1].len());

                if len0 < self.threshold {
                    tables.sets[0][h0].append(key, val);
                    self.set_size.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                if len1 < self.threshold {
                    tables.sets[1][h1].append(key, val);
                    self.set_size.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                if len0 < self.probe_size {
                    tables.sets[0][h0].append(key, val);
                    self.set_size.fetch_add(1, Ordering::Relaxed);
                    (Some((0, h0)), size)
                } else if len1 < self.probe_size {
                    tables.sets[1][h1].append(key, val);
                    self.set_size.fetch_add(1, Ordering::Relaxed);
                    (Some((1, h1)), size)
                } else {
                    (None, size)
                }
            };

            match placement {
                Some((side, bucket)) => {
                    // Inserted above the soft cap; decongest without any
                    // stripes held, escalating to resize on failure.
                    if !self.relocate(side, bucket) {
                        self.resize(size);
                    }
                    return true;
                }
                None => {
                    // Both candidate buckets at the hard cap
                    self.resize(size);
                }
            }
        }
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let (_g0, _g1) = self.acquire(key);
        // Safety: both stripes for key are held
        let tables = unsafe { self.tables() };
        let size = tables.size();
        for side in 0..2 {
            let bucket = side_hash(side, key, size);
            if let Some(val) = tables.sets[side][bucket].remove(key) {
                self.set_size.fetch_sub(1, Ordering::Relaxed);
                return Some(val);
            }
        }
        None
    }

    fn contains(&self, key: Key) -> bool {
        let (_g0, _g1) = self.acquire(key);
        // Safety: both stripes for key are held
        let tables = unsafe { self.tables() };
        Self::contains_in(tables, key)
    }

    fn len(&self) -> usize {
        self.set_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_ops() {
        let ht = ConcurrentCuckooHash::new(4, 4, 2).unwrap();
        assert!(ht.insert(1, 10));
        assert!(!ht.insert(1, 11));
        assert!(ht.contains(1));
        assert_eq!(ht.remove(1), Some(10));
        assert_eq!(ht.remove(1), None);
        assert_eq!(ht.len(), 0);
    }

    #[test]
    fn test_saturation_forces_resize() {
        // Table size 4, soft cap 2, hard cap 4: ten keys cannot fit
        // without at least one resize.
        let ht = ConcurrentCuckooHash::new(2, 4, 2).unwrap();
        for k in 1..=10 {
            assert!(ht.insert(k, k));
        }
        assert!(ht.resize_count() >= 1);
        for k in 1..=10 {
            assert!(ht.contains(k));
        }
        for k in 1..=10 {
            assert_eq!(ht.remove(k), Some(k));
        }
        assert_eq!(ht.len(), 0);
    }

    #[test]
    fn test_probe_lists_bounded_after_quiescence() {
        let ht = ConcurrentCuckooHash::new(3, 4, 2).unwrap();
        for k in 1..=60 {
            assert!(ht.insert(k, k));
        }
        assert!(ht.max_probe_list_len() <= 4);
    }

    #[test]
    fn test_bad_params() {
        assert!(ConcurrentCuckooHash::new(0, 4, 2).is_err());
        assert!(ConcurrentCuckooHash::new(4, 2, 4).is_err());
        assert!(ConcurrentCuckooHash::new(4, 4, 0).is_err());
    }

    #[test]
    fn test_concurrent_workload() {
        let ht = Arc::new(ConcurrentCuckooHash::new(4, 4, 2).unwrap());
        let mut handles = vec![];

        for t in 0..8i64 {
            let ht = Arc::clone(&ht);
            handles.push(thread::spawn(move || {
                let lo = t * 300 + 1;
                let hi = (t + 1) * 300;
                for k in lo..=hi {
                    assert!(ht.insert(k, k));
                }
                let mut sum = 0;
                for k in lo..=hi {
                    sum += ht.remove(k).unwrap();
                }
                assert_eq!(sum, (lo + hi) * 300 / 2);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ht.len(), 0);
    }
}
