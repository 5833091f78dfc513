// Copyright (c) 2025 Syncset Contributors
//
// Cuckoo hash table behind a single container mutex
//
// Two flat tables with independent hash functions; every key lives in
// exactly one of its two candidate slots. Insertion displaces incumbents
// back and forth for a bounded number of hops; when the hop budget runs
// out the tables double and the displaced entry continues its journey in
// the bigger table, so no resident is ever lost.

use super::{cuckoo_hash0, cuckoo_hash1};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use crate::error::{Result, SetError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Largest supported size exponent, from the original workbench
const MAX_SIZE_EXP: usize = 10;

#[derive(Clone, Copy)]
struct Slot {
    key: Key,
    val: Value,
    occupied: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            key: 0,
            val: 0,
            occupied: false,
        }
    }

    fn entry(key: Key, val: Value) -> Self {
        Self {
            key,
            val,
            occupied: true,
        }
    }
}

struct Inner {
    tables: [Vec<Slot>; 2],
    set_size: usize,
}

impl Inner {
    fn table_size(&self) -> usize {
        self.tables[0].len()
    }

    fn slot_of(&self, side: usize, key: Key) -> usize {
        if side == 0 {
            cuckoo_hash0(key, self.table_size())
        } else {
            cuckoo_hash1(key, self.table_size())
        }
    }

    fn find(&self, key: Key) -> Option<(usize, usize)> {
        for side in 0..2 {
            let idx = self.slot_of(side, key);
            if self.tables[side][idx].occupied && self.tables[side][idx].key == key {
                return Some((side, idx));
            }
        }
        None
    }

    /// Displace-insert one entry, hopping between the two tables.
    /// On budget exhaustion the entry still in hand comes back as `Err`
    /// so the caller can resize without losing it.
    fn place(&mut self, entry: Slot) -> std::result::Result<(), Slot> {
        let mut item = entry;
        for _hop in 0..self.table_size() {
            for side in 0..2 {
                let idx = self.slot_of(side, item.key);
                let displaced = std::mem::replace(&mut self.tables[side][idx], item);
                if !displaced.occupied {
                    return Ok(());
                }
                item = displaced;
            }
        }
        Err(item)
    }

    /// Double both tables and rebucket everything. Keeps doubling until
    /// every resident fits again.
    fn resize(&mut self) {
        let mut entries: Vec<Slot> = Vec::with_capacity(self.set_size);
        for table in &self.tables {
            for slot in table {
                if slot.occupied {
                    entries.push(*slot);
                }
            }
        }
        let mut new_size = self.table_size() * 2;
        'rebuild: loop {
            self.tables = [vec![Slot::empty(); new_size], vec![Slot::empty(); new_size]];
            for entry in &entries {
                if self.place(*entry).is_err() {
                    new_size *= 2;
                    continue 'rebuild;
                }
            }
            return;
        }
    }
}

/// Sequential-core cuckoo hash set with a global lock
pub struct CuckooHash {
    inner: Mutex<Inner>,
    resizes: AtomicUsize,
}

impl CuckooHash {
    /// Table size is `2^size_exp` slots per side
    pub fn new(size_exp: usize) -> Result<Self> {
        if size_exp == 0 || size_exp > MAX_SIZE_EXP {
            return Err(SetError::Config(format!(
                "size exponent must be in 1..={MAX_SIZE_EXP}, got {size_exp}"
            )));
        }
        let size = 1 << size_exp;
        Ok(Self {
            inner: Mutex::new(Inner {
                tables: [vec![Slot::empty(); size], vec![Slot::empty(); size]],
                set_size: 0,
            }),
            resizes: AtomicUsize::new(0),
        })
    }

    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::Relaxed)
    }

    pub fn table_size(&self) -> usize {
        self.inner.lock().table_size()
    }
}

impl ConcurrentSet for CuckooHash {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.find(key).is_some() {
            return false;
        }
        let mut pending = Slot::entry(key, val);
        loop {
            match inner.place(pending) {
                Ok(()) => {
                    inner.set_size += 1;
                    return true;
                }
                Err(displaced) => {
                    // The displacement cycled; grow and let the entry in
                    // hand continue in the doubled table.
                    inner.resize();
                    self.resizes.fetch_add(1, Ordering::Relaxed);
                    debug!(table_size = inner.table_size(), "cuckoo hash resized");
                    pending = displaced;
                }
            }
        }
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let mut inner = self.inner.lock();
        let (side, idx) = inner.find(key)?;
        let val = inner.tables[side][idx].val;
        inner.tables[side][idx] = Slot::empty();
        inner.set_size -= 1;
        Some(val)
    }

    fn contains(&self, key: Key) -> bool {
        self.inner.lock().find(key).is_some()
    }

    fn len(&self) -> usize {
        self.inner.lock().set_size
    }
}
