// Copyright (c) 2025 Syncset Contributors
//
// Open-addressed hash table with linear probing, behind a single mutex
//
// Flat array of slots in one of three states. Searches probe until an
// EMPTY slot (miss) or a matching OCCUPIED slot (hit); tombstones keep the
// probe chain alive. The table doubles once occupancy passes 4/5, dropping
// tombstones in the process.

use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use crate::error::{Result, SetError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Largest supported size exponent (table of 2^24 slots)
const MAX_SIZE_EXP: usize = 24;

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Occupied,
    Tombstone,
}

#[derive(Clone, Copy)]
struct Slot {
    key: Key,
    val: Value,
    state: SlotState,
}

impl Slot {
    fn empty() -> Self {
        Self {
            key: 0,
            val: 0,
            state: SlotState::Empty,
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    set_size: usize,
}

impl Inner {
    /// `(key + i) mod table_size` linear probe sequence
    fn probe(&self, key: Key, i: usize) -> usize {
        (key.wrapping_add(i as i64)).rem_euclid(self.slots.len() as i64) as usize
    }

    fn find_occupied(&self, key: Key) -> Option<usize> {
        for i in 0..self.slots.len() {
            let idx = self.probe(key, i);
            match self.slots[idx].state {
                SlotState::Empty => return None,
                SlotState::Occupied if self.slots[idx].key == key => return Some(idx),
                _ => {}
            }
        }
        None
    }

    fn place(&mut self, key: Key, val: Value) {
        for i in 0..self.slots.len() {
            let idx = self.probe(key, i);
            if self.slots[idx].state != SlotState::Occupied {
                self.slots[idx] = Slot {
                    key,
                    val,
                    state: SlotState::Occupied,
                };
                return;
            }
        }
        unreachable!("resize keeps the table below full occupancy");
    }

    /// Resize policy from the original workbench: above 4/5 occupancy
    fn needs_resize(&self) -> bool {
        self.slots.len() * 4 / 5 < self.set_size
    }

    fn resize(&mut self) {
        let new_size = self.slots.len() * 2;
        let old_slots = std::mem::replace(&mut self.slots, vec![Slot::empty(); new_size]);
        for slot in &old_slots {
            if slot.state == SlotState::Occupied {
                self.place(slot.key, slot.val);
            }
        }
        debug!(
            old_size = old_slots.len(),
            new_size = self.slots.len(),
            "open-address hash resized"
        );
    }
}

/// Open-addressed hash set with linear probing and tombstone deletion
pub struct OpenAddrHash {
    inner: Mutex<Inner>,
    resizes: AtomicUsize,
}

impl OpenAddrHash {
    /// Table size is `2^size_exp` slots
    pub fn new(size_exp: usize) -> Result<Self> {
        if size_exp == 0 || size_exp > MAX_SIZE_EXP {
            return Err(SetError::Config(format!(
                "size exponent must be in 1..={MAX_SIZE_EXP}, got {size_exp}"
            )));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                slots: vec![Slot::empty(); 1 << size_exp],
                set_size: 0,
            }),
            resizes: AtomicUsize::new(0),
        })
    }

    pub fn resize_count(&self) -> usize {
        self.resizes.load(Ordering::Relaxed)
    }

    pub fn table_size(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl ConcurrentSet for OpenAddrHash {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.find_occupied(key).is_some() {
            return false;
        }
        inner.place(key, val);
        inner.set_size += 1;
        if inner.needs_resize() {
            inner.resize();
            self.resizes.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let mut inner = self.inner.lock();
        let idx = inner.find_occupied(key)?;
        let val = inner.slots[idx].val;
        inner.slots[idx].state = SlotState::Tombstone;
        inner.set_size -= 1;
        Some(val)
    }

    fn contains(&self, key: Key) -> bool {
        self.inner.lock().find_occupied(key).is_some()
    }

    fn len(&self) -> usize {
        self.inner.lock().set_size
    }
}
