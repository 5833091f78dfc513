// Copyright (c) 2025 Syncset Contributors
//
// Lazy skiplist after Herlihy, Lev, Luchangco and Shavit, "A Simple
// Optimistic Skiplist Algorithm"
//
// Search takes no locks. Insertion locks every predecessor up to the new
// node's top level, validates, splices bottom-up and only then publishes
// the node by setting `fully_linked`. Removal locks and marks the victim
// first, then locks the predecessors and unlinks top-down. A predecessor
// can appear at several levels, so the per-node lock is reentrant.
//
// Each thread keeps fixed-capacity preds/succs scratch arrays so the hot
// path never allocates.

use super::{check_params, random_level};
use crate::concurrent::epoch::{Atomic, Epoch, EpochGuard, Shared};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_LEVEL};
use crate::error::Result;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct Node {
    key: Key,
    val: Value,
    top_level: usize,
    mtx: ReentrantMutex<()>,
    marked: AtomicBool,
    fully_linked: AtomicBool,
    next: Vec<Atomic<Node>>,
}

impl Node {
    fn alloc(key: Key, val: Value, top_level: usize) -> *mut Node {
        let mut next = Vec::with_capacity(top_level + 1);
        for _ in 0..=top_level {
            next.push(Atomic::null());
        }
        Box::into_raw(Box::new(Node {
            key,
            val,
            top_level,
            mtx: ReentrantMutex::new(()),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            next,
        }))
    }
}

// Safety: nodes reached through the skiplist are kept alive by the epoch
// guard the caller holds.
unsafe fn node_ref<'a>(ptr: *mut Node) -> &'a Node {
    &*ptr
}

/// Per-thread scratch for the search subroutine
struct Workspace {
    preds: [*mut Node; MAX_LEVEL],
    succs: [*mut Node; MAX_LEVEL],
}

thread_local! {
    static WORKSPACE: RefCell<Workspace> = const {
        RefCell::new(Workspace {
            preds: [std::ptr::null_mut(); MAX_LEVEL],
            succs: [std::ptr::null_mut(); MAX_LEVEL],
        })
    };
}

/// Optimistic skiplist with lazy deletion
pub struct LazySkiplist {
    head: *mut Node,
    max_level: usize,
    min: Key,
    max: Key,
    size: AtomicUsize,
}

unsafe impl Send for LazySkiplist {}
unsafe impl Sync for LazySkiplist {}

impl LazySkiplist {
    pub fn new(max_level: usize, min: Key, max: Key) -> Result<Self> {
        check_params(max_level, min, max)?;

        let head = Node::alloc(min, 0, max_level - 1);
        let tail = Node::alloc(max, 0, max_level - 1);
        // Safety: freshly allocated, exclusively owned
        unsafe {
            (*head).fully_linked.store(true, Ordering::Relaxed);
            (*tail).fully_linked.store(true, Ordering::Relaxed);
            for level in 0..max_level {
                (&(*head).next)[level].store(Shared::from_raw(tail), Ordering::Relaxed);
            }
        }

        Ok(Self {
            head,
            max_level,
            min,
            max,
            size: AtomicUsize::new(0),
        })
    }

    /// Unlocked search. Fills the scratch arrays and returns the highest
    /// level with an exact match.
    fn search(&self, key: Key, ws: &mut Workspace, guard: &EpochGuard) -> Option<usize> {
        let mut found = None;
        let mut pred = self.head;
        // Safety: epoch guard keeps traversed nodes alive
        unsafe {
            for level in (0..self.max_level).rev() {
                let mut curr = node_ref(pred).next[level].load(Ordering::Acquire, guard).as_ptr();
                while key > node_ref(curr).key {
                    pred = curr;
                    curr = node_ref(pred).next[level].load(Ordering::Acquire, guard).as_ptr();
                }
                if found.is_none() && key == node_ref(curr).key {
                    found = Some(level);
                }
                ws.preds[level] = pred;
                ws.succs[level] = curr;
            }
        }
        found
    }
}

impl ConcurrentSet for LazySkiplist {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, self.min, self.max) {
            return false;
        }
        let top_level = random_level(self.max_level);
        let guard = Epoch::pin();

        WORKSPACE.with(|ws| {
            let mut scratch = ws.borrow_mut();
            let ws = &mut *scratch;
            loop {
                if let Some(found_level) = self.search(key, ws, &guard) {
                    // Safety: guard pinned above
                    let found = unsafe { node_ref(ws.succs[found_level]) };
                    if !found.marked.load(Ordering::Acquire) {
                        // An in-flight insert of the same key counts as
                        // present once it is fully linked.
                        while !found.fully_linked.load(Ordering::Acquire) {
                            std::hint::spin_loop();
                        }
                        return false;
                    }
                    continue;
                }

                // Lock all predecessors bottom-up, validating at each level
                let mut guards: Vec<ReentrantMutexGuard<'_, ()>> = Vec::with_capacity(top_level + 1);
                let mut valid = true;
                for level in 0..=top_level {
                    // Safety: guard pinned above
                    unsafe {
                        let pred = node_ref(ws.preds[level]);
                        let succ = ws.succs[level];
                        guards.push(pred.mtx.lock());
                        valid = !pred.marked.load(Ordering::Acquire)
                            && !node_ref(succ).marked.load(Ordering::Acquire)
                            && pred.next[level].load(Ordering::Acquire, &guard).as_ptr() == succ;
                    }
                    if !valid {
                        break;
                    }
                }
                if !valid {
                    drop(guards);
                    continue;
                }

                // Splice in bottom-up, then publish via fully_linked
                let node = Node::alloc(key, val, top_level);
                // Safety: new node not yet shared; preds are locked
                unsafe {
                    for level in 0..=top_level {
                        (&(*node).next)[level]
                            .store(Shared::from_raw(ws.succs[level]), Ordering::Relaxed);
                    }
                    for level in 0..=top_level {
                        node_ref(ws.preds[level]).next[level]
                            .store(Shared::from_raw(node), Ordering::Release);
                    }
                    (*node).fully_linked.store(true, Ordering::Release);
                }
                self.size.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        })
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let guard = Epoch::pin();

        WORKSPACE.with(|ws| {
            let mut scratch = ws.borrow_mut();
            let ws = &mut *scratch;
            let mut victim_ptr = std::ptr::null_mut();
            let mut victim_guard: Option<ReentrantMutexGuard<'_, ()>> = None;
            let mut top_level = 0;

            loop {
                let found = self.search(key, ws, &guard);

                if victim_guard.is_none() {
                    let found_level = found?;
                    victim_ptr = ws.succs[found_level];
                    // Safety: guard pinned above
                    let victim = unsafe { node_ref(victim_ptr) };
                    let deletable = victim.fully_linked.load(Ordering::Acquire)
                        && victim.top_level == found_level
                        && !victim.marked.load(Ordering::Acquire);
                    if !deletable {
                        return None;
                    }
                    top_level = victim.top_level;

                    let vg = victim.mtx.lock();
                    if victim.marked.load(Ordering::Acquire) {
                        return None;
                    }
                    victim.marked.store(true, Ordering::Release);
                    victim_guard = Some(vg);
                }

                // Lock the predecessors and validate they still point at
                // the victim at every level.
                let mut guards: Vec<ReentrantMutexGuard<'_, ()>> = Vec::with_capacity(top_level + 1);
                let mut valid = true;
                for level in 0..=top_level {
                    // Safety: guard pinned above
                    unsafe {
                        let pred = node_ref(ws.preds[level]);
                        guards.push(pred.mtx.lock());
                        valid = !pred.marked.load(Ordering::Acquire)
                            && pred.next[level].load(Ordering::Acquire, &guard).as_ptr()
                                == victim_ptr;
                    }
                    if !valid {
                        break;
                    }
                }
                if !valid {
                    drop(guards);
                    continue;
                }

                // Unlink top-down
                // Safety: victim and all predecessors are locked
                unsafe {
                    let victim = node_ref(victim_ptr);
                    for level in (0..=top_level).rev() {
                        let succ = victim.next[level].load(Ordering::Acquire, &guard);
                        node_ref(ws.preds[level]).next[level].store(succ, Ordering::Release);
                    }
                    let val = victim.val;
                    drop(victim_guard);
                    drop(guards);
                    self.size.fetch_sub(1, Ordering::Relaxed);
                    Epoch::defer(victim_ptr);
                    return Some(val);
                }
            }
        })
    }

    fn contains(&self, key: Key) -> bool {
        let guard = Epoch::pin();
        WORKSPACE.with(|ws| {
            let mut scratch = ws.borrow_mut();
            let ws = &mut *scratch;
            match self.search(key, ws, &guard) {
                Some(level) => {
                    // Safety: guard pinned above
                    let found = unsafe { node_ref(ws.succs[level]) };
                    found.fully_linked.load(Ordering::Acquire)
                        && !found.marked.load(Ordering::Acquire)
                }
                None => false,
            }
        })
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Drop for LazySkiplist {
    fn drop(&mut self) {
        let guard = Epoch::pin();
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access during drop
            unsafe {
                let next = (&(*curr).next)[0].load(Ordering::Relaxed, &guard).as_ptr();
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_range_insert_and_descending_remove() {
        let sl = LazySkiplist::new(4, Key::MIN, Key::MAX).unwrap();

        for k in 1..=9 {
            assert!(sl.insert(k, k));
        }
        for k in 1..=9 {
            assert!(sl.contains(k));
        }
        assert!(!sl.contains(0));

        for k in (1..=9).rev() {
            assert_eq!(sl.remove(k), Some(k));
        }
        assert_eq!(sl.len(), 0);
    }

    #[test]
    fn test_duplicate_rejected() {
        let sl = LazySkiplist::new(4, Key::MIN, Key::MAX).unwrap();
        assert!(sl.insert(1, 10));
        assert!(!sl.insert(1, 11));
        assert_eq!(sl.remove(1), Some(10));
        assert_eq!(sl.remove(1), None);
    }

    #[test]
    fn test_multithreaded_checksum() {
        let sl = Arc::new(LazySkiplist::new(8, Key::MIN, Key::MAX).unwrap());
        let threads = 8i64;
        let items = 250i64;
        let mut handles = vec![];

        for t in 0..threads {
            let sl = Arc::clone(&sl);
            handles.push(thread::spawn(move || {
                let lo = t * items + 1;
                let hi = (t + 1) * items;
                for k in lo..=hi {
                    assert!(sl.insert(k, k));
                }
                let mut sum = 0;
                for k in lo..=hi {
                    sum += sl.remove(k).unwrap();
                }
                sum
            }));
        }

        let total: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let nm = threads * items;
        assert_eq!(total, nm * (nm + 1) / 2);
        assert_eq!(sl.len(), 0);
    }

    #[test]
    fn test_remove_race_single_winner() {
        for _ in 0..50 {
            let sl = Arc::new(LazySkiplist::new(4, Key::MIN, Key::MAX).unwrap());
            sl.insert(5, 55);

            let a = Arc::clone(&sl);
            let b = Arc::clone(&sl);
            let ha = thread::spawn(move || a.remove(5));
            let hb = thread::spawn(move || b.remove(5));
            let ra = ha.join().unwrap();
            let rb = hb.join().unwrap();

            assert!(ra.is_some() ^ rb.is_some());
            assert!(!sl.contains(5));
        }
    }
}
