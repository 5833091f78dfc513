// Copyright (c) 2025 Syncset Contributors
//
// Lock-free sorted list after Harris, "A Pragmatic Implementation of
// Non-Blocking Linked-Lists"
//
// Each node's `next` word carries a mark bit meaning "this node is
// logically deleted". Removal is two CASes: mark the victim's next, then
// swing the predecessor past it. `search` physically unsplices any run of
// marked nodes it encounters with a single CAS on the predecessor.

use crate::concurrent::epoch::Epoch;
use crate::concurrent::{AtomicMarkedPtr, MarkedPtr};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use std::sync::atomic::{AtomicUsize, Ordering};

struct Node {
    key: Key,
    val: Value,
    next: AtomicMarkedPtr<Node>,
}

impl Node {
    fn alloc(key: Key, val: Value) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            val,
            next: AtomicMarkedPtr::null(),
        }))
    }
}

// Safety: nodes reached through the list are kept alive by the epoch
// guard the caller holds.
unsafe fn node_ref<'a>(ptr: *mut Node) -> &'a Node {
    &*ptr
}

/// Lock-free sorted linked list (Harris)
pub struct HarrisList {
    head: *mut Node,
    tail: *mut Node,
    size: AtomicUsize,
}

unsafe impl Send for HarrisList {}
unsafe impl Sync for HarrisList {}

impl HarrisList {
    pub fn new() -> Self {
        let tail = Node::alloc(MAX_KEY, 0);
        let head = Node::alloc(MIN_KEY, 0);
        // Safety: freshly allocated, exclusively owned
        unsafe {
            (*head).next.store(MarkedPtr::new(tail), Ordering::Relaxed);
        }
        Self {
            head,
            tail,
            size: AtomicUsize::new(0),
        }
    }

    /// Locate `(pred, curr)` with `pred.key < key <= curr.key`, unsplicing
    /// any marked run found in between. Marked nodes are never rewritten in
    /// place; all bookkeeping uses local snapshots.
    ///
    /// Caller must hold an epoch guard.
    fn search(&self, key: Key) -> (*mut Node, *mut Node) {
        'again: loop {
            let mut pred = self.head;
            // Safety: epoch guard held by caller keeps traversed nodes alive
            unsafe {
                let mut pred_next = node_ref(pred).next.load(Ordering::Acquire);
                let mut t = pred;
                let mut t_next = pred_next;

                // 1: find pred and the first node with key >= `key`,
                //    skipping over nodes whose next is marked
                loop {
                    if !t_next.is_marked() {
                        pred = t;
                        pred_next = t_next;
                    }
                    t = t_next.ptr();
                    if t == self.tail {
                        break;
                    }
                    t_next = node_ref(t).next.load(Ordering::Acquire);
                    if !t_next.is_marked() && node_ref(t).key >= key {
                        break;
                    }
                }
                let curr = t;

                // 2: check the nodes are adjacent
                if pred_next.ptr() == curr {
                    if curr != self.tail && node_ref(curr).next.load(Ordering::Acquire).is_marked()
                    {
                        continue 'again;
                    }
                    return (pred, curr);
                }

                // 3: unsplice the whole marked run with one CAS
                if node_ref(pred)
                    .next
                    .compare_exchange(
                        pred_next,
                        MarkedPtr::new(curr),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // The nodes between pred_next and curr are now
                    // unreachable; retire them.
                    let mut garbage = pred_next.ptr();
                    while garbage != curr {
                        let next = node_ref(garbage).next.load(Ordering::Acquire).ptr();
                        Epoch::defer(garbage);
                        garbage = next;
                    }
                    if curr != self.tail && node_ref(curr).next.load(Ordering::Acquire).is_marked()
                    {
                        continue 'again;
                    }
                    return (pred, curr);
                }
            }
        }
    }
}

impl Default for HarrisList {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentSet for HarrisList {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        let _guard = Epoch::pin();
        let node = Node::alloc(key, val);
        loop {
            let (pred, curr) = self.search(key);
            // Safety: guard pinned above
            unsafe {
                if curr != self.tail && node_ref(curr).key == key {
                    drop(Box::from_raw(node));
                    return false;
                }
                node_ref(node).next.store(MarkedPtr::new(curr), Ordering::Relaxed);
                if node_ref(pred)
                    .next
                    .compare_exchange(
                        MarkedPtr::new(curr),
                        MarkedPtr::new(node),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.size.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
        }
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let _guard = Epoch::pin();
        loop {
            let (pred, curr) = self.search(key);
            // Safety: guard pinned above
            unsafe {
                if curr == self.tail || node_ref(curr).key != key {
                    return None;
                }
                let curr_next = node_ref(curr).next.load(Ordering::Acquire);
                if curr_next.is_marked() {
                    // Another remover won; let the next search unsplice it.
                    continue;
                }
                // Logical deletion: mark the victim's next pointer.
                if node_ref(curr)
                    .next
                    .compare_exchange(
                        curr_next,
                        curr_next.marked(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    continue;
                }
                let val = node_ref(curr).val;
                self.size.fetch_sub(1, Ordering::Relaxed);

                // Physical deletion: either we unsplice it here, or a
                // subsequent search does.
                if node_ref(pred)
                    .next
                    .compare_exchange(
                        MarkedPtr::new(curr),
                        MarkedPtr::new(curr_next.ptr()),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    Epoch::defer(curr);
                } else {
                    self.search(key);
                }
                return Some(val);
            }
        }
    }

    fn contains(&self, key: Key) -> bool {
        let _guard = Epoch::pin();
        let (_, curr) = self.search(key);
        // Safety: guard pinned above
        unsafe { curr != self.tail && node_ref(curr).key == key }
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Drop for HarrisList {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access during drop
            unsafe {
                let next = (*curr).next.load(Ordering::Relaxed).ptr();
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
    fn test_sequential_ops() {
        let list = HarrisList::new();

        assert!(list.insert(2, 20));
        assert!(list.insert(1, 10));
        assert!(list.insert(3, 30));
        assert!(!list.insert(2, 22));

        assert!(list.contains(1));
        assert!(list.contains(3));
        assert!(!list.contains(4));

        assert_eq!(list.remove(2), Some(20));
        assert_eq!(list.remove(2), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_race_single_winner() {
        for _ in 0..100 {
            let list = Arc::new(HarrisList::new());
            list.insert(5, 55);

            let a = Arc::clone(&list);
            let b = Arc::clone(&list);
            let ha = thread::spawn(move || a.remove(5));
            let hb = thread::spawn(move || b.remove(5));
            let ra = ha.join().unwrap();
            let rb = hb.join().unwrap();

            assert!(ra.is_some() ^ rb.is_some());
            assert_eq!(ra.or(rb), Some(55));
            assert!(!list.contains(5));
        }
    }

    #[test]
    fn test_concurrent_disjoint_workload() {
        let list = Arc::new(HarrisList::new());
        let mut handles = vec![];

        for t in 0..8i64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                let lo = t * 500 + 1;
                let hi = (t + 1) * 500;
                for k in lo..=hi {
                    assert!(list.insert(k, k));
                }
                let mut sum = 0;
                for k in lo..=hi {
                    sum += list.remove(k).unwrap();
                }
                assert_eq!(sum, (lo + hi) * 500 / 2);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_contended_same_keys() {
        let list = Arc::new(HarrisList::new());
        let mut handles = vec![];

        for _ in 0..4 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for k in 1..=100i64 {
                    list.insert(k, k);
                    list.remove(k);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        for k in 1..=100i64 {
            list.remove(k);
        }
        for k in 1..=100i64 {
            assert!(!list.contains(k));
        }
    }
}
