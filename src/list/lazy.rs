// Copyright (c) 2025 Syncset Contributors
//
// Lazy synchronized list (optimistic locking with validation)
//
// Traversal takes no locks. At the destination the operation locks `pred`
// then `curr` and validates that neither is marked and that they are still
// adjacent; on failure it retries from the head. Removal marks the victim
// before unsplicing it, so the wait-free `contains` can rely on the mark
// alone. Unlinked nodes are retired through the epoch scheme because
// readers may still be traversing them.

use crate::concurrent::epoch::{Atomic, Epoch, Owned, Shared};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct Node {
    key: Key,
    val: Value,
    marked: AtomicBool,
    mtx: Mutex<()>,
    next: Atomic<Node>,
}

impl Node {
    fn new(key: Key, val: Value) -> Self {
        Self {
            key,
            val,
            marked: AtomicBool::new(false),
            mtx: Mutex::new(()),
            next: Atomic::null(),
        }
    }
}

/// Sorted linked list with optimistic traversal and lazy deletion
pub struct LazyList {
    head: *mut Node,
    size: AtomicUsize,
}

unsafe impl Send for LazyList {}
unsafe impl Sync for LazyList {}

impl LazyList {
    pub fn new() -> Self {
        let tail = Owned::new(Node::new(MAX_KEY, 0)).into_shared();
        let head_node = Node::new(MIN_KEY, 0);
        head_node.next.store(tail, Ordering::Relaxed);
        Self {
            head: Box::into_raw(Box::new(head_node)),
            size: AtomicUsize::new(0),
        }
    }

    /// Unlocked traversal to `pred.key < key <= curr.key`
    fn locate<'g>(
        &self,
        key: Key,
        guard: &'g crate::concurrent::epoch::EpochGuard,
    ) -> (Shared<'g, Node>, Shared<'g, Node>) {
        let mut pred = Shared::from_raw(self.head);
        let mut curr = pred.as_ref().expect("head").next.load(Ordering::Acquire, guard);
        loop {
            let curr_ref = curr.as_ref().expect("tail bounds traversal");
            if curr_ref.key >= key {
                return (pred, curr);
            }
            pred = curr;
            curr = curr_ref.next.load(Ordering::Acquire, guard);
        }
    }

    fn validate(pred: &Node, curr: Shared<'_, Node>, guard: &crate::concurrent::epoch::EpochGuard) -> bool {
        let curr_ref = curr.as_ref().expect("validated node");
        !pred.marked.load(Ordering::Acquire)
            && !curr_ref.marked.load(Ordering::Acquire)
            && pred.next.load(Ordering::Acquire, guard) == curr
    }
}

impl Default for LazyList {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentSet for LazyList {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        let guard = Epoch::pin();
        loop {
            let (pred, curr) = self.locate(key, &guard);
            let pred_ref = pred.as_ref().expect("pred");
            let _pred_lock = pred_ref.mtx.lock();
            let _curr_lock = curr.as_ref().expect("curr").mtx.lock();

            if !Self::validate(pred_ref, curr, &guard) {
                continue;
            }
            if curr.as_ref().expect("curr").key == key {
                return false;
            }
            let node = Node::new(key, val);
            node.next.store(curr, Ordering::Relaxed);
            pred_ref.next.store(Owned::new(node).into_shared(), Ordering::Release);
            self.size.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let guard = Epoch::pin();
        loop {
            let (pred, curr) = self.locate(key, &guard);
            let pred_ref = pred.as_ref().expect("pred");
            let curr_ref = curr.as_ref().expect("curr");
            let pred_lock = pred_ref.mtx.lock();
            let curr_lock = curr_ref.mtx.lock();

            if !Self::validate(pred_ref, curr, &guard) {
                drop(curr_lock);
                drop(pred_lock);
                continue;
            }
            if curr_ref.key != key {
                return None;
            }

            // Logical removal first, then the unsplice; readers that
            // already reached `curr` see the mark.
            curr_ref.marked.store(true, Ordering::Release);
            let next = curr_ref.next.load(Ordering::Acquire, &guard);
            pred_ref.next.store(next, Ordering::Release);
            self.size.fetch_sub(1, Ordering::Relaxed);
            let val = curr_ref.val;

            drop(curr_lock);
            drop(pred_lock);
            Epoch::defer(curr.as_ptr());
            return Some(val);
        }
    }

    /// Wait-free membership test: one unlocked pass, decided by the mark
    fn contains(&self, key: Key) -> bool {
        let guard = Epoch::pin();
        let (_, curr) = self.locate(key, &guard);
        let curr_ref = curr.as_ref().expect("curr");
        curr_ref.key == key && !curr_ref.marked.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Drop for LazyList {
    fn drop(&mut self) {
        let guard = Epoch::pin();
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access during drop
            unsafe {
                let next = (*curr).next.load(Ordering::Relaxed, &guard).as_ptr();
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
        let list = LazyList::new();

        assert!(list.insert(10, 100));
        assert!(list.insert(20, 200));
        assert!(!list.insert(10, 111));
        assert!(list.contains(10));
        assert!(!list.contains(15));
        assert_eq!(list.remove(10), Some(100));
        assert!(!list.contains(10));
        assert_eq!(list.remove(10), None);
    }

    #[test]
    fn test_remove_race_single_winner() {
        for _ in 0..50 {
            let list = Arc::new(LazyList::new());
            list.insert(5, 55);

            let a = Arc::clone(&list);
            let b = Arc::clone(&list);
            let ha = thread::spawn(move || a.remove(5));
            let hb = thread::spawn(move || b.remove(5));
            let ra = ha.join().unwrap();
            let rb = hb.join().unwrap();

            assert!(ra.is_some() ^ rb.is_some());
            assert!(!list.contains(5));
        }
    }

    #[test]
    fn test_concurrent_workload() {
        let list = Arc::new(LazyList::new());
        let mut handles = vec![];

        for t in 0..8i64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                let lo = t * 250 + 1;
                let hi = (t + 1) * 250;
                for k in lo..=hi {
                    assert!(list.insert(k, k));
                }
                for k in lo..=hi {
                    assert!(list.contains(k));
                }
                for k in lo..=hi {
                    assert_eq!(list.remove(k), Some(k));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(list.len(), 0);
    }
}
