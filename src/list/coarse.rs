// Copyright (c) 2025 Syncset Contributors
//
// Coarse-grained synchronized list
//
// One container-wide mutex serializes every operation. The linearization
// point of each operation is the lock acquisition.

use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use parking_lot::Mutex;

struct Node {
    key: Key,
    val: Value,
    next: *mut Node,
}

impl Node {
    fn sentinel(key: Key) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            val: 0,
            next: std::ptr::null_mut(),
        }))
    }
}

struct Inner {
    head: *mut Node,
    tail: *mut Node,
    len: usize,
}

// Safety: Inner is only touched through the container mutex
unsafe impl Send for Inner {}

impl Inner {
    fn new() -> Self {
        let head = Node::sentinel(MIN_KEY);
        let tail = Node::sentinel(MAX_KEY);
        // Safety: freshly allocated, exclusively owned
        unsafe {
            (*head).next = tail;
        }
        Self { head, tail, len: 0 }
    }

    /// Position the cursor so that `pred.key < key <= curr.key`
    fn locate(&self, key: Key) -> (*mut Node, *mut Node) {
        let mut pred = self.head;
        // Safety: list pointers are valid while the container lock is held
        unsafe {
            let mut curr = (*pred).next;
            while curr != self.tail && (*curr).key < key {
                pred = curr;
                curr = (*curr).next;
            }
            (pred, curr)
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access during drop; every node was Box-allocated
            unsafe {
                let next = (*curr).next;
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

/// Sorted linked list behind a single mutex
pub struct CoarseList {
    inner: Mutex<Inner>,
}

impl CoarseList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }
}

impl Default for CoarseList {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentSet for CoarseList {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        let mut inner = self.inner.lock();
        let (pred, curr) = inner.locate(key);
        // Safety: protected by the container lock
        unsafe {
            if curr != inner.tail && (*curr).key == key {
                return false;
            }
            let node = Box::into_raw(Box::new(Node {
                key,
                val,
                next: curr,
            }));
            (*pred).next = node;
        }
        inner.len += 1;
        true
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let mut inner = self.inner.lock();
        let (pred, curr) = inner.locate(key);
        // Safety: protected by the container lock
        unsafe {
            if curr == inner.tail || (*curr).key != key {
                return None;
            }
            (*pred).next = (*curr).next;
            inner.len -= 1;
            let node = Box::from_raw(curr);
            Some(node.val)
        }
    }

    fn contains(&self, key: Key) -> bool {
        let inner = self.inner.lock();
        let (_, curr) = inner.locate(key);
        // Safety: protected by the container lock
        unsafe { curr != inner.tail && (*curr).key == key }
    }

    fn len(&self) -> usize {
        self.inner.lock().len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_remove_contains() {
        let list = CoarseList::new();

        assert!(list.insert(3, 30));
        assert!(list.insert(1, 10));
        assert!(list.insert(2, 20));
        assert!(!list.insert(2, 99));
        assert_eq!(list.len(), 3);

        assert!(list.contains(1));
        assert!(!list.contains(4));

        assert_eq!(list.remove(2), Some(20));
        assert_eq!(list.remove(2), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_sentinels_rejected() {
        let list = CoarseList::new();
        assert!(!list.insert(MIN_KEY, 0));
        assert!(!list.insert(MAX_KEY, 0));
        assert!(!list.contains(MIN_KEY));
    }

    #[test]
    fn test_concurrent_disjoint_ranges() {
        let list = Arc::new(CoarseList::new());
        let mut handles = vec![];

        for t in 0..4i64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for k in (t * 100 + 1)..=(t + 1) * 100 {
                    assert!(list.insert(k, k));
                }
                for k in (t * 100 + 1)..=(t + 1) * 100 {
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
