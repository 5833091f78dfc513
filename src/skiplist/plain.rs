// Copyright (c) 2025 Syncset Contributors
//
// Skiplist behind a single container mutex
//
// The search subroutine fills the container-owned preds/succs arrays with
// the predecessor and successor of the key position at every level and
// reports the highest level holding an exact match. All of it runs under
// the one lock, so the scratch arrays can live in the container itself.

use super::{check_params, random_level};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value};
use crate::error::Result;
use parking_lot::Mutex;

struct Node {
    key: Key,
    val: Value,
    top_level: usize,
    next: Vec<*mut Node>,
}

impl Node {
    fn alloc(key: Key, val: Value, top_level: usize) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            val,
            top_level,
            next: vec![std::ptr::null_mut(); top_level + 1],
        }))
    }
}

struct Inner {
    head: *mut Node,
    max_level: usize,
    preds: Vec<*mut Node>,
    succs: Vec<*mut Node>,
    len: usize,
}

// Safety: Inner is only touched through the container mutex
unsafe impl Send for Inner {}

impl Inner {
    /// Fill preds/succs for `key` and return the highest level with an
    /// exact match, or `None`.
    fn search(&mut self, key: Key) -> Option<usize> {
        let mut found = None;
        let mut pred = self.head;
        // Safety: all nodes are valid while the container lock is held
        unsafe {
            for level in (0..self.max_level).rev() {
                let mut curr = (&(*pred).next)[level];
                while key > (*curr).key {
                    pred = curr;
                    curr = (&(*pred).next)[level];
                }
                if found.is_none() && key == (*curr).key {
                    found = Some(level);
                }
                self.preds[level] = pred;
                self.succs[level] = curr;
            }
        }
        found
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access during drop
            unsafe {
                let next = (&(*curr).next)[0];
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}

/// Randomized skiplist serialized by one mutex
pub struct PlainSkiplist {
    inner: Mutex<Inner>,
    min: Key,
    max: Key,
}

impl PlainSkiplist {
    pub fn new(max_level: usize, min: Key, max: Key) -> Result<Self> {
        check_params(max_level, min, max)?;

        let head = Node::alloc(min, 0, max_level - 1);
        let tail = Node::alloc(max, 0, max_level - 1);
        // Safety: freshly allocated, exclusively owned
        unsafe {
            for level in 0..max_level {
                (&mut (*head).next)[level] = tail;
            }
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                head,
                max_level,
                preds: vec![std::ptr::null_mut(); max_level],
                succs: vec![std::ptr::null_mut(); max_level],
                len: 0,
            }),
            min,
            max,
        })
    }
}

impl ConcurrentSet for PlainSkiplist {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, self.min, self.max) {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.search(key).is_some() {
            return false;
        }
        let top_level = random_level(inner.max_level);
        let node = Node::alloc(key, val, top_level);
        // Safety: protected by the container lock
        unsafe {
            for level in 0..=top_level {
                (&mut (*node).next)[level] = inner.succs[level];
                (&mut (*inner.preds[level]).next)[level] = node;
            }
        }
        inner.len += 1;
        true
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let mut inner = self.inner.lock();
        inner.search(key)?;
        // Safety: protected by the container lock
        unsafe {
            let victim = inner.succs[0];
            debug_assert_eq!((*victim).key, key);
            for level in (0..=(*victim).top_level).rev() {
                (&mut (*inner.preds[level]).next)[level] = (&(*victim).next)[level];
            }
            inner.len -= 1;
            let node = Box::from_raw(victim);
            Some(node.val)
        }
    }

    fn contains(&self, key: Key) -> bool {
        self.inner.lock().search(key).is_some()
    }

    fn len(&self) -> usize {
        self.inner.lock().len
    }
}
