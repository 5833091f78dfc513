// Copyright (c) 2025 Syncset Contributors
//
// Lock-free skiplist after Herlihy and Shavit, "A Lock-Free Concurrent
// Skiplist with Wait-Free Search"
//
// Every level of a node's tower is a marked reference: the mark means the
// node is deleted at that level. A node enters the set when the bottom
// level CAS links it, and leaves it when the bottom level mark CAS
// succeeds; upper levels are bookkeeping. Search physically unsplices any
// marked towers it passes.

use super::{check_params, random_level};
use crate::concurrent::epoch::Epoch;
use crate::concurrent::{AtomicMarkedPtr, MarkedPtr};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_LEVEL};
use crate::error::Result;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

struct Node {
    key: Key,
    val: Value,
    top_level: usize,
    tower: Vec<AtomicMarkedPtr<Node>>,
}

impl Node {
    fn alloc(key: Key, val: Value, top_level: usize) -> *mut Node {
        let mut tower = Vec::with_capacity(top_level + 1);
        for _ in 0..=top_level {
            tower.push(AtomicMarkedPtr::null());
        }
        Box::into_raw(Box::new(Node {
            key,
            val,
            top_level,
            tower,
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

/// Lock-free skiplist (Herlihy-Shavit)
pub struct LockFreeSkiplist {
    head: *mut Node,
    max_level: usize,
    min: Key,
    max: Key,
    size: AtomicUsize,
    insert_count: AtomicU64,
    remove_count: AtomicU64,
    search_count: AtomicU64,
}

unsafe impl Send for LockFreeSkiplist {}
unsafe impl Sync for LockFreeSkiplist {}

/// Operation counters for the lock-free skiplist
#[derive(Debug, Clone, Copy)]
pub struct SkiplistStats {
    pub size: usize,
    pub inserts: u64,
    pub removes: u64,
    pub searches: u64,
}

impl LockFreeSkiplist {
    pub fn new(max_level: usize, min: Key, max: Key) -> Result<Self> {
        check_params(max_level, min, max)?;

        let head = Node::alloc(min, 0, max_level - 1);
        let tail = Node::alloc(max, 0, max_level - 1);
        // Safety: freshly allocated, exclusively owned
        unsafe {
            for level in 0..max_level {
                (&(*head).tower)[level].store(MarkedPtr::new(tail), Ordering::Relaxed);
            }
        }

        Ok(Self {
            head,
            max_level,
            min,
            max,
            size: AtomicUsize::new(0),
            insert_count: AtomicU64::new(0),
            remove_count: AtomicU64::new(0),
            search_count: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> SkiplistStats {
        SkiplistStats {
            size: self.size.load(Ordering::Relaxed),
            inserts: self.insert_count.load(Ordering::Relaxed),
            removes: self.remove_count.load(Ordering::Relaxed),
            searches: self.search_count.load(Ordering::Relaxed),
        }
    }

    /// Fill preds/succs for `key`, unsplicing marked towers on the way.
    /// Returns whether an exact match sits at the bottom level.
    ///
    /// Caller must hold an epoch guard.
    fn search(&self, key: Key, ws: &mut Workspace) -> bool {
        'retry: loop {
            let mut pred = self.head;
            // Safety: epoch guard held by caller
            unsafe {
                for level in (0..self.max_level).rev() {
                    let mut curr = node_ref(pred).tower[level].load(Ordering::Acquire).ptr();
                    loop {
                        let curr_link = node_ref(curr).tower[level].load(Ordering::Acquire);
                        let mut succ = curr_link.ptr();
                        let mut marked = curr_link.is_marked();

                        while marked {
                            // curr is deleted at this level; unsplice it
                            if node_ref(pred).tower[level]
                                .compare_exchange(
                                    MarkedPtr::new(curr),
                                    MarkedPtr::new(succ),
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_err()
                            {
                                continue 'retry;
                            }
                            curr = node_ref(pred).tower[level].load(Ordering::Acquire).ptr();
                            let link = node_ref(curr).tower[level].load(Ordering::Acquire);
                            succ = link.ptr();
                            marked = link.is_marked();
                        }

                        if node_ref(curr).key < key {
                            pred = curr;
                            curr = succ;
                        } else {
                            break;
                        }
                    }
                    ws.preds[level] = pred;
                    ws.succs[level] = curr;
                }
                return node_ref(ws.succs[0]).key == key;
            }
        }
    }
}

impl ConcurrentSet for LockFreeSkiplist {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, self.min, self.max) {
            return false;
        }
        let top_level = random_level(self.max_level);
        let _guard = Epoch::pin();

        WORKSPACE.with(|ws| {
            let mut scratch = ws.borrow_mut();
            let ws = &mut *scratch;
            loop {
                if self.search(key, ws) {
                    return false;
                }

                let node = Node::alloc(key, val, top_level);
                // Safety: guard pinned above; node not yet published
                unsafe {
                    for level in 0..=top_level {
                        (&(*node).tower)[level]
                            .store(MarkedPtr::new(ws.succs[level]), Ordering::Relaxed);
                    }

                    // Bottom-level CAS is the linearization point
                    if node_ref(ws.preds[0]).tower[0]
                        .compare_exchange(
                            MarkedPtr::new(ws.succs[0]),
                            MarkedPtr::new(node),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        drop(Box::from_raw(node));
                        continue;
                    }
                    self.size.fetch_add(1, Ordering::Relaxed);
                    self.insert_count.fetch_add(1, Ordering::Relaxed);

                    // Link the upper levels, refreshing preds/succs on
                    // contention and bailing out if the node has been
                    // deleted under us.
                    for level in 1..=top_level {
                        loop {
                            let link = (&(*node).tower)[level].load(Ordering::Acquire);
                            if link.is_marked() {
                                return true;
                            }
                            if link.ptr() != ws.succs[level]
                                && (&(*node).tower)[level]
                                    .compare_exchange(
                                        link,
                                        MarkedPtr::new(ws.succs[level]),
                                        Ordering::AcqRel,
                                        Ordering::Acquire,
                                    )
                                    .is_err()
                            {
                                // Marked while we were relinking
                                return true;
                            }
                            if node_ref(ws.preds[level]).tower[level]
                                .compare_exchange(
                                    MarkedPtr::new(ws.succs[level]),
                                    MarkedPtr::new(node),
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                            {
                                // A deleter may have marked this level
                                // between our load and the link; make sure
                                // the tower gets unspliced in that case.
                                if (&(*node).tower)[level].load(Ordering::Acquire).is_marked() {
                                    self.search(key, ws);
                                    return true;
                                }
                                break;
                            }
                            self.search(key, ws);
                        }
                    }
                    return true;
                }
            }
        })
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let _guard = Epoch::pin();

        WORKSPACE.with(|ws| {
            let mut scratch = ws.borrow_mut();
            let ws = &mut *scratch;
            loop {
                if !self.search(key, ws) {
                    return None;
                }
                let victim_ptr = ws.succs[0];
                // Safety: guard pinned above
                let victim = unsafe { node_ref(victim_ptr) };

                // Mark the upper levels top-down
                for level in (1..=victim.top_level).rev() {
                    loop {
                        let link = victim.tower[level].load(Ordering::Acquire);
                        if link.is_marked() {
                            break;
                        }
                        let _ = victim.tower[level].compare_exchange(
                            link,
                            link.marked(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                }

                // The bottom-level mark CAS decides the race
                loop {
                    let link = victim.tower[0].load(Ordering::Acquire);
                    if link.is_marked() {
                        // Another remover won
                        return None;
                    }
                    if victim.tower[0]
                        .compare_exchange(
                            link,
                            link.marked(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let val = victim.val;
                        self.size.fetch_sub(1, Ordering::Relaxed);
                        self.remove_count.fetch_add(1, Ordering::Relaxed);
                        // Unsplice the victim everywhere, then retire it
                        self.search(key, ws);
                        Epoch::defer(victim_ptr);
                        return Some(val);
                    }
                }
            }
        })
    }

    /// Wait-free in the absence of marked towers on the path; never CASes
    fn contains(&self, key: Key) -> bool {
        self.search_count.fetch_add(1, Ordering::Relaxed);
        let _guard = Epoch::pin();
        let mut pred = self.head;
        // Safety: guard pinned above
        unsafe {
            for level in (0..self.max_level).rev() {
                let mut curr = node_ref(pred).tower[level].load(Ordering::Acquire).ptr();
                loop {
                    let link = node_ref(curr).tower[level].load(Ordering::Acquire);
                    if link.is_marked() {
                        // Skip deleted nodes without unsplicing them
                        curr = link.ptr();
                        continue;
                    }
                    if node_ref(curr).key < key {
                        pred = curr;
                        curr = link.ptr();
                    } else {
                        break;
                    }
                }
                if node_ref(curr).key == key {
                    return !node_ref(curr).tower[0].load(Ordering::Acquire).is_marked();
                }
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Drop for LockFreeSkiplist {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access during drop
            unsafe {
                let next = (&(*curr).tower)[0].load(Ordering::Relaxed).ptr();
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
        let sl = LockFreeSkiplist::new(4, Key::MIN, Key::MAX).unwrap();

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
        let sl = LockFreeSkiplist::new(4, Key::MIN, Key::MAX).unwrap();
        assert!(sl.insert(9, 90));
        assert!(!sl.insert(9, 91));
        assert_eq!(sl.remove(9), Some(90));
        assert_eq!(sl.remove(9), None);
    }

    #[test]
    fn test_stats_count_successful_ops() {
        let sl = LockFreeSkiplist::new(4, Key::MIN, Key::MAX).unwrap();
        sl.insert(1, 10);
        sl.insert(2, 20);
        sl.insert(1, 11);
        sl.remove(1);
        sl.contains(2);

        let stats = sl.stats();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.searches, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_remove_race_single_winner() {
        for _ in 0..100 {
            let sl = Arc::new(LockFreeSkiplist::new(4, Key::MIN, Key::MAX).unwrap());
            sl.insert(5, 55);

            let a = Arc::clone(&sl);
            let b = Arc::clone(&sl);
            let ha = thread::spawn(move || a.remove(5));
            let hb = thread::spawn(move || b.remove(5));
            let ra = ha.join().unwrap();
            let rb = hb.join().unwrap();

            assert!(ra.is_some() ^ rb.is_some());
            assert_eq!(ra.or(rb), Some(55));
            assert!(!sl.contains(5));
        }
    }

    #[test]
    fn test_multithreaded_checksum() {
        let sl = Arc::new(LockFreeSkiplist::new(8, Key::MIN, Key::MAX).unwrap());
        let threads = 8i64;
        let items = 300i64;
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
    fn test_contended_same_range() {
        let sl = Arc::new(LockFreeSkiplist::new(8, Key::MIN, Key::MAX).unwrap());
        let mut handles = vec![];

        for _ in 0..4 {
            let sl = Arc::clone(&sl);
            handles.push(thread::spawn(move || {
                for k in 1..=200i64 {
                    sl.insert(k, k);
                    sl.remove(k);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        for k in 1..=200i64 {
            sl.remove(k);
        }
        for k in 1..=200i64 {
            assert!(!sl.contains(k));
        }
    }
}
