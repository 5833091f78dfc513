// Copyright (c) 2025 Syncset Contributors
//
// Lock-free sorted list after Fomitchev and Ruppert, "Lock-Free Linked
// Lists and Skip Lists"
//
// The successor word of every node carries two bits: mark ("this node is
// logically deleted") and flag ("this node's successor is being removed").
// A node also records a backlink to the predecessor that flagged it, so
// threads that run into a marked predecessor can walk backwards instead of
// restarting the search from the head.
//
// Deletion protocol: flag the predecessor, set the victim's backlink, mark
// the victim, then swing the predecessor's successor word past the victim
// and clear the flag in the same CAS.

use crate::concurrent::epoch::Epoch;
use crate::concurrent::{AtomicMarkedPtr, MarkedPtr};
use crate::core::{key_in_bounds, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node {
    key: Key,
    val: Value,
    succ: AtomicMarkedPtr<Node>,
    backlink: AtomicPtr<Node>,
}

impl Node {
    fn alloc(key: Key, val: Value) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            val,
            succ: AtomicMarkedPtr::null(),
            backlink: AtomicPtr::new(std::ptr::null_mut()),
        }))
    }
}

// Safety: nodes reached through the list (including via backlinks) are
// kept alive by the epoch guard the caller holds.
unsafe fn node_ref<'a>(ptr: *mut Node) -> &'a Node {
    &*ptr
}

/// Lock-free sorted linked list with backlinks (Fomitchev-Ruppert)
pub struct FomitchevList {
    head: *mut Node,
    tail: *mut Node,
    size: AtomicUsize,
}

unsafe impl Send for FomitchevList {}
unsafe impl Sync for FomitchevList {}

impl FomitchevList {
    pub fn new() -> Self {
        let tail = Node::alloc(MAX_KEY, 0);
        let head = Node::alloc(MIN_KEY, 0);
        // Safety: freshly allocated, exclusively owned
        unsafe {
            (*head).succ.store(MarkedPtr::new(tail), Ordering::Relaxed);
        }
        Self {
            head,
            tail,
            size: AtomicUsize::new(0),
        }
    }

    /// Walk from `start` to `(curr, next)` with `curr.key < key <= next.key`,
    /// helping to complete any deletions encountered along the way.
    ///
    /// Caller must hold an epoch guard and guarantee `start.key < key`.
    unsafe fn search_from(&self, key: Key, start: *mut Node) -> (*mut Node, *mut Node) {
        let mut curr = start;
        let mut next = node_ref(curr).succ.load(Ordering::Acquire).ptr();

        while node_ref(next).key < key {
            // Skip over successors that are already marked
            loop {
                let next_succ = node_ref(next).succ.load(Ordering::Acquire);
                if !next_succ.is_marked() {
                    break;
                }
                let curr_succ = node_ref(curr).succ.load(Ordering::Acquire);
                if curr_succ.is_marked() && curr_succ.ptr() == next {
                    break;
                }
                if curr_succ.ptr() == next {
                    self.help_marked(curr, next);
                }
                next = node_ref(curr).succ.load(Ordering::Acquire).ptr();
            }
            if node_ref(next).key < key {
                curr = next;
                next = node_ref(curr).succ.load(Ordering::Acquire).ptr();
            }
        }

        (curr, next)
    }

    /// Physically unsplice the marked `del` from `prev`, clearing the flag
    /// with the same CAS. The winner retires the victim.
    unsafe fn help_marked(&self, prev: *mut Node, del: *mut Node) {
        let next = node_ref(del).succ.load(Ordering::Acquire).ptr();
        if node_ref(prev)
            .succ
            .compare_exchange(
                MarkedPtr::new(del).flagged(),
                MarkedPtr::new(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            Epoch::defer(del);
        }
    }

    /// Finish a deletion whose predecessor is already flagged: record the
    /// backlink, mark the victim, then unsplice it.
    unsafe fn help_flagged(&self, prev: *mut Node, del: *mut Node) {
        node_ref(del).backlink.store(prev, Ordering::Release);
        if !node_ref(del).succ.load(Ordering::Acquire).is_marked() {
            self.try_mark(del);
        }
        self.help_marked(prev, del);
    }

    /// Set the mark bit of `del`'s successor word, helping any flagged
    /// successor out of the way first.
    unsafe fn try_mark(&self, del: *mut Node) {
        loop {
            let succ = node_ref(del).succ.load(Ordering::Acquire);
            if succ.is_marked() {
                return;
            }
            if succ.is_flagged() {
                self.help_flagged(del, succ.ptr());
                continue;
            }
            if node_ref(del)
                .succ
                .compare_exchange(succ, succ.marked(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Flag `prev` as the node whose successor (`target`) is being removed.
    ///
    /// Returns the predecessor that ended up flagged (if the target is
    /// still in the list) and whether this thread won the flag.
    unsafe fn try_flag(
        &self,
        mut prev: *mut Node,
        target: *mut Node,
    ) -> (Option<*mut Node>, bool) {
        loop {
            let prev_succ = node_ref(prev).succ.load(Ordering::Acquire);
            if prev_succ.ptr() == target && !prev_succ.is_marked() && prev_succ.is_flagged() {
                // Already flagged by someone else
                return (Some(prev), false);
            }
            if node_ref(prev)
                .succ
                .compare_exchange(
                    MarkedPtr::new(target),
                    MarkedPtr::new(target).flagged(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return (Some(prev), true);
            }
            let result = node_ref(prev).succ.load(Ordering::Acquire);
            if result.ptr() == target && !result.is_marked() && result.is_flagged() {
                return (Some(prev), false);
            }
            // prev may itself have been deleted; back up to a live node
            while node_ref(prev).succ.load(Ordering::Acquire).is_marked() {
                prev = node_ref(prev).backlink.load(Ordering::Acquire);
            }
            let (new_prev, del) = self.search_from(node_ref(target).key, prev);
            if del != target {
                // Target already removed from the list
                return (None, false);
            }
            prev = new_prev;
        }
    }
}

impl Default for FomitchevList {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentSet for FomitchevList {
    fn insert(&self, key: Key, val: Value) -> bool {
        if !key_in_bounds(key, MIN_KEY, MAX_KEY) {
            return false;
        }
        let _guard = Epoch::pin();
        // Safety: guard pinned above
        unsafe {
            let (mut prev, mut next) = self.search_from(key, self.head);
            if node_ref(next).key == key {
                return false;
            }
            let node = Node::alloc(key, val);
            loop {
                let prev_succ = node_ref(prev).succ.load(Ordering::Acquire);
                if prev_succ.is_flagged() {
                    self.help_flagged(prev, prev_succ.ptr());
                } else {
                    node_ref(node).succ.store(MarkedPtr::new(next), Ordering::Relaxed);
                    if node_ref(prev)
                        .succ
                        .compare_exchange(
                            MarkedPtr::new(next),
                            MarkedPtr::new(node),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.size.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    let result = node_ref(prev).succ.load(Ordering::Acquire);
                    if !result.is_marked() && result.is_flagged() {
                        self.help_flagged(prev, result.ptr());
                    }
                    while node_ref(prev).succ.load(Ordering::Acquire).is_marked() {
                        prev = node_ref(prev).backlink.load(Ordering::Acquire);
                    }
                }
                let (p, n) = self.search_from(key, prev);
                prev = p;
                next = n;
                if node_ref(next).key == key {
                    drop(Box::from_raw(node));
                    return false;
                }
            }
        }
    }

    fn remove(&self, key: Key) -> Option<Value> {
        let _guard = Epoch::pin();
        // Safety: guard pinned above
        unsafe {
            let (prev, del) = self.search_from(key, self.head);
            if node_ref(del).key != key {
                return None;
            }
            let (result_node, won) = self.try_flag(prev, del);
            if let Some(flagged_prev) = result_node {
                self.help_flagged(flagged_prev, del);
            }
            if !won {
                return None;
            }
            self.size.fetch_sub(1, Ordering::Relaxed);
            Some(node_ref(del).val)
        }
    }

    fn contains(&self, key: Key) -> bool {
        let _guard = Epoch::pin();
        // Safety: guard pinned above
        unsafe {
            let (_, next) = self.search_from(key, self.head);
            node_ref(next).key == key
        }
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Drop for FomitchevList {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access during drop
            unsafe {
                let next = (*curr).succ.load(Ordering::Relaxed).ptr();
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
    }
}
