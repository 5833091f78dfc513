// Copyright (c) 2025 Syncset Contributors
//
// LL/SC-emulation queue after Doherty, Herlihy, Luchangco and Moir,
// "Bringing Practical Lock-Free Synchronization to 64-Bit Applications"
//
// On 64-bit targets a pointer plus a full-width version counter no longer
// fit in one CAS word, so head and tail are emulated LL/SC variables: two
// candidate slots plus an entry tag (version, outstanding-LL count). The
// current pointer is slot 0 on even versions, slot 1 on odd ones. An SC
// writes the new node into the non-current slot and bumps the version;
// the outstanding-LL count is transferred into the departing node's exit
// tag, and the node is reclaimed only when its exit tag shows no
// outstanding references, no pending transfers, a successor that no
// longer names it as predecessor, and an explicit to-be-freed mark.

use crate::concurrent::Backoff;
use crate::core::{ConcurrentQueue, Value};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Entry tag of an LL/SC variable: version and outstanding-LL count
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct EntryTag {
    ver: u32,
    count: u32,
}

impl EntryTag {
    fn pack(self) -> u64 {
        (u64::from(self.ver) << 32) | u64::from(self.count)
    }

    fn unpack(raw: u64) -> Self {
        Self {
            ver: (raw >> 32) as u32,
            count: raw as u32,
        }
    }
}

/// Exit tag of a node: reference accounting that gates reclamation
#[derive(Clone, Copy, Debug)]
struct ExitTag {
    count: i32,
    transfers_left: u8,
    nl_pred: bool,
    to_be_freed: bool,
}

impl ExitTag {
    fn new(transfers_left: u8) -> Self {
        Self {
            count: 0,
            transfers_left,
            nl_pred: false,
            to_be_freed: false,
        }
    }

    fn clean(&self) -> bool {
        self.count == 0 && self.transfers_left == 0
    }

    fn freeable(&self) -> bool {
        self.clean() && self.nl_pred && self.to_be_freed
    }

    fn pack(self) -> u64 {
        (u64::from(self.count as u32) << 32)
            | (u64::from(self.transfers_left) << 2)
            | (u64::from(self.nl_pred) << 1)
            | u64::from(self.to_be_freed)
    }

    fn unpack(raw: u64) -> Self {
        Self {
            count: (raw >> 32) as u32 as i32,
            transfers_left: ((raw >> 2) & 0b11) as u8,
            nl_pred: (raw >> 1) & 1 == 1,
            to_be_freed: raw & 1 == 1,
        }
    }
}

struct Node {
    val: Value,
    next: AtomicPtr<Node>,
    pred: AtomicPtr<Node>,
    exit: AtomicU64,
}

impl Node {
    fn alloc(val: Value, transfers_left: u8) -> *mut Node {
        Box::into_raw(Box::new(Node {
            val,
            next: AtomicPtr::new(std::ptr::null_mut()),
            pred: AtomicPtr::new(std::ptr::null_mut()),
            exit: AtomicU64::new(ExitTag::new(transfers_left).pack()),
        }))
    }
}

// Safety: a node returned by `ll` is protected by the LL credit accounted
// in the entry tag until the matching `sc`/`unlink` releases it.
unsafe fn node_ref<'a>(ptr: *mut Node) -> &'a Node {
    &*ptr
}

/// An emulated LL/SC variable over a node pointer
struct LlScVar {
    ptr0: AtomicPtr<Node>,
    ptr1: AtomicPtr<Node>,
    entry: AtomicU64,
}

impl LlScVar {
    fn new(current: *mut Node, noncurrent: *mut Node) -> Self {
        Self {
            ptr0: AtomicPtr::new(current),
            ptr1: AtomicPtr::new(noncurrent),
            entry: AtomicU64::new(EntryTag { ver: 0, count: 0 }.pack()),
        }
    }

    fn slot(&self, ver: u32) -> &AtomicPtr<Node> {
        if ver % 2 == 0 {
            &self.ptr0
        } else {
            &self.ptr1
        }
    }

    fn noncurrent_slot(&self, ver: u32) -> &AtomicPtr<Node> {
        self.slot(ver.wrapping_add(1))
    }
}

/// Load-linked: read the current node and register one credit in the
/// entry tag so the node cannot be reclaimed under us.
fn ll(loc: &LlScVar) -> (*mut Node, u32) {
    loop {
        let e = EntryTag::unpack(loc.entry.load(Ordering::Acquire));
        let node = loc.slot(e.ver).load(Ordering::Acquire);
        let bumped = EntryTag {
            ver: e.ver,
            count: e.count.wrapping_add(1),
        };
        if loc
            .entry
            .compare_exchange(e.pack(), bumped.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return (node, e.ver);
        }
    }
}

/// Store-conditional: install `new` and retire the node we LL-ed,
/// transferring the outstanding credits into its exit tag.
fn sc(loc: &LlScVar, new: *mut Node, myver: u32, mynode: *mut Node) -> bool {
    // Safety: mynode is protected by our LL credit
    let pred = unsafe { node_ref(mynode).pred.load(Ordering::Acquire) };
    let success = loc
        .noncurrent_slot(myver)
        .compare_exchange(pred, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();

    loop {
        let e = EntryTag::unpack(loc.entry.load(Ordering::Acquire));
        if e.ver != myver {
            break;
        }
        let bumped = EntryTag {
            ver: e.ver.wrapping_add(1),
            count: 0,
        };
        if loc
            .entry
            .compare_exchange(e.pack(), bumped.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            transfer(mynode, e.count);
        }
    }
    release(mynode);
    success
}

/// Drop an LL credit without attempting an SC
fn unlink(loc: &LlScVar, myver: u32, mynode: *mut Node) {
    loop {
        let e = EntryTag::unpack(loc.entry.load(Ordering::Acquire));
        if e.ver != myver {
            // Version moved on; our credit was transferred to the node
            release(mynode);
            return;
        }
        let decremented = EntryTag {
            ver: e.ver,
            count: e.count.wrapping_sub(1),
        };
        if loc
            .entry
            .compare_exchange(
                e.pack(),
                decremented.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return;
        }
    }
}

/// Move `count` credits from an entry tag into the node's exit tag
fn transfer(node: *mut Node, count: u32) {
    // Safety: the node is still protected by the credits being transferred
    let exit = unsafe { &node_ref(node).exit };
    loop {
        let pre = ExitTag::unpack(exit.load(Ordering::Acquire));
        let post = ExitTag {
            count: pre.count + count as i32,
            transfers_left: pre.transfers_left - 1,
            ..pre
        };
        if exit
            .compare_exchange(pre.pack(), post.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Return one credit; the final holder propagates NL-pred to the
/// predecessor and frees the node once every condition is met.
fn release(node: *mut Node) {
    // Safety: our own credit keeps the node alive until the CAS below
    let node_view = unsafe { node_ref(node) };
    let pred = node_view.pred.load(Ordering::Acquire);
    let post = loop {
        let pre = ExitTag::unpack(node_view.exit.load(Ordering::Acquire));
        let post = ExitTag {
            count: pre.count - 1,
            ..pre
        };
        if node_view
            .exit
            .compare_exchange(pre.pack(), post.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break post;
        }
    };

    if post.clean() {
        set_nl_pred(pred);
    }
    if post.freeable() {
        // Safety: the exit tag proves no thread can reference the node
        unsafe { drop(Box::from_raw(node)) };
    }
}

/// Record that the successor of `pred` no longer names it as predecessor
fn set_nl_pred(pred: *mut Node) {
    // Safety: a node keeps its predecessor alive until this flag is set
    let pred_view = unsafe { node_ref(pred) };
    let post = loop {
        let pre = ExitTag::unpack(pred_view.exit.load(Ordering::Acquire));
        let post = ExitTag {
            nl_pred: true,
            ..pre
        };
        if pred_view
            .exit
            .compare_exchange(pre.pack(), post.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break post;
        }
    };
    if post.freeable() {
        // Safety: the exit tag proves no thread can reference the node
        unsafe { drop(Box::from_raw(pred)) };
    }
}

/// Mark a dequeued node as logically consumed
fn set_to_be_freed(node: *mut Node) {
    // Safety: the caller's SC success guarantees the node is still live
    let node_view = unsafe { node_ref(node) };
    let post = loop {
        let pre = ExitTag::unpack(node_view.exit.load(Ordering::Acquire));
        let post = ExitTag {
            to_be_freed: true,
            ..pre
        };
        if node_view
            .exit
            .compare_exchange(pre.pack(), post.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break post;
        }
    };
    if post.freeable() {
        // Safety: the exit tag proves no thread can reference the node
        unsafe { drop(Box::from_raw(node)) };
    }
}

/// Unbounded FIFO queue over emulated LL/SC head and tail
pub struct LlScQueue {
    head: LlScVar,
    tail: LlScVar,
    /// The initial non-current dummy; it never enters the list proper and
    /// is reclaimed with the queue.
    spare: *mut Node,
}

unsafe impl Send for LlScQueue {}
unsafe impl Sync for LlScQueue {}

impl LlScQueue {
    pub fn new() -> Self {
        // The first dummy will be retired by both the head and the tail
        // variable, hence two pending transfers.
        let dummy = Node::alloc(0, 2);
        let spare = Node::alloc(0, 0);
        // Safety: freshly allocated, exclusively owned
        unsafe {
            (*dummy).pred.store(spare, Ordering::Relaxed);
        }
        Self {
            head: LlScVar::new(dummy, spare),
            tail: LlScVar::new(dummy, spare),
            spare,
        }
    }
}

impl Default for LlScQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentQueue for LlScQueue {
    fn enqueue(&self, val: Value) -> bool {
        let node = Node::alloc(val, 2);
        let mut backoff = Backoff::new();
        loop {
            let (tail_node, ver) = ll(&self.tail);
            // Safety: tail_node is protected by our LL credit; node is
            // still private to us.
            unsafe {
                node_ref(node).pred.store(tail_node, Ordering::Release);
                if node_ref(tail_node)
                    .next
                    .compare_exchange(
                        std::ptr::null_mut(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    sc(&self.tail, node, ver, tail_node);
                    return true;
                }
                // Someone else linked first; help swing the tail
                let next = node_ref(tail_node).next.load(Ordering::Acquire);
                sc(&self.tail, next, ver, tail_node);
            }
            backoff.snooze();
        }
    }

    fn dequeue(&self) -> Option<Value> {
        loop {
            let (head_node, ver) = ll(&self.head);
            // Safety: head_node is protected by our LL credit
            let next = unsafe { node_ref(head_node).next.load(Ordering::Acquire) };
            if next.is_null() {
                unlink(&self.head, ver, head_node);
                return None;
            }
            if sc(&self.head, next, ver, head_node) {
                // Safety: `next` is now the current head dummy and cannot
                // be freed before we set its to-be-freed mark below.
                let val = unsafe { node_ref(next).val };
                set_to_be_freed(next);
                return Some(val);
            }
        }
    }
}

impl Drop for LlScQueue {
    fn drop(&mut self) {
        // Exclusive access: walk the remaining chain from the current
        // head dummy. Retired dummies were already reclaimed through
        // their exit tags.
        let e = EntryTag::unpack(self.head.entry.load(Ordering::Relaxed));
        let mut curr = self.head.slot(e.ver).load(Ordering::Relaxed);
        while !curr.is_null() {
            // Safety: exclusive access during drop
            unsafe {
                let next = (*curr).next.load(Ordering::Relaxed);
                drop(Box::from_raw(curr));
                curr = next;
            }
        }
        // Safety: the spare dummy never entered the list
        unsafe { drop(Box::from_raw(self.spare)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = LlScQueue::new();
        for v in 1..=5 {
            assert!(q.enqueue(v));
        }
        for v in 1..=5 {
            assert_eq!(q.dequeue(), Some(v));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_interleaved_enqueue_dequeue() {
        let q = LlScQueue::new();
        assert!(q.enqueue(1));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), None);
        assert!(q.enqueue(2));
        assert!(q.enqueue(3));
        assert_eq!(q.dequeue(), Some(2));
        assert!(q.enqueue(4));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), Some(4));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_mpmc_checksum() {
        let q = Arc::new(LlScQueue::new());
        let producers = 4i64;
        let items = 500i64;
        let mut handles = vec![];

        for t in 0..producers {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for v in (t * items + 1)..=(t + 1) * items {
                    q.enqueue(v);
                }
            }));
        }

        let mut consumers = vec![];
        for _ in 0..producers {
            let q = Arc::clone(&q);
            consumers.push(thread::spawn(move || {
                let mut sum = 0i64;
                let mut taken = 0;
                while taken < items {
                    if let Some(v) = q.dequeue() {
                        sum += v;
                        taken += 1;
                    } else {
                        thread::yield_now();
                    }
                }
                sum
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        let total: i64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        let nm = producers * items;
        assert_eq!(total, nm * (nm + 1) / 2);
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_spsc_order_preserved() {
        let q = Arc::new(LlScQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for v in 1..=5_000 {
                    q.enqueue(v);
                }
            })
        };
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut last = 0;
                let mut seen = 0;
                while seen < 5_000 {
                    if let Some(v) = q.dequeue() {
                        assert!(v > last);
                        last = v;
                        seen += 1;
                    }
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
