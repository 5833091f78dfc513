// Copyright (c) 2025 Syncset Contributors
//
// Michael-Scott queue, "Simple, Fast, and Practical Non-Blocking and
// Blocking Concurrent Queue Algorithms"
//
// Head and tail are counted pointers: every successful CAS bumps the
// counter, so a pointer that was recycled between a read and the CAS can
// no longer match. The value of a dequeued entry is read from the
// successor before the head swing, never from the retired dummy.

use crate::concurrent::epoch::Epoch;
use crate::concurrent::{AtomicCountedPtr, Backoff, CountedPtr, CACHE_LINE_SIZE};
use crate::core::{ConcurrentQueue, Value};
use std::sync::atomic::{AtomicU64, Ordering};

struct Node {
    val: Value,
    next: AtomicCountedPtr<Node>,
}

impl Node {
    fn alloc(val: Value) -> *mut Node {
        Box::into_raw(Box::new(Node {
            val,
            next: AtomicCountedPtr::new(CountedPtr::null()),
        }))
    }
}

// Safety: nodes reached through the queue are kept alive by the epoch
// guard the caller holds.
unsafe fn node_ref<'a>(ptr: *mut Node) -> &'a Node {
    &*ptr
}

/// Michael-Scott unbounded FIFO queue
///
/// Head and tail live on separate cache lines so producers and consumers
/// do not false-share.
#[repr(C)]
pub struct MsQueue {
    head: AtomicCountedPtr<Node>,
    _pad: [u8; CACHE_LINE_SIZE - 8],
    tail: AtomicCountedPtr<Node>,
    _pad2: [u8; CACHE_LINE_SIZE - 8],
    enqueue_count: AtomicU64,
    dequeue_count: AtomicU64,
}

unsafe impl Send for MsQueue {}
unsafe impl Sync for MsQueue {}

/// Operation counters for the MS queue
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub enqueue_count: u64,
    pub dequeue_count: u64,
    pub current_size: u64,
}

impl MsQueue {
    pub fn new() -> Self {
        let dummy = Node::alloc(0);
        Self {
            head: AtomicCountedPtr::new(CountedPtr::new(dummy, 0)),
            _pad: [0; CACHE_LINE_SIZE - 8],
            tail: AtomicCountedPtr::new(CountedPtr::new(dummy, 0)),
            _pad2: [0; CACHE_LINE_SIZE - 8],
            enqueue_count: AtomicU64::new(0),
            dequeue_count: AtomicU64::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        let _guard = Epoch::pin();
        let head = self.head.load(Ordering::Acquire);
        // Safety: guard pinned above
        unsafe { node_ref(head.ptr()).next.load(Ordering::Acquire).is_null() }
    }

    pub fn stats(&self) -> QueueStats {
        let enqueue_count = self.enqueue_count.load(Ordering::Relaxed);
        let dequeue_count = self.dequeue_count.load(Ordering::Relaxed);
        QueueStats {
            enqueue_count,
            dequeue_count,
            current_size: enqueue_count.saturating_sub(dequeue_count),
        }
    }
}

impl Default for MsQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentQueue for MsQueue {
    fn enqueue(&self, val: Value) -> bool {
        let _guard = Epoch::pin();
        let node = Node::alloc(val);
        let mut backoff = Backoff::new();
        let mut tail;

        loop {
            tail = self.tail.load(Ordering::Acquire);
            // Safety: guard pinned above; tail nodes are retired, not freed
            let next = unsafe { node_ref(tail.ptr()).next.load(Ordering::Acquire) };
            if tail != self.tail.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }
            if next.is_null() {
                // Tail points at the last node; link the new one
                let linked = unsafe {
                    node_ref(tail.ptr())
                        .next
                        .compare_exchange(
                            next,
                            next.bump(node),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                };
                if linked {
                    break;
                }
                backoff.spin();
            } else {
                // Tail is lagging; help it along
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.bump(next.ptr()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                backoff.spin();
            }
        }

        // Swing the tail to the node we just linked
        let _ = self.tail.compare_exchange(
            tail,
            tail.bump(node),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.enqueue_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn dequeue(&self) -> Option<Value> {
        let _guard = Epoch::pin();
        let mut backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            // Safety: guard pinned above
            let next = unsafe { node_ref(head.ptr()).next.load(Ordering::Acquire) };
            if head != self.head.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }

            if head.ptr() == tail.ptr() {
                if next.is_null() {
                    return None;
                }
                // Tail is lagging behind the linked node; help
                let _ = self.tail.compare_exchange(
                    tail,
                    tail.bump(next.ptr()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                backoff.spin();
            } else {
                // Read the value before the swing; after it, another
                // dequeuer may already be retiring `next`.
                let val = unsafe { node_ref(next.ptr()).val };
                if self
                    .head
                    .compare_exchange(
                        head,
                        head.bump(next.ptr()),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // The old dummy is unreachable once head moved past it
                    Epoch::defer(head.ptr());
                    self.dequeue_count.fetch_add(1, Ordering::Relaxed);
                    return Some(val);
                }
                backoff.spin();
            }
        }
    }
}

impl Drop for MsQueue {
    fn drop(&mut self) {
        let mut curr = self.head.load(Ordering::Relaxed).ptr();
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
    fn test_fifo_order() {
        let q = MsQueue::new();
        for v in 1..=5 {
            assert!(q.enqueue(v));
        }
        for v in 1..=5 {
            assert_eq!(q.dequeue(), Some(v));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_stats_track_operations() {
        let q = MsQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.dequeue();

        let stats = q.stats();
        assert_eq!(stats.enqueue_count, 2);
        assert_eq!(stats.dequeue_count, 1);
        assert_eq!(stats.current_size, 1);
    }

    #[test]
    fn test_empty_after_drain() {
        let q = MsQueue::new();
        assert!(q.is_empty());
        q.enqueue(1);
        assert!(!q.is_empty());
        q.dequeue();
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_mpmc_checksum() {
        let q = Arc::new(MsQueue::new());
        let producers = 4i64;
        let items = 1000i64;
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
    fn test_single_producer_single_consumer_order() {
        let q = Arc::new(MsQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for v in 1..=10_000 {
                    q.enqueue(v);
                }
            })
        };
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut last = 0;
                let mut seen = 0;
                while seen < 10_000 {
                    if let Some(v) = q.dequeue() {
                        assert!(v > last, "FIFO order violated: {v} after {last}");
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
