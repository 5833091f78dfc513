// Copyright (c) 2025 Syncset Contributors
//
// Epoch-based memory reclamation for the lock-free containers
//
// Threads pin the global epoch around every operation that traverses
// shared nodes outside a lock. Unlinked nodes are deferred, tagged with the
// epoch current at retirement, and reclaimed once the global epoch has
// advanced at least two steps past the tag: by then every thread that could
// have observed the node has unpinned.

use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Reclaim deferred garbage in batches of this many nodes
const GC_BATCH_SIZE: usize = 64;

/// Try a collection after this many local defers
const DEFER_COLLECT_PERIOD: usize = 64;

/// Global epoch counter. Starts at 1; a participant epoch of 0 means
/// "not currently pinned".
static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Global list of all participants
static PARTICIPANTS: Mutex<Vec<Arc<Participant>>> = Mutex::new(Vec::new());

/// Garbage abandoned by exited threads, picked up by any collector
static ORPHANS: Mutex<Vec<(u64, Garbage)>> = Mutex::new(Vec::new());

thread_local! {
    static LOCAL: RefCell<Option<LocalHandle>> = const { RefCell::new(None) };
    static DEFER_COUNT: Cell<usize> = const { Cell::new(0) };
}

/// A piece of retired memory together with its typed deleter
struct Garbage {
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
}

impl Garbage {
    fn new<T>(ptr: *mut T) -> Self {
        unsafe fn deleter<T>(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut T));
        }

        Self {
            ptr: ptr as *mut u8,
            deleter: deleter::<T>,
        }
    }

    unsafe fn reclaim(self) {
        (self.deleter)(self.ptr);
    }
}

// Safety: the raw pointer is only dereferenced by the deleter, after the
// epoch protocol has proven no other thread can reach it.
unsafe impl Send for Garbage {}

/// Per-thread participant in epoch-based reclamation
#[repr(C, align(64))]
pub struct Participant {
    /// Epoch this participant is pinned in (0 = not pinned)
    epoch: AtomicU64,
    /// Reentrant pin depth
    pin_count: AtomicUsize,
    _padding: [u8; 48],
}

impl Participant {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            pin_count: AtomicUsize::new(0),
            _padding: [0; 48],
        }
    }

    fn enter(&self) {
        let count = self.pin_count.fetch_add(1, Ordering::Relaxed);
        if count == 0 {
            // Publish the pin, then re-validate: if the global epoch moved
            // between the read and the store, a collector may not have seen
            // this participant yet, so publish again at the newer epoch.
            let mut global = GLOBAL_EPOCH.load(Ordering::Relaxed);
            loop {
                self.epoch.store(global, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                let current = GLOBAL_EPOCH.load(Ordering::SeqCst);
                if current == global {
                    break;
                }
                global = current;
            }
        }
    }

    fn leave(&self) {
        let count = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        if count == 1 {
            self.epoch.store(0, Ordering::Release);
        }
    }

    fn is_active(&self) -> bool {
        self.epoch.load(Ordering::Acquire) != 0
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

/// Thread-local registration plus the deferred-garbage bag.
/// On thread exit the bag is handed to the global orphan list and the
/// participant is deregistered.
struct LocalHandle {
    participant: Arc<Participant>,
    bag: Vec<(u64, Garbage)>,
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        let mut orphans = ORPHANS.lock();
        orphans.append(&mut self.bag);
        drop(orphans);
        let mut participants = PARTICIPANTS.lock();
        participants.retain(|p| !Arc::ptr_eq(p, &self.participant));
    }
}

fn with_local<R>(f: impl FnOnce(&mut LocalHandle) -> R) -> R {
    LOCAL.with(|local| {
        let mut slot = local.borrow_mut();
        let handle = slot.get_or_insert_with(|| {
            let participant = Arc::new(Participant::new());
            PARTICIPANTS.lock().push(participant.clone());
            LocalHandle {
                participant,
                bag: Vec::new(),
            }
        });
        f(handle)
    })
}

/// The global epoch-based reclamation system
pub struct Epoch;

impl Epoch {
    /// Pin the current thread to the current epoch
    pub fn pin() -> EpochGuard {
        with_local(|handle| handle.participant.enter());
        EpochGuard {
            _marker: PhantomData,
        }
    }

    /// Try to advance the global epoch. Succeeds only when every pinned
    /// participant has caught up with the current epoch.
    pub fn try_advance() -> bool {
        let global = GLOBAL_EPOCH.load(Ordering::Relaxed);

        let participants = PARTICIPANTS.lock();
        let all_caught_up = participants
            .iter()
            .filter(|p| p.is_active())
            .all(|p| p.current_epoch() == global);
        drop(participants);

        if all_caught_up {
            GLOBAL_EPOCH
                .compare_exchange(global, global + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// Defer reclamation of a node that has just been unlinked.
    ///
    /// The caller must guarantee the node is unreachable from the
    /// container roots and that no thread frees it twice.
    pub fn defer<T>(ptr: *mut T) {
        let tag = GLOBAL_EPOCH.load(Ordering::Acquire);
        with_local(|handle| handle.bag.push((tag, Garbage::new(ptr))));

        let count = DEFER_COUNT.with(|c| {
            let n = c.get() + 1;
            c.set(n);
            n
        });
        if count % DEFER_COLLECT_PERIOD == 0 {
            Self::try_collect();
        }
    }

    /// Reclaim garbage retired at least two epochs ago, then try to
    /// advance the epoch.
    pub fn try_collect() {
        let global = GLOBAL_EPOCH.load(Ordering::Acquire);

        with_local(|handle| Self::collect_bag(&mut handle.bag, global));

        if let Some(mut orphans) = ORPHANS.try_lock() {
            Self::collect_bag(&mut orphans, global);
        }

        Self::try_advance();
    }

    fn collect_bag(bag: &mut Vec<(u64, Garbage)>, global: u64) {
        let mut reclaimed = 0;
        let mut i = 0;
        while i < bag.len() && reclaimed < GC_BATCH_SIZE {
            if global.saturating_sub(bag[i].0) >= 2 {
                let (_, garbage) = bag.swap_remove(i);
                // Safety: retired two or more epochs ago, so every thread
                // pinned at retirement time has since unpinned
                unsafe { garbage.reclaim() };
                reclaimed += 1;
            } else {
                i += 1;
            }
        }
    }

    /// Drive the epoch forward until outstanding garbage can be reclaimed
    #[cfg(test)]
    pub fn force_collect() {
        for _ in 0..8 {
            Self::try_advance();
            Self::try_collect();
            std::thread::yield_now();
        }
    }
}

/// Guard representing a pinned epoch. Not `Send`: pins are per-thread.
pub struct EpochGuard {
    _marker: PhantomData<*mut ()>,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        with_local(|handle| handle.participant.leave());
    }
}

/// An atomic pointer whose loads are valid for the lifetime of an epoch
/// guard. Links do not own their targets: containers free their nodes in
/// their own `Drop`, and unlink paths go through [`Epoch::defer`].
pub struct Atomic<T> {
    ptr: AtomicPtr<T>,
    _marker: PhantomData<T>,
}

impl<T> Atomic<T> {
    pub fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn new(value: T) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _marker: PhantomData,
        }
    }

    pub fn load<'g>(&self, ord: Ordering, _guard: &'g EpochGuard) -> Shared<'g, T> {
        Shared {
            ptr: self.ptr.load(ord),
            _marker: PhantomData,
        }
    }

    pub fn store(&self, ptr: Shared<'_, T>, ord: Ordering) {
        self.ptr.store(ptr.ptr, ord);
    }

    pub fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g EpochGuard,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        match self
            .ptr
            .compare_exchange(current.ptr, new.ptr, success, failure)
        {
            Ok(ptr) => Ok(Shared {
                ptr,
                _marker: PhantomData,
            }),
            Err(ptr) => Err(Shared {
                ptr,
                _marker: PhantomData,
            }),
        }
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<'g, T> From<Shared<'g, T>> for Atomic<T> {
    fn from(shared: Shared<'g, T>) -> Self {
        Self {
            ptr: AtomicPtr::new(shared.ptr),
            _marker: PhantomData,
        }
    }
}

// Safety: atomic operations are thread-safe
unsafe impl<T: Send> Send for Atomic<T> {}
unsafe impl<T: Send> Sync for Atomic<T> {}

/// A uniquely owned pointer, used to build nodes before publication
pub struct Owned<T> {
    ptr: *mut T,
    _marker: PhantomData<T>,
}

impl<T> Owned<T> {
    pub fn new(value: T) -> Self {
        Self {
            ptr: Box::into_raw(Box::new(value)),
            _marker: PhantomData,
        }
    }

    /// Publish: relinquish unique ownership and get a shared pointer
    pub fn into_shared<'g>(self) -> Shared<'g, T> {
        let ptr = self.ptr;
        mem::forget(self);
        Shared {
            ptr,
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // Safety: we own this pointer
            unsafe {
                drop(Box::from_raw(self.ptr));
            }
        }
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: Owned guarantees the pointer is valid and uniquely owned
        unsafe { &*self.ptr }
    }
}

impl<T> DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: Owned guarantees the pointer is valid and uniquely owned
        unsafe { &mut *self.ptr }
    }
}

/// A pointer that may be shared between threads, valid while the epoch
/// guard it was loaded under is alive
#[derive(Debug)]
pub struct Shared<'g, T> {
    ptr: *mut T,
    _marker: PhantomData<&'g T>,
}

impl<'g, T> Shared<'g, T> {
    pub fn null() -> Self {
        Self {
            ptr: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    pub fn as_ref(&self) -> Option<&'g T> {
        if self.ptr.is_null() {
            None
        } else {
            // Safety: protected by the epoch guard for 'g
            Some(unsafe { &*self.ptr })
        }
    }

    pub fn from_raw(ptr: *mut T) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }
}

impl<'g, T> Clone for Shared<'g, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, T> Copy for Shared<'g, T> {}

impl<'g, T> PartialEq for Shared<'g, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<'g, T> Eq for Shared<'g, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_epoch_pin_reentrant() {
        let guard1 = Epoch::pin();
        let guard2 = Epoch::pin();
        drop(guard1);
        drop(guard2);
    }

    #[test]
    fn test_atomic_operations() {
        let atomic = Atomic::new(42);
        let guard = Epoch::pin();

        let shared = atomic.load(Ordering::SeqCst, &guard);
        assert_eq!(*shared.as_ref().unwrap(), 42);

        let old = shared;
        let new_value = Owned::new(100);
        atomic.store(new_value.into_shared(), Ordering::SeqCst);

        let updated = atomic.load(Ordering::SeqCst, &guard);
        assert_eq!(*updated.as_ref().unwrap(), 100);

        // The container owns its nodes; mimic that here
        unsafe {
            drop(Box::from_raw(old.as_ptr()));
            drop(Box::from_raw(updated.as_ptr()));
        }
    }

    #[test]
    fn test_compare_exchange() {
        let atomic = Atomic::new(42);
        let guard = Epoch::pin();

        let current = atomic.load(Ordering::SeqCst, &guard);
        let new_value = Owned::new(100).into_shared();

        let result =
            atomic.compare_exchange(current, new_value, Ordering::SeqCst, Ordering::SeqCst, &guard);
        assert!(result.is_ok());

        let updated = atomic.load(Ordering::SeqCst, &guard);
        assert_eq!(*updated.as_ref().unwrap(), 100);

        unsafe {
            drop(Box::from_raw(current.as_ptr()));
            drop(Box::from_raw(updated.as_ptr()));
        }
    }

    #[test]
    fn test_concurrent_pins() {
        let atomic = Arc::new(Atomic::new(0usize));
        let mut handles = vec![];

        for _ in 0..8 {
            let atomic = atomic.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let guard = Epoch::pin();
                    let current = atomic.load(Ordering::Acquire, &guard);
                    assert!(current.as_ref().is_some());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let guard = Epoch::pin();
        let last = atomic.load(Ordering::Acquire, &guard);
        unsafe { drop(Box::from_raw(last.as_ptr())) };
    }

    #[test]
    fn test_deferred_reclamation() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropCounter;
        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count_before = DROP_COUNT.load(Ordering::SeqCst);

        {
            let _guard = Epoch::pin();
            let ptr = Box::into_raw(Box::new(DropCounter));
            Epoch::defer(ptr);
        }

        Epoch::force_collect();

        let count_after = DROP_COUNT.load(Ordering::SeqCst);
        assert!(count_after > count_before);
    }
}
