// Copyright (c) 2025 Syncset Contributors
//
// Shared key/value model and the container contracts implemented by every
// synchronization variant in this crate.

/// Key type shared by all containers. Total order via `<`; the extreme
/// representable values are reserved for the head/tail sentinels.
pub type Key = i64;

/// Opaque integer-sized payload stored alongside each key.
pub type Value = i64;

/// Sentinel key of every head node. Never insertable.
pub const MIN_KEY: Key = Key::MIN;

/// Sentinel key of every tail node. Never insertable.
pub const MAX_KEY: Key = Key::MAX;

/// Hard cap on skiplist height, matching the workload harness bound.
pub const MAX_LEVEL: usize = 16;

/// An ordered set of unique integer keys with attached values.
///
/// All implementations are linearizable. Duplicate insert and absent
/// remove/contains are ordinary outcomes, not errors:
///
/// - `insert` returns whether the key was absent and is now present
/// - `remove` returns the stored value iff the key was present
/// - `contains` reports logical membership at the linearization point
pub trait ConcurrentSet: Send + Sync {
    /// Inserts `(key, value)` iff no entry with `key` exists.
    fn insert(&self, key: Key, value: Value) -> bool;

    /// Removes the entry with `key`, returning its value.
    fn remove(&self, key: Key) -> Option<Value>;

    /// Reports whether `key` is logically present.
    fn contains(&self, key: Key) -> bool;

    /// Number of entries currently in the set. Under concurrent mutation
    /// this is a snapshot, exact only in quiescent states.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An unbounded multi-producer multi-consumer FIFO queue.
pub trait ConcurrentQueue: Send + Sync {
    /// Appends `value` at the tail. Always succeeds for the in-memory
    /// queues in this crate; the `bool` mirrors the set interface so the
    /// harness can treat an unexpected failure as a reportable bug.
    fn enqueue(&self, value: Value) -> bool;

    /// Removes and returns the value at the head, or `None` when empty.
    fn dequeue(&self) -> Option<Value>;
}

/// Returns whether `key` is a real key, i.e. strictly between the given
/// sentinel bounds. Containers reject anything else up front.
#[inline]
pub(crate) fn key_in_bounds(key: Key, min: Key, max: Key) -> bool {
    min < key && key < max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_bounds() {
        assert!(!key_in_bounds(MIN_KEY, MIN_KEY, MAX_KEY));
        assert!(!key_in_bounds(MAX_KEY, MIN_KEY, MAX_KEY));
        assert!(key_in_bounds(0, MIN_KEY, MAX_KEY));
        assert!(key_in_bounds(MIN_KEY + 1, MIN_KEY, MAX_KEY));
        assert!(key_in_bounds(MAX_KEY - 1, MIN_KEY, MAX_KEY));
    }
}
