// Syncset - a catalogue of synchronization strategies over one
// ordered-set interface
//
// Fourteen concurrent ordered-set implementations (sorted lists,
// skiplists, hash tables) and two lock-free FIFO queues, all sharing the
// same abstract contracts, plus the workload harness that exercises and
// cross-checks them.

pub mod bench;
pub mod concurrent;
pub mod core;
pub mod error;
pub mod hash;
pub mod list;
pub mod queue;
pub mod skiplist;

pub use crate::core::{ConcurrentQueue, ConcurrentSet, Key, Value, MAX_KEY, MIN_KEY};
pub use error::{Result, SetError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
