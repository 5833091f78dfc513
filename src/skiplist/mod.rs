// Copyright (c) 2025 Syncset Contributors
//
// Randomized skiplist variants: one behind a container mutex, one with
// optimistic per-node locking (Herlihy-Lev-Luchangco-Shavit), and one
// fully lock-free (Herlihy-Shavit).

pub mod lazy;
pub mod lockfree;
pub mod plain;

pub use lazy::LazySkiplist;
pub use lockfree::LockFreeSkiplist;
pub use plain::PlainSkiplist;

use crate::core::{Key, MAX_LEVEL};
use crate::error::{Result, SetError};

/// Pick a tower height uniformly in `0..max_level`, as the original
/// workbench does.
pub(crate) fn random_level(max_level: usize) -> usize {
    fastrand::usize(..max_level)
}

/// Validate the shared constructor parameters of all skiplist variants.
pub(crate) fn check_params(max_level: usize, min: Key, max: Key) -> Result<()> {
    if max_level == 0 || max_level > MAX_LEVEL {
        return Err(SetError::Config(format!(
            "max_level must be in 1..={MAX_LEVEL}, got {max_level}"
        )));
    }
    if min >= max {
        return Err(SetError::Config(format!(
            "sentinel bounds must satisfy min < max, got {min} >= {max}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_level_in_range() {
        for _ in 0..1000 {
            let level = random_level(4);
            assert!(level < 4);
        }
    }

    #[test]
    fn test_param_validation() {
        assert!(check_params(4, Key::MIN, Key::MAX).is_ok());
        assert!(check_params(0, Key::MIN, Key::MAX).is_err());
        assert!(check_params(MAX_LEVEL + 1, Key::MIN, Key::MAX).is_err());
        assert!(check_params(4, 10, 10).is_err());
        assert!(check_params(4, 10, 5).is_err());
    }
}
