//! Logical timestamp type
//!
//! Timestamps order every prepare, commit and snapshot read in the
//! deployment. They are logical, not wall-clock: the only operations are
//! comparison and "the next one".
//!
//! ```
//! use tessera_core::Timestamp;
//!
//! let a = Timestamp::from_raw(10);
//! assert!(a.next() > a);
//! assert_eq!(Timestamp::ZERO.max(a), a);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in logical time.
///
/// ## Invariants
///
/// - `ZERO` is earlier than every timestamp ever issued by a clock
/// - Ordering is total; equal timestamps denote the same instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The beginning of logical time. Never issued by a clock.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Largest representable timestamp
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Wrap a raw logical counter value
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Timestamp(raw)
    }

    /// Raw logical counter value
    #[inline]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// The immediately following timestamp (saturating)
    #[inline]
    pub const fn next(&self) -> Timestamp {
        Timestamp(self.0.saturating_add(1))
    }

    /// True for `ZERO`
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Timestamp(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_is_smallest() {
        assert!(Timestamp::ZERO < Timestamp::from_raw(1));
        assert!(Timestamp::ZERO.is_zero());
        assert_eq!(Timestamp::default(), Timestamp::ZERO);
    }

    #[test]
    fn test_next_saturates() {
        assert_eq!(Timestamp::MAX.next(), Timestamp::MAX);
        assert_eq!(Timestamp::from_raw(4).next().as_raw(), 5);
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::from_raw(42).to_string(), "Timestamp(42)");
    }

    proptest! {
        #[test]
        fn prop_ordering_matches_raw(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            prop_assert_eq!(Timestamp::from_raw(a).cmp(&Timestamp::from_raw(b)), a.cmp(&b));
        }

        #[test]
        fn prop_next_is_strictly_later(a in 0u64..u64::MAX - 1) {
            prop_assert!(Timestamp::from_raw(a).next() > Timestamp::from_raw(a));
        }
    }
}
