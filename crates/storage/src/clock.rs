//! Logical clock
//!
//! Each node owns one clock. Timestamps handed out by `next_timestamp` are
//! strictly increasing; `advance_to` folds in cluster time gossiped by
//! routers and coordinators so that a timestamp issued after observing `t`
//! is always greater than `t`.

use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::Timestamp;

/// Monotonic logical clock
#[derive(Debug, Default)]
pub struct LogicalClock {
    now: AtomicU64,
}

impl LogicalClock {
    /// A clock at `Timestamp::ZERO`
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose next timestamp is greater than `ts` (used after recovery)
    pub fn starting_at(ts: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(ts.as_raw()),
        }
    }

    /// Issue a timestamp strictly greater than every one issued or observed
    pub fn next_timestamp(&self) -> Timestamp {
        Timestamp::from_raw(self.now.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Latest timestamp issued or observed
    pub fn current(&self) -> Timestamp {
        Timestamp::from_raw(self.now.load(Ordering::SeqCst))
    }

    /// Observe an external timestamp; the clock never moves backwards
    pub fn advance_to(&self, ts: Timestamp) {
        self.now.fetch_max(ts.as_raw(), Ordering::SeqCst);
    }
}
