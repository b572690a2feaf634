//! Cancellation tokens and deadlines for bounded waits
//!
//! Every suspension point (prepare-conflict wait, interlock blocking,
//! coordinator retry loop) takes a `Deadline` and a `CancellationToken`.
//! A stepdown or killOp cancels the token; waiters notice on their next
//! wake-up and return the token's error.

use crate::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a token was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// killOp / explicit cancellation
    Killed,
    /// The node stepped down
    StepDown,
    /// The process is shutting down
    Shutdown,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
}

/// Shared, clonable cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// A fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token; the first reason wins
    pub fn cancel(&self, reason: CancelReason) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Reason given to the first `cancel` call
    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock()
    }

    /// `Err` with the matching error if cancelled
    pub fn check(&self, what: &str) -> Result<(), Error> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(match self.reason() {
            Some(CancelReason::StepDown) => Error::InterruptedDueToReplStateChange(what.to_string()),
            Some(CancelReason::Shutdown) => Error::Interrupted(format!("{} (shutdown)", what)),
            _ => Error::Interrupted(what.to_string()),
        })
    }
}

/// Point in time after which a bounded wait gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Never expires
    pub fn none() -> Self {
        Deadline(None)
    }

    /// Expires `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    /// Expires at `instant`
    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// True once the deadline passed
    pub fn expired(&self) -> bool {
        self.0.map_or(false, |at| Instant::now() >= at)
    }

    /// Time left, capped at `cap`
    pub fn remaining(&self, cap: Duration) -> Duration {
        match self.0 {
            None => cap,
            Some(at) => at.saturating_duration_since(Instant::now()).min(cap),
        }
    }

    /// The earlier of two deadlines
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) | (None, Some(a)) => Deadline(Some(a)),
            (None, None) => Deadline(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cancel_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.check("wait").is_ok());
        token.cancel(CancelReason::StepDown);
        token.cancel(CancelReason::Killed);
        assert_eq!(token.reason(), Some(CancelReason::StepDown));
        assert!(matches!(
            token.check("wait"),
            Err(Error::InterruptedDueToReplStateChange(_))
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel(CancelReason::Killed);
        assert!(token.is_cancelled());
        assert!(matches!(token.check("op"), Err(Error::Interrupted(_))));
    }

    #[test]
    fn test_deadline_min_and_expiry() {
        assert!(!Deadline::none().expired());
        let past = Deadline::after(Duration::ZERO);
        assert!(past.expired());
        assert_eq!(Deadline::none().min(past), past);
        assert_eq!(past.remaining(Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(Deadline::none().remaining(Duration::from_millis(5)), Duration::from_millis(5));
    }
}
