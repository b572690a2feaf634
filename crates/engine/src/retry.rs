//! Retry loops for requests that may be re-sent
//!
//! Only errors classified `Retryable` (network failures, stepdowns of the
//! callee) are retried. Everything else is returned to the caller at once.
//! Backoff doubles from `initial` up to `max` and every sleep is sliced so a
//! cancelled token is noticed promptly.

use std::time::Duration;
use tessera_core::{CancellationToken, Deadline, Error, Result};
use tracing::warn;

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound of the delay
    pub max_backoff: Duration,
    /// Attempts before giving up; 0 retries until cancelled
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(initial_backoff: Duration, max_backoff: Duration, max_attempts: usize) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            max_attempts,
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Same backoff, retrying until cancelled
    pub fn unbounded(self) -> Self {
        Self {
            max_attempts: 0,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(31) as u32;
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails non-retryably, or retries run out
    ///
    /// Cancellation and the deadline are checked before every attempt; the
    /// last retryable error is returned when attempts are exhausted.
    pub fn run<T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        deadline: Deadline,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            cancel.check(what)?;
            let err = match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };
            attempt += 1;
            if self.max_attempts != 0 && attempt >= self.max_attempts {
                warn!(target: "tessera::2pc", what, attempt, error = %err, "Giving up after retries");
                return Err(err);
            }
            if deadline.expired() {
                return Err(Error::MaxTimeMSExpired(format!("{}: {}", what, err)));
            }
            warn!(target: "tessera::2pc", what, attempt, error = %err, "Retrying");
            sleep(self.delay(attempt - 1), cancel, deadline);
        }
    }
}

fn sleep(total: Duration, cancel: &CancellationToken, deadline: Deadline) {
    let until = Deadline::after(total).min(deadline);
    while !until.expired() && !cancel.is_cancelled() {
        std::thread::sleep(until.remaining(SLEEP_SLICE));
    }
}
