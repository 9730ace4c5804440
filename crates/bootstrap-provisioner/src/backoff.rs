//! # Fixed Backoff
//!
//! Bounded retries with a constant wait between attempts, used for remote image
//! downloads that hit server errors. The wait only happens between attempts:
//! three attempts with a 2s wait take two waits in total.

use std::time::Duration;

/// Attempts made against a remote image before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Wait between attempts
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(2);

/// Fixed backoff calculator
///
/// Call `next_backoff` after each failed attempt. It returns the wait before
/// the next attempt, or `None` once all attempts are used up.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    /// Total attempts allowed, including the first
    max_attempts: u32,
    /// Wait between attempts
    delay: Duration,
    /// Failed attempts so far
    failures: u32,
}

impl FixedBackoff {
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            failures: 0,
        }
    }

    /// Record a failed attempt and get the wait before the next one
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures < self.max_attempts {
            Some(self.delay)
        } else {
            None
        }
    }

    /// Failed attempts recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_WAIT)
    }
}
