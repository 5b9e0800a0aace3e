//! Retry policy for bulk requests.

use std::time::Duration;

/// How failed bulk requests are retried.
///
/// Delays start at `initial_backoff` and double after every retry, capped at
/// `max_backoff`. Every attempt is bounded by `request_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 7,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(120_000),
            request_timeout: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before each retry, one entry per allowed retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        DoublingBackoff {
            next: self.initial_backoff,
            max: self.max_backoff,
        }
        .take(self.max_retries)
    }

    /// First attempt plus every retry.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
struct DoublingBackoff {
    next: Duration,
    max: Duration,
}

impl Iterator for DoublingBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next.min(self.max);
        self.next = self.next.saturating_mul(2);
        Some(delay)
    }
}
