//! Bounded retry for driver calls: a fixed number of attempts with a per-attempt backoff list.

use crate::driver::DriverError;
use crate::pacing::Clock;
use std::time::Duration;

/// Default number of attempts (initial plus retries).
const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default backoff in seconds after each failed attempt.
const DEFAULT_BACKOFF_SECS: [u64; 2] = [1, 2];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_COUNT,
            DEFAULT_BACKOFF_SECS.iter().map(|s| Duration::from_secs(*s)).collect(),
        )
    }
}

impl RetryPolicy {
    /// `backoff[i]` is waited after failed attempt `i + 1`; if shorter than needed, the last value
    /// is reused, and an empty list means 1, 2, 4, ... seconds.
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        let max_attempts = max_attempts.max(1);
        let backoff = if backoff.is_empty() {
            let n = max_attempts.saturating_sub(1) as usize;
            (0..n).map(|i| Duration::from_secs(1u64 << i.min(4))).collect()
        } else {
            backoff
        };
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .get(attempt as usize)
            .copied()
            .or_else(|| self.backoff.last().copied())
            .unwrap_or(Duration::from_secs(1))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub fn run<T, F>(&self, clock: &dyn Clock, what: &str, mut op: F) -> Result<T, DriverError>
    where
        F: FnMut() -> Result<T, DriverError>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation = what, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        operation = what,
                        error = %e,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Driver call failed, retrying"
                    );
                    clock.sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
