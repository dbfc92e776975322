//! Waiting: the clock every bounded wait goes through, human-paced page delays, and cancellation.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of time and sleeping. Production uses [SystemClock]; tests use a virtual clock so
/// multi-minute waits finish instantly.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Randomized delay between page advances, uniformly drawn from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDelay {
    pub min: Duration,
    pub max: Duration,
}

impl PageDelay {
    pub fn from_secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min.min(max)),
            max: Duration::from_secs(max.max(min)),
        }
    }

    pub fn sample(&self) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if lo >= hi {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

impl Default for PageDelay {
    fn default() -> Self {
        Self::from_secs(2, 5)
    }
}

/// Cooperative interrupt checked between pages and between export jobs.
///
/// Library-only: the `mparchive` binary installs no signal handler, so Ctrl-C ends the process
/// outright. Dedup keys are flushed per append and the pending journal is rewritten atomically,
/// so nothing already recorded is lost. Embedders set the flag from their own handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Virtual clock: `sleep` advances `now` without blocking.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: std::cell::Cell<Instant>,
    slept: std::cell::Cell<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: std::cell::Cell::new(Instant::now()),
            slept: std::cell::Cell::new(Duration::ZERO),
        }
    }

    /// Total virtual time slept so far.
    pub(crate) fn slept(&self) -> Duration {
        self.slept.get()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
        self.slept.set(self.slept.get() + duration);
    }
}
