//! Cooperative timeout budget.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::clock::{system_clock, SharedClock};
use crate::error::ResilienceError;

/// A deadline for one operation.
///
/// The clock starts at construction. Once the budget is seen to be spent it
/// latches: `elapsed()` then reports exactly `max_duration` and never more.
#[derive(Debug)]
pub struct TimeoutBudget {
    name: String,
    max_duration: Duration,
    started_at: Mutex<Instant>,
    exhausted: AtomicBool,
    clock: SharedClock,
}

impl TimeoutBudget {
    /// Create a budget and start its clock.
    pub fn new(name: impl Into<String>, max_duration: Duration) -> Self {
        Self::with_clock(name, max_duration, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, max_duration: Duration, clock: SharedClock) -> Self {
        let started_at = clock.now();
        Self {
            name: name.into(),
            max_duration,
            started_at: Mutex::new(started_at),
            exhausted: AtomicBool::new(max_duration.is_zero()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Time spent so far, capped at `max_duration`.
    pub fn elapsed(&self) -> Duration {
        if self.exhausted.load(Ordering::Acquire) {
            return self.max_duration;
        }
        let started_at = *self.started_at.lock();
        let elapsed = self.clock.now().saturating_duration_since(started_at);
        if elapsed >= self.max_duration {
            self.exhausted.store(true, Ordering::Release);
            return self.max_duration;
        }
        elapsed
    }

    pub fn remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Fail with [`ResilienceError::TimeoutExceeded`] once the budget is spent.
    pub fn check(&self) -> Result<(), ResilienceError> {
        if self.is_exhausted() {
            return Err(ResilienceError::TimeoutExceeded {
                operation: self.name.clone(),
                limit: self.max_duration,
            });
        }
        Ok(())
    }

    /// Restart the clock.
    pub fn rearm(&self) {
        *self.started_at.lock() = self.clock.now();
        self.exhausted
            .store(self.max_duration.is_zero(), Ordering::Release);
    }

    /// Run `f` inside a freshly armed budget.
    ///
    /// An error from `f` is returned as is. If `f` succeeds but overran the
    /// deadline, the result is dropped and a timeout is returned instead.
    pub fn scope<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<ResilienceError>,
    {
        self.rearm();
        let value = f(self)?;
        self.check()?;
        Ok(value)
    }
}
