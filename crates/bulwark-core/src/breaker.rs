//! Circuit breaker for a single dependency.
//!
//! # State machine
//! ```text
//! Closed   → Open:     consecutive_failures >= failure_threshold
//! Open     → HalfOpen: recovery_timeout elapsed since the last failure (on read)
//! HalfOpen → Closed:   success
//! HalfOpen → Open:     failure
//! ```
//!
//! There is no timer thread. The Open → HalfOpen transition is computed from
//! the stored failure timestamp whenever the state is read or a signal is
//! recorded. A breaker configured with `require_manual_reset` never makes that
//! transition and stays Open until [`CircuitBreaker::reset`].
//!
//! A `failure_threshold` of 0 produces a breaker that starts Open: the
//! dependency is gated until an operator resets it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, SharedClock};
use crate::error::ResilienceError;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time after the last failure before a probe call is allowed
    #[serde(with = "crate::config::duration_human")]
    pub recovery_timeout: Duration,

    /// Never heal on a timer; only an explicit reset closes the circuit
    #[serde(default)]
    pub require_manual_reset: bool,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            require_manual_reset: false,
        }
    }

    /// Configuration for breakers guarding irreversible actions.
    pub fn manual(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            // unused while require_manual_reset is set
            recovery_timeout: Duration::from_secs(60),
            require_manual_reset: true,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,

    /// Failing fast, requests blocked
    Open,

    /// Recovery probe allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerHealth {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub since_last_failure: Option<Duration>,
    pub since_last_success: Option<Duration>,
}

/// Consecutive-failure circuit breaker.
///
/// Not internally synchronized; wrap it in a lock to share it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    /// Create a breaker reading time from `clock`.
    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        let state = Self::initial_state(&config);
        Self {
            name: name.into(),
            config,
            state,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            clock,
        }
    }

    fn initial_state(config: &BreakerConfig) -> CircuitState {
        if config.failure_threshold == 0 {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Number of consecutive failures.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    pub fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    /// Current state, applying a pending Open → HalfOpen transition first.
    pub fn state(&mut self) -> CircuitState {
        self.tick();
        self.state
    }

    /// Current state as it would be read now, without applying it.
    pub fn peek_state(&self) -> CircuitState {
        self.effective_state(self.clock.now())
    }

    fn effective_state(&self, now: Instant) -> CircuitState {
        if self.state != CircuitState::Open || self.config.require_manual_reset {
            return self.state;
        }
        match self.last_failure_at {
            Some(at) if now.saturating_duration_since(at) >= self.config.recovery_timeout => {
                CircuitState::HalfOpen
            }
            _ => self.state,
        }
    }

    fn tick(&mut self) {
        let next = self.effective_state(self.clock.now());
        if next != self.state {
            tracing::info!(
                dependency = %self.name,
                "Circuit transitioning to half-open for recovery test"
            );
            self.state = next;
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        self.tick();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(self.clock.now());

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                tracing::warn!(
                    dependency = %self.name,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.state = CircuitState::Open;
                tracing::warn!(
                    dependency = %self.name,
                    failures = self.consecutive_failures,
                    "Circuit opened after repeated failures"
                );
            }
            _ => {}
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        self.tick();
        self.last_success_at = Some(self.clock.now());

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                tracing::info!(dependency = %self.name, "Circuit closed after successful recovery");
            }
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::Open => {}
        }
    }

    /// Whether a call may proceed right now.
    pub fn allows_request(&mut self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Fail with [`ResilienceError::CircuitOpen`] if the circuit is open.
    ///
    /// HalfOpen lets the probe call through.
    pub fn assert_can_proceed(&mut self) -> Result<(), ResilienceError> {
        match self.state() {
            CircuitState::Open => Err(ResilienceError::CircuitOpen {
                dependency: self.name.clone(),
                state: CircuitState::Open,
            }),
            _ => Ok(()),
        }
    }

    /// Run `op` inline under this breaker, recording its outcome.
    pub fn call<T, E, F>(&mut self, op: F) -> Result<T, crate::CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.assert_can_proceed()?;
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(crate::CallError::Operation(e))
            }
        }
    }

    /// Force the circuit closed and forget all history.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        self.last_success_at = None;
    }

    /// Restore persisted counters without replaying history.
    pub(crate) fn restore(&mut self, state: CircuitState, failures: u32) {
        self.state = state;
        self.consecutive_failures = failures;
    }

    /// Snapshot for monitoring. Does not mutate the breaker.
    pub fn health(&self) -> BreakerHealth {
        let now = self.clock.now();
        BreakerHealth {
            name: self.name.clone(),
            state: self.effective_state(now),
            failure_count: self.consecutive_failures,
            since_last_failure: self.last_failure_at.map(|at| now.saturating_duration_since(at)),
            since_last_success: self.last_success_at.map(|at| now.saturating_duration_since(at)),
        }
    }
}
