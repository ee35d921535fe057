//! Forced deadlines for non-cooperative calls.
//!
//! The operation runs on its own thread while the caller waits on a channel
//! with a deadline. When the deadline passes the caller moves on and the
//! worker is abandoned: Rust has no way to preempt a thread, so it keeps
//! running until the operation returns and its result is discarded. Every
//! timed-out call can therefore leave one thread behind for as long as the
//! operation takes. Operations that can check for cancellation should use
//! [`enforce_deadline_cancellable`] and stop when the [`CancelSignal`] is raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::clock::millis;
use crate::error::{CallError, ResilienceError};

/// Raised when the caller stopped waiting for the operation.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Run `op` on a worker thread, waiting at most `limit` for it.
pub fn enforce_deadline<T, E, F>(operation: &str, limit: Duration, op: F) -> Result<T, CallError<E>>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    enforce_deadline_cancellable(operation, limit, move |_| op())
}

/// Like [`enforce_deadline`], handing the operation a cancellation signal.
pub fn enforce_deadline_cancellable<T, E, F>(
    operation: &str,
    limit: Duration,
    op: F,
) -> Result<T, CallError<E>>
where
    F: FnOnce(CancelSignal) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let timed_out = || {
        CallError::Resilience(ResilienceError::TimeoutExceeded {
            operation: operation.to_string(),
            limit,
        })
    };

    // A zero budget is spent before it starts
    if limit.is_zero() {
        return Err(timed_out());
    }

    // Capacity 1 so a late worker never blocks on send
    let (tx, rx) = mpsc::sync_channel(1);
    let signal = CancelSignal::default();
    let worker_signal = signal.clone();

    thread::Builder::new()
        .name("bulwark-worker".to_string())
        .spawn(move || {
            let outcome = op(worker_signal);
            let _ = tx.send(outcome);
        })
        .map_err(|e| ResilienceError::Spawn(e.to_string()))?;

    match rx.recv_timeout(limit) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Operation(e)),
        Err(RecvTimeoutError::Timeout) => {
            signal.cancel();
            tracing::warn!(
                operation = %operation,
                limit_ms = millis(limit),
                "Operation exceeded its deadline; worker abandoned"
            );
            Err(timed_out())
        }
        Err(RecvTimeoutError::Disconnected) => Err(CallError::Panicked {
            operation: operation.to_string(),
        }),
    }
}

/// What the caller gets when the deadline passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OnTimeout<T> {
    /// Return [`ResilienceError::TimeoutExceeded`]
    #[default]
    Fail,

    /// Return `Ok(None)`
    ReturnNone,

    /// Return `Ok(Some(value))`
    ReturnValue(T),
}

/// A deadline plus what to do when it is missed.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy<T> {
    operation: String,
    limit: Duration,
    on_timeout: OnTimeout<T>,
}

impl<T> TimeoutPolicy<T>
where
    T: Clone + Send + 'static,
{
    /// A policy that fails on timeout.
    pub fn new(operation: impl Into<String>, limit: Duration) -> Self {
        Self {
            operation: operation.into(),
            limit,
            on_timeout: OnTimeout::Fail,
        }
    }

    pub fn on_timeout(mut self, on_timeout: OnTimeout<T>) -> Self {
        self.on_timeout = on_timeout;
        self
    }

    pub fn return_none(self) -> Self {
        self.on_timeout(OnTimeout::ReturnNone)
    }

    pub fn return_value(self, value: T) -> Self {
        self.on_timeout(OnTimeout::ReturnValue(value))
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Run `op` under this policy.
    ///
    /// `Ok(None)` only ever comes from [`OnTimeout::ReturnNone`].
    pub fn run<E, F>(&self, op: F) -> Result<Option<T>, CallError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Send + 'static,
    {
        self.resolve(enforce_deadline(&self.operation, self.limit, op))
    }

    pub fn run_cancellable<E, F>(&self, op: F) -> Result<Option<T>, CallError<E>>
    where
        F: FnOnce(CancelSignal) -> Result<T, E> + Send + 'static,
        E: Send + 'static,
    {
        self.resolve(enforce_deadline_cancellable(&self.operation, self.limit, op))
    }

    fn resolve<E>(&self, result: Result<T, CallError<E>>) -> Result<Option<T>, CallError<E>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_timeout() => match &self.on_timeout {
                OnTimeout::Fail => Err(e),
                OnTimeout::ReturnNone => Ok(None),
                OnTimeout::ReturnValue(value) => Ok(Some(value.clone())),
            },
            Err(e) => Err(e),
        }
    }
}
