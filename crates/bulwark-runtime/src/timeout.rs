//! Deadlines for async work.
//!
//! A future that misses its deadline is dropped, which cancels it at its
//! next await point. Blocking closures go to tokio's blocking pool and cannot
//! be cancelled: on timeout the pool thread keeps running until the closure
//! returns, and its result is discarded.

use bulwark_core::{CallError, ResilienceError};
use std::future::Future;
use std::time::Duration;

fn timed_out<E>(operation: &str, limit: Duration) -> CallError<E> {
    CallError::Resilience(ResilienceError::TimeoutExceeded {
        operation: operation.to_string(),
        limit,
    })
}

/// Await `fut` for at most `limit`.
pub async fn enforce_future<T, E, F>(
    operation: &str,
    limit: Duration,
    fut: F,
) -> Result<T, CallError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    if limit.is_zero() {
        return Err(timed_out(operation, limit));
    }

    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Operation(e)),
        Err(_) => {
            tracing::warn!(operation = %operation, timeout = ?limit, "Operation timed out");
            Err(timed_out(operation, limit))
        }
    }
}

/// Run a blocking closure on the blocking pool, waiting at most `limit`.
pub async fn enforce_blocking<T, E, F>(
    operation: &str,
    limit: Duration,
    op: F,
) -> Result<T, CallError<E>>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    if limit.is_zero() {
        return Err(timed_out(operation, limit));
    }

    let handle = tokio::task::spawn_blocking(op);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(CallError::Operation(e)),
        Ok(Err(_)) => Err(CallError::Panicked {
            operation: operation.to_string(),
        }),
        Err(_) => {
            tracing::warn!(
                operation = %operation,
                timeout = ?limit,
                "Blocking operation timed out; worker abandoned"
            );
            Err(timed_out(operation, limit))
        }
    }
}
