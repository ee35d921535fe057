//! Shared, async-friendly dependency chain.

use bulwark_core::{
    Admission, CallError, ChainOutcome, ChainReport, DependencyChain, DependencyConfig, NodeHealth,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::timeout::{enforce_blocking, enforce_future};

/// A type-erased async operation for batch execution.
pub type BoxedTask<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// A [`DependencyChain`] that can be cloned across tasks.
///
/// The lock is held only to admit a call and to record its outcome, never
/// while the operation runs.
pub struct AsyncChain<T = Value> {
    inner: Arc<Mutex<DependencyChain<T>>>,
}

impl<T> Clone for AsyncChain<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AsyncChain<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChain")
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl<T> From<DependencyChain<T>> for AsyncChain<T> {
    fn from(chain: DependencyChain<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(chain)),
        }
    }
}

impl<T> AsyncChain<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(chain: DependencyChain<T>) -> Self {
        chain.into()
    }

    pub fn add(&self, config: DependencyConfig<T>) {
        self.inner.lock().add(config);
    }

    /// Run `f` with exclusive access to the underlying chain.
    pub fn with_chain<R>(&self, f: impl FnOnce(&mut DependencyChain<T>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Execute one dependency: breaker gate, deadline, fallback.
    pub async fn execute<E, F, Fut>(&self, name: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let admission = self.inner.lock().admit(name)?;
        match admission {
            Admission::Fallback(value) => Ok(value),
            Admission::Proceed { timeout } => {
                let result = enforce_future(name, timeout, op()).await;
                self.inner.lock().settle(name, result)
            }
        }
    }

    /// Execute a blocking closure for one dependency on the blocking pool.
    pub async fn execute_blocking<E, F>(&self, name: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let admission = self.inner.lock().admit(name)?;
        match admission {
            Admission::Fallback(value) => Ok(value),
            Admission::Proceed { timeout } => {
                let result = enforce_blocking(name, timeout, op).await;
                self.inner.lock().settle(name, result)
            }
        }
    }

    /// Run every entry, one after another, in the given order.
    pub async fn execute_all<E, I, S>(&self, entries: I) -> Vec<ChainReport<T>>
    where
        I: IntoIterator<Item = (S, BoxedTask<T, E>)>,
        S: Into<String>,
        E: fmt::Display,
    {
        let mut reports = Vec::new();
        for (name, task) in entries {
            let name = name.into();
            let outcome = if !self.inner.lock().contains(&name) {
                ChainOutcome::Unknown {
                    error: format!("Service {} not configured", name),
                }
            } else {
                match self.execute(&name, || task).await {
                    Ok(result) => ChainOutcome::Success { result },
                    Err(e) => ChainOutcome::Error {
                        error: e.to_string(),
                    },
                }
            };
            reports.push(ChainReport { name, outcome });
        }
        reports
    }

    pub fn health(&self) -> Vec<NodeHealth> {
        self.inner.lock().health()
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::CircuitState;
    use serde_json::json;
    use std::time::Duration;

    fn chain() -> AsyncChain {
        let mut chain = DependencyChain::new();
        chain.add(
            DependencyConfig::new("api")
                .timeout(Duration::from_millis(100))
                .failure_threshold(2)
                .fallback(json!({"status": "degraded"})),
        );
        chain.add(DependencyConfig::new("db").timeout(Duration::from_millis(100)));
        AsyncChain::new(chain)
    }

    #[tokio::test]
    async fn test_execute_success() {
        let chain = chain();
        let result = chain
            .execute("db", || async { Ok::<_, String>(json!({"rows": 3})) })
            .await;
        assert_eq!(result.unwrap(), json!({"rows": 3}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_serves_fallback_and_counts() {
        let chain = chain();
        let result = chain
            .execute("api", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(json!("fresh"))
            })
            .await;

        assert_eq!(result.unwrap(), json!({"status": "degraded"}));
        assert_eq!(chain.health()[0].failure_count, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let chain = chain();
        for _ in 0..2 {
            let _ = chain
                .execute("api", || async { Err::<Value, _>("503") })
                .await;
        }
        assert_eq!(chain.health()[0].state, CircuitState::Open);

        let result = chain
            .execute("api", || async { Err::<Value, _>("must not run while open") })
            .await;
        assert_eq!(result.unwrap(), json!({"status": "degraded"}));
        assert_eq!(chain.health()[0].failure_count, 2);

        chain.reset();
        assert_eq!(chain.health()[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let chain = chain();
        let other = chain.clone();
        let _ = other.execute("db", || async { Err::<Value, _>("down") }).await;
        assert_eq!(chain.health()[1].failure_count, 1);
    }

    #[tokio::test]
    async fn test_execute_blocking() {
        let chain = chain();
        let result = chain.execute_blocking("db", || Ok::<_, String>(json!(1))).await;
        assert_eq!(result.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_execute_all_reports_every_entry() {
        let chain = chain();
        let entries: Vec<(&str, BoxedTask<Value, String>)> = vec![
            ("db", Box::pin(async { Ok(json!("ok")) })),
            ("ghost", Box::pin(async { Ok(json!("never")) })),
            ("api", Box::pin(async { Err("boom".to_string()) })),
        ];

        let reports = chain.execute_all(entries).await;
        let statuses: Vec<_> = reports.iter().map(|r| r.outcome.status()).collect();
        assert_eq!(statuses, vec!["success", "unknown", "success"]);
        assert_eq!(reports[2].outcome.result(), Some(&json!({"status": "degraded"})));
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_config_error() {
        let chain = chain();
        let result = chain
            .execute("ghost", || async { Ok::<_, String>(Value::Null) })
            .await;
        match result {
            Err(CallError::Resilience(e)) => assert!(e.is_config()),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
