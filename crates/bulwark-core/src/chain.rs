//! Dependency chain: named dependencies, each with its own breaker,
//! timeout and fallback, executed in a declared order.
//!
//! # Execution flow for one dependency
//! 1. Breaker gate: an open circuit serves the fallback, or fails with
//!    `CircuitOpen` when there is none
//! 2. Run the operation under the dependency's timeout
//! 3. Success records a success; an error or a timeout records a failure
//! 4. After a failure the fallback, when configured, replaces the error
//!
//! Fallbacks are `Option<T>`: `None` means no fallback, while
//! `Some(Value::Null)` is a configured fallback whose value is null.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::clock::{millis, system_clock, SharedClock};
use crate::error::{CallError, ConfigError, ResilienceError};
use crate::timeout::{enforce_deadline, TimeoutBudget};

/// A type-erased operation for batch execution.
pub type BoxedOperation<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send + 'static>;

fn default_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Deserialize a present field (even `null`) as `Some`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Configuration for a single dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct DependencyConfig<T = Value> {
    /// Unique name within a chain
    pub name: String,

    /// Deadline for each call
    #[serde(default = "default_timeout", with = "crate::config::duration_human")]
    pub timeout: Duration,

    /// Value served instead of an error
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub fallback: Option<T>,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before allowing a probe
    #[serde(default = "default_reset_timeout", with = "crate::config::duration_human")]
    pub reset_timeout: Duration,
}

impl<T> DependencyConfig<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: default_timeout(),
            fallback: None,
            failure_threshold: default_failure_threshold(),
            reset_timeout: default_reset_timeout(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::new(self.failure_threshold, self.reset_timeout)
    }
}

/// Health of one dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHealth {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub timeout_ms: u64,
    pub has_fallback: bool,
}

/// Result of the breaker gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission<T> {
    /// Run the operation within `timeout`
    Proceed { timeout: Duration },

    /// Circuit is open; serve this instead
    Fallback(T),
}

/// Outcome of one chain entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainOutcome<T> {
    Success { result: T },
    Error { error: String },
    Unknown { error: String },
}

impl<T> ChainOutcome<T> {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
            Self::Unknown { .. } => "unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            Self::Success { result } => Some(result),
            _ => None,
        }
    }
}

/// One row of a chain run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainReport<T> {
    pub name: String,
    #[serde(flatten)]
    pub outcome: ChainOutcome<T>,
}

/// A dependency and the breaker that guards it.
#[derive(Debug)]
pub struct DependencyNode<T = Value> {
    config: DependencyConfig<T>,
    breaker: CircuitBreaker,
    clock: SharedClock,
}

impl<T> DependencyNode<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(config: DependencyConfig<T>) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: DependencyConfig<T>, clock: SharedClock) -> Self {
        let breaker = CircuitBreaker::with_clock(&config.name, config.breaker_config(), clock.clone());
        Self {
            config,
            breaker,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DependencyConfig<T> {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.breaker
    }

    /// Breaker gate.
    pub fn admit(&mut self) -> Result<Admission<T>, ResilienceError> {
        match self.breaker.assert_can_proceed() {
            Ok(()) => Ok(Admission::Proceed {
                timeout: self.config.timeout,
            }),
            Err(e) => match &self.config.fallback {
                Some(value) => {
                    tracing::debug!(dependency = %self.config.name, "Circuit open, serving fallback");
                    Ok(Admission::Fallback(value.clone()))
                }
                None => Err(e),
            },
        }
    }

    /// Record the outcome of an admitted call and apply the fallback.
    pub fn settle<E>(&mut self, result: Result<T, CallError<E>>) -> Result<T, CallError<E>>
    where
        E: fmt::Display,
    {
        match result {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                tracing::warn!(dependency = %self.config.name, error = %e, "Dependency call failed");
                match &self.config.fallback {
                    Some(value) => {
                        tracing::debug!(dependency = %self.config.name, "Serving fallback");
                        Ok(value.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Run `op` on a worker thread under this dependency's deadline.
    pub fn execute<E, F>(&mut self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        match self.admit()? {
            Admission::Fallback(value) => Ok(value),
            Admission::Proceed { timeout } => {
                let result = enforce_deadline(&self.config.name, timeout, op);
                self.settle(result)
            }
        }
    }

    /// Run `op` on the calling thread.
    ///
    /// The deadline is only checked once `op` returns: a call that overran is
    /// treated as a timeout even though it produced a value.
    pub fn execute_inline<E, F>(&mut self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        match self.admit()? {
            Admission::Fallback(value) => Ok(value),
            Admission::Proceed { timeout } => {
                let budget = TimeoutBudget::with_clock(&self.config.name, timeout, self.clock.clone());
                let result = budget.scope(|_| op().map_err(CallError::Operation));
                self.settle(result)
            }
        }
    }

    pub fn health(&self) -> NodeHealth {
        let breaker = self.breaker.health();
        NodeHealth {
            name: self.config.name.clone(),
            state: breaker.state,
            failure_count: breaker.failure_count,
            timeout_ms: millis(self.config.timeout),
            has_fallback: self.config.fallback.is_some(),
        }
    }
}

/// Ordered set of protected dependencies.
///
/// Not internally synchronized.
#[derive(Debug)]
pub struct DependencyChain<T = Value> {
    nodes: Vec<DependencyNode<T>>,
    order: Vec<String>,
    clock: SharedClock,
}

impl<T> Default for DependencyChain<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            order: Vec::new(),
            clock: system_clock(),
        }
    }
}

impl<T> DependencyChain<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            nodes: Vec::new(),
            order: Vec::new(),
            clock,
        }
    }

    /// A chain of dependencies sharing one timeout and fallback.
    pub fn uniform<I, S>(names: I, timeout: Duration, fallback: Option<T>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut chain = Self::new();
        for name in names {
            let mut config = DependencyConfig::new(name).timeout(timeout);
            config.fallback = fallback.clone();
            chain.add(config);
        }
        chain
    }

    /// Add a dependency, replacing any existing one (and its breaker state)
    /// with the same name.
    pub fn add(&mut self, config: DependencyConfig<T>) -> &mut Self {
        let node = DependencyNode::with_clock(config, self.clock.clone());
        match self.position(node.name()) {
            Some(index) => self.nodes[index] = node,
            None => {
                self.order.push(node.name().to_string());
                self.nodes.push(node);
            }
        }
        self
    }

    /// Override the default execution order.
    pub fn set_order<I, S>(&mut self, names: I) -> Result<&mut Self, ResilienceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if let Some(missing) = names.iter().find(|n| !self.contains(n)) {
            return Err(ConfigError::UnregisteredDependency(missing.clone()).into());
        }
        self.order = names;
        Ok(self)
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Registered names, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&DependencyNode<T>> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DependencyNode<T>> {
        self.nodes.iter_mut().find(|n| n.name() == name)
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut DependencyNode<T>, ResilienceError> {
        self.get_mut(name)
            .ok_or_else(|| ConfigError::UnregisteredDependency(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Breaker gate for `name`, for callers that run the operation themselves.
    pub fn admit(&mut self, name: &str) -> Result<Admission<T>, ResilienceError> {
        self.node_mut(name)?.admit()
    }

    /// Record the outcome of a call admitted by [`admit`](Self::admit).
    pub fn settle<E>(&mut self, name: &str, result: Result<T, CallError<E>>) -> Result<T, CallError<E>>
    where
        E: fmt::Display,
    {
        Ok(self.node_mut(name)?.settle(result)?)
    }

    /// Execute one dependency with breaker, forced timeout and fallback.
    pub fn execute_one<E, F>(&mut self, name: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.node_mut(name)?.execute(op)
    }

    /// Execute one dependency on the calling thread.
    pub fn execute_one_inline<E, F>(&mut self, name: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        self.node_mut(name)?.execute_inline(op)
    }

    /// Run every entry in the given order. Never fails: each entry resolves
    /// to a report, and a failing entry does not stop the rest.
    pub fn execute_chain<E, I, S>(&mut self, entries: I) -> Vec<ChainReport<T>>
    where
        I: IntoIterator<Item = (S, BoxedOperation<T, E>)>,
        S: Into<String>,
        E: fmt::Display + Send + 'static,
    {
        entries
            .into_iter()
            .map(|(name, op)| {
                let name = name.into();
                let outcome = self.run_entry(&name, op);
                ChainReport { name, outcome }
            })
            .collect()
    }

    /// Like [`execute_chain`](Self::execute_chain), but in the chain's
    /// configured order. Entries the order does not mention run last.
    pub fn execute_in_order<E, I, S>(&mut self, entries: I) -> Vec<ChainReport<T>>
    where
        I: IntoIterator<Item = (S, BoxedOperation<T, E>)>,
        S: Into<String>,
        E: fmt::Display + Send + 'static,
    {
        let mut entries: Vec<(String, BoxedOperation<T, E>)> = entries
            .into_iter()
            .map(|(name, op)| (name.into(), op))
            .collect();
        entries.sort_by_key(|(name, _)| {
            self.order
                .iter()
                .position(|n| n == name)
                .unwrap_or(usize::MAX)
        });
        self.execute_chain(entries)
    }

    /// Run every dependency in the configured order, asking `op_for` for
    /// each one's operation.
    pub fn execute_all_with<E, F>(&mut self, mut op_for: F) -> Vec<ChainReport<T>>
    where
        F: FnMut(&str) -> BoxedOperation<T, E>,
        E: fmt::Display + Send + 'static,
    {
        let order = self.order.clone();
        let entries: Vec<_> = order
            .into_iter()
            .map(|name| {
                let op = op_for(&name);
                (name, op)
            })
            .collect();
        self.execute_chain(entries)
    }

    /// Exercise every dependency in the configured order with an operation
    /// that returns `T::default()`. Open circuits report their fallback or
    /// `CircuitOpen`; half-open ones get their trial call.
    pub fn sweep(&mut self) -> Vec<ChainReport<T>>
    where
        T: Default,
    {
        self.execute_all_with(|_| -> BoxedOperation<T, String> { Box::new(|| Ok(T::default())) })
    }

    fn run_entry<E>(&mut self, name: &str, op: BoxedOperation<T, E>) -> ChainOutcome<T>
    where
        E: fmt::Display + Send + 'static,
    {
        let Some(node) = self.get_mut(name) else {
            return ChainOutcome::Unknown {
                error: format!("Service {} not configured", name),
            };
        };
        match node.execute(op) {
            Ok(result) => ChainOutcome::Success { result },
            Err(e) => ChainOutcome::Error {
                error: e.to_string(),
            },
        }
    }

    /// Health of every registered dependency, in insertion order.
    pub fn health(&self) -> Vec<NodeHealth> {
        self.nodes.iter().map(|n| n.health()).collect()
    }

    /// Close every breaker. Timeouts and fallbacks are untouched.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.breaker.reset();
        }
    }
}
