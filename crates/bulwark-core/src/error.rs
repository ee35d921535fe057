//! Error taxonomy for the resilience layer.
//!
//! Refusals (open circuit, exhausted budget), overruns (timeouts) and
//! programmer mistakes (unknown names) are kept apart so callers can
//! decide what is worth retrying.

use std::time::Duration;
use thiserror::Error;

use crate::breaker::CircuitState;

/// Errors raised by breakers, budgets and chains.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    #[error("{dependency} is {state} - request blocked. Try again later.")]
    CircuitOpen {
        dependency: String,
        state: CircuitState,
    },

    #[error("{operation} exceeded timeout budget ({}ms)", .limit.as_millis())]
    TimeoutExceeded { operation: String, limit: Duration },

    #[error("Budget exceeded for {category} ({}ms remaining)", .remaining.as_millis())]
    BudgetExceeded { category: String, remaining: Duration },

    #[error(
        "Circuit is OPEN ({failures} failures). Autonomous actions paused. Review the action log and reset."
    )]
    AuditTripped { failures: u32 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start worker thread: {0}")]
    Spawn(String),
}

impl ResilienceError {
    /// True for programmer/config mistakes. These never succeed on retry.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// True when the same call may succeed later (but not immediately).
    pub fn retry_later(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::TimeoutExceeded { .. } | Self::BudgetExceeded { .. }
        )
    }
}

/// Configuration mistakes, raised eagerly at call time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Category '{0}' not registered")]
    UnknownCategory(String),

    #[error("Unknown dependency: {0}")]
    UnregisteredDependency(String),

    #[error("Allocation '{id}' already active in category '{category}'")]
    DuplicateAllocation { category: String, id: String },

    #[error("{0}")]
    Invalid(String),
}

/// Outcome of running a caller-supplied operation under protection.
///
/// `E` is the caller's own error type and is passed through untouched.
#[derive(Error, Debug)]
pub enum CallError<E> {
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error("Operation failed: {0}")]
    Operation(E),

    #[error("Operation '{operation}' panicked")]
    Panicked { operation: String },
}

impl<E> CallError<E> {
    /// The resilience error, if this failure came from the layer itself.
    pub fn resilience(&self) -> Option<&ResilienceError> {
        match self {
            Self::Resilience(e) => Some(e),
            _ => None,
        }
    }

    /// True if the call was abandoned because its deadline passed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Resilience(ResilienceError::TimeoutExceeded { .. }))
    }

    /// True if the call never ran because the circuit was open.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Resilience(ResilienceError::CircuitOpen { .. }))
    }

    /// Map the caller's error type, leaving the other variants alone.
    pub fn map_operation<F, O>(self, f: O) -> CallError<F>
    where
        O: FnOnce(E) -> F,
    {
        match self {
            Self::Resilience(e) => CallError::Resilience(e),
            Self::Operation(e) => CallError::Operation(f(e)),
            Self::Panicked { operation } => CallError::Panicked { operation },
        }
    }
}
