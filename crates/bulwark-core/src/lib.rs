//! # Bulwark Core
//!
//! Resilience primitives for calls into unreliable dependencies.
//!
//! ## Pieces
//!
//! - **CircuitBreaker**: consecutive-failure breaker with lazy half-open recovery
//! - **TimeoutBudget**: per-operation deadlines, cooperative or forced
//! - **BudgetCategory / BudgetMonitor**: shared time pools split into allocations
//! - **DependencyChain**: breaker + timeout + fallback per named dependency
//! - **AuditBreaker**: manual-reset breaker with a persisted action ledger
//!
//! ## Example
//!
//! ```rust,no_run
//! use bulwark_core::{DependencyChain, DependencyConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let mut chain = DependencyChain::new();
//! chain.add(
//!     DependencyConfig::new("moltbook_api")
//!         .timeout(Duration::from_secs(3))
//!         .fallback(json!({"error": true})),
//! );
//!
//! let feed = chain.execute_one("moltbook_api", || Err::<serde_json::Value, _>("HTTP 503"));
//! assert_eq!(feed.unwrap(), json!({"error": true}));
//! ```

pub mod audit;
pub mod breaker;
pub mod budget;
pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod monitor;
pub mod timeout;

pub use audit::{
    ActionRecord, ActionSummary, AuditBreaker, JsonFileStore, LedgerSnapshot, LedgerStore,
    MemoryLedgerStore, StoreError,
};
pub use breaker::{BreakerConfig, BreakerHealth, CircuitBreaker, CircuitState};
pub use budget::{global_monitor, Allocation, BudgetCategory, BudgetMonitor, CategoryStatus};
pub use chain::{
    Admission, BoxedOperation, ChainOutcome, ChainReport, DependencyChain, DependencyConfig,
    DependencyNode, NodeHealth,
};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AuditConfig, BudgetConfig, LoadError, ResilienceConfig};
pub use error::{CallError, ConfigError, ResilienceError};
pub use monitor::DependencyMonitor;
pub use timeout::{
    enforce_deadline, enforce_deadline_cancellable, CancelSignal, OnTimeout, TimeoutBudget,
    TimeoutPolicy,
};
