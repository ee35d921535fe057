//! # Bulwark Runtime
//!
//! Tokio adapters for `bulwark-core`.
//!
//! - [`enforce_future`]: deadline for a future, cancelling it on timeout
//! - [`enforce_blocking`]: deadline for blocking code on the blocking pool
//! - [`AsyncChain`]: a cloneable [`DependencyChain`](bulwark_core::DependencyChain)
//!   whose lock is never held across an await
//! - [`spawn_health_reporter`]: periodic health logging

pub mod chain;
pub mod reporter;
pub mod timeout;

pub use chain::{AsyncChain, BoxedTask};
pub use reporter::{spawn_health_reporter, spawn_health_watch};
pub use timeout::{enforce_blocking, enforce_future};
