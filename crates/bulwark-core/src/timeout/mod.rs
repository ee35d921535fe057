//! Wall-clock budgets for single operations.
//!
//! - [`TimeoutBudget`]: cooperative deadline tracking (`check`, scoped runs)
//! - [`enforce_deadline`] / [`TimeoutPolicy`]: forced deadlines for calls that
//!   never hand control back, by running them on a worker thread

mod budget;
mod enforce;

pub use budget::TimeoutBudget;
pub use enforce::{
    enforce_deadline, enforce_deadline_cancellable, CancelSignal, OnTimeout, TimeoutPolicy,
};
