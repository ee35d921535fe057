//! Pooled timeout budgets.
//!
//! A [`BudgetCategory`] holds a total allowance of wall-clock time for one
//! external system and hands out [`TimeoutBudget`]s carved from it. The
//! [`BudgetMonitor`] is the registry of categories; [`global_monitor`] gives
//! process-wide access to a shared one.

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{millis, system_clock, SharedClock};
use crate::error::{ConfigError, ResilienceError};
use crate::timeout::TimeoutBudget;

/// A budget carved out of a category, tagged with its allocation id.
#[derive(Debug, Clone)]
pub struct Allocation {
    id: String,
    category: String,
    budget: Arc<TimeoutBudget>,
}

impl Allocation {
    /// Id to pass to `release`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn budget(&self) -> &Arc<TimeoutBudget> {
        &self.budget
    }
}

impl Deref for Allocation {
    type Target = TimeoutBudget;

    fn deref(&self) -> &TimeoutBudget {
        &self.budget
    }
}

/// Usage summary for a category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStatus {
    pub name: String,
    pub total_ms: u64,
    pub allocated_ms: u64,
    pub remaining_ms: u64,
    pub usage_percent: f64,
    pub active_allocations: usize,
}

#[derive(Debug, Default)]
struct CategoryLedger {
    allocated: Duration,
    allocations: HashMap<String, Arc<TimeoutBudget>>,
}

/// A shared pool of time for calls to one external system.
///
/// The capacity check and the increment happen under one lock, so concurrent
/// callers can never over-commit the pool.
#[derive(Debug)]
pub struct BudgetCategory {
    name: String,
    total: Duration,
    ledger: Mutex<CategoryLedger>,
    next_id: AtomicU64,
    clock: SharedClock,
}

impl BudgetCategory {
    pub fn new(name: impl Into<String>, total: Duration) -> Self {
        Self::with_clock(name, total, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, total: Duration, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            total,
            ledger: Mutex::new(CategoryLedger::default()),
            next_id: AtomicU64::new(0),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn allocated(&self) -> Duration {
        self.ledger.lock().allocated
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.allocated())
    }

    pub fn allocation_count(&self) -> usize {
        self.ledger.lock().allocations.len()
    }

    /// Allocated share of the pool. A zero-sized pool reports 100%.
    pub fn usage_percent(&self) -> f64 {
        usage_percent(self.allocated(), self.total)
    }

    /// Carve `duration` out of the pool.
    ///
    /// Without an explicit id one is generated; generated ids are never reused.
    pub fn allocate(&self, duration: Duration, id: Option<&str>) -> Result<Allocation, ResilienceError> {
        let mut ledger = self.ledger.lock();

        let remaining = self.total.saturating_sub(ledger.allocated);
        if remaining < duration {
            tracing::debug!(
                category = %self.name,
                requested_ms = millis(duration),
                remaining_ms = millis(remaining),
                "Budget allocation rejected"
            );
            return Err(ResilienceError::BudgetExceeded {
                category: self.name.clone(),
                remaining,
            });
        }

        let id = match id {
            Some(id) if ledger.allocations.contains_key(id) => {
                return Err(ConfigError::DuplicateAllocation {
                    category: self.name.clone(),
                    id: id.to_string(),
                }
                .into());
            }
            Some(id) => id.to_string(),
            None => self.generate_id(&ledger),
        };

        let budget = Arc::new(TimeoutBudget::with_clock(
            format!("{}_{}", self.name, id),
            duration,
            self.clock.clone(),
        ));
        ledger.allocations.insert(id.clone(), budget.clone());
        ledger.allocated += duration;

        Ok(Allocation {
            id,
            category: self.name.clone(),
            budget,
        })
    }

    fn generate_id(&self, ledger: &CategoryLedger) -> String {
        loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = format!("alloc_{}", n);
            if !ledger.allocations.contains_key(&id) {
                return id;
            }
        }
    }

    /// Return an allocation to the pool. Unknown ids are ignored.
    pub fn release(&self, id: &str) -> bool {
        let mut ledger = self.ledger.lock();
        match ledger.allocations.remove(id) {
            Some(budget) => {
                ledger.allocated = ledger.allocated.saturating_sub(budget.max_duration());
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> CategoryStatus {
        let (allocated, active) = {
            let ledger = self.ledger.lock();
            (ledger.allocated, ledger.allocations.len())
        };
        CategoryStatus {
            name: self.name.clone(),
            total_ms: millis(self.total),
            allocated_ms: millis(allocated),
            remaining_ms: millis(self.total.saturating_sub(allocated)),
            usage_percent: usage_percent(allocated, self.total),
            active_allocations: active,
        }
    }
}

fn usage_percent(allocated: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        return 100.0;
    }
    allocated.as_secs_f64() / total.as_secs_f64() * 100.0
}

/// Registry of budget categories, keyed by name.
#[derive(Debug, Default)]
pub struct BudgetMonitor {
    categories: RwLock<HashMap<String, Arc<BudgetCategory>>>,
}

impl BudgetMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a category, replacing any existing one with the same name.
    pub fn register_category(&self, category: BudgetCategory) -> Arc<BudgetCategory> {
        let category = Arc::new(category);
        self.categories
            .write()
            .insert(category.name().to_string(), category.clone());
        category
    }

    pub fn category(&self, name: &str) -> Option<Arc<BudgetCategory>> {
        self.categories.read().get(name).cloned()
    }

    /// Allocate from a registered category.
    ///
    /// An unregistered category is a configuration error, not a budget
    /// overrun.
    pub fn allocate(
        &self,
        category: &str,
        duration: Duration,
        id: Option<&str>,
    ) -> Result<Allocation, ResilienceError> {
        let found = self
            .category(category)
            .ok_or_else(|| ConfigError::UnknownCategory(category.to_string()))?;
        found.allocate(duration, id)
    }

    pub fn release(&self, category: &str, id: &str) -> bool {
        self.category(category)
            .map(|c| c.release(id))
            .unwrap_or(false)
    }

    pub fn status(&self, category: &str) -> Option<CategoryStatus> {
        self.category(category).map(|c| c.status())
    }

    /// Status of every category, sorted by name.
    pub fn all_status(&self) -> Vec<CategoryStatus> {
        let mut all: Vec<CategoryStatus> = self
            .categories
            .read()
            .values()
            .map(|c| c.status())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

lazy_static! {
    static ref GLOBAL_MONITOR: BudgetMonitor = BudgetMonitor::new();
}

/// The process-wide monitor, created on first use.
pub fn global_monitor() -> &'static BudgetMonitor {
    &GLOBAL_MONITOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_over_allocation_reports_remaining() {
        let category = BudgetCategory::new("openai", ms(1000));
        category.allocate(ms(600), None).unwrap();

        let err = category.allocate(ms(500), None).unwrap_err();
        assert_eq!(
            err,
            ResilienceError::BudgetExceeded {
                category: "openai".to_string(),
                remaining: ms(400),
            }
        );
        // Rejected request left the pool untouched
        assert_eq!(category.allocated(), ms(600));
    }

    #[test]
    fn test_release_returns_time_to_pool() {
        let category = BudgetCategory::new("api", ms(5000));
        let first = category.allocate(ms(1000), None).unwrap();
        let second = category.allocate(ms(2000), Some("batch")).unwrap();
        assert_eq!(second.id(), "batch");
        assert_eq!(category.remaining(), ms(2000));
        assert!((category.usage_percent() - 60.0).abs() < 1e-9);

        assert!(category.release(first.id()));
        assert_eq!(category.remaining(), ms(3000));

        // Idempotent
        assert!(!category.release(first.id()));
        assert!(!category.release("never-allocated"));
        assert_eq!(category.remaining(), ms(3000));
    }

    #[test]
    fn test_generated_ids_are_not_reused() {
        let category = BudgetCategory::new("api", ms(100));
        let a = category.allocate(ms(10), None).unwrap();
        let b = category.allocate(ms(10), None).unwrap();
        category.release(a.id());
        let c = category.allocate(ms(10), None).unwrap();

        assert_ne!(c.id(), b.id());
        assert_ne!(c.id(), a.id());
        assert_eq!(category.allocated(), ms(20));
    }

    #[test]
    fn test_duplicate_explicit_id_is_rejected() {
        let category = BudgetCategory::new("api", ms(100));
        category.allocate(ms(10), Some("job")).unwrap();
        let err = category.allocate(ms(10), Some("job")).unwrap_err();
        assert!(err.is_config());
        assert_eq!(category.allocated(), ms(10));
    }

    #[test]
    fn test_zero_budget_category_is_saturated() {
        let category = BudgetCategory::new("frozen", Duration::ZERO);
        assert_eq!(category.usage_percent(), 100.0);
        assert_eq!(category.status().usage_percent, 100.0);

        // A zero-length allocation still fits
        let alloc = category.allocate(Duration::ZERO, None).unwrap();
        assert!(alloc.is_exhausted());
    }

    #[test]
    fn test_allocation_is_a_live_budget() {
        let category = BudgetCategory::new("api", ms(1000));
        let alloc = category.allocate(ms(250), Some("call")).unwrap();
        assert_eq!(alloc.name(), "api_call");
        assert_eq!(alloc.max_duration(), ms(250));
        assert!(alloc.check().is_ok());
    }

    #[test]
    fn test_monitor_unknown_category_is_config_error() {
        let monitor = BudgetMonitor::new();
        let err = monitor.allocate("missing", ms(10), None).unwrap_err();
        assert_eq!(
            err,
            ResilienceError::Config(ConfigError::UnknownCategory("missing".to_string()))
        );
        assert!(!monitor.release("missing", "x"));
        assert!(monitor.status("missing").is_none());
    }

    #[test]
    fn test_monitor_status() {
        let monitor = BudgetMonitor::new();
        monitor.register_category(BudgetCategory::new("b", ms(1000)));
        monitor.register_category(BudgetCategory::new("a", ms(2000)));

        let alloc = monitor.allocate("a", ms(500), None).unwrap();
        let status = monitor.status("a").unwrap();
        assert_eq!(status.allocated_ms, 500);
        assert_eq!(status.remaining_ms, 1500);
        assert_eq!(status.usage_percent, 25.0);
        assert_eq!(status.active_allocations, 1);

        let names: Vec<_> = monitor.all_status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(monitor.release(alloc.category(), alloc.id()));
        assert_eq!(monitor.status("a").unwrap().allocated_ms, 0);
    }

    #[test]
    fn test_status_of_unbounded_category_saturates() {
        let status = BudgetCategory::new("forever", Duration::MAX).status();
        assert_eq!(status.total_ms, u64::MAX);
        assert_eq!(status.remaining_ms, u64::MAX);
        assert_eq!(status.allocated_ms, 0);
    }

    #[test]
    fn test_global_monitor_is_shared() {
        global_monitor().register_category(BudgetCategory::new("global_test", ms(10_000)));
        let alloc = global_monitor().allocate("global_test", ms(500), None).unwrap();
        assert!(global_monitor().category("global_test").is_some());
        global_monitor().release("global_test", alloc.id());
    }

    #[test]
    fn test_concurrent_allocations_never_overcommit() {
        let category = Arc::new(BudgetCategory::new("shared", ms(1000)));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let category = Arc::clone(&category);
                thread::spawn(move || category.allocate(ms(100), None).is_ok())
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 10);
        assert_eq!(category.remaining(), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_allocate_release_is_exact(total in 0u64..10_000, request in 0u64..10_000) {
            let category = BudgetCategory::new("prop", ms(total));
            let before = category.remaining();
            match category.allocate(ms(request), None) {
                Ok(alloc) => {
                    prop_assert!(request <= total);
                    prop_assert_eq!(category.remaining(), before - ms(request));
                    category.release(alloc.id());
                    prop_assert_eq!(category.remaining(), before);
                }
                Err(_) => prop_assert!(request > total),
            }
        }
    }
}
