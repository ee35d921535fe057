//! Audit breaker for autonomous actions.
//!
//! Counts failures of irreversible actions rather than service calls and
//! keeps a ledger of what was done, with the command that would undo it.
//! Once open it stays open until an operator calls [`AuditBreaker::reset`]:
//! there is no timed recovery. A success always clears the failure count and
//! starts a new window, even while open.
//!
//! The snapshot is saved after every change. Saving is best effort: a
//! failed write is logged and the in-memory state carries on.

mod ledger;
mod store;

pub use ledger::{ActionRecord, LedgerSnapshot};
pub use store::{JsonFileStore, LedgerStore, MemoryLedgerStore, StoreError};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::error::ResilienceError;

/// Failures before an audit breaker opens, unless configured.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Ledger entries kept on disk, unless configured.
pub const DEFAULT_RETAIN: usize = 100;

/// Counts over the whole in-memory ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSummary {
    pub total_actions: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub current_state: CircuitState,
    pub failures_in_window: u32,
}

#[derive(Debug)]
struct AuditState {
    breaker: CircuitBreaker,
    ledger: Vec<ActionRecord>,
    window_start: DateTime<Utc>,
}

/// Breaker guarding irreversible actions, with a persisted action ledger.
///
/// Safe to share between threads.
#[derive(Debug)]
pub struct AuditBreaker {
    inner: Mutex<AuditState>,
    store: Box<dyn LedgerStore>,
    retain: usize,
}

impl AuditBreaker {
    /// Breaker persisted as JSON at `state_file`.
    pub fn new(failure_threshold: u32, state_file: impl Into<PathBuf>) -> Self {
        Self::with_store(failure_threshold, JsonFileStore::new(state_file))
    }

    /// Breaker whose ledger lives only in memory.
    pub fn in_memory(failure_threshold: u32) -> Self {
        Self::with_store(failure_threshold, MemoryLedgerStore::new())
    }

    /// Breaker backed by `store`, restoring any snapshot it holds.
    ///
    /// An unreadable snapshot is logged and ignored.
    pub fn with_store(failure_threshold: u32, store: impl LedgerStore + 'static) -> Self {
        let mut breaker = CircuitBreaker::new("audit", BreakerConfig::manual(failure_threshold));
        let mut ledger = Vec::new();
        let mut window_start = Utc::now();

        match store.load() {
            Ok(Some(snapshot)) => {
                breaker.restore(snapshot.state, snapshot.failure_count);
                window_start = snapshot.parsed_window_start().unwrap_or(window_start);
                ledger = snapshot.action_log;
                tracing::debug!(
                    state = %snapshot.state,
                    failures = snapshot.failure_count,
                    entries = ledger.len(),
                    "Restored audit ledger"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not load audit ledger, starting fresh");
            }
        }

        Self {
            inner: Mutex::new(AuditState {
                breaker,
                ledger,
                window_start,
            }),
            store: Box::new(store),
            retain: DEFAULT_RETAIN,
        }
    }

    /// Number of ledger entries written on each save.
    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    pub fn retain(&self) -> usize {
        self.retain
    }

    /// Record an action and its outcome, then save.
    pub fn record_action(&self, operation: &str, success: bool, revert_command: Option<&str>) {
        let mut inner = self.inner.lock();
        inner.ledger.push(ActionRecord::new(
            operation,
            success,
            revert_command.map(str::to_string),
        ));

        if success {
            inner.breaker.record_success();
            if inner.breaker.peek_state() == CircuitState::Open {
                // stays open, but the count restarts
                inner.breaker.restore(CircuitState::Open, 0);
            }
            inner.window_start = Utc::now();
        } else {
            inner.breaker.record_failure();
            tracing::warn!(
                operation = %operation,
                failures = inner.breaker.failure_count(),
                "Autonomous action failed"
            );
        }

        self.persist(&inner);
    }

    /// Whether `operation` may run now.
    pub fn can_execute(&self, operation: &str) -> bool {
        let allowed = self.inner.lock().breaker.allows_request();
        if !allowed {
            tracing::debug!(operation = %operation, "Audit circuit open, action refused");
        }
        allowed
    }

    /// Fail with [`ResilienceError::AuditTripped`] if the circuit is open.
    pub fn assert_can_execute(&self, operation: &str) -> Result<(), ResilienceError> {
        let mut inner = self.inner.lock();
        if inner.breaker.allows_request() {
            return Ok(());
        }
        tracing::debug!(operation = %operation, "Audit circuit open, action refused");
        Err(ResilienceError::AuditTripped {
            failures: inner.breaker.failure_count(),
        })
    }

    /// Entries carrying a revert command, oldest first.
    pub fn revert_plan(&self) -> Vec<ActionRecord> {
        self.inner
            .lock()
            .ledger
            .iter()
            .filter(|record| record.revert().is_some())
            .cloned()
            .collect()
    }

    pub fn action_summary(&self) -> ActionSummary {
        let inner = self.inner.lock();
        let success_count = inner.ledger.iter().filter(|r| r.success).count();
        ActionSummary {
            total_actions: inner.ledger.len(),
            success_count,
            failure_count: inner.ledger.len() - success_count,
            current_state: inner.breaker.peek_state(),
            failures_in_window: inner.breaker.failure_count(),
        }
    }

    /// Close the circuit. The ledger is kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.breaker.reset();
        inner.window_start = Utc::now();
        tracing::info!("Audit circuit reset by operator");
        self.persist(&inner);
    }

    /// Drop every ledger entry.
    pub fn clear_ledger(&self) {
        let mut inner = self.inner.lock();
        inner.ledger.clear();
        self.persist(&inner);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().breaker.peek_state()
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().breaker.failure_count()
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.inner.lock().window_start
    }

    /// Copy of the in-memory ledger.
    pub fn ledger(&self) -> Vec<ActionRecord> {
        self.inner.lock().ledger.clone()
    }

    /// Snapshot as it would be saved.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.snapshot_of(&self.inner.lock())
    }

    fn snapshot_of(&self, inner: &AuditState) -> LedgerSnapshot {
        let skip = inner.ledger.len().saturating_sub(self.retain);
        LedgerSnapshot {
            state: inner.breaker.peek_state(),
            failure_count: inner.breaker.failure_count(),
            window_start: Some(inner.window_start.to_rfc3339()),
            action_log: inner.ledger[skip..].to_vec(),
        }
    }

    fn persist(&self, inner: &AuditState) {
        if let Err(e) = self.store.save(&self.snapshot_of(inner)) {
            tracing::warn!(error = %e, "Could not save audit ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn breaker(threshold: u32) -> (AuditBreaker, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        (AuditBreaker::with_store(threshold, store.clone()), store)
    }

    #[test]
    fn test_opens_after_threshold_and_stays_open() {
        let (audit, _) = breaker(2);
        audit.record_action("post", false, None);
        assert!(audit.can_execute("post"));
        audit.record_action("post", false, None);

        assert_eq!(audit.state(), CircuitState::Open);
        assert!(!audit.can_execute("post"));

        // no timed recovery, and a success does not close it
        let opened_window = audit.window_start();
        audit.record_action("post", true, None);
        assert_eq!(audit.state(), CircuitState::Open);
        assert!(!audit.can_execute("post"));
        assert_eq!(audit.failure_count(), 0);
        assert!(audit.window_start() >= opened_window);
        assert_eq!(audit.action_summary().failures_in_window, 0);
    }

    #[test]
    fn test_failures_after_success_while_open_count_from_zero() {
        let (audit, store) = breaker(2);
        audit.record_action("post", false, None);
        audit.record_action("post", false, None);
        audit.record_action("post", true, None);
        audit.record_action("post", false, None);

        assert_eq!(audit.state(), CircuitState::Open);
        assert_eq!(audit.failure_count(), 1);
        let saved = store.snapshot().unwrap();
        assert_eq!(saved.state, CircuitState::Open);
        assert_eq!(saved.failure_count, 1);
    }

    #[test]
    fn test_assert_reports_failure_count() {
        let (audit, _) = breaker(3);
        for _ in 0..3 {
            audit.record_action("delete_file", false, None);
        }
        let err = audit.assert_can_execute("delete_file").unwrap_err();
        assert_eq!(err, ResilienceError::AuditTripped { failures: 3 });
        assert!(err.to_string().contains("Circuit is OPEN (3 failures)"));
    }

    #[test]
    fn test_success_heals_closed_breaker() {
        let (audit, _) = breaker(3);
        audit.record_action("a", false, None);
        audit.record_action("b", false, None);
        audit.record_action("c", true, None);
        assert_eq!(audit.failure_count(), 0);
        audit.record_action("d", false, None);
        assert_eq!(audit.state(), CircuitState::Closed);
    }

    #[test]
    fn test_revert_plan_in_ledger_order() {
        let (audit, _) = breaker(5);
        audit.record_action("write config", true, Some("git checkout config.yaml"));
        audit.record_action("read status", true, None);
        audit.record_action("post comment", false, Some("delete comment 42"));
        audit.record_action("noop", true, Some(""));

        let plan: Vec<_> = audit
            .revert_plan()
            .into_iter()
            .map(|r| r.operation)
            .collect();
        assert_eq!(plan, vec!["write config", "post comment"]);
    }

    #[test]
    fn test_action_summary() {
        let (audit, _) = breaker(2);
        audit.record_action("a", true, None);
        audit.record_action("b", false, None);
        audit.record_action("c", false, None);

        assert_eq!(
            audit.action_summary(),
            ActionSummary {
                total_actions: 3,
                success_count: 1,
                failure_count: 2,
                current_state: CircuitState::Open,
                failures_in_window: 2,
            }
        );
    }

    #[test]
    fn test_reset_keeps_ledger() {
        let (audit, store) = breaker(1);
        audit.record_action("a", false, Some("undo a"));
        audit.reset();

        assert_eq!(audit.state(), CircuitState::Closed);
        assert_eq!(audit.ledger().len(), 1);
        assert_eq!(store.snapshot().unwrap().state, CircuitState::Closed);

        audit.clear_ledger();
        assert!(audit.ledger().is_empty());
        assert!(store.snapshot().unwrap().action_log.is_empty());
    }

    #[test]
    fn test_saved_ledger_is_trimmed_oldest_first() {
        let (audit, store) = breaker(1000);
        let audit = audit.with_retain(3);
        for i in 0..5 {
            audit.record_action(&format!("op{}", i), true, None);
        }

        let saved: Vec<_> = store
            .snapshot()
            .unwrap()
            .action_log
            .into_iter()
            .map(|r| r.operation)
            .collect();
        assert_eq!(saved, vec!["op2", "op3", "op4"]);
        assert_eq!(audit.ledger().len(), 5);
    }

    #[test]
    fn test_restores_from_store() {
        let (audit, store) = breaker(2);
        audit.record_action("a", false, Some("undo a"));
        audit.record_action("b", false, None);

        let restored = AuditBreaker::with_store(2, store.clone());
        assert_eq!(restored.state(), CircuitState::Open);
        assert_eq!(restored.failure_count(), 2);
        assert_eq!(restored.ledger(), audit.ledger());
        assert_eq!(restored.window_start(), audit.window_start());
    }

    #[test]
    fn test_bad_window_start_falls_back_to_now() {
        let store = MemoryLedgerStore::with_snapshot(LedgerSnapshot {
            state: CircuitState::Closed,
            failure_count: 1,
            window_start: Some("not a date".to_string()),
            action_log: Vec::new(),
        });
        let before = Utc::now();
        let audit = AuditBreaker::with_store(3, store);
        assert!(audit.window_start() >= before);
        assert_eq!(audit.failure_count(), 1);
    }

    #[test]
    fn test_loads_ledger_with_naive_timestamps_and_snake_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".canary_state.json");
        std::fs::write(
            &path,
            r#"{
                "state": "open",
                "failure_count": 2,
                "window_start": "2026-01-05T10:00:00.000001",
                "action_log": [
                    {"timestamp": "2026-01-05T10:00:01.000001", "operation": "post",
                     "success": false, "revert_cmd": "delete post"},
                    {"timestamp": "2026-01-05T10:00:02.000001", "operation": "post",
                     "success": false, "revert_cmd": null}
                ]
            }"#,
        )
        .unwrap();

        let audit = AuditBreaker::new(2, &path);
        assert_eq!(audit.state(), CircuitState::Open);
        assert!(!audit.can_execute("post"));
        assert_eq!(audit.failure_count(), 2);
        assert_eq!(audit.ledger().len(), 2);
        assert_eq!(audit.revert_plan().len(), 1);
        assert_eq!(
            audit.window_start().to_rfc3339(),
            "2026-01-05T10:00:00.000001+00:00"
        );
    }

    #[test]
    fn test_unparseable_ledger_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, r#"{"state": "sideways"}"#).unwrap();

        let audit = AuditBreaker::new(2, &path);
        assert_eq!(audit.state(), CircuitState::Closed);
        audit.record_action("post", true, None);

        let aside = JsonFileStore::new(&path).corrupt_path();
        assert_eq!(
            std::fs::read_to_string(aside).unwrap(),
            r#"{"state": "sideways"}"#
        );
        assert_eq!(AuditBreaker::new(2, &path).ledger().len(), 1);
    }

    #[test]
    fn test_unwritable_store_does_not_fail_callers() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be
        let path = dir.path().join("ledger.json");
        std::fs::create_dir(&path).unwrap();

        let audit = AuditBreaker::new(1, &path);
        audit.record_action("a", false, None);
        assert_eq!(audit.state(), CircuitState::Open);
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let (audit, _) = breaker(1000);
        let audit = Arc::new(audit);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let audit = audit.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        audit.record_action("op", false, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(audit.failure_count(), 200);
        assert_eq!(audit.ledger().len(), 200);
    }
}
