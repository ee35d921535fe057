//! End-to-end behavior of the public API.

use bulwark_core::{
    AuditBreaker, BreakerConfig, BudgetCategory, BudgetMonitor, CallError, CircuitBreaker,
    CircuitState, DependencyChain, DependencyConfig, JsonFileStore, LedgerStore,
    ResilienceConfig, ResilienceError, TimeoutPolicy,
};
use serde_json::{json, Value};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_breaker_recovers_after_real_timeout() {
    let mut breaker = CircuitBreaker::new("api", BreakerConfig::new(2, Duration::from_secs(1)));
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(matches!(
        breaker.assert_can_proceed(),
        Err(ResilienceError::CircuitOpen { .. })
    ));

    thread::sleep(Duration::from_millis(1100));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[test]
fn test_failing_dependency_serves_fallback() {
    let mut chain = DependencyChain::new();
    chain.add(DependencyConfig::new("moltbook_api").fallback(json!({"error": true})));

    let result = chain.execute_one("moltbook_api", || -> Result<Value, String> {
        Err("connection reset".to_string())
    });
    assert_eq!(result.unwrap(), json!({"error": true}));
}

#[test]
fn test_sentinel_returned_at_deadline() {
    let policy = TimeoutPolicy::new("slow_fetch", Duration::from_millis(50)).return_value("sentinel");

    let start = Instant::now();
    let result = policy.run(|| {
        thread::sleep(Duration::from_millis(300));
        Ok::<_, String>("real")
    });
    let waited = start.elapsed();

    assert_eq!(result.unwrap(), Some("sentinel"));
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(250), "waited {:?}", waited);
}

#[test]
fn test_budget_category_pooling() {
    let category = BudgetCategory::new("api_calls", Duration::from_millis(1000));
    let first = category.allocate(Duration::from_millis(600), None).unwrap();

    let err = category.allocate(Duration::from_millis(500), None).unwrap_err();
    assert_eq!(
        err,
        ResilienceError::BudgetExceeded {
            category: "api_calls".to_string(),
            remaining: Duration::from_millis(400),
        }
    );

    assert!(category.release(first.id()));
    assert!(category.allocate(Duration::from_millis(500), None).is_ok());
}

#[test]
fn test_monitor_rejects_unknown_category() {
    let monitor = BudgetMonitor::new();
    let err = monitor
        .allocate("missing", Duration::from_millis(10), None)
        .unwrap_err();
    assert!(err.is_config());
}

#[test]
fn test_ledger_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canary.json");

    let audit = AuditBreaker::new(2, &path);
    audit.record_action("write config", true, Some("git checkout config.yaml"));
    audit.record_action("post comment", false, None);
    audit.record_action("delete branch", false, Some("git push origin branch"));
    assert_eq!(audit.state(), CircuitState::Open);

    let saved = JsonFileStore::new(&path).load().unwrap().unwrap();
    assert_eq!(saved.failure_count, 2);
    assert_eq!(saved.action_log, audit.ledger());

    let restored = AuditBreaker::new(2, &path);
    assert_eq!(restored.failure_count(), audit.failure_count());
    assert_eq!(restored.ledger(), audit.ledger());
    assert!(matches!(
        restored.assert_can_execute("anything"),
        Err(ResilienceError::AuditTripped { failures: 2 })
    ));

    let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["state"], "open");
    assert_eq!(raw["actionLog"][0]["revertCommand"], "git checkout config.yaml");
}

#[test]
fn test_corrupt_ledger_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canary.json");
    std::fs::write(&path, "]]]").unwrap();

    let audit = AuditBreaker::new(3, &path);
    assert_eq!(audit.state(), CircuitState::Closed);
    assert!(audit.ledger().is_empty());
}

#[test]
fn test_chain_from_config() {
    let config = ResilienceConfig::from_yaml(
        r#"
dependencies:
  - name: api
    timeout: 40ms
    failure_threshold: 1
    fallback: degraded
  - name: db
order: [db, api]
"#,
    )
    .unwrap();
    let mut chain = config.build_chain().unwrap();

    let slow = chain.execute_one("api", || {
        thread::sleep(Duration::from_millis(300));
        Ok::<_, String>(json!("fresh"))
    });
    assert_eq!(slow.unwrap(), json!("degraded"));

    let health = chain.health();
    assert_eq!(health[0].state, CircuitState::Open);

    let failed = chain.execute_one("db", || Err::<Value, _>("down"));
    assert!(matches!(failed, Err(CallError::Operation("down"))));
}
