//! Declarative configuration for a set of protected dependencies.
//!
//! ```yaml
//! dependencies:
//!   - name: moltbook_api
//!     timeout: 3s
//!     failure_threshold: 5
//!     reset_timeout: 30s
//!     fallback: { error: true }
//!   - name: cache
//!     timeout: 250ms
//! order: [cache, moltbook_api]
//! budgets:
//!   - name: api_calls
//!     total: 10s
//! audit:
//!   failure_threshold: 5
//!   state_file: .canary_state.json
//! ```
//!
//! Durations accept humantime strings (`"1m 30s"`) or integer milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::audit::{AuditBreaker, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RETAIN};
use crate::budget::{BudgetCategory, BudgetMonitor};
use crate::chain::{DependencyChain, DependencyConfig};

/// Serde adapter for [`Duration`] as a humantime string.
pub mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// A named budget pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub name: String,

    #[serde(with = "duration_human")]
    pub total: Duration,
}

fn default_audit_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_retain() -> usize {
    DEFAULT_RETAIN
}

/// Audit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_threshold")]
    pub failure_threshold: u32,

    /// Ledger location; the ledger stays in memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// Ledger entries kept on disk
    #[serde(default = "default_retain")]
    pub retain: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            state_file: None,
            retain: DEFAULT_RETAIN,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,

    /// Execution order; defaults to declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,

    #[serde(default)]
    pub budgets: Vec<BudgetConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditConfig>,
}

impl ResilienceConfig {
    /// Parse config from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, LoadError> {
        let config: ResilienceConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from JSON string.
    pub fn from_json(json: &str) -> Result<Self, LoadError> {
        let config: ResilienceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Load by extension: `.json` as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_file(path),
            _ => Self::from_yaml_file(path),
        }
    }

    fn validate(&self) -> Result<(), LoadError> {
        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                return Err(LoadError::ValidationError(
                    "Dependency name must not be empty".to_string(),
                ));
            }
            if !seen.insert(dep.name.as_str()) {
                return Err(LoadError::ValidationError(format!(
                    "Duplicate dependency: {}",
                    dep.name
                )));
            }
        }

        for name in &self.order {
            if !seen.contains(name.as_str()) {
                return Err(LoadError::ValidationError(format!(
                    "Order names unknown dependency: {}",
                    name
                )));
            }
        }

        let mut budgets = HashSet::new();
        for budget in &self.budgets {
            if !budgets.insert(budget.name.as_str()) {
                return Err(LoadError::ValidationError(format!(
                    "Duplicate budget category: {}",
                    budget.name
                )));
            }
        }

        Ok(())
    }

    /// Build a chain holding every configured dependency.
    pub fn build_chain(&self) -> Result<DependencyChain, LoadError> {
        let mut chain = DependencyChain::new();
        for dep in &self.dependencies {
            chain.add(dep.clone());
        }
        if !self.order.is_empty() {
            chain
                .set_order(self.order.iter().cloned())
                .map_err(|e| LoadError::ValidationError(e.to_string()))?;
        }
        Ok(chain)
    }

    /// Register every budget category with `monitor`.
    pub fn register_budgets(&self, monitor: &BudgetMonitor) -> Vec<Arc<BudgetCategory>> {
        self.budgets
            .iter()
            .map(|b| monitor.register_category(BudgetCategory::new(&b.name, b.total)))
            .collect()
    }

    /// The configured audit breaker, if any.
    pub fn audit_breaker(&self) -> Option<AuditBreaker> {
        let audit = self.audit.as_ref()?;
        let breaker = match &audit.state_file {
            Some(path) => AuditBreaker::new(audit.failure_threshold, path),
            None => AuditBreaker::in_memory(audit.failure_threshold),
        };
        Some(breaker.with_retain(audit.retain))
    }
}
