//! Persisted ledger format.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::breaker::CircuitState;

/// One recorded autonomous action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    #[serde(deserialize_with = "utc_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub success: bool,
    #[serde(default, alias = "revert_command", alias = "revert_cmd")]
    pub revert_command: Option<String>,
}

/// RFC 3339, or an ISO-8601 timestamp without offset read as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| raw.parse::<NaiveDateTime>().map(|naive| naive.and_utc()))
        .ok()
}

fn utc_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

impl ActionRecord {
    pub fn new(operation: impl Into<String>, success: bool, revert_command: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            success,
            revert_command,
        }
    }

    /// The revert command, when present and non-blank.
    pub fn revert(&self) -> Option<&str> {
        self.revert_command
            .as_deref()
            .filter(|cmd| !cmd.trim().is_empty())
    }
}

/// On-disk snapshot of an audit breaker.
///
/// `window_start` stays a string so a malformed timestamp can be replaced
/// on load instead of rejecting the whole file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub state: CircuitState,
    #[serde(default, alias = "failure_count")]
    pub failure_count: u32,
    #[serde(default, alias = "window_start")]
    pub window_start: Option<String>,
    #[serde(default, alias = "action_log")]
    pub action_log: Vec<ActionRecord>,
}

impl LedgerSnapshot {
    /// Parsed `window_start`, if well-formed. Timestamps without an offset
    /// are read as UTC.
    pub fn parsed_window_start(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.window_start.as_deref()?)
    }
}
