//! Per-connection access log.
//!
//! Exactly one JSON line per connection on stdout, written at teardown.
//! Stdout is reserved for these records; human diagnostics go to stderr
//! through `tracing`.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Everything observed over the life of one connection.
///
/// Fields fill in as the connection progresses and are serialized once.
/// Empty and absent fields are omitted, so a port-scan-adjacent record
/// stays a single short line.
#[derive(Debug, Default, Serialize)]
pub struct LogEntry {
    pub timestamp: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub claimed_username: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_version: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_types: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys_offered: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_name: Option<String>,
}

impl LogEntry {
    /// A fresh entry stamped with the current time.
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ..Self::default()
        }
    }

    /// Record an error unless one is already present. The first failure on
    /// a connection is the one worth keeping.
    pub fn record_error(&mut self, err: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(err.into());
        }
    }

    /// Serialize and write the record as one line on stdout.
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::error!("failed to serialize access record: {err}"),
        }
    }
}
