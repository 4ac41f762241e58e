//! Command-audit events emitted by the terminal gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One command flushed (by CR/LF) from a terminal session's input parser.
/// Immutable once emitted; retention is governed by the audit sink's
/// file-age policy, not by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub reservation_id: String,
    pub user_id: String,
    pub user_name: String,
    pub pod_name: String,
    pub session_id: String,
    pub command_text: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        reservation_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        pod_name: impl Into<String>,
        session_id: impl Into<String>,
        command_text: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("log_{}", now.timestamp_nanos_opt().unwrap_or_default()),
            reservation_id: reservation_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            pod_name: pod_name.into(),
            session_id: session_id.into(),
            command_text: command_text.into(),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_camel_case() {
        let e = AuditEntry::new("res-1", "alice@example.com", "Alice", "pod-0", "s-1", "ls -la");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["reservationId"], "res-1");
        assert_eq!(v["commandText"], "ls -la");
        assert_eq!(v["sessionId"], "s-1");
        assert!(v["id"].as_str().unwrap().starts_with("log_"));
    }
}
