//! The reservation record and its status state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifetime of a sandbox from creation to forced expiry.
pub const RESERVATION_TTL_HOURS: i64 = 24;

/// Reservation status.
///
/// Transitions are partitioned between writers: the generator owns
/// `pending` and `generating`, the collector owns expiry into `shutdown`,
/// and the killer owns `shutdown` into `terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Generating,
    Available,
    Error,
    Shutdown,
    Terminated,
}

impl Status {
    /// Whether a record in this status may move to `next`.
    pub fn allows(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (Pending, Generating) => true,
            (Generating, Available) => true,
            // Any live state can fail with a message.
            (Pending | Generating | Available, Error) => true,
            // Expiry or user destroy; error records can be destroyed too.
            (Pending | Generating | Available | Error, Shutdown) => true,
            (Shutdown, Terminated) => true,
            // Terminated is read-only until the collector deletes it.
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Terminated)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Generating => "generating",
            Status::Available => "available",
            Status::Error => "error",
            Status::Shutdown => "shutdown",
            Status::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Flavor of the outer workload backing a sandbox.
///
/// `Stateful` keeps the nested docker graph on a PVC across pod restarts;
/// `Ephemeral` uses emptyDir and loses it. Decided at creation, immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Stateful,
    Ephemeral,
}

impl WorkloadKind {
    /// Parse a configured default, falling back to `Stateful` on anything
    /// unrecognized (matches the gateway's creation-time fallback).
    pub fn from_config(s: &str) -> Self {
        match s {
            "ephemeral" => WorkloadKind::Ephemeral,
            _ => WorkloadKind::Stateful,
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Stateful => f.write_str("stateful"),
            WorkloadKind::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

/// Attempted status change that the state machine forbids.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Status,
    pub to: Status,
}

/// One user request for an ephemeral cluster; the central state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub display_name: String,
    pub k8s_version: String,
    pub workload_type: WorkloadKind,
    /// Name of the outer workload object, not the pod. Empty until the
    /// generator creates the workload; never rewritten afterwards.
    #[serde(default)]
    pub pod_id: String,
    pub status: Status,
    #[serde(default)]
    pub error_message: String,
    pub status_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Create a fresh `pending` record with a 24h expiry.
    pub fn new(
        owner: impl Into<String>,
        k8s_version: impl Into<String>,
        display_name: impl Into<String>,
        workload_type: WorkloadKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            display_name: display_name.into(),
            k8s_version: k8s_version.into(),
            workload_type,
            pod_id: String::new(),
            status: Status::Pending,
            error_message: String::new(),
            status_updated_at: now,
            expires_at: now + Duration::hours(RESERVATION_TTL_HOURS),
        }
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: Status) -> Result<(), InvalidTransition> {
        if !self.status.allows(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Move to `error`, recording the failure message.
    pub fn fail(&mut self, message: impl Into<String>) {
        // Error is reachable from every live state; if we are already in a
        // terminal state the message still gets recorded for diagnosis.
        self.status = Status::Error;
        self.error_message = message.into();
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the collector should mark this record for teardown.
    /// Records already in `shutdown`, `terminated`, or `error` are left to
    /// their owning loops.
    pub fn should_be_collected(&self, now: DateTime<Utc>) -> bool {
        !matches!(
            self.status,
            Status::Shutdown | Status::Terminated | Status::Error
        ) && self.is_expired(now)
    }

    /// Short form of the id used in workload names and banners.
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_edges_match_lifecycle() {
        use Status::*;
        assert!(Pending.allows(Generating));
        assert!(Generating.allows(Available));
        assert!(Available.allows(Shutdown));
        assert!(Shutdown.allows(Terminated));
        assert!(Error.allows(Shutdown));
        assert!(Pending.allows(Error));
        assert!(Generating.allows(Error));
    }

    #[test]
    fn forbidden_edges_rejected() {
        use Status::*;
        assert!(!Terminated.allows(Shutdown));
        assert!(!Terminated.allows(Pending));
        assert!(!Available.allows(Generating));
        assert!(!Shutdown.allows(Available));
        assert!(!Pending.allows(Available));
        assert!(!Error.allows(Available));
    }

    #[test]
    fn transition_enforces_table() {
        let mut r = Reservation::new("alice@example.com", "1.33", "", WorkloadKind::Stateful);
        r.transition(Status::Generating).unwrap();
        r.transition(Status::Available).unwrap();
        let err = r.transition(Status::Generating).unwrap_err();
        assert_eq!(err.from, Status::Available);
        assert_eq!(err.to, Status::Generating);
    }

    #[test]
    fn expiry_is_24h_and_collectable_only_when_live() {
        let now = Utc::now();
        let mut r = Reservation::new("o", "1.33", "", WorkloadKind::Ephemeral);
        assert!(!r.should_be_collected(now));
        assert!(r.should_be_collected(r.expires_at));
        assert!(r.should_be_collected(r.expires_at + Duration::seconds(1)));

        r.status = Status::Shutdown;
        assert!(!r.should_be_collected(r.expires_at + Duration::hours(1)));
        r.status = Status::Error;
        assert!(!r.should_be_collected(r.expires_at + Duration::hours(1)));
    }

    #[test]
    fn record_serializes_camel_case() {
        let r = Reservation::new("alice@example.com", "1.33", "demo", WorkloadKind::Ephemeral);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["k8sVersion"], "1.33");
        assert_eq!(v["workloadType"], "ephemeral");
        assert_eq!(v["displayName"], "demo");
        assert_eq!(v["status"], "pending");
        assert!(v.get("statusUpdatedAt").is_some());
        assert!(v.get("expiresAt").is_some());

        let back: Reservation = serde_json::from_value(v).unwrap();
        assert_eq!(back.id, r.id);
        assert_eq!(back.workload_type, WorkloadKind::Ephemeral);
    }
}
