//! Store trait shared by the Redis backend and the in-memory test backend.

use std::time::Duration;

use async_trait::async_trait;

use crate::{AuditEntry, Reservation, Status};

/// Work-queue failures as seen by callers.
///
/// The REST surface maps `Unavailable` to 503; control loops log it and
/// retry on their next tick.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("reservation not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Durable record store keyed by reservation id, plus the audit side buffer.
///
/// Scans are whole-table reads filtered in memory: the working set is small
/// (hundreds of records) and reads are bounded by the loops' ticker periods.
/// There are no cross-record transactions and no fine-grained CAS; writes
/// overwrite whole records.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Upsert by id. Stamps `status_updated_at` on the passed record before
    /// persisting, so the caller's copy matches what was stored.
    async fn put(&self, r: &mut Reservation) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Reservation, StoreError>;

    /// Idempotent; deleting a missing record succeeds.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn list_all(&self) -> Result<Vec<Reservation>, StoreError>;

    async fn list_by_status(&self, status: Status) -> Result<Vec<Reservation>, StoreError>;

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Reservation>, StoreError>;

    /// Append an audit event to the tail of the side buffer.
    async fn audit_push(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Pop the oldest audit event, blocking up to `timeout`. Returns `None`
    /// on timeout; malformed buffered payloads are skipped.
    async fn audit_pop(&self, timeout: Duration) -> Result<Option<AuditEntry>, StoreError>;

    /// Put a drained-but-unwritten event back at the head of the buffer so
    /// the next pop retries it first. Keeps FIFO order across sink crashes
    /// at the cost of possible duplicates.
    async fn audit_requeue(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}
