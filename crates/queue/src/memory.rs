//! In-process store used by loop and gateway tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use crate::{AuditEntry, Reservation, ReservationStore, Status, StoreError};

/// Memory-backed work queue with the same observable behavior as the Redis
/// backend (whole-record overwrites, `status_updated_at` stamping, blocking
/// audit pop).
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Reservation>>,
    audit: Mutex<VecDeque<AuditEntry>>,
    audit_ready: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered audit events (test helper).
    pub async fn audit_len(&self) -> usize {
        self.audit.lock().await.len()
    }

    /// Insert a record without stamping `status_updated_at`, so tests can
    /// stage records with backdated timestamps.
    pub async fn insert_raw(&self, r: Reservation) {
        self.records.lock().await.insert(r.id.clone(), r);
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn put(&self, r: &mut Reservation) -> Result<(), StoreError> {
        r.status_updated_at = Utc::now();
        self.records.lock().await.insert(r.id.clone(), r.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Reservation, StoreError> {
        self.records
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn list_by_status(&self, status: Status) -> Result<Vec<Reservation>, StoreError> {
        let mut all = self.list_all().await?;
        all.retain(|r| r.status == status);
        Ok(all)
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Reservation>, StoreError> {
        let mut all = self.list_all().await?;
        all.retain(|r| r.owner == owner);
        Ok(all)
    }

    async fn audit_push(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit.lock().await.push_back(entry.clone());
        self.audit_ready.notify_one();
        Ok(())
    }

    async fn audit_pop(&self, timeout: Duration) -> Result<Option<AuditEntry>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(entry) = self.audit.lock().await.pop_front() {
                return Ok(Some(entry));
            }
            let notified = self.audit_ready.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn audit_requeue(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit.lock().await.push_front(entry.clone());
        self.audit_ready.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkloadKind;

    #[tokio::test]
    async fn put_stamps_and_get_roundtrips() {
        let store = MemoryStore::new();
        let mut r = Reservation::new("alice@example.com", "1.33", "", WorkloadKind::Stateful);
        let before = r.status_updated_at;
        store.put(&mut r).await.unwrap();
        assert!(r.status_updated_at >= before);

        let got = store.get(&r.id).await.unwrap();
        assert_eq!(got.id, r.id);
        assert_eq!(got.status_updated_at, r.status_updated_at);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.delete("missing").await.unwrap();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn filters_by_status_and_owner() {
        let store = MemoryStore::new();
        let mut a = Reservation::new("alice", "1.33", "", WorkloadKind::Stateful);
        let mut b = Reservation::new("bob", "1.32", "", WorkloadKind::Stateful);
        b.status = Status::Available;
        store.put(&mut a).await.unwrap();
        store.put(&mut b).await.unwrap();

        assert_eq!(store.list_by_status(Status::Pending).await.unwrap().len(), 1);
        assert_eq!(store.list_by_owner("bob").await.unwrap().len(), 1);
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn audit_buffer_is_fifo_and_requeue_goes_first() {
        let store = MemoryStore::new();
        let first = AuditEntry::new("r", "u", "n", "p", "s", "first");
        let second = AuditEntry::new("r", "u", "n", "p", "s", "second");
        store.audit_push(&first).await.unwrap();
        store.audit_push(&second).await.unwrap();

        let popped = store
            .audit_pop(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.command_text, "first");

        store.audit_requeue(&popped).await.unwrap();
        let again = store
            .audit_pop(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.command_text, "first");
    }

    #[tokio::test]
    async fn audit_pop_times_out_when_empty() {
        let store = MemoryStore::new();
        let got = store.audit_pop(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }
}
