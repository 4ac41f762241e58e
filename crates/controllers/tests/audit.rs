//! Audit sink drain behavior over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use playground_controllers::audit_sink::{AuditLog, AuditSink};
use playground_queue::{AuditEntry, MemoryStore, ReservationStore};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn drain_persists_buffered_entries_in_order() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AuditLog::open(dir.path()).unwrap());
    let sink = Arc::new(AuditSink::new(store.clone(), log, Some("token".to_string())));

    store
        .audit_push(&AuditEntry::new("res-1", "alice", "Alice", "pod-0", "s-1", "ls -la"))
        .await
        .unwrap();
    store
        .audit_push(&AuditEntry::new("res-1", "alice", "Alice", "pod-0", "s-1", "kubectl get pods"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let drain_sink = sink.clone();
    let drain_cancel = cancel.clone();
    let drain = tokio::spawn(async move { drain_sink.run(drain_cancel).await });

    // Wait for both entries to land on disk.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let entries = sink.log().list(None, None, 10, 0).unwrap();
        if entries.len() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "drain did not persist entries in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    let _ = drain.await;

    assert_eq!(store.audit_len().await, 0);
    let entries = sink.log().list(None, Some("res-1"), 10, 0).unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first in the read API.
    assert_eq!(entries[0].command_text, "kubectl get pods");
    assert_eq!(entries[1].command_text, "ls -la");
}

#[tokio::test]
async fn configured_token_wins_over_generated_one() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AuditLog::open(dir.path()).unwrap());

    let sink = AuditSink::new(store.clone(), log.clone(), Some("configured".to_string()));
    assert!(sink.verify_token("configured"));
    assert!(!sink.verify_token("other"));

    let generated = AuditSink::new(store, log, None);
    assert!(!generated.verify_token(""));
}
