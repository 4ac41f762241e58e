//! Control-loop behavior over the in-memory store and a stub driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use playground_controllers::collector::Collector;
use playground_controllers::generator::{Generator, GeneratorConfig};
use playground_controllers::killer::Killer;
use playground_driver::{
    ClusterDriver, DriverError, ExecOutput, ExecStreams, SandboxWorkload, ServiceInfo,
    WorkloadSpec,
};
use playground_queue::{
    MemoryStore, Reservation, ReservationStore, Status, WorkloadKind,
};
use tokio_util::sync::CancellationToken;

/// Driver stub: records calls, readiness and failures are scripted.
#[derive(Default)]
struct StubDriver {
    created: Mutex<Vec<WorkloadSpec>>,
    deleted: Mutex<Vec<String>>,
    fail_delete: AtomicBool,
    ready_after: AtomicU32,
    fatal_readiness: Mutex<Option<String>>,
    orphans: Mutex<Vec<SandboxWorkload>>,
}

#[async_trait]
impl ClusterDriver for StubDriver {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String, DriverError> {
        self.created.lock().unwrap().push(spec.clone());
        Ok(match spec.kind {
            WorkloadKind::Stateful => format!("{}-0", spec.name),
            WorkloadKind::Ephemeral => String::new(),
        })
    }

    async fn resolve_pod(&self, workload: &str, _ns: &str) -> Result<String, DriverError> {
        Ok(format!("{workload}-pod"))
    }

    async fn is_pod_ready(&self, _pod: &str, _ns: &str) -> Result<bool, DriverError> {
        if let Some(msg) = self.fatal_readiness.lock().unwrap().clone() {
            return Err(DriverError::Fatal(msg));
        }
        if self.ready_after.load(Ordering::SeqCst) == 0 {
            return Ok(true);
        }
        self.ready_after.fetch_sub(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn delete_workload(
        &self,
        name: &str,
        _ns: &str,
        _kind: WorkloadKind,
    ) -> Result<(), DriverError> {
        self.deleted.lock().unwrap().push(name.to_string());
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(DriverError::Stream("delete failed".into()));
        }
        Ok(())
    }

    async fn ensure_owner_directory(&self, _ns: &str, owner: &str) -> Result<String, DriverError> {
        Ok(owner.replace('@', "-").replace('.', "-"))
    }

    async fn service_cluster_ip(&self, _name: &str, _ns: &str) -> Result<String, DriverError> {
        Ok("10.0.0.9".to_string())
    }

    async fn exec_collect(
        &self,
        _pod: &str,
        _ns: &str,
        _command: Vec<String>,
    ) -> Result<ExecOutput, DriverError> {
        Ok(ExecOutput::default())
    }

    async fn exec_shell(
        &self,
        _pod: &str,
        _ns: &str,
        _command: Vec<String>,
        _io: ExecStreams,
        _cancel: CancellationToken,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn discover_services(
        &self,
        _pod: &str,
        _ns: &str,
    ) -> Result<Vec<ServiceInfo>, DriverError> {
        Ok(Vec::new())
    }

    async fn list_sandbox_workloads(&self, _ns: &str) -> Result<Vec<SandboxWorkload>, DriverError> {
        Ok(self.orphans.lock().unwrap().clone())
    }
}

fn generator_config() -> GeneratorConfig {
    let mut config = GeneratorConfig::new(
        "default".to_string(),
        "example/dind".to_string(),
        HashMap::from([
            ("1.33".to_string(), "k8s-1.33.0".to_string()),
            ("1.32".to_string(), "k8s-1.32.1".to_string()),
        ]),
        "10Gi".to_string(),
    );
    config.readiness_poll = Duration::from_millis(2);
    config.readiness_timeout = Duration::from_millis(200);
    config
}

async fn stage(store: &MemoryStore, mut r: Reservation) -> String {
    let id = r.id.clone();
    store.put(&mut r).await.unwrap();
    id
}

#[tokio::test]
async fn generator_drives_pending_to_available() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    let generator = Generator::new(store.clone(), driver.clone(), generator_config());

    let id = stage(
        &store,
        Reservation::new("alice@example.com", "1.33", "demo", WorkloadKind::Stateful),
    )
    .await;

    generator
        .process_pending(&CancellationToken::new())
        .await
        .unwrap();

    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, Status::Available);
    assert_eq!(record.pod_id, format!("k8s-playground-{}", &id[..8]));
    assert!(record.error_message.is_empty());

    let created = driver.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].image, "example/dind:k8s-1.33.0");
    assert_eq!(created[0].reservation_id, id);
    assert_eq!(created[0].nfs_server, "10.0.0.9");
}

#[tokio::test]
async fn generator_resolves_ephemeral_pod_lazily() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    driver.ready_after.store(2, Ordering::SeqCst);
    let generator = Generator::new(store.clone(), driver.clone(), generator_config());

    let id = stage(
        &store,
        Reservation::new("alice@example.com", "1.32", "", WorkloadKind::Ephemeral),
    )
    .await;

    generator
        .process_pending(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.get(&id).await.unwrap().status, Status::Available);
}

#[tokio::test]
async fn generator_rejects_unknown_version_with_known_list() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    let generator = Generator::new(store.clone(), driver.clone(), generator_config());

    let id = stage(
        &store,
        Reservation::new("alice@example.com", "9.99", "", WorkloadKind::Stateful),
    )
    .await;

    generator
        .process_pending(&CancellationToken::new())
        .await
        .unwrap();

    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, Status::Error);
    assert!(record.error_message.contains("unsupported k8s version: 9.99"));
    assert!(record.error_message.contains("1.32"));
    assert!(record.error_message.contains("1.33"));
    assert!(driver.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn generator_times_out_waiting_for_readiness() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    driver.ready_after.store(u32::MAX, Ordering::SeqCst);
    let generator = Generator::new(store.clone(), driver.clone(), generator_config());

    let id = stage(
        &store,
        Reservation::new("alice@example.com", "1.33", "", WorkloadKind::Stateful),
    )
    .await;

    generator
        .process_pending(&CancellationToken::new())
        .await
        .unwrap();

    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, Status::Error);
    assert!(record.error_message.contains("timeout waiting for pod"));
    // The workload name was persisted before the wait, so the killer can
    // still tear it down after a user-initiated destroy.
    assert!(!record.pod_id.is_empty());
}

#[tokio::test]
async fn generator_stops_waiting_on_fatal_pod_state() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    *driver.fatal_readiness.lock().unwrap() =
        Some("container dind in CrashLoopBackOff state".to_string());
    let generator = Generator::new(store.clone(), driver.clone(), generator_config());

    let id = stage(
        &store,
        Reservation::new("alice@example.com", "1.33", "", WorkloadKind::Stateful),
    )
    .await;

    generator
        .process_pending(&CancellationToken::new())
        .await
        .unwrap();

    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, Status::Error);
    assert!(record.error_message.contains("CrashLoopBackOff"));
}

#[tokio::test]
async fn collector_expires_live_records_and_gc_terminated() {
    let store = Arc::new(MemoryStore::new());
    let collector = Collector::new(store.clone());

    let mut expired = Reservation::new("alice", "1.33", "", WorkloadKind::Stateful);
    expired.status = Status::Available;
    expired.expires_at = Utc::now() - chrono::Duration::minutes(1);
    let expired_id = expired.id.clone();
    store.insert_raw(expired).await;

    let mut fresh = Reservation::new("bob", "1.33", "", WorkloadKind::Stateful);
    fresh.status = Status::Available;
    let fresh_id = fresh.id.clone();
    store.insert_raw(fresh).await;

    let mut old_terminated = Reservation::new("carol", "1.33", "", WorkloadKind::Stateful);
    old_terminated.status = Status::Terminated;
    old_terminated.status_updated_at = Utc::now() - chrono::Duration::minutes(6);
    let old_terminated_id = old_terminated.id.clone();
    store.insert_raw(old_terminated).await;

    let mut young_terminated = Reservation::new("dave", "1.33", "", WorkloadKind::Stateful);
    young_terminated.status = Status::Terminated;
    young_terminated.status_updated_at = Utc::now() - chrono::Duration::minutes(1);
    let young_terminated_id = young_terminated.id.clone();
    store.insert_raw(young_terminated).await;

    collector.collect_once().await.unwrap();

    assert_eq!(store.get(&expired_id).await.unwrap().status, Status::Shutdown);
    assert_eq!(store.get(&fresh_id).await.unwrap().status, Status::Available);
    assert!(store.get(&old_terminated_id).await.is_err());
    assert_eq!(
        store.get(&young_terminated_id).await.unwrap().status,
        Status::Terminated
    );

    // A second back-to-back pass changes nothing further.
    collector.collect_once().await.unwrap();
    assert_eq!(store.get(&expired_id).await.unwrap().status, Status::Shutdown);
    assert_eq!(store.get(&fresh_id).await.unwrap().status, Status::Available);
}

#[tokio::test]
async fn killer_marks_terminated_before_deleting() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    let killer = Killer::new(store.clone(), driver.clone(), "default".to_string());

    let mut doomed = Reservation::new("alice", "1.33", "", WorkloadKind::Stateful);
    doomed.status = Status::Shutdown;
    doomed.pod_id = "k8s-playground-abcd1234".to_string();
    let id = stage(&store, doomed).await;

    killer.process_shutdown().await.unwrap();

    assert_eq!(store.get(&id).await.unwrap().status, Status::Terminated);
    assert_eq!(
        driver.deleted.lock().unwrap().as_slice(),
        ["k8s-playground-abcd1234"]
    );

    // Idempotent: a second pass sees no shutdown records and deletes nothing.
    killer.process_shutdown().await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().status, Status::Terminated);
    assert_eq!(driver.deleted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn killer_keeps_terminated_when_delete_fails() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    driver.fail_delete.store(true, Ordering::SeqCst);
    let killer = Killer::new(store.clone(), driver.clone(), "default".to_string());

    let mut doomed = Reservation::new("alice", "1.33", "", WorkloadKind::Ephemeral);
    doomed.status = Status::Shutdown;
    doomed.pod_id = "k8s-playground-ffff0000".to_string();
    let id = stage(&store, doomed).await;

    killer.process_shutdown().await.unwrap();

    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, Status::Terminated);
    assert!(record.error_message.is_empty());
}

#[tokio::test]
async fn killer_skips_records_without_workload() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());
    let killer = Killer::new(store.clone(), driver.clone(), "default".to_string());

    let mut doomed = Reservation::new("alice", "1.33", "", WorkloadKind::Stateful);
    doomed.status = Status::Shutdown;
    let id = stage(&store, doomed).await;

    killer.process_shutdown().await.unwrap();

    assert_eq!(store.get(&id).await.unwrap().status, Status::Terminated);
    assert!(driver.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reconciliation_deletes_only_labeled_orphans() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(StubDriver::default());

    let live = Reservation::new("alice", "1.33", "", WorkloadKind::Stateful);
    let live_id = stage(&store, live).await;

    *driver.orphans.lock().unwrap() = vec![
        SandboxWorkload {
            name: "k8s-playground-live".to_string(),
            kind: WorkloadKind::Stateful,
            reservation_id: Some(live_id),
        },
        SandboxWorkload {
            name: "k8s-playground-orphan".to_string(),
            kind: WorkloadKind::Ephemeral,
            reservation_id: Some("gone-reservation".to_string()),
        },
        SandboxWorkload {
            name: "k8s-playground-nfs-server".to_string(),
            kind: WorkloadKind::Stateful,
            reservation_id: None,
        },
    ];

    let killer = Killer::new(store, driver.clone(), "default".to_string());
    killer.reconcile_orphans().await.unwrap();

    assert_eq!(
        driver.deleted.lock().unwrap().as_slice(),
        ["k8s-playground-orphan"]
    );
}
