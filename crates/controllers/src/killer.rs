//! Killer loop: tears down workloads of `shutdown` reservations and runs the
//! orphan reconciliation sweep.

use std::collections::HashSet;
use std::sync::Arc;

use playground_driver::ClusterDriver;
use playground_queue::{ReservationStore, Status};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Reconciliation runs every this many killer ticks.
const RECONCILE_EVERY: u64 = 10;

pub struct Killer {
    store: Arc<dyn ReservationStore>,
    driver: Arc<dyn ClusterDriver>,
    namespace: String,
}

impl Killer {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        driver: Arc<dyn ClusterDriver>,
        namespace: String,
    ) -> Self {
        Self {
            store,
            driver,
            namespace,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(crate::KILLER_TICK);
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("killer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    tick += 1;
                    if let Err(e) = self.process_shutdown().await {
                        warn!(error = %e, "failed to process shutdown reservations");
                    }
                    if tick % RECONCILE_EVERY == 0 {
                        if let Err(e) = self.reconcile_orphans().await {
                            warn!(error = %e, "reconciliation sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// Process each `shutdown` record. The `terminated` write happens before
    /// the workload delete: a retry after a mid-failure will not attempt to
    /// delete an already-deleted workload, and a failed delete never blocks
    /// record progression.
    pub async fn process_shutdown(&self) -> anyhow::Result<()> {
        for mut item in self.store.list_by_status(Status::Shutdown).await? {
            if item.transition(Status::Terminated).is_err() {
                continue;
            }
            if let Err(e) = self.store.put(&mut item).await {
                // Still `shutdown`; the next tick retries.
                warn!(id = %item.id, error = %e, "failed to persist terminated status");
                continue;
            }

            if !item.pod_id.is_empty() {
                info!(id = %item.id, workload = %item.pod_id, kind = %item.workload_type, "deleting workload");
                if let Err(e) = self
                    .driver
                    .delete_workload(&item.pod_id, &self.namespace, item.workload_type)
                    .await
                {
                    // The record is already terminated; deletion failures are
                    // left to the reconciliation sweep.
                    warn!(id = %item.id, workload = %item.pod_id, error = %e, "failed to delete workload");
                }
            }
        }
        Ok(())
    }

    /// Delete sandbox workloads whose reservation-id label matches no stored
    /// record. Covers generator crashes that provisioned a workload but
    /// never persisted `pod_id`, and killer deletes that failed after the
    /// record was garbage collected. Workloads without the label (shared
    /// infrastructure like the NFS server) are never touched.
    pub async fn reconcile_orphans(&self) -> anyhow::Result<()> {
        let known: HashSet<String> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();

        for workload in self.driver.list_sandbox_workloads(&self.namespace).await? {
            let Some(reservation_id) = workload.reservation_id else {
                continue;
            };
            if known.contains(&reservation_id) {
                continue;
            }
            info!(
                workload = %workload.name,
                reservation_id = %reservation_id,
                "deleting orphaned workload"
            );
            if let Err(e) = self
                .driver
                .delete_workload(&workload.name, &self.namespace, workload.kind)
                .await
            {
                warn!(workload = %workload.name, error = %e, "failed to delete orphaned workload");
            }
        }
        Ok(())
    }
}
