//! Collector loop: expires live reservations into `shutdown` and garbage
//! collects records that have sat in `terminated` past the grace period.

use std::sync::Arc;

use chrono::{Duration, Utc};
use playground_queue::{ReservationStore, Status};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a `terminated` record stays visible before deletion.
pub const TERMINATED_GRACE_MINUTES: i64 = 5;

pub struct Collector {
    store: Arc<dyn ReservationStore>,
}

impl Collector {
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(crate::COLLECTOR_TICK);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("collector shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.collect_once().await {
                        warn!(error = %e, "cleanup pass failed");
                    }
                }
            }
        }
    }

    /// One idempotent pass over every record: back-to-back runs produce the
    /// same transitions.
    pub async fn collect_once(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let grace = Duration::minutes(TERMINATED_GRACE_MINUTES);

        for mut item in self.store.list_all().await? {
            if item.should_be_collected(now) {
                info!(id = %item.id, expired_at = %item.expires_at, "collecting expired reservation");
                if item.transition(Status::Shutdown).is_err() {
                    continue;
                }
                if let Err(e) = self.store.put(&mut item).await {
                    warn!(id = %item.id, error = %e, "failed to mark reservation for shutdown");
                    item.fail("Failed to mark for shutdown during collection");
                    if let Err(e) = self.store.put(&mut item).await {
                        warn!(id = %item.id, error = %e, "failed to record collection error");
                    }
                }
                continue;
            }

            if item.status == Status::Terminated && now - item.status_updated_at > grace {
                info!(id = %item.id, terminated_at = %item.status_updated_at, "deleting terminated reservation");
                if let Err(e) = self.store.delete(&item.id).await {
                    warn!(id = %item.id, error = %e, "failed to delete terminated reservation");
                }
            }
        }
        Ok(())
    }
}
