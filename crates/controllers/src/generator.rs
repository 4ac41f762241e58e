//! Generator loop: drives `pending` reservations to `available` or `error`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use playground_driver::{ClusterDriver, DriverError, WorkloadSpec, NFS_SERVICE};
use playground_queue::{Reservation, ReservationStore, Status};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub namespace: String,
    /// Image repo prefix; the full image is `{repo}:{version_image_map[v]}`.
    pub image_base_repo: String,
    pub version_image_map: HashMap<String, String>,
    pub pvc_size: String,
    pub readiness_poll: Duration,
    pub readiness_timeout: Duration,
}

impl GeneratorConfig {
    pub fn new(
        namespace: String,
        image_base_repo: String,
        version_image_map: HashMap<String, String>,
        pvc_size: String,
    ) -> Self {
        Self {
            namespace,
            image_base_repo,
            version_image_map,
            pvc_size,
            readiness_poll: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(5 * 60),
        }
    }

    fn known_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.version_image_map.keys().cloned().collect();
        versions.sort();
        versions
    }
}

pub struct Generator {
    store: Arc<dyn ReservationStore>,
    driver: Arc<dyn ClusterDriver>,
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        driver: Arc<dyn ClusterDriver>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            store,
            driver,
            config,
        }
    }

    /// Tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(crate::GENERATOR_TICK);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("generator shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.process_pending(&cancel).await {
                        warn!(error = %e, "failed to process pending reservations");
                    }
                }
            }
        }
    }

    /// One pass over `pending` records. Each record is its own failure
    /// boundary; a provisioning error is written into the record and the
    /// loop moves on.
    pub async fn process_pending(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let pending = self.store.list_by_status(Status::Pending).await?;
        for mut item in pending {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = self.provision(&mut item, cancel).await {
                // A shutdown mid-wait is not a provisioning failure; the
                // record stays where it is and a restart picks it up.
                if cancel.is_cancelled() {
                    return Ok(());
                }
                warn!(id = %item.id, error = %e, "provisioning failed");
                item.fail(e.to_string());
                if let Err(update_err) = self.store.put(&mut item).await {
                    warn!(id = %item.id, error = %update_err, "failed to record provisioning error");
                }
            }
        }
        Ok(())
    }

    async fn provision(
        &self,
        item: &mut Reservation,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        item.transition(Status::Generating)?;
        self.store
            .put(item)
            .await
            .context("failed to persist generating status")?;

        let image_tag = self
            .config
            .version_image_map
            .get(&item.k8s_version)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "unsupported k8s version: {}. Available versions: {:?}",
                    item.k8s_version,
                    self.config.known_versions()
                )
            })?;
        let image = format!("{}:{}", self.config.image_base_repo, image_tag);

        let nfs_server = self
            .driver
            .service_cluster_ip(NFS_SERVICE, &self.config.namespace)
            .await
            .context("failed to get nfs server service IP")?;
        let nfs_sub_path = self
            .driver
            .ensure_owner_directory(&self.config.namespace, &item.owner)
            .await
            .with_context(|| format!("failed to ensure nfs directory for owner {}", item.owner))?;

        let workload_name = format!("k8s-playground-{}", item.short_id());
        let spec = WorkloadSpec {
            name: workload_name.clone(),
            namespace: self.config.namespace.clone(),
            image: image.clone(),
            kind: item.workload_type,
            reservation_id: item.id.clone(),
            nfs_server,
            nfs_sub_path,
            pvc_size: self.config.pvc_size.clone(),
        };

        let pod_name = self
            .driver
            .create_workload(&spec)
            .await
            .with_context(|| format!("failed to create sandbox workload with image {image}"))?;

        // Persist the workload name right away so a crash between here and
        // readiness still leaves the killer something to delete.
        item.pod_id = workload_name.clone();
        self.store
            .put(item)
            .await
            .context("failed to persist workload name")?;
        info!(id = %item.id, workload = %workload_name, image = %image, "created sandbox workload");

        self.wait_until_ready(item, pod_name, cancel).await?;

        item.transition(Status::Available)?;
        self.store
            .put(item)
            .await
            .context("failed to persist available status")?;
        info!(id = %item.id, workload = %workload_name, "sandbox available");
        Ok(())
    }

    /// Poll pod readiness every `readiness_poll` up to `readiness_timeout`.
    /// Ephemeral pod names are resolved lazily once the replica exists.
    async fn wait_until_ready(
        &self,
        item: &Reservation,
        mut pod_name: String,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;

        loop {
            tokio::select! {
                () = cancel.cancelled() => bail!("shutting down"),
                () = tokio::time::sleep(self.config.readiness_poll) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "timeout waiting for pod to be running for workload {}",
                    item.pod_id
                );
            }

            if pod_name.is_empty() {
                match self
                    .driver
                    .resolve_pod(&item.pod_id, &self.config.namespace)
                    .await
                {
                    Ok(name) => {
                        info!(id = %item.id, pod = %name, "resolved sandbox pod");
                        pod_name = name;
                    }
                    Err(_) => continue,
                }
            }

            match self
                .driver
                .is_pod_ready(&pod_name, &self.config.namespace)
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(DriverError::Fatal(msg)) => bail!(msg),
                Err(e) => bail!("failed to check pod status for {pod_name}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_versions_are_sorted() {
        let config = GeneratorConfig::new(
            "default".into(),
            "example/dind".into(),
            HashMap::from([
                ("1.33".to_string(), "k8s-1.33.0".to_string()),
                ("1.30".to_string(), "k8s-1.30.2".to_string()),
                ("1.32".to_string(), "k8s-1.32.1".to_string()),
            ]),
            "10Gi".into(),
        );
        assert_eq!(config.known_versions(), vec!["1.30", "1.32", "1.33"]);
    }
}
