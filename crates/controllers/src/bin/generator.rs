use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use playground_controllers::generator::{Generator, GeneratorConfig};
use playground_controllers::{env_or, shutdown_signal};
use playground_driver::KubeDriver;
use playground_queue::RedisStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let redis_url = env_or("REDIS_URL", "redis://localhost:6379");
    let namespace = env_or("NAMESPACE", "default");
    let image_base_repo = env_or("IMAGE_BASE_REPO", "tyottodekiru/dind");
    let pvc_size = env_or("PVC_SIZE", "10Gi");
    let version_map_json = env_or("VERSION_IMAGE_MAP", "{}");

    let version_image_map: HashMap<String, String> = serde_json::from_str(&version_map_json)
        .with_context(|| format!("failed to parse VERSION_IMAGE_MAP: {version_map_json}"))?;
    if version_image_map.is_empty() {
        tracing::warn!("VERSION_IMAGE_MAP is empty; every reservation will fail version lookup");
    }
    info!(image_base_repo = %image_base_repo, versions = ?version_image_map, "generator configuration");

    let store = Arc::new(RedisStore::connect(&redis_url).await?);
    let driver = Arc::new(KubeDriver::new().await?);

    let generator = Generator::new(
        store,
        driver,
        GeneratorConfig::new(namespace, image_base_repo, version_image_map, pvc_size),
    );

    info!("starting generator controller");
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    tokio::select! {
        () = generator.run(loop_cancel) => {}
        () = shutdown_signal() => {
            info!("received shutdown signal");
            cancel.cancel();
        }
    }
    Ok(())
}
