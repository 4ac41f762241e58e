use std::sync::Arc;

use playground_controllers::killer::Killer;
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

    let store = Arc::new(RedisStore::connect(&redis_url).await?);
    let driver = Arc::new(KubeDriver::new().await?);

    let killer = Killer::new(store, driver, namespace);

    info!("starting killer controller");
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    tokio::select! {
        () = killer.run(loop_cancel) => {}
        () = shutdown_signal() => {
            info!("received shutdown signal");
            cancel.cancel();
        }
    }
    Ok(())
}
