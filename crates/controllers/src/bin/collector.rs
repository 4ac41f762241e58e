use std::sync::Arc;

use playground_controllers::collector::Collector;
use playground_controllers::{env_or, shutdown_signal};
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
    let store = Arc::new(RedisStore::connect(&redis_url).await?);

    let collector = Collector::new(store);

    info!("starting collector controller");
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    tokio::select! {
        () = collector.run(loop_cancel) => {}
        () = shutdown_signal() => {
            info!("received shutdown signal");
            cancel.cancel();
        }
    }
    Ok(())
}
