use std::sync::Arc;

use playground_controllers::audit_sink::{admin_router, AuditLog, AuditSink};
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
    let log_dir = env_or("LOG_DIR", "/var/log/k8s-playground");
    let api_port = env_or("API_PORT", "8081");
    let admin_token = std::env::var("ADMIN_TOKEN").ok();

    let store = Arc::new(RedisStore::connect(&redis_url).await?);
    let log = Arc::new(AuditLog::open(&log_dir)?);
    let sink = Arc::new(AuditSink::new(store, log, admin_token));

    let cancel = CancellationToken::new();
    let drain_sink = sink.clone();
    let drain_cancel = cancel.clone();
    let drain = tokio::spawn(async move { drain_sink.run(drain_cancel).await });

    let addr = format!("0.0.0.0:{api_port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, log_dir = %log_dir, "starting audit sink");

    let server = axum::serve(listener, admin_router(sink)).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        cancel.cancel();
    });
    server.await?;

    let _ = drain.await;
    Ok(())
}
