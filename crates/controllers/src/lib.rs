//! Lifecycle control loops and the command-audit sink.
//!
//! Each loop is an independently restartable worker over the shared work
//! queue. Safety without cross-record locking comes from status
//! partitioning: the generator writes `pending`/`generating` records, the
//! collector expires live records into `shutdown`, the killer moves
//! `shutdown` to `terminated`. Per-record failures are logged and retried on
//! a later tick; a loop never crashes because of one record.

pub mod audit_sink;
pub mod collector;
pub mod generator;
pub mod killer;

use std::time::Duration;

/// Read an environment variable with a fallback, the way every controller
/// binary is configured.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Ticker interval of the generator loop.
pub const GENERATOR_TICK: Duration = Duration::from_secs(5);
/// Ticker interval of the collector loop.
pub const COLLECTOR_TICK: Duration = Duration::from_secs(30);
/// Ticker interval of the killer loop.
pub const KILLER_TICK: Duration = Duration::from_secs(10);
