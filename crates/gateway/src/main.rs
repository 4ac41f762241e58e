use std::sync::Arc;
use std::time::Duration;

use playground_controllers::audit_sink::AuditLog;
use playground_controllers::shutdown_signal;
use playground_driver::KubeDriver;
use playground_gateway::auth::SessionSigner;
use playground_gateway::config::{AuthMethod, Config};
use playground_gateway::oauth::OAuthClient;
use playground_gateway::{api, AppState};
use playground_queue::RedisStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = Arc::new(Config::from_env()?);

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let driver = Arc::new(KubeDriver::new().await?);

    let oauth = match config.auth_method {
        AuthMethod::OAuth => Some(Arc::new(OAuthClient::new(
            config.oauth_client_id.clone(),
            config.oauth_client_secret.clone(),
            &config.base_url,
            config.oauth_allowed_domains.clone(),
        )?)),
        AuthMethod::Password => {
            info!("authentication mode: password");
            None
        }
    };

    let audit_log = Arc::new(AuditLog::open(&config.log_dir)?);
    let signer = Arc::new(SessionSigner::new(config.session_key.clone()));

    let state = AppState {
        store,
        driver,
        config: config.clone(),
        signer,
        oauth,
        audit_log,
        http: reqwest::Client::new(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = api::router(state).layer(cors);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, namespace = %config.namespace, "starting gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("shutting down; draining connections for up to 30s");
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                warn!("grace period elapsed, exiting");
                std::process::exit(0);
            });
        })
        .await?;

    info!("gateway exited");
    Ok(())
}
