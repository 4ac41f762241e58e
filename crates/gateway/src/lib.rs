//! The app-facing gateway: reservation REST API, terminal WebSocket bridge,
//! and the in-pod HTTP proxy.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod oauth;
pub mod proxy;
pub mod terminal;

use std::sync::Arc;

use playground_controllers::audit_sink::AuditLog;
use playground_driver::ClusterDriver;
use playground_queue::ReservationStore;

use crate::auth::SessionSigner;
use crate::config::Config;
use crate::oauth::OAuthClient;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReservationStore>,
    pub driver: Arc<dyn ClusterDriver>,
    pub config: Arc<Config>,
    pub signer: Arc<SessionSigner>,
    /// Present in oauth mode only.
    pub oauth: Option<Arc<OAuthClient>>,
    /// Direct read access to the audit tree, used when no audit-sink API is
    /// configured.
    pub audit_log: Arc<AuditLog>,
    pub http: reqwest::Client,
}
