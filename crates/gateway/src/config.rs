//! Gateway configuration, read from the environment.

use std::collections::HashMap;

use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use playground_queue::WorkloadKind;
use rand::RngCore;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    OAuth,
    Password,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub port: u16,
    pub namespace: String,
    pub base_url: String,
    pub auth_method: AuthMethod,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_allowed_domains: Vec<String>,
    pub admin_password: String,
    pub admin_principals: Vec<String>,
    pub session_key: Vec<u8>,
    pub version_image_map: HashMap<String, String>,
    pub default_workload_type: WorkloadKind,
    pub log_dir: String,
    pub audit_api_url: String,
    pub audit_admin_token: String,
    /// Secure cookies and release behavior.
    pub production: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Version map used when `VERSION_IMAGE_MAP` is unset or unparseable.
fn fallback_versions() -> HashMap<String, String> {
    HashMap::from([
        ("1.33".to_string(), "k8s-1.33.0".to_string()),
        ("1.32".to_string(), "k8s-1.32.1".to_string()),
        ("1.31".to_string(), "k8s-1.31.2".to_string()),
        ("1.30".to_string(), "k8s-1.30.2".to_string()),
    ])
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let auth_method = match env_or("AUTH_METHOD", "oauth").as_str() {
            "oauth" => AuthMethod::OAuth,
            "password" => AuthMethod::Password,
            other => bail!("invalid AUTH_METHOD: {other}. Must be 'oauth' or 'password'"),
        };

        let oauth_client_id = env_or("OAUTH_CLIENT_ID", "");
        let oauth_client_secret = env_or("OAUTH_CLIENT_SECRET", "");
        if auth_method == AuthMethod::OAuth
            && (oauth_client_id.is_empty() || oauth_client_secret.is_empty())
        {
            bail!("AUTH_METHOD is 'oauth', but OAUTH_CLIENT_ID or OAUTH_CLIENT_SECRET is not set");
        }

        let session_key = match std::env::var("SESSION_KEY") {
            Ok(key) if !key.is_empty() => key.into_bytes(),
            _ => {
                warn!("SESSION_KEY is not set; generating a random key. Sessions will not survive a restart");
                let mut key = [0u8; 64];
                rand::thread_rng().fill_bytes(&mut key);
                STANDARD.encode(key).into_bytes()
            }
        };

        let version_map_raw = env_or("VERSION_IMAGE_MAP", "{}");
        let version_image_map = match serde_json::from_str::<HashMap<String, String>>(
            &version_map_raw,
        ) {
            Ok(map) if !map.is_empty() => map,
            Ok(_) => {
                warn!("VERSION_IMAGE_MAP is empty; using fallback versions");
                fallback_versions()
            }
            Err(e) => {
                warn!(error = %e, "failed to parse VERSION_IMAGE_MAP; using fallback versions");
                fallback_versions()
            }
        };

        let port: u16 = env_or("PORT", "8080")
            .parse()
            .context("PORT must be a port number")?;

        Ok(Self {
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            port,
            namespace: env_or("NAMESPACE", "default"),
            base_url: env_or("BASE_URL", "http://localhost:8080"),
            auth_method,
            oauth_client_id,
            oauth_client_secret,
            oauth_allowed_domains: split_list(&env_or("OAUTH_ALLOWED_DOMAINS", "")),
            admin_password: env_or("ADMIN_PASSWORD", "admin123"),
            admin_principals: split_list(&env_or("ADMIN_PRINCIPALS", "")),
            session_key,
            version_image_map,
            default_workload_type: WorkloadKind::from_config(&env_or(
                "WORKLOAD_TYPE",
                "stateful",
            )),
            log_dir: env_or("LOG_DIR", "/var/log/k8s-playground"),
            audit_api_url: env_or("AUDIT_API_URL", ""),
            audit_admin_token: env_or("AUDIT_ADMIN_TOKEN", ""),
            production: env_or("RUN_MODE", "debug") == "release",
        })
    }

    /// Sorted version tags offered to users.
    pub fn known_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.version_image_map.keys().cloned().collect();
        versions.sort();
        versions
    }
}
