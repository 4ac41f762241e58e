//! OAuth authorization-code flow against a federated identity provider.
//!
//! Authorization code with PKCE; the callback exchanges the code, fetches
//! userinfo, and enforces the email-domain allow-list before a session
//! cookie is issued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::auth::{session_cookie, Principal};
use crate::AppState;

const AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";

pub struct OAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    allowed_domains: Vec<String>,
    /// CSRF state -> PKCE verifier for logins in flight.
    pending: RwLock<HashMap<String, PendingAuth>>,
}

struct PendingAuth {
    code_verifier: String,
    created_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl OAuthClient {
    pub fn new(
        client_id: String,
        client_secret: String,
        base_url: &str,
        allowed_domains: Vec<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            client_id,
            client_secret,
            redirect_uri: format!("{}/auth/callback", base_url.trim_end_matches('/')),
            allowed_domains,
            pending: RwLock::new(HashMap::new()),
        })
    }

    /// Build the provider redirect and remember the CSRF state.
    pub async fn authorize_url(&self) -> String {
        let code_verifier = random_string(64);
        let code_challenge = code_challenge(&code_verifier);
        let state = random_string(32);

        let mut url = format!(
            "{AUTHORIZE_ENDPOINT}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode("openid email profile"),
            urlencoding::encode(&state),
            urlencoding::encode(&code_challenge),
        );
        // A single allowed domain can be hinted to the provider's account
        // chooser; enforcement still happens in the callback.
        if let [domain] = self.allowed_domains.as_slice() {
            url.push_str(&format!("&hd={}", urlencoding::encode(domain)));
        }

        let mut pending = self.pending.write().await;
        pending.insert(
            state,
            PendingAuth {
                code_verifier,
                created_at: Instant::now(),
            },
        );
        pending.retain(|_, p| p.created_at.elapsed().as_secs() < 600);

        url
    }

    /// Exchange the callback code for a principal, enforcing the domain
    /// allow-list.
    pub async fn exchange_code(&self, code: &str, state: &str) -> Result<Principal> {
        let pending = {
            let mut map = self.pending.write().await;
            map.remove(state)
                .ok_or_else(|| anyhow::anyhow!("invalid or expired login state"))?
        };

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("code_verifier", &pending.code_verifier),
        ];
        let response = self.http.post(TOKEN_ENDPOINT).form(&params).send().await?;
        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("token exchange failed: {detail}");
        }
        let token: TokenResponse = response.json().await?;

        let response = self
            .http
            .get(USERINFO_ENDPOINT)
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("userinfo request failed");
        }
        let info: UserInfoResponse = response.json().await?;

        let email = info
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("identity provider returned no email"))?;
        self.check_domain(&email)?;

        let name = info.name.filter(|n| !n.is_empty()).unwrap_or(info.sub);
        Ok(Principal::new(email, name))
    }

    fn check_domain(&self, email: &str) -> Result<()> {
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        let domain = email.rsplit('@').next().unwrap_or("");
        if self.allowed_domains.iter().any(|d| d == domain) {
            Ok(())
        } else {
            anyhow::bail!(
                "you must log in with an account from one of the allowed domains: {:?}",
                self.allowed_domains
            )
        }
    }
}

fn random_string(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

// Routes

/// GET /auth/login: redirect to the provider.
pub async fn login(State(state): State<AppState>) -> Response {
    match &state.oauth {
        Some(client) => Redirect::temporary(&client.authorize_url().await).into_response(),
        None => (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": "OAuth login is not enabled" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct CallbackParams {
    code: String,
    state: String,
}

/// GET /auth/callback: finish the flow and set the session cookie.
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(client) = &state.oauth else {
        return (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": "OAuth login is not enabled" })),
        )
            .into_response();
    };

    match client.exchange_code(&params.code, &params.state).await {
        Ok(principal) => {
            info!(owner = %principal.id, "login succeeded");
            let cookie = session_cookie(&state.signer.encode(&principal), state.config.production);
            (
                StatusCode::FOUND,
                [(header::LOCATION, "/".to_string()), (header::SET_COOKIE, cookie)],
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "login callback failed");
            (
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({ "error": format!("Authentication failed: {e}") })),
            )
                .into_response()
        }
    }
}

pub type SharedOAuthClient = Arc<OAuthClient>;
