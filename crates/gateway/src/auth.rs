//! Principal sessions: HMAC-signed cookies, the password login, and the
//! auth/admin middleware layers.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::config::AuthMethod;
use crate::error::ApiError;
use crate::AppState;

/// Fixed principal used by password mode.
pub const LEGACY_ADMIN: &str = "legacy_admin_user";
pub const SESSION_COOKIE: &str = "playground_session";
/// Session lifetime: 7 days.
pub const SESSION_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

/// The authenticated principal carried through request extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
    /// Unix seconds after which the session is invalid.
    pub exp: i64,
}

impl Principal {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            exp: chrono::Utc::now().timestamp() + SESSION_MAX_AGE_SECS,
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies session cookies: `base64url(json) . base64url(mac)`.
pub struct SessionSigner {
    key: Vec<u8>,
}

impl SessionSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn encode(&self, principal: &Principal) -> String {
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(principal).expect("principal serialization cannot fail"),
        );
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload}.{tag}")
    }

    /// Verify the signature and expiry; `None` on any mismatch.
    pub fn decode(&self, token: &str) -> Option<Principal> {
        let (payload, tag) = token.split_once('.')?;
        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(payload.as_bytes());
        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        mac.verify_slice(&tag).ok()?;

        let principal: Principal =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;
        if principal.exp < chrono::Utc::now().timestamp() {
            return None;
        }
        Some(principal)
    }
}

/// Set-Cookie value for a fresh session.
pub fn session_cookie(token: &str, production: bool) -> String {
    format!(
        "{SESSION_COOKIE}={token}; Max-Age={SESSION_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Lax{}",
        if production { "; Secure" } else { "" }
    )
}

/// Set-Cookie value that clears the session.
pub fn clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax")
}

/// Pull the session cookie out of request headers.
pub fn principal_from_headers(headers: &HeaderMap, signer: &SessionSigner) -> Option<Principal> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    let token = cookies.split(';').find_map(|c| {
        let (name, value) = c.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })?;
    signer.decode(token)
}

/// Require a valid session; insert the [`Principal`] into extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = principal_from_headers(request.headers(), &state.signer)
        .ok_or(ApiError::Unauthorized)?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Require an admin principal. Runs inside `auth_middleware`.
pub async fn admin_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = request
        .extensions()
        .get::<Principal>()
        .ok_or(ApiError::Unauthorized)?;
    if !is_admin(&state, principal) {
        return Err(ApiError::Forbidden(
            "Access denied: admin privileges required".to_string(),
        ));
    }
    Ok(next.run(request).await)
}

pub fn is_admin(state: &AppState, principal: &Principal) -> bool {
    match state.config.auth_method {
        AuthMethod::Password => principal.id == LEGACY_ADMIN,
        AuthMethod::OAuth => state
            .config
            .admin_principals
            .iter()
            .any(|admin| admin == &principal.id),
    }
}

#[derive(Deserialize)]
pub struct PasswordLoginRequest {
    password: String,
}

/// POST /auth/login, password mode only.
pub async fn password_login(
    State(state): State<AppState>,
    Json(req): Json<PasswordLoginRequest>,
) -> Result<Response, ApiError> {
    if state.config.auth_method != AuthMethod::Password {
        return Err(ApiError::Forbidden(
            "Password login is not enabled".to_string(),
        ));
    }
    if req.password != state.config.admin_password {
        warn!("rejected password login attempt");
        return Err(ApiError::Unauthorized);
    }

    let principal = Principal::new(LEGACY_ADMIN, "Admin (Password Auth)");
    let cookie = session_cookie(&state.signer.encode(&principal), state.config.production);
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "authenticated": true })),
    )
        .into_response())
}

/// GET /auth/logout
pub async fn logout() -> Response {
    ([(header::SET_COOKIE, clear_cookie())], Redirect::to("/")).into_response()
}

/// GET /auth/me
pub async fn me(
    State(state): State<AppState>,
    axum::Extension(principal): axum::Extension<Principal>,
) -> Json<serde_json::Value> {
    let auth_method = match state.config.auth_method {
        AuthMethod::OAuth => "oauth",
        AuthMethod::Password => "password",
    };
    Json(serde_json::json!({
        "ownerId": principal.id,
        "displayName": principal.name,
        "authMethod": auth_method,
        "admin": is_admin(&state, &principal),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_roundtrip() {
        let signer = SessionSigner::new(b"test-session-key".to_vec());
        let principal = Principal::new("alice@example.com", "Alice");
        let token = signer.encode(&principal);
        let decoded = signer.decode(&token).unwrap();
        assert_eq!(decoded.id, "alice@example.com");
        assert_eq!(decoded.name, "Alice");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let signer = SessionSigner::new(b"test-session-key".to_vec());
        let token = signer.encode(&Principal::new("alice@example.com", "Alice"));

        let mut tampered = token.clone();
        tampered.replace_range(0..2, "zz");
        assert!(signer.decode(&tampered).is_none());

        let other = SessionSigner::new(b"different-key".to_vec());
        assert!(other.decode(&token).is_none());
    }

    #[test]
    fn expired_session_is_rejected() {
        let signer = SessionSigner::new(b"test-session-key".to_vec());
        let mut principal = Principal::new("alice@example.com", "Alice");
        principal.exp = chrono::Utc::now().timestamp() - 1;
        let token = signer.encode(&principal);
        assert!(signer.decode(&token).is_none());
    }

    #[test]
    fn cookie_attributes() {
        let cookie = session_cookie("tok", false);
        assert!(cookie.starts_with("playground_session=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Max-Age=604800"));
        assert!(!cookie.contains("Secure"));

        let secure = session_cookie("tok", true);
        assert!(secure.contains("Secure"));
    }

    #[test]
    fn header_extraction_finds_our_cookie() {
        let signer = SessionSigner::new(b"key".to_vec());
        let token = signer.encode(&Principal::new("alice@example.com", "Alice"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("other=1; {SESSION_COOKIE}={token}; theme=dark")
                .parse()
                .unwrap(),
        );
        let principal = principal_from_headers(&headers, &signer).unwrap();
        assert_eq!(principal.id, "alice@example.com");

        headers.insert(header::COOKIE, "other=1".parse().unwrap());
        assert!(principal_from_headers(&headers, &signer).is_none());
    }
}
