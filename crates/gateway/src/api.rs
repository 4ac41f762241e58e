//! Reservation REST surface and the admin endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{any, delete, get, put},
    Extension, Json, Router,
};
use playground_queue::{Reservation, Status, WorkloadKind};
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::{self, Principal};
use crate::error::ApiError;
use crate::{oauth, proxy, terminal, AppState};

const MAX_DISPLAY_NAME: usize = 50;

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route(
            "/auth/login",
            get(oauth::login).post(auth::password_login),
        )
        .route("/auth/callback", get(oauth::callback))
        .route("/auth/logout", get(auth::logout))
        .route("/healthz", get(health));

    let authed = Router::new()
        .route("/reservations", get(list_reservations).post(create_reservation))
        .route("/reservations/:id", delete(destroy_reservation))
        .route("/reservations/:id/displayName", put(update_display_name))
        .route("/reservations/:id/services", get(list_services))
        .route("/reservations/:id/attach", get(terminal::attach))
        .route("/reservations/:id/proxy/*path", any(proxy::proxy))
        .route("/versions", get(list_versions))
        .route("/auth/me", get(auth::me))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    // Outer-to-inner: authentication first, then the admin gate.
    let admin = Router::new()
        .route("/admin/commandLogs", get(command_logs))
        .route("/admin/reservations", get(all_reservations))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::admin_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .merge(public)
        .merge(authed)
        .merge(admin)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Load a record and enforce ownership. Every resource-bound handler goes
/// through this.
pub async fn load_owned(
    state: &AppState,
    id: &str,
    principal: &Principal,
) -> Result<Reservation, ApiError> {
    let record = state.store.get(id).await?;
    if record.owner != principal.id {
        warn!(id = %id, principal = %principal.id, owner = %record.owner, "ownership check failed");
        return Err(ApiError::Forbidden(
            "You are not the owner of this reservation".to_string(),
        ));
    }
    Ok(record)
}

/// Resolve the pod backing a reservation's workload. Stateful pod names are
/// deterministic; ephemeral ones are looked up by label.
pub async fn resolve_pod_name(
    state: &AppState,
    record: &Reservation,
) -> Result<String, ApiError> {
    match record.workload_type {
        WorkloadKind::Stateful => Ok(format!("{}-0", record.pod_id)),
        WorkloadKind::Ephemeral => state
            .driver
            .resolve_pod(&record.pod_id, &state.config.namespace)
            .await
            .map_err(|e| {
                ApiError::External(format!(
                    "Could not find the running pod for the reservation: {e}"
                ))
            }),
    }
}

// Handlers

pub async fn list_reservations(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reservations = state.store.list_by_owner(&principal.id).await?;
    Ok(Json(serde_json::json!({ "reservations": reservations })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[serde(default)]
    k8s_version: String,
    #[serde(default)]
    display_name: String,
}

pub async fn create_reservation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.k8s_version.is_empty() {
        return Err(ApiError::Validation("k8sVersion is required".to_string()));
    }
    if req.display_name.chars().count() > MAX_DISPLAY_NAME {
        return Err(ApiError::Validation(
            "displayName cannot exceed 50 characters".to_string(),
        ));
    }

    let mut record = Reservation::new(
        principal.id.clone(),
        req.k8s_version,
        req.display_name,
        state.config.default_workload_type,
    );
    state.store.put(&mut record).await?;
    info!(id = %record.id, owner = %record.owner, version = %record.k8s_version, "reservation created");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "reservation": record })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayNameRequest {
    display_name: String,
}

pub async fn update_display_name(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(req): Json<DisplayNameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.display_name.is_empty() {
        return Err(ApiError::Validation("displayName is required".to_string()));
    }
    if req.display_name.chars().count() > MAX_DISPLAY_NAME {
        return Err(ApiError::Validation(
            "displayName cannot exceed 50 characters".to_string(),
        ));
    }

    let mut record = load_owned(&state, &id, &principal).await?;
    record.display_name = req.display_name;
    state.store.put(&mut record).await?;
    Ok(Json(serde_json::json!({ "reservation": record })))
}

pub async fn destroy_reservation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut record = load_owned(&state, &id, &principal).await?;
    record.transition(Status::Shutdown)?;
    state.store.put(&mut record).await?;
    info!(id = %id, owner = %principal.id, "reservation marked for destruction");
    Ok(Json(
        serde_json::json!({ "message": "Reservation marked for destruction" }),
    ))
}

pub async fn list_services(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = load_owned(&state, &id, &principal).await?;
    if record.status != Status::Available {
        return Err(ApiError::Validation(
            "Reservation is not available".to_string(),
        ));
    }
    if record.pod_id.is_empty() {
        return Err(ApiError::Validation("Pod ID not available".to_string()));
    }
    let pod_name = resolve_pod_name(&state, &record).await?;

    let services = state
        .driver
        .discover_services(&pod_name, &state.config.namespace)
        .await
        .map_err(|e| ApiError::External(format!("Failed to retrieve services: {e}")))?;
    Ok(Json(serde_json::json!({ "services": services })))
}

pub async fn list_versions(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "versions": state.config.known_versions() }))
}

// Admin handlers

pub async fn all_reservations(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reservations = state.store.list_all().await?;
    Ok(Json(serde_json::json!({ "reservations": reservations })))
}

#[derive(Deserialize)]
pub struct CommandLogsQuery {
    user: Option<String>,
    reservation: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn command_logs(
    State(state): State<AppState>,
    Query(query): Query<CommandLogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0);

    // Prefer the audit sink's API; fall back to reading the shared log
    // tree directly.
    if !state.config.audit_api_url.is_empty() && !state.config.audit_admin_token.is_empty() {
        match fetch_logs_from_sink(&state, query.user.as_deref(), query.reservation.as_deref(), limit, offset)
            .await
        {
            Ok(logs) => {
                let count = logs.as_array().map(Vec::len).unwrap_or(0);
                return Ok(Json(serde_json::json!({ "logs": logs, "count": count })));
            }
            Err(e) => {
                warn!(error = %e, "audit sink API unavailable, reading log tree directly");
            }
        }
    }

    let logs = state
        .audit_log
        .list(
            query.user.as_deref(),
            query.reservation.as_deref(),
            limit,
            offset,
        )
        .map_err(|e| ApiError::Internal(format!("Failed to retrieve command logs: {e}")))?;
    let count = logs.len();
    Ok(Json(serde_json::json!({ "logs": logs, "count": count })))
}

async fn fetch_logs_from_sink(
    state: &AppState,
    user: Option<&str>,
    reservation: Option<&str>,
    limit: usize,
    offset: usize,
) -> anyhow::Result<serde_json::Value> {
    let mut url = format!(
        "{}/admin/logs?limit={limit}&offset={offset}",
        state.config.audit_api_url.trim_end_matches('/')
    );
    if let Some(user) = user {
        url.push_str(&format!("&user={}", urlencoding::encode(user)));
    }
    if let Some(reservation) = reservation {
        url.push_str(&format!("&reservation={}", urlencoding::encode(reservation)));
    }

    let response = state
        .http
        .get(&url)
        .header("X-Admin-Token", &state.config.audit_admin_token)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("audit sink API returned status {}", response.status());
    }
    let body: serde_json::Value = response.json().await?;
    Ok(body.get("logs").cloned().unwrap_or_default())
}
