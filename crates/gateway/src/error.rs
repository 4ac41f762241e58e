//! REST error mapping. Every failure renders as `{"error": "..."}` with the
//! status the error kind dictates.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use playground_queue::{InvalidTransition, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad input; never retried.
    #[error("{0}")]
    Validation(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    /// Transition not allowed from the record's current state.
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Timeout(String),
    /// Outer Kubernetes rejection.
    #[error("{0}")]
    External(String),
    /// Work queue unreachable; the client may retry.
    #[error("{0}")]
    Storage(String),
    /// Proxy target unreachable.
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ApiError::External(_) => StatusCode::BAD_GATEWAY,
            ApiError::Storage(_) | ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("Reservation not found".to_string()),
            StoreError::Unavailable(msg) => ApiError::Storage(msg),
            StoreError::Corrupt(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<InvalidTransition> for ApiError {
    fn from(e: InvalidTransition) -> Self {
        ApiError::Conflict(e.to_string())
    }
}
