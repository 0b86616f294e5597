use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use leash_auth::{AuthError, LoginError, PermissionError, PolicyError, StoreError};
use leash_core::DomainError;

/// Every failure a handler or middleware can return.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::Auth(AuthError::invalid(msg))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound("record"),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Auth(other.into()),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Stale => Self::Conflict(err.to_string()),
            other => Self::Auth(other.into()),
        }
    }
}

impl From<LoginError> for ApiError {
    fn from(err: LoginError) -> Self {
        Self::Auth(err.into())
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => Self::NotFound("record"),
            DomainError::Conflict(msg) => Self::Conflict(msg),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<PermissionError> for ApiError {
    fn from(err: PermissionError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            // Bare 401 for both: callers cannot probe which one they hit.
            ApiError::Auth(AuthError::Unauthenticated | AuthError::Unauthorized(_)) => {
                StatusCode::UNAUTHORIZED.into_response()
            }
            ApiError::Auth(AuthError::InvalidRequest(msg)) => {
                json_error(StatusCode::BAD_REQUEST, "invalid_request", msg)
            }
            ApiError::Auth(AuthError::Infrastructure(msg)) => {
                error!(error = %msg, "request failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
            }
            ApiError::NotFound(what) => json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
            ApiError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
