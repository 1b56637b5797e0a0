// [[MISSION]]/apps/kernel-server/src/error.rs
// Purpose: Typed outcomes for every rejected kernel operation.
// Architecture: Domain Error Layer
// Dependencies: thiserror, axum

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

/// Every rejection carries a stable reason string. The variant tells a caller
/// whether to retry later (conflict), fix its input (not found / validation)
/// or give up (internal / timeout).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Timeout(String),
}

impl KernelError {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::NotFound(_) => "not_found",
            KernelError::Conflict(_) => "conflict",
            KernelError::Validation(_) => "validation",
            KernelError::Internal(_) => "internal",
            KernelError::Timeout(_) => "timeout",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            KernelError::NotFound(_) => StatusCode::NOT_FOUND,
            KernelError::Conflict(_) => StatusCode::CONFLICT,
            KernelError::Validation(_) => StatusCode::BAD_REQUEST,
            KernelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            KernelError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<redis::RedisError> for KernelError {
    fn from(err: redis::RedisError) -> Self {
        KernelError::Internal(format!("project store unavailable: {}", err))
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Internal(format!("malformed record: {}", err))
    }
}

impl From<reqwest::Error> for KernelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KernelError::Timeout(format!("agent endpoint timed out: {}", err))
        } else {
            KernelError::Internal(format!("agent endpoint failed: {}", err))
        }
    }
}

impl IntoResponse for KernelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match status {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::GATEWAY_TIMEOUT => {
                tracing::error!("Request failed: {}", self)
            }
            _ => tracing::debug!("Request rejected ({}): {}", self.kind(), self),
        }

        let body = Json(json!({
            "success": false,
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
