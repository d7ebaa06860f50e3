// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the e2epool controller.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::backend::BackendError;
use crate::ci::CiError;

/// Controller errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Malformed input (bad name pattern, bad enum value, ...).
    #[error("{0}")]
    Validation(String),

    /// Missing or unparseable credentials.
    #[error("{0}")]
    Auth(String),

    /// Valid credentials without access to the resource.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown checkpoint or runner (may mask a token mismatch).
    #[error("{0}")]
    NotFound(String),

    /// Single-active violation or duplicate registration.
    #[error("{0}")]
    Conflict(String),

    /// Create attempted inside the post-finalize cooldown window.
    #[error("{0}")]
    Cooldown(String),

    /// Hypervisor or agent-side failure during a backend operation.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// CI adapter call failed.
    #[error("CI adapter error: {0}")]
    CiAdapter(#[from] CiError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    /// Task enqueue failed; the state change was rolled back.
    #[error("Broker error: {0}")]
    Broker(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the controller Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Cooldown(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Backend(BackendError::AgentNotConnected(_)) => StatusCode::NOT_FOUND,
            Error::Backend(BackendError::AgentTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Error::Backend(_) => StatusCode::BAD_GATEWAY,
            Error::CiAdapter(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) | Error::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric code carried on agent-channel error responses.
    pub fn rpc_code(&self) -> u16 {
        self.status_code().as_u16()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Internal details go to the log, not the caller.
            tracing::error!(error = %self, "Internal error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Auth("no token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::Forbidden("wrong runner".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::NotFound("missing".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Conflict("active exists".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Cooldown("wait".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Broker("enqueue failed".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_agent_backend_mapping() {
        assert_eq!(
            Error::Backend(BackendError::AgentNotConnected("r1".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Backend(BackendError::AgentTimeout("r1".into())).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::Backend(BackendError::Hypervisor("boom".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_rpc_code_matches_status() {
        assert_eq!(Error::NotFound("x".into()).rpc_code(), 404);
        assert_eq!(Error::Conflict("x".into()).rpc_code(), 409);
        assert_eq!(Error::Cooldown("x".into()).rpc_code(), 429);
    }
}
