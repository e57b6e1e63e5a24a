// src/error.rs
// Shared error taxonomy. Every component boundary returns EngineError so the
// orchestrator and the HTTP/WS surfaces can react to a failure kind instead
// of a string.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Upstream is unreachable or timed out; safe to retry with backoff.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Upstream returned a 4xx we can't route around (bad request, auth, etc).
    #[error("upstream rejected request: {0}")]
    Upstream4xx(String),

    /// The thing being looked up does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An internal invariant was violated; indicates a bug, not bad input.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The service is shedding load (pool exhausted, queue full).
    #[error("overloaded: {0}")]
    Overload(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn overload(msg: impl Into<String>) -> Self {
        Self::Overload(msg.into())
    }

    /// True when a caller may retry the same operation after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Overload(_))
    }

    /// The reply shape the conversation orchestrator falls back to when a
    /// component fails outright rather than returning a Decision.
    pub fn as_escalation_reason(&self) -> &'static str {
        match self {
            Self::Transient(_) => "upstream temporarily unavailable",
            Self::Upstream4xx(_) => "upstream rejected the request",
            Self::NotFound(_) => "requested item not found",
            Self::Invariant(_) => "internal inconsistency detected",
            Self::Overload(_) => "system is under heavy load",
            Self::Internal(_) => "unexpected internal error",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => EngineError::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut => EngineError::Overload("database pool exhausted".into()),
            other => EngineError::Internal(other.into()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            EngineError::Transient(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_client_error() {
                EngineError::Upstream4xx(e.to_string())
            } else {
                EngineError::Transient(e.to_string())
            }
        } else {
            EngineError::Internal(e.into())
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            EngineError::Transient(_) => (StatusCode::BAD_GATEWAY, "transient"),
            EngineError::Upstream4xx(_) => (StatusCode::BAD_REQUEST, "upstream_4xx"),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::Invariant(_) => (StatusCode::INTERNAL_SERVER_ERROR, "invariant"),
            EngineError::Overload(_) => (StatusCode::SERVICE_UNAVAILABLE, "overload"),
            EngineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = json!({ "error": code, "message": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
