//! # error
//!
//! Centralised application error type.
//!
//! Every handler returns `Result<_, EngineError>`. Axum's `IntoResponse`
//! impl converts these into structured JSON error bodies so the dashboard
//! always gets a machine-readable response even on failure.
//!
//! Note what is deliberately *not* here: `lock_not_acquired` and
//! `already_closed` are expected concurrency/idempotency outcomes of the
//! close protocol, modelled as skipped-but-successful results — never as
//! errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The requested resource (position, account) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A close was requested but no exit price could be resolved from any
    /// source (live quote, last known price, average entry). Actionable and
    /// distinct from "already closed".
    #[error("Quote unavailable: {0}")]
    QuoteUnavailable(String),

    /// Durable-store failure.
    #[error("Ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            EngineError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            EngineError::QuoteUnavailable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("No exit price available: {msg}"),
            ),
            EngineError::Ledger(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Ledger error: {err}"),
            ),
            EngineError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
