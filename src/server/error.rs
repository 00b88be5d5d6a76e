//! API error type: converts engine failures into structured JSON
//! responses so callers always get a machine-readable body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The requested model or position does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A cycle is already running for the targeted model.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The signal was understood but rejected by the accounting rules.
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// An upstream oracle failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => ApiError::BadRequest(msg),
            EngineError::NotFound(msg) => ApiError::NotFound(msg),
            EngineError::ConcurrentExecution => ApiError::Conflict(err.to_string()),
            EngineError::Margin(msg) => ApiError::Unprocessable(msg),
            EngineError::Oracle(msg) => ApiError::Upstream(msg),
            EngineError::Persistence(e) => ApiError::Internal(e.into()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ApiError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}
