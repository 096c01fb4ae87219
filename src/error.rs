// Open Testimony error types
//
// Request handlers map each kind to a status code and a terse {"detail": ...}
// body; stack traces never leave the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OtError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    /// Structurally malformed input (bad UUID, unreadable JSON body).
    #[error("{0}")]
    Unprocessable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Audit chain integrity error: {0}")]
    Integrity(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("{0}")]
    Internal(String),
}

impl From<anyhow::Error> for OtError {
    fn from(err: anyhow::Error) -> Self {
        OtError::Internal(err.to_string())
    }
}

impl From<object_store::Error> for OtError {
    fn from(err: object_store::Error) -> Self {
        OtError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for OtError {
    fn from(err: reqwest::Error) -> Self {
        OtError::Model(err.to_string())
    }
}

impl OtError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OtError::Unauthenticated => StatusCode::UNAUTHORIZED,
            OtError::Forbidden(_) => StatusCode::FORBIDDEN,
            OtError::Validation(_) => StatusCode::BAD_REQUEST,
            OtError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OtError::NotFound(_) => StatusCode::NOT_FOUND,
            OtError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OtError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {}", self);
        }
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, OtError>;
