use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::services::id_generator::ObjectId;

/// Failures produced by the ephemeral object store.
///
/// `NotFound` and `Expired` are ordinary lifecycle outcomes, not faults;
/// callers should not log them as failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload exceeds the {limit} byte limit")]
    SizeExceeded { limit: u64 },
    #[error("file type `{0}` is not allowed")]
    InvalidType(String),
    #[error("object not found")]
    NotFound,
    #[error("object has expired")]
    Expired,
    #[error("identifier `{0}` is already registered")]
    Conflict(ObjectId),
    #[error(transparent)]
    StorageIo(#[from] io::Error),
    #[error("entropy source unavailable: {0}")]
    EntropyExhausted(#[source] rand::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            StoreError::Expired => Self::new(StatusCode::GONE, err.to_string()),
            StoreError::SizeExceeded { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            StoreError::InvalidType(_) => Self::bad_request(err.to_string()),
            StoreError::Conflict(_)
            | StoreError::StorageIo(_)
            | StoreError::EntropyExhausted(_) => {
                // Internal details stay in the log, not the response body.
                tracing::error!(error = %err, "object store failure");
                Self::internal("internal storage error")
            }
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}
