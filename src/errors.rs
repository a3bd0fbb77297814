use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures of the drive emulation layer, as seen by callers of the folder,
/// upload and archive services.
#[derive(Debug, Error)]
pub enum DriveError {
    /// Client-supplied path escapes the tenant root or is malformed.
    /// Never retried; no I/O has happened when this is raised.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    /// Transient store failure that survived the retry budget.
    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),
    /// The gateway never builds oversize batches; seeing this is a bug.
    #[error("delete batch of {size} keys exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("upload of `{key}` failed at part {part_number}: {reason}")]
    PartUploadFailed {
        key: String,
        part_number: u32,
        reason: String,
    },
    #[error("folder `{0}` is empty or missing")]
    EmptyOrMissingFolder(String),
    #[error("archive write failed: {0}")]
    Archive(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for DriveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => DriveError::NotFound(key),
            StoreError::Unavailable(reason) => DriveError::StoreUnavailable(reason),
            StoreError::BatchTooLarge { size, max } => DriveError::BatchTooLarge { size, max },
            other => DriveError::Store(other),
        }
    }
}

pub type DriveResult<T> = Result<T, DriveError>;

/// A lightweight wrapper for handler errors that keeps the message local.
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

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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

impl From<DriveError> for AppError {
    fn from(err: DriveError) -> Self {
        let status = match &err {
            DriveError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            DriveError::NotFound(_) | DriveError::EmptyOrMissingFolder(_) => StatusCode::NOT_FOUND,
            DriveError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DriveError::BatchTooLarge { .. }
            | DriveError::PartUploadFailed { .. }
            | DriveError::Archive(_)
            | DriveError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
