use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, time::Duration};
use thiserror::Error;

use crate::services::blob_store::BlobError;

/// Stage of a finalization request, reported alongside every fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeStage {
    Received,
    Reassembling,
    Transcoding,
    Persisting,
    CleaningUp,
    Done,
}

impl FinalizeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeStage::Received => "received",
            FinalizeStage::Reassembling => "reassembling",
            FinalizeStage::Transcoding => "transcoding",
            FinalizeStage::Persisting => "persisting",
            FinalizeStage::CleaningUp => "cleaning_up",
            FinalizeStage::Done => "done",
        }
    }
}

impl fmt::Display for FinalizeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure kinds of the chunked upload and finalization workflow.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("upload incomplete: chunk {missing_index} of {total} is missing")]
    IncompleteUpload { missing_index: u32, total: u32 },
    #[error("empty upload: {0}")]
    EmptyUpload(String),
    #[error("invalid processing parameters: {0}")]
    InvalidParams(String),
    #[error("transcode failed: {diagnostic}")]
    TranscodeFailed { diagnostic: String },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("external tool exceeded its {0:?} budget")]
    Timeout(Duration),
    #[error("session `{0}` is already being finalized")]
    FinalizeInProgress(String),
}

impl UploadError {
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::InvalidChunk(_) => "invalid_chunk",
            UploadError::MissingField(_) => "missing_field",
            UploadError::Forbidden(_) => "forbidden",
            UploadError::IncompleteUpload { .. } => "incomplete_upload",
            UploadError::EmptyUpload(_) => "empty_upload",
            UploadError::InvalidParams(_) => "invalid_params",
            UploadError::TranscodeFailed { .. } => "transcode_failed",
            UploadError::StorageUnavailable(_) => "storage_unavailable",
            UploadError::Timeout(_) => "timeout",
            UploadError::FinalizeInProgress(_) => "finalize_in_progress",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::InvalidChunk(_)
            | UploadError::MissingField(_)
            | UploadError::InvalidParams(_) => StatusCode::BAD_REQUEST,
            UploadError::Forbidden(_) => StatusCode::FORBIDDEN,
            UploadError::IncompleteUpload { .. } | UploadError::FinalizeInProgress(_) => {
                StatusCode::CONFLICT
            }
            UploadError::EmptyUpload(_) | UploadError::TranscodeFailed { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            UploadError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Attach the finalization stage the error surfaced in.
    pub fn at(self, stage: FinalizeStage) -> FinalizeError {
        FinalizeError { stage, error: self }
    }
}

impl From<BlobError> for UploadError {
    fn from(err: BlobError) -> Self {
        UploadError::StorageUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for UploadError {
    fn from(err: sqlx::Error) -> Self {
        UploadError::StorageUnavailable(err.to_string())
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A fatal finalize failure tagged with the stage it happened in.
#[derive(Debug, Error)]
#[error("{stage}: {error}")]
pub struct FinalizeError {
    pub stage: FinalizeStage,
    #[source]
    pub error: UploadError,
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub stage: Option<FinalizeStage>,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind: "error",
            stage: None,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            kind: "not_found",
            ..Self::new(StatusCode::NOT_FOUND, msg)
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            kind: "bad_request",
            ..Self::new(StatusCode::BAD_REQUEST, msg)
        }
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
            "kind": self.kind,
            "stage": self.stage.map(|s| s.as_str()),
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        Self {
            status: err.status(),
            kind: err.kind(),
            stage: None,
            message: err.to_string(),
        }
    }
}

impl From<FinalizeError> for AppError {
    fn from(err: FinalizeError) -> Self {
        Self {
            status: err.error.status(),
            kind: err.error.kind(),
            stage: Some(err.stage),
            message: err.to_string(),
        }
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound { .. } => AppError::not_found(err.to_string()),
            BlobError::InvalidKey | BlobError::UnknownBucket(_) => {
                AppError::bad_request(err.to_string())
            }
            other => UploadError::from(other).into(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
