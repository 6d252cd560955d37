use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::library::StorageTarget;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Manuscript container could not be opened or parsed.
    #[error("Manuscript could not be parsed: {0}")]
    Parse(String),

    /// Extraction produced no chapters.
    #[error("Manuscript contains no chapters")]
    EmptyManuscript,

    /// Cover or promotional asset could not be normalized.
    #[error("Asset normalization failed: {0}")]
    AssetNormalization(String),

    /// Some chapter writes failed after the book record was stored.
    #[error(
        "Saved {saved} chapters of {book_id} to {target} storage, {} failed: {failed:?}",
        .failed.len()
    )]
    PartialWrite {
        /// Book the chapters belong to.
        book_id: String,
        /// Store the writes went to.
        target: StorageTarget,
        /// Number of chapters that were written.
        saved: usize,
        /// Chapter numbers that failed, ascending.
        failed: Vec<u32>,
    },

    /// A caller without cloud permission attempted a cloud write.
    #[error("Caller is not allowed to write to cloud storage")]
    AuthorizationViolation,

    /// Caller supplied unusable input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document or blob store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failed operation left nothing behind in storage.
    pub fn nothing_saved(&self) -> bool {
        !matches!(self, AppError::PartialWrite { .. })
    }

    /// Human-readable message for the person who triggered the operation.
    ///
    /// Only a partial write says what was saved. Use [`AppError::write_message`]
    /// when the failed operation was a write.
    pub fn user_message(&self) -> String {
        match self {
            AppError::PartialWrite { saved, failed, .. } => {
                let list = failed
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "{} chapters were saved, {} failed (chapters {}). Retry to upload the missing chapters.",
                    saved,
                    failed.len(),
                    list
                )
            }
            other => other.to_string(),
        }
    }

    /// Message for a failed upload or retry, stating whether anything was saved.
    pub fn write_message(&self) -> String {
        if self.nothing_saved() {
            format!("Nothing was saved: {}", self)
        } else {
            self.user_message()
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Parse(_) | AppError::EmptyManuscript | AppError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::AssetNormalization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::AuthorizationViolation => StatusCode::FORBIDDEN,
            AppError::PartialWrite { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Request error");

        (self.status(), self.user_message()).into_response()
    }
}

/// An error from a write request, reported with what was or was not saved.
#[derive(Debug)]
pub struct WriteError(pub AppError);

impl From<AppError> for WriteError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl IntoResponse for WriteError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "Write request error");

        (self.0.status(), self.0.write_message()).into_response()
    }
}


/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
