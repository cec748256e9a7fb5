use crate::object_store::StorageError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors produced by ingestion operations
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("{0}")]
    Validation(String),

    #[error("File size exceeds maximum allowed size of {max_mb}MB")]
    PayloadTooLarge { max_mb: usize },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid stored record: {0}")]
    Corrupt(String),
}

pub type Result<T, E = IngestionError> = std::result::Result<T, E>;

impl IngestionError {
    /// Message safe to persist on a failed job or show to a client
    pub fn public_message(&self) -> String {
        match self {
            IngestionError::Validation(_)
            | IngestionError::PayloadTooLarge { .. }
            | IngestionError::NotFound(_)
            | IngestionError::Conflict(_)
            | IngestionError::Download(_) => self.to_string(),
            IngestionError::Storage(e) if e.is_missing() => "File not found".to_string(),
            IngestionError::Storage(StorageError::Source(_)) => {
                "Transfer from source was interrupted".to_string()
            }
            IngestionError::Storage(_) => {
                "An error occurred while accessing cloud storage".to_string()
            }
            IngestionError::Database(_) | IngestionError::Corrupt(_) => {
                "An error occurred while processing your request".to_string()
            }
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            IngestionError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            IngestionError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE")
            }
            IngestionError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            IngestionError::Conflict(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
            IngestionError::Download(_) => (StatusCode::BAD_GATEWAY, "DOWNLOAD_ERROR"),
            IngestionError::Storage(e) if e.is_missing() => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            IngestionError::Storage(_) => (StatusCode::BAD_GATEWAY, "STORAGE_ERROR"),
            IngestionError::Database(_) | IngestionError::Corrupt(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for IngestionError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() || status == StatusCode::BAD_GATEWAY {
            error!(error = %self, code, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.public_message(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_sanitized() {
        let forbidden = IngestionError::Storage(StorageError::Forbidden(
            "ingestions/1/abc.zip".to_string(),
        ));
        assert_eq!(forbidden.public_message(), "File not found");
        assert_eq!(forbidden.status_and_code().0, StatusCode::NOT_FOUND);

        let provider = IngestionError::Storage(StorageError::Provider(
            "SlowDown: request id 4442587FB7D0A2F9".to_string(),
        ));
        assert!(!provider.public_message().contains("4442587FB7D0A2F9"));
        assert_eq!(provider.status_and_code().0, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_validation_status_codes() {
        assert_eq!(
            IngestionError::PayloadTooLarge { max_mb: 50 }.status_and_code().0,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            IngestionError::Validation("Only ZIP files are supported".to_string())
                .status_and_code()
                .0,
            StatusCode::BAD_REQUEST
        );
    }
}
