use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors produced by BOM operations
#[derive(Error, Debug)]
pub enum BomError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("File exceeds the {max_mb} MB limit")]
    PayloadTooLarge { max_mb: usize },

    /// The BOM checker answered with an error status
    #[error("BOM checker returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The BOM checker could not be reached or its stream broke
    #[error("BOM checker unavailable: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid stored record: {0}")]
    Corrupt(String),
}

pub type Result<T, E = BomError> = std::result::Result<T, E>;

impl From<reqwest::Error> for BomError {
    fn from(e: reqwest::Error) -> Self {
        let message = if e.is_timeout() {
            "request timed out".to_string()
        } else if e.is_connect() {
            "connection failed".to_string()
        } else if e.is_decode() {
            "unreadable response".to_string()
        } else {
            "request failed".to_string()
        };
        BomError::Transport(message)
    }
}

impl BomError {
    /// Message safe to show to a client
    pub fn public_message(&self) -> String {
        match self {
            BomError::Validation(_) | BomError::NotFound(_) | BomError::PayloadTooLarge { .. } => {
                self.to_string()
            }
            BomError::Upstream { status, message } if (400..500).contains(status) => {
                message.clone()
            }
            BomError::Upstream { .. } | BomError::Transport(_) => {
                "BOM checker is unavailable".to_string()
            }
            BomError::Database(_) | BomError::Corrupt(_) => {
                "An error occurred while processing your request".to_string()
            }
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            BomError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            BomError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            BomError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            // Client errors from the checker are passed through
            BomError::Upstream { status, .. } if (400..500).contains(status) => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                "UPSTREAM_REJECTED",
            ),
            BomError::Upstream { .. } | BomError::Transport(_) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
            }
            BomError::Database(_) | BomError::Corrupt(_) => {
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

impl IntoResponse for BomError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
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
    fn test_upstream_status_passthrough() {
        let rejected = BomError::Upstream {
            status: 422,
            message: "Unsupported spreadsheet".to_string(),
        };
        assert_eq!(rejected.status_and_code().0, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(rejected.public_message(), "Unsupported spreadsheet");

        let broken = BomError::Upstream {
            status: 500,
            message: "Traceback ...".to_string(),
        };
        assert_eq!(broken.status_and_code().0, StatusCode::BAD_GATEWAY);
        assert!(!broken.public_message().contains("Traceback"));
    }

    #[test]
    fn test_internal_errors_are_generic() {
        let err = BomError::Corrupt("unknown lookup status 'MAYBE'".to_string());
        assert_eq!(err.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("MAYBE"));
    }
}
