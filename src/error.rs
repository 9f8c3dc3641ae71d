//! Error types for the PDF toolkit server
//!
//! Every failure a job can hit is a [`JobError`]. Intake errors are raised
//! before any workspace exists; dispatcher errors always come with the
//! workspace already scheduled for removal.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type for job processing
pub type Result<T> = std::result::Result<T, JobError>;

/// Job error taxonomy
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("{tool} failed with exit code {}", exit_label(exit_code))]
    ExternalToolFailure {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Tool reported success but produced no output: {0}")]
    OutputMissing(String),

    #[error("Server busy: all {0} job slots in use")]
    ServerBusy(usize),

    #[error("Delivery aborted after {sent} of {total} bytes")]
    DeliveryAborted { sent: u64, total: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

impl JobError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ExternalToolFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::OutputMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ServerBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeliveryAborted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            Self::ExternalToolFailure { .. } => "EXTERNAL_TOOL_FAILURE",
            Self::Timeout(_) => "TIMEOUT",
            Self::OutputMissing(_) => "OUTPUT_MISSING",
            Self::ServerBusy(_) => "SERVER_BUSY",
            Self::DeliveryAborted { .. } => "DELIVERY_ABORTED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let (error, details) = match &self {
            JobError::ExternalToolFailure { stderr, .. } => {
                let details = if stderr.trim().is_empty() {
                    None
                } else {
                    Some(stderr.trim().to_string())
                };
                (self.to_string(), details)
            }
            JobError::Io(e) => {
                tracing::error!("IO error: {}", e);
                ("An internal error occurred".to_string(), None)
            }
            _ => (self.to_string(), None),
        };

        let body = Json(ErrorResponse {
            error,
            code: self.code(),
            details,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            JobError::UnsupportedType("text/plain".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(JobError::Timeout(1).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(JobError::ServerBusy(4).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            JobError::PayloadTooLarge { size: 10, max: 5 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_tool_failure_message() {
        let err = JobError::ExternalToolFailure {
            tool: "qpdf".into(),
            exit_code: Some(2),
            stderr: "qpdf: invalid password".into(),
        };
        assert_eq!(err.to_string(), "qpdf failed with exit code 2");
        assert_eq!(err.code(), "EXTERNAL_TOOL_FAILURE");

        let killed = JobError::ExternalToolFailure {
            tool: "gs".into(),
            exit_code: None,
            stderr: String::new(),
        };
        assert_eq!(killed.to_string(), "gs failed with exit code none");
    }
}
