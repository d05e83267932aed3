//! Error types for rollcall-vs
//!
//! Every error leaves the service as
//! `{"error": {"code", "message", "retryable"}}` so clients can tell
//! "try again" apart from "does not match".

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::coordinator::VerificationError;
use crate::ledger::LedgerError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or incomplete request (400)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or bad credentials (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Body over the configured sample limit (413)
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Verification or ledger outcome (status depends on the variant)
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// rollcall-common error
    #[error("Common error: {0}")]
    Common(#[from] rollcall_common::Error),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Forbidden(msg) => ApiError::Forbidden(msg),
            other => ApiError::Verification(other.into()),
        }
    }
}

impl ApiError {
    /// Status, machine code, and whether resubmitting may help
    fn classify(&self) -> (StatusCode, &'static str, bool) {
        match self {
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST", false),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", false),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN", false),
            ApiError::PayloadTooLarge(_) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", false)
            }
            ApiError::Internal(_) | ApiError::Common(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", false)
            }
            ApiError::Verification(err) => match err {
                VerificationError::InvalidRequest(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_REQUEST", false)
                }
                VerificationError::NotAuthorized(_) => {
                    (StatusCode::FORBIDDEN, "FORBIDDEN", false)
                }
                VerificationError::VerificationInProgress(_) => {
                    (StatusCode::CONFLICT, "VERIFICATION_IN_PROGRESS", false)
                }
                VerificationError::Worker(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "VERIFICATION_UNAVAILABLE", true)
                }
                VerificationError::Rejected(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "REJECTED", false)
                }
                VerificationError::DuplicateAttendance { .. } => {
                    (StatusCode::CONFLICT, "DUPLICATE_ATTENDANCE", false)
                }
                VerificationError::StorageUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE", true)
                }
                VerificationError::Cancelled => (StatusCode::CONFLICT, "CANCELLED", false),
                VerificationError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", false)
                }
            },
        }
    }

    /// Text shown to the user. Worker-boundary details stay in the log.
    fn public_message(&self) -> String {
        match self {
            ApiError::Verification(VerificationError::Worker(_)) => {
                "Could not verify right now, please try again".to_string()
            }
            ApiError::Verification(VerificationError::Rejected(_)) => {
                "Verification failed, does not match".to_string()
            }
            ApiError::Verification(VerificationError::StorageUnavailable(_)) => {
                "Verified, but attendance could not be saved; please try again".to_string()
            }
            ApiError::Internal(_)
            | ApiError::Common(_)
            | ApiError::Verification(VerificationError::Internal(_)) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, retryable) = self.classify();
        if status.is_server_error() {
            error!(%code, error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.public_message(),
                "retryable": retryable,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerFailure;

    #[test]
    fn test_rejected_is_not_retryable() {
        let err = ApiError::from(VerificationError::Rejected("no".to_string()));
        let (status, code, retryable) = err.classify();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(code, "REJECTED");
        assert!(!retryable);
        assert_eq!(err.public_message(), "Verification failed, does not match");
    }

    #[test]
    fn test_worker_failure_hides_detail() {
        let err = ApiError::from(VerificationError::Worker(WorkerFailure::ProcessLaunch(
            "/opt/secret/path: not found".to_string(),
        )));
        let (status, _, retryable) = err.classify();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(retryable);
        assert!(!err.public_message().contains("secret"));
    }

    #[test]
    fn test_ledger_forbidden_maps_to_403() {
        let err = ApiError::from(LedgerError::Forbidden("nope".to_string()));
        assert_eq!(err.classify().0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_duplicate_maps_to_409() {
        let err = ApiError::from(LedgerError::DuplicateAttendance {
            subject_id: "s1".to_string(),
            course_id: "c1".to_string(),
            day: "2024-03-01".to_string(),
        });
        assert_eq!(err.classify(), (StatusCode::CONFLICT, "DUPLICATE_ATTENDANCE", false));
    }
}
