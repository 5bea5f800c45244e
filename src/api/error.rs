//! Structured API error responses
//!
//! Every error carries a stable machine-readable code and a category telling
//! the caller whether to retry later, fix the request, or escalate to an
//! operator.

use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::infra::{ErrorClass, SequencerError};

/// Seconds a client should wait before retrying a transient failure
const RETRY_AFTER_SECS: u64 = 1;

/// Error codes for API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors (1xxx)
    InvalidArgument,
    InvalidRequestBody,

    // Resource errors (2xxx)
    DirectoryNotFound,
    BatchNotFound,
    RevisionNotFound,

    // Integrity errors (3xxx), need operator attention
    BatchConflict,
    LeafConflict,
    IntegrityViolation,

    // Verification errors (4xxx)
    VerificationFailed,

    // Retryable errors (5xxx)
    FailedPrecondition,
    ServiceUnavailable,
    Cancelled,
    DeadlineExceeded,

    // Internal errors (9xxx)
    DatabaseError,
    InternalError,
}

impl ErrorCode {
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::InvalidArgument => 1001,
            ErrorCode::InvalidRequestBody => 1002,
            ErrorCode::DirectoryNotFound => 2001,
            ErrorCode::BatchNotFound => 2002,
            ErrorCode::RevisionNotFound => 2003,
            ErrorCode::BatchConflict => 3001,
            ErrorCode::LeafConflict => 3002,
            ErrorCode::IntegrityViolation => 3003,
            ErrorCode::VerificationFailed => 4001,
            ErrorCode::FailedPrecondition => 5001,
            ErrorCode::ServiceUnavailable => 5002,
            ErrorCode::Cancelled => 5003,
            ErrorCode::DeadlineExceeded => 5004,
            ErrorCode::DatabaseError => 9001,
            ErrorCode::InternalError => 9999,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidArgument | ErrorCode::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ErrorCode::DirectoryNotFound
            | ErrorCode::BatchNotFound
            | ErrorCode::RevisionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::BatchConflict | ErrorCode::LeafConflict => StatusCode::CONFLICT,
            ErrorCode::IntegrityViolation => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::VerificationFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::FailedPrecondition
            | ErrorCode::ServiceUnavailable
            | ErrorCode::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::FailedPrecondition
                | ErrorCode::ServiceUnavailable
                | ErrorCode::Cancelled
                | ErrorCode::DeadlineExceeded
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&code)
    }
}

/// Coarse category shown to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Integrity,
    Verification,
    InvalidInput,
    NotFound,
    Cancelled,
    Internal,
}

impl From<ErrorClass> for ErrorCategory {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Transient => ErrorCategory::Transient,
            ErrorClass::Integrity => ErrorCategory::Integrity,
            ErrorClass::Verification => ErrorCategory::Verification,
            ErrorClass::InvalidInput => ErrorCategory::InvalidInput,
            ErrorClass::NotFound => ErrorCategory::NotFound,
            ErrorClass::Cancelled => ErrorCategory::Cancelled,
            ErrorClass::Internal => ErrorCategory::Internal,
        }
    }
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                category,
                message: message.into(),
                details: None,
                retry_after: code.is_retryable().then_some(RETRY_AFTER_SECS),
            },
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, ErrorCategory::InvalidInput, message)
    }

    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequestBody, ErrorCategory::InvalidInput, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.error.code.to_string();
        let retry_after = self.error.retry_after;
        let mut response = (status, Json(self)).into_response();

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&code) {
            headers.insert("x-error-code", value);
        }
        if let Some(seconds) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::invalid_argument(format!("invalid path: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::invalid_argument(format!("invalid query: {}", rejection.body_text()))
    }
}

impl From<SequencerError> for ApiError {
    fn from(err: SequencerError) -> Self {
        let category = ErrorCategory::from(err.class());
        let message = err.to_string();
        match err {
            SequencerError::Database(_) => {
                let code = if category == ErrorCategory::Transient {
                    ErrorCode::ServiceUnavailable
                } else {
                    ErrorCode::DatabaseError
                };
                ApiError::new(code, category, message)
            }
            SequencerError::BatchNotFound {
                directory_id,
                revision,
            } => ApiError::new(ErrorCode::BatchNotFound, category, message).with_details(
                serde_json::json!({ "directory_id": directory_id, "revision": revision }),
            ),
            SequencerError::BatchConflict {
                directory_id,
                revision,
            } => ApiError::new(ErrorCode::BatchConflict, category, message).with_details(
                serde_json::json!({ "directory_id": directory_id, "revision": revision }),
            ),
            SequencerError::RevisionNotFound {
                directory_id,
                revision,
            } => ApiError::new(ErrorCode::RevisionNotFound, category, message).with_details(
                serde_json::json!({ "directory_id": directory_id, "revision": revision }),
            ),
            SequencerError::DirectoryNotFound(_) => {
                ApiError::new(ErrorCode::DirectoryNotFound, category, message)
            }
            SequencerError::LeafConflict { index } => {
                ApiError::new(ErrorCode::LeafConflict, category, message)
                    .with_details(serde_json::json!({ "log_index": index }))
            }
            SequencerError::IntegrityViolation(_) => {
                ApiError::new(ErrorCode::IntegrityViolation, category, message)
            }
            SequencerError::Verification(_) => {
                ApiError::new(ErrorCode::VerificationFailed, category, message)
            }
            SequencerError::FailedPrecondition(_) => {
                ApiError::new(ErrorCode::FailedPrecondition, category, message)
            }
            SequencerError::Unavailable(_) => {
                ApiError::new(ErrorCode::ServiceUnavailable, category, message)
            }
            SequencerError::Cancelled => ApiError::new(ErrorCode::Cancelled, category, message),
            SequencerError::DeadlineExceeded(_) => {
                ApiError::new(ErrorCode::DeadlineExceeded, category, message)
            }
            SequencerError::InvalidArgument(_) => {
                ApiError::new(ErrorCode::InvalidArgument, category, message)
            }
            SequencerError::Serialization(_)
            | SequencerError::Configuration(_)
            | SequencerError::Internal(_) => {
                ApiError::new(ErrorCode::InternalError, category, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DirectoryId;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::BatchConflict.to_string(), "BATCH_CONFLICT");
        assert_eq!(ErrorCode::VerificationFailed.to_string(), "VERIFICATION_FAILED");
    }

    #[test]
    fn test_conflicts_need_attention() {
        let api: ApiError = SequencerError::BatchConflict {
            directory_id: DirectoryId::new("d"),
            revision: 4,
        }
        .into();
        assert_eq!(api.status(), StatusCode::CONFLICT);
        assert_eq!(api.error.category, ErrorCategory::Integrity);
        assert!(api.error.retry_after.is_none());
        assert_eq!(api.error.details.unwrap()["revision"], 4);
    }

    #[test]
    fn test_transient_errors_carry_retry_after() {
        let api: ApiError = SequencerError::FailedPrecondition("pending".into()).into();
        assert_eq!(api.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.error.retry_after, Some(1));

        let response = api.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(response.headers()["x-error-code"], "FAILED_PRECONDITION");
    }

    #[test]
    fn test_invalid_body_is_a_client_error() {
        let api = ApiError::invalid_body("min_batch must be a number");
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);
        assert_eq!(api.error.category, ErrorCategory::InvalidInput);
        assert_eq!(api.error.numeric_code, 1002);
        assert!(api.error.retry_after.is_none());
    }

    #[test]
    fn test_verification_maps_to_bad_gateway() {
        let api: ApiError = SequencerError::Verification("bad sig".into()).into();
        assert_eq!(api.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(api.error.code, ErrorCode::VerificationFailed);
    }
}
