//! Maps every engine-side error onto one of the wire error codes (§6) and an
//! HTTP status. This is the only place that translation happens — route
//! handlers return the typed engine errors directly via `?` and let `From`
//! impls below do the rest.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bpmn_engine::{AuthError, EngineError, ErrorCode, JobError, StoreError, TimerError};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(value_type = String, example = "NOT_FOUND")]
    pub code: ErrorCode,
    pub error: String,
}

pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::BadRequest | ErrorCode::ValidationError | ErrorCode::InvalidDuration | ErrorCode::BpmnParseError | ErrorCode::BpmnValidationError | ErrorCode::ExpressionError => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::NotFound | ErrorCode::ProcessNotFound | ErrorCode::InstanceNotFound | ErrorCode::JobNotFound | ErrorCode::TimerNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::StorageError | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status() == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = ?self.code, message = %self.message, "request failed");
        } else {
            tracing::warn!(code = ?self.code, message = %self.message, "request rejected");
        }
        (self.status(), Json(ErrorResponse { code: self.code, error: self.message })).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<TimerError> for ApiError {
    fn from(e: TimerError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}
