//! Typed errors for every component boundary, each mapped onto a stable wire error code.

use uuid::Uuid;

/// Error code taxonomy, stable across transports (HTTP, gRPC, internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    ValidationError,
    Unauthorized,
    Forbidden,
    RateLimited,
    NotFound,
    Conflict,
    ProcessNotFound,
    InstanceNotFound,
    JobNotFound,
    TimerNotFound,
    InvalidDuration,
    BpmnParseError,
    BpmnValidationError,
    ExpressionError,
    StorageError,
    InternalError,
    Busy,
}

/// Errors raised by the key-value store adapter (C1).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound(_) => ErrorCode::NotFound,
            _ => ErrorCode::StorageError,
        }
    }
}

/// Errors raised by the execution engine (C9) and its direct collaborators.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("process definition not found: {process_key}@{version:?}")]
    ProcessNotFound {
        process_key: String,
        version: Option<u32>,
    },

    #[error("process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("element not found in definition: {0}")]
    ElementNotFound(String),

    #[error("token {0} is not in a steppable state")]
    TokenNotSteppable(Uuid),

    #[error("expression evaluation failed: {0}")]
    ExpressionError(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("instance dispatch queue is full")]
    Busy,

    #[error("internal engine invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::ProcessNotFound { .. } => ErrorCode::ProcessNotFound,
            EngineError::InstanceNotFound(_) => ErrorCode::InstanceNotFound,
            EngineError::ElementNotFound(_) => ErrorCode::BpmnValidationError,
            EngineError::TokenNotSteppable(_) => ErrorCode::Conflict,
            EngineError::ExpressionError(_) => ErrorCode::ExpressionError,
            EngineError::Store(e) => e.code(),
            EngineError::Busy => ErrorCode::Busy,
            EngineError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Errors raised by the job manager (C7).
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found or expired: {0}")]
    NotFoundOrExpired(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::NotFoundOrExpired(_) => ErrorCode::JobNotFound,
            JobError::Store(e) => e.code(),
            JobError::Engine(e) => e.code(),
        }
    }
}

/// Errors raised by the timing wheel (C5).
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("timer not found: {0}")]
    NotFound(Uuid),

    #[error("invalid ISO-8601 duration: {0}")]
    InvalidDuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TimerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TimerError::NotFound(_) => ErrorCode::TimerNotFound,
            TimerError::InvalidDuration(_) => ErrorCode::InvalidDuration,
            TimerError::Store(e) => e.code(),
        }
    }
}

/// Errors raised by the auth gateway (C10).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid API key")]
    InvalidApiKey,

    #[error("client IP is not in the allow-list")]
    IpBlocked,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("API key lacks required permission: {0}")]
    InsufficientPermissions(String),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::InvalidApiKey => ErrorCode::Unauthorized,
            AuthError::IpBlocked => ErrorCode::Forbidden,
            AuthError::RateLimited => ErrorCode::RateLimited,
            AuthError::InsufficientPermissions(_) => ErrorCode::Forbidden,
        }
    }
}
