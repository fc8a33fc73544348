//! Application error taxonomy. `AppError` is the single error type crossing
//! component boundaries; the Control API maps it onto HTTP status codes via
//! [`AppError::status_code`] without re-deriving the mapping per handler.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Numeric HTTP status the Control API should respond with.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::Conflict(_) => 409,
            AppError::NotFound(_) => 404,
            AppError::Persistence(_) | AppError::Bus(_) | AppError::Internal(_) => 500,
        }
    }
}

/// Classification of HTTP-level outcomes observed by the agent worker pool,
/// used only for structured logging/metrics labels, never to alter recording
/// semantics (every non-2xx/3xx response still counts toward `errors`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ClientError,
    ServerError,
    NetworkError,
    TimeoutError,
    OtherError,
}

impl ErrorCategory {
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }
}
