//! # Error Handling
//!
//! This module defines the HTTP-facing error type and how it is converted to
//! JSON responses. Domain failures come in as [`JobError`] and are mapped onto
//! status codes that tell the client what to do next.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Data**: Variants carry the message (and for jobs, the job id)
//! - **Pattern matching**: `match` picks the status code per variant
//!
//! ### Traits for Error Conversion
//! - **From trait**: `?` converts domain, JSON and config errors automatically
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! ## Status codes for job failures:
//! | Failure              | Status | `type`               |
//! |----------------------|--------|----------------------|
//! | validation           | 400    | `validation_error`   |
//! | not found            | 404    | `not_found`          |
//! | polling abandoned    | 409    | `cancelled`          |
//! | job failed           | 422    | `job_failure`        |
//! | job start rejected   | 502    | `job_start_error`    |
//! | transient I/O        | 503    | `transient_io_error` |
//! | poll budget exceeded | 202    | `timeout`            |
//!
//! A timeout is not a failure of the job itself: it may still finish in the
//! background, so it is reported as 202 Accepted.

use crate::jobs::JobError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal** / **ConfigError**: server-side problems (500)
/// - **BadRequest** / **ValidationError**: the client sent something unusable (400)
/// - **NotFound**: requested job or route target does not exist (404)
/// - The remaining variants mirror [`JobError`] one to one
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (startup failures, poisoned state, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// A store or service call failed; retrying later may succeed
    TransientIo(String),

    /// The managed transcription service refused to start the job
    JobStart(String),

    /// The managed service reported the job as failed
    JobFailure { job_id: String, reason: String },

    /// Polling stopped before the job reached a terminal state
    Timeout { job_id: String, attempts: u32 },

    /// The client abandoned the wait
    Cancelled(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::TransientIo(msg) => write!(f, "Temporarily unavailable: {}", msg),
            AppError::JobStart(msg) => write!(f, "Job start rejected: {}", msg),
            AppError::JobFailure { job_id, reason } => write!(f, "Job {} failed: {}", job_id, reason),
            AppError::Timeout { job_id, attempts } => write!(
                f,
                "Job {} still in progress after {} attempts",
                job_id, attempts
            ),
            AppError::Cancelled(job_id) => write!(f, "Waiting for job {} was abandoned", job_id),
        }
    }
}

impl AppError {
    /// Status code and machine-readable type for this error.
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::TransientIo(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient_io_error"),
            AppError::JobStart(_) => (StatusCode::BAD_GATEWAY, "job_start_error"),
            AppError::JobFailure { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "job_failure"),
            AppError::Timeout { .. } => (StatusCode::ACCEPTED, "timeout"),
            AppError::Cancelled(_) => (StatusCode::CONFLICT, "cancelled"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::TransientIo(msg)
            | AppError::JobStart(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Converts errors into JSON responses with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "job_failure",
///     "message": "Job 6f1c... failed: unsupported codec",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
///
/// Job-scoped errors additionally carry `job_id` so clients can resume
/// polling or look the job up in history.
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = self.classify();

        let mut error = json!({
            "type": error_type,
            "message": self.message(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        match self {
            AppError::JobFailure { job_id, .. } | AppError::Cancelled(job_id) => {
                error["job_id"] = json!(job_id);
            }
            AppError::Timeout { job_id, attempts } => {
                error["job_id"] = json!(job_id);
                error["attempts"] = json!(attempts);
            }
            _ => {}
        }

        HttpResponse::build(status).json(json!({ "error": error }))
    }
}

/// Domain failures keep their meaning all the way to the client.
impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(msg) => AppError::ValidationError(msg),
            JobError::TransientIo(msg) => AppError::TransientIo(msg),
            JobError::JobStart(msg) => AppError::JobStart(msg),
            JobError::JobFailure { job_id, reason } => AppError::JobFailure { job_id, reason },
            JobError::Timeout { job_id, attempts } => AppError::Timeout { job_id, attempts },
            JobError::NotFound(id) => AppError::NotFound(format!("Job {} not found", id)),
            JobError::Cancelled(id) => AppError::Cancelled(id),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they become 400s.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
