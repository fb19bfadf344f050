//! Failure taxonomy for the job lifecycle.
//!
//! Each variant tells the caller what to do next: fix the input, retry,
//! wait, or look at history later.

use crate::stores::{ServiceError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// Bad input, rejected before any I/O
    #[error("{0}")]
    Validation(String),

    /// A single network or store step failed; the caller's loop may retry
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// The managed service refused to create the job
    #[error("managed service rejected the job: {0}")]
    JobStart(String),

    /// The managed service reported the job as failed
    #[error("job {job_id} failed: {reason}")]
    JobFailure { job_id: String, reason: String },

    /// Poll budget exhausted; the job may still finish in the background
    #[error("job {job_id} still in progress after {attempts} attempts")]
    Timeout { job_id: String, attempts: u32 },

    #[error("job {0} not found")]
    NotFound(String),

    /// The caller abandoned polling
    #[error("polling for job {0} was abandoned")]
    Cancelled(String),
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TooLarge { .. } => JobError::Validation(err.to_string()),
            other => JobError::TransientIo(other.to_string()),
        }
    }
}

impl From<ServiceError> for JobError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Rejected(reason) => JobError::JobStart(reason),
            other => JobError::TransientIo(other.to_string()),
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;
