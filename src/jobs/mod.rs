//! # Job Lifecycle and Reconciliation Engine
//!
//! Submission, status derivation, progressive polling and the self-healing
//! sweep that repairs rows left stale by missed completion signals.
//!
//! ## Components (leaves first):
//! - [`id`]: job name ↔ canonical id derivation
//! - [`submitter`]: validation, upload and job start
//! - [`lifecycle`]: the single seam for terminal transitions
//! - [`poller`]: typed backoff schedule with cancellation
//! - [`sweep`]: bulk repair against the managed service
//! - [`history`]: server/local merge for presentation
//! - [`session`]: per-client rate limits and wait tokens
//! - [`trigger`]: storage-write-driven job start
//! - [`engine`]: facade used by the HTTP layer

pub mod engine;
pub mod error;
pub mod history;
pub mod id;
pub mod lifecycle;
pub mod model;
pub mod poller;
pub mod session;
pub mod submitter;
pub mod sweep;
pub mod transcript;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineSettings, JobEngine, SweepStats};
pub use error::{JobError, JobResult};
pub use model::{JobPatch, JobSource, JobStatus, TranscriptionJob};
