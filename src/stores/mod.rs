//! # External Collaborators
//!
//! The job engine talks to three independently-consistent systems:
//! - **Object store**: input audio and transcript artifacts
//! - **Managed transcription service**: runs jobs out-of-process
//! - **Metadata store**: the job rows clients query
//!
//! Each one is an async trait so the engine can run against the in-memory,
//! filesystem, SQLite or simulated implementations in this module.

pub mod credentials;
pub mod filesystem;
pub mod memory;
pub mod simulated;
pub mod sqlite;

use crate::config::{AppConfig, MetadataBackend, StorageBackend};
use crate::jobs::model::{JobPatch, JobStatus, TranscriptionJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

pub use credentials::CredentialLedger;
pub use filesystem::FsObjectStore;
pub use memory::{MemoryMetadataStore, MemoryObjectStore};
pub use simulated::SimulatedTranscriptionService;
pub use sqlite::SqliteMetadataStore;

/// Tag carrying the canonical job id on managed-service jobs.
pub const JOB_ID_TAG: &str = "job_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("write credential rejected: {0}")]
    CredentialRejected(String),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Rejected(String),

    #[error("managed job not found: {0}")]
    NotFound(String),

    #[error("managed service unavailable: {0}")]
    Unavailable(String),
}

/// Time-limited permission to write one object.
#[derive(Debug, Clone, Serialize)]
pub struct WriteCredential {
    pub key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub content_type: String,
    pub max_bytes: u64,
}

/// Write notification published after every successful `put`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectWritten {
    pub key: String,
    pub content_type: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn write_credential(
        &self,
        key: &str,
        content_type: &str,
        max_bytes: u64,
    ) -> Result<WriteCredential, StoreError>;

    /// Upload through a credential URL. Credentials are single use.
    async fn put(&self, url: &str, body: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Location string handed to the managed service for `key`.
    fn media_location(&self, key: &str) -> String;

    fn subscribe(&self) -> broadcast::Receiver<ObjectWritten>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpeakerLabelOptions {
    pub enabled: bool,
    pub max_speakers: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartJobRequest {
    pub job_name: String,
    pub media_location: String,
    pub media_format: String,
    pub language_code: String,
    pub speaker_labels: SpeakerLabelOptions,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceJobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

/// Managed-service view of one job (`getJob`).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceJob {
    pub job_name: String,
    pub status: ServiceJobStatus,
    pub result_location: Option<String>,
    pub failure_reason: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Entry of `listCompletedJobs`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJobSummary {
    pub job_name: String,
    pub result_location: String,
    pub completed_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn start_job(&self, request: StartJobRequest) -> Result<JobHandle, ServiceError>;

    async fn get_job(&self, job_name: &str) -> Result<ServiceJob, ServiceError>;

    /// Most recently completed first, at most `page_size` entries.
    async fn list_completed_jobs(&self, page_size: usize) -> Result<Vec<CompletedJobSummary>, ServiceError>;
}

/// Result of `updateFields`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Missing,
    Unchanged(TranscriptionJob),
    Updated(TranscriptionJob),
}

impl UpdateOutcome {
    pub fn into_job(self) -> Option<TranscriptionJob> {
        match self {
            UpdateOutcome::Missing => None,
            UpdateOutcome::Unchanged(job) | UpdateOutcome::Updated(job) => Some(job),
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the row keyed by `job.id`.
    async fn put_record(&self, job: &TranscriptionJob) -> Result<(), StoreError>;

    async fn get_record(&self, id: &str) -> Result<Option<TranscriptionJob>, StoreError>;

    /// Merge `patch` into the row through [`TranscriptionJob::apply`].
    async fn update_fields(&self, id: &str, patch: &JobPatch) -> Result<UpdateOutcome, StoreError>;

    /// Hard delete. Returns whether a row existed.
    async fn delete_record(&self, id: &str) -> Result<bool, StoreError>;

    /// Newest first. `None` lists every status.
    async fn query_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<TranscriptionJob>, StoreError>;

    async fn scan_in_progress(&self) -> Result<Vec<TranscriptionJob>, StoreError>;
}

/// The three collaborators wired together for one process.
#[derive(Clone)]
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    pub service: Arc<dyn TranscriptionService>,
    pub metadata: Arc<dyn MetadataStore>,
    /// Handle for driving the simulated service (debug endpoints)
    pub simulator: Option<Arc<SimulatedTranscriptionService>>,
}

impl Backends {
    /// Build the configured backends. The managed service is always the
    /// in-process simulation; real providers plug in behind the same trait.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let ttl = Duration::from_secs(config.storage.credential_ttl_seconds);
        let objects: Arc<dyn ObjectStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryObjectStore::new(ttl)),
            StorageBackend::Filesystem => Arc::new(FsObjectStore::open(&config.storage.root, ttl).await?),
        };

        let metadata: Arc<dyn MetadataStore> = match config.metadata.backend {
            MetadataBackend::Memory => Arc::new(MemoryMetadataStore::new()),
            MetadataBackend::Sqlite => Arc::new(
                SqliteMetadataStore::connect(&config.metadata.database_url, config.metadata.max_connections).await?,
            ),
        };

        let simulator = Arc::new(SimulatedTranscriptionService::new(objects.clone()));
        info!(
            storage = ?config.storage.backend,
            metadata = ?config.metadata.backend,
            "Job backends ready"
        );

        Ok(Self {
            objects,
            service: simulator.clone(),
            metadata,
            simulator: Some(simulator),
        })
    }

    /// Everything in memory; used by tests.
    pub fn in_memory() -> Self {
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new(Duration::from_secs(900)));
        let simulator = Arc::new(SimulatedTranscriptionService::new(objects.clone()));
        Self {
            objects,
            service: simulator.clone(),
            metadata: Arc::new(MemoryMetadataStore::new()),
            simulator: Some(simulator),
        }
    }
}
