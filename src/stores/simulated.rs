//! In-process stand-in for the managed transcription service.
//!
//! Jobs are recorded when started and stay `IN_PROGRESS` until driven to a
//! terminal state with [`SimulatedTranscriptionService::complete_job`] or
//! [`SimulatedTranscriptionService::fail_job`]. Completion writes the transcript
//! artifact into the object store the same way the real service would.

use super::{
    CompletedJobSummary, JobHandle, ObjectStore, ServiceError, ServiceJob, ServiceJobStatus, StartJobRequest,
    TranscriptionService,
};
use crate::jobs::transcript::TranscriptArtifact;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Object key prefix for transcript artifacts.
pub const TRANSCRIPT_PREFIX: &str = "transcripts";

#[derive(Debug, Clone, Serialize)]
pub struct SimulatedJob {
    pub job_name: String,
    pub media_location: String,
    pub media_format: String,
    pub language_code: String,
    pub status: ServiceJobStatus,
    pub result_location: Option<String>,
    pub failure_reason: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    sequence: u64,
}

#[derive(Default)]
struct SimulatorState {
    jobs: HashMap<String, SimulatedJob>,
    reject_next_start: Option<String>,
    unavailable: bool,
    sequence: u64,
}

pub struct SimulatedTranscriptionService {
    objects: Arc<dyn ObjectStore>,
    state: RwLock<SimulatorState>,
}

impl SimulatedTranscriptionService {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            state: RwLock::new(SimulatorState::default()),
        }
    }

    /// Make the next `start_job` call fail with `reason`.
    pub async fn reject_next_start(&self, reason: impl Into<String>) {
        self.state.write().await.reject_next_start = Some(reason.into());
    }

    /// Toggle a simulated outage: every call fails with `Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    pub async fn job(&self, job_name: &str) -> Option<SimulatedJob> {
        self.state.read().await.jobs.get(job_name).cloned()
    }

    pub async fn jobs(&self) -> Vec<SimulatedJob> {
        let mut jobs: Vec<SimulatedJob> = self.state.read().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.job_name.cmp(&b.job_name)));
        jobs
    }

    /// Write `artifact` to the object store and mark the job completed.
    pub async fn complete_job(&self, job_name: &str, artifact: &TranscriptArtifact) -> Result<String, ServiceError> {
        self.ensure_exists(job_name).await?;

        let key = format!("{}/{}.json", TRANSCRIPT_PREFIX, job_name);
        let body = serde_json::to_vec(artifact).map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        let credential = self
            .objects
            .write_credential(&key, "application/json", body.len() as u64)
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        self.objects
            .put(&credential.url, body)
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        let mut state = self.state.write().await;
        state.sequence += 1;
        let sequence = state.sequence;
        let job = state
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| ServiceError::NotFound(job_name.to_string()))?;
        job.status = ServiceJobStatus::Completed;
        job.result_location = Some(key.clone());
        job.failure_reason = None;
        job.completed_at = Some(Utc::now());
        job.sequence = sequence;

        info!(job_name, result_location = %key, "Simulated job completed");
        Ok(key)
    }

    pub async fn fail_job(&self, job_name: &str, reason: impl Into<String>) -> Result<(), ServiceError> {
        let reason = reason.into();
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| ServiceError::NotFound(job_name.to_string()))?;
        job.status = ServiceJobStatus::Failed;
        job.failure_reason = Some(reason.clone());
        job.result_location = None;
        job.completed_at = Some(Utc::now());

        info!(job_name, reason = %reason, "Simulated job failed");
        Ok(())
    }

    async fn ensure_exists(&self, job_name: &str) -> Result<(), ServiceError> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(ServiceError::Unavailable("simulated outage".to_string()));
        }
        if !state.jobs.contains_key(job_name) {
            return Err(ServiceError::NotFound(job_name.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptionService for SimulatedTranscriptionService {
    async fn start_job(&self, request: StartJobRequest) -> Result<JobHandle, ServiceError> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(ServiceError::Unavailable("simulated outage".to_string()));
        }
        if let Some(reason) = state.reject_next_start.take() {
            return Err(ServiceError::Rejected(reason));
        }
        if request.job_name.trim().is_empty() {
            return Err(ServiceError::Rejected("job name must not be empty".to_string()));
        }
        if state.jobs.contains_key(&request.job_name) {
            return Err(ServiceError::Rejected(format!(
                "job name '{}' already exists",
                request.job_name
            )));
        }
        if request.language_code.trim().is_empty() {
            return Err(ServiceError::Rejected("language code is required".to_string()));
        }
        if request.speaker_labels.enabled && request.speaker_labels.max_speakers < 2 {
            return Err(ServiceError::Rejected(
                "speaker labels need at least 2 speakers".to_string(),
            ));
        }

        let started_at = Utc::now();
        debug!(job_name = %request.job_name, media = %request.media_location, "Simulated job started");
        state.jobs.insert(
            request.job_name.clone(),
            SimulatedJob {
                job_name: request.job_name.clone(),
                media_location: request.media_location,
                media_format: request.media_format,
                language_code: request.language_code,
                status: ServiceJobStatus::InProgress,
                result_location: None,
                failure_reason: None,
                tags: request.tags,
                started_at,
                completed_at: None,
                sequence: 0,
            },
        );

        Ok(JobHandle {
            job_name: request.job_name,
            started_at,
        })
    }

    async fn get_job(&self, job_name: &str) -> Result<ServiceJob, ServiceError> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(ServiceError::Unavailable("simulated outage".to_string()));
        }
        let job = state
            .jobs
            .get(job_name)
            .ok_or_else(|| ServiceError::NotFound(job_name.to_string()))?;

        Ok(ServiceJob {
            job_name: job.job_name.clone(),
            status: job.status,
            result_location: job.result_location.clone(),
            failure_reason: job.failure_reason.clone(),
            tags: job.tags.clone(),
        })
    }

    async fn list_completed_jobs(&self, page_size: usize) -> Result<Vec<CompletedJobSummary>, ServiceError> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(ServiceError::Unavailable("simulated outage".to_string()));
        }

        let mut completed: Vec<&SimulatedJob> = state
            .jobs
            .values()
            .filter(|job| job.status == ServiceJobStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        Ok(completed
            .into_iter()
            .take(page_size)
            .filter_map(|job| {
                Some(CompletedJobSummary {
                    job_name: job.job_name.clone(),
                    result_location: job.result_location.clone()?,
                    completed_at: job.completed_at?,
                    tags: job.tags.clone(),
                })
            })
            .collect())
    }
}
