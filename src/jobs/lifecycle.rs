//! Terminal transitions for job rows.
//!
//! The completion callback, the explicit status fetch and the sweep all end up
//! here, so a row reaches `COMPLETED` or `FAILED` through exactly one code path
//! regardless of which observer saw the managed job finish first.

use super::error::{JobError, JobResult};
use super::id;
use super::model::{JobPatch, JobStatus, TranscriptionJob};
use super::transcript::TranscriptArtifact;
use crate::stores::{
    MetadataStore, ObjectStore, ServiceJob, ServiceJobStatus, TranscriptionService, UpdateOutcome, JOB_ID_TAG,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const EMPTY_TRANSCRIPT: &str = "empty transcript";

pub struct JobLifecycle {
    objects: Arc<dyn ObjectStore>,
    service: Arc<dyn TranscriptionService>,
    metadata: Arc<dyn MetadataStore>,
}

impl JobLifecycle {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        service: Arc<dyn TranscriptionService>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            objects,
            service,
            metadata,
        }
    }

    /// Read the transcript artifact at `result_location` and upsert the row
    /// to `COMPLETED`. Safe to repeat: identical data reports `Unchanged`.
    pub async fn complete(&self, id: &str, job_name: &str, result_location: &str) -> JobResult<UpdateOutcome> {
        let bytes = self.objects.get(result_location).await?;
        let artifact = TranscriptArtifact::from_slice(&bytes).map_err(|e| {
            JobError::TransientIo(format!("unreadable transcript artifact '{}': {}", result_location, e))
        })?;
        let summary = artifact.summarize();

        let mut patch = if summary.text.is_empty() {
            JobPatch::failed(EMPTY_TRANSCRIPT)
        } else {
            JobPatch::completed(summary.text, summary.confidence, summary.duration_seconds)
        };
        patch.job_name = Some(job_name.to_string());

        let outcome = self.metadata.update_fields(id, &patch).await?;
        if let UpdateOutcome::Updated(job) = &outcome {
            info!(
                job_id = %job.id,
                job_name,
                status = %job.status,
                confidence = job.confidence.unwrap_or_default(),
                "Job reached terminal state"
            );
        }
        Ok(outcome)
    }

    pub async fn fail(&self, id: &str, job_name: Option<&str>, reason: &str) -> JobResult<UpdateOutcome> {
        let mut patch = JobPatch::failed(reason);
        patch.job_name = job_name.map(str::to_string);

        let outcome = self.metadata.update_fields(id, &patch).await?;
        if outcome.changed() {
            info!(job_id = id, reason, "Job failed");
        }
        Ok(outcome)
    }

    /// Current row, asking the managed service when the row is still in
    /// progress. Service errors fall back to the stored row.
    pub async fn refresh_status(&self, id: &str) -> JobResult<TranscriptionJob> {
        let job = self
            .metadata
            .get_record(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if job.is_terminal() {
            return Ok(job);
        }
        let Some(job_name) = job.job_name.clone() else {
            return Ok(job);
        };

        let service_job = match self.service.get_job(&job_name).await {
            Ok(service_job) => service_job,
            Err(e) => {
                warn!(job_id = id, job_name = %job_name, error = %e, "Status fetch from managed service failed");
                return Ok(job);
            }
        };

        match self.apply_service_state(id, &service_job).await {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => Ok(job),
            Err(e) => {
                warn!(job_id = id, job_name = %job_name, error = %e, "Could not apply managed job state");
                Ok(job)
            }
        }
    }

    /// Completion callback from the managed service. The service is asked
    /// for the authoritative state; jobs with no matching row are left for
    /// the sweep to adopt.
    pub async fn on_service_notification(
        &self,
        job_name: &str,
        reported: ServiceJobStatus,
    ) -> JobResult<Option<TranscriptionJob>> {
        if !matches!(reported, ServiceJobStatus::Completed | ServiceJobStatus::Failed) {
            debug!(job_name, ?reported, "Ignoring non-terminal notification");
            return Ok(None);
        }

        let service_job = self.service.get_job(job_name).await?;
        let Some(id) = self.locate(job_name, service_job.tags.get(JOB_ID_TAG).map(String::as_str)).await? else {
            debug!(job_name, "Notification for unknown job; leaving it to the sweep");
            return Ok(None);
        };

        self.apply_service_state(&id, &service_job).await
    }

    /// Id of the row for `job_name`: the tagged or derived id when that row
    /// exists, otherwise an in-progress row carrying the literal job name.
    pub async fn locate(&self, job_name: &str, tagged_id: Option<&str>) -> JobResult<Option<String>> {
        let candidate = tagged_id.map(str::to_string).unwrap_or_else(|| id::derive(job_name));
        if self.metadata.get_record(&candidate).await?.is_some() {
            return Ok(Some(candidate));
        }

        let in_progress = self.metadata.scan_in_progress().await?;
        Ok(in_progress
            .into_iter()
            .find(|job| job.job_name.as_deref() == Some(job_name))
            .map(|job| job.id))
    }

    async fn apply_service_state(&self, id: &str, service_job: &ServiceJob) -> JobResult<Option<TranscriptionJob>> {
        let outcome = match (service_job.status, service_job.result_location.as_deref()) {
            (ServiceJobStatus::Completed, Some(location)) => {
                self.complete(id, &service_job.job_name, location).await?
            }
            (ServiceJobStatus::Failed, _) => {
                let reason = service_job.failure_reason.as_deref().unwrap_or("managed service reported failure");
                self.fail(id, Some(&service_job.job_name), reason).await?
            }
            _ => return Ok(self.metadata.get_record(id).await?),
        };
        Ok(outcome.into_job())
    }

    pub async fn delete(&self, id: &str) -> JobResult<()> {
        if self.metadata.delete_record(id).await? {
            info!(job_id = id, "Job deleted");
            Ok(())
        } else {
            Err(JobError::NotFound(id.to_string()))
        }
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> JobResult<Vec<TranscriptionJob>> {
        Ok(self.metadata.query_by_status(status, limit).await?)
    }
}
