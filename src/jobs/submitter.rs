//! # Job Submitter
//!
//! Accepts an audio blob, uploads it through a write credential and gets the
//! managed job started, either explicitly or by the storage trigger.
//!
//! ## Ordering:
//! 1. Validate size and media type (no I/O)
//! 2. Request a write credential for `<prefix>/<id>.<ext>`
//! 3. Record the `IN_PROGRESS` row so polling can start immediately
//! 4. Upload
//! 5. Start the managed job (explicit mode only)
//!
//! Any failure after step 3 moves the row to `FAILED`; nothing is left
//! dangling in `IN_PROGRESS`.

use super::error::{JobError, JobResult};
use super::id::{compose_job_name, derive_from_key, new_job_id, new_name_suffix, NamingPattern};
use super::model::{JobPatch, JobSource, TranscriptionJob};
use crate::stores::{
    MetadataStore, ObjectStore, SpeakerLabelOptions, StartJobRequest, TranscriptionService, JOB_ID_TAG,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Upload ceiling accepted by the managed service.
pub const MAX_UPLOAD_BYTES: u64 = 200 * 1024 * 1024;

/// Declared types that carry no format information; the file extension decides.
const GENERIC_CONTENT_TYPES: &[&str] = &["", "application/octet-stream", "binary/octet-stream", "audio/*"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp3,
    Wav,
    M4a,
    Mp4,
}

impl MediaFormat {
    pub const SUPPORTED: &'static str = "mp3, wav, m4a, mp4";

    /// Format for a declared content type. `Ok(None)` means the type is too
    /// generic to decide; `Err` means it names an unsupported format.
    pub fn from_content_type(content_type: &str) -> Result<Option<Self>, JobError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if GENERIC_CONTENT_TYPES.contains(&essence.as_str()) {
            return Ok(None);
        }

        match essence.as_str() {
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg-3" => Ok(Some(MediaFormat::Mp3)),
            "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Ok(Some(MediaFormat::Wav)),
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Ok(Some(MediaFormat::M4a)),
            "video/mp4" => Ok(Some(MediaFormat::Mp4)),
            other => Err(JobError::Validation(format!(
                "unsupported media type '{}'; supported formats: {}",
                other,
                Self::SUPPORTED
            ))),
        }
    }

    pub fn from_filename(filename: &str) -> Result<Self, JobError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "mp3" => Ok(MediaFormat::Mp3),
            "wav" => Ok(MediaFormat::Wav),
            "m4a" => Ok(MediaFormat::M4a),
            "mp4" => Ok(MediaFormat::Mp4),
            "" => Err(JobError::Validation(format!(
                "cannot determine media type of '{}'; supported formats: {}",
                filename,
                Self::SUPPORTED
            ))),
            other => Err(JobError::Validation(format!(
                "unsupported file extension '.{}'; supported formats: {}",
                other,
                Self::SUPPORTED
            ))),
        }
    }

    /// Declared type first, file extension when the declared type is generic.
    pub fn detect(content_type: Option<&str>, filename: &str) -> Result<Self, JobError> {
        match content_type.map(Self::from_content_type).transpose()?.flatten() {
            Some(format) => Ok(format),
            None => Self::from_filename(filename),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "mp3",
            MediaFormat::Wav => "wav",
            MediaFormat::M4a => "m4a",
            MediaFormat::Mp4 => "mp4",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            MediaFormat::Mp3 => "audio/mpeg",
            MediaFormat::Wav => "audio/wav",
            MediaFormat::M4a => "audio/mp4",
            MediaFormat::Mp4 => "video/mp4",
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Who starts the managed job once the audio is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// The submitter calls `start_job` right after the upload
    Explicit,
    /// The storage trigger starts the job from the write notification
    StorageTrigger,
}

/// Recognition options passed on every start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    pub language_code: String,
    pub speaker_labels: SpeakerLabelOptions,
}

impl StartOptions {
    pub fn request(&self, job_id: &str, job_name: &str, media_location: String, format: MediaFormat) -> StartJobRequest {
        StartJobRequest {
            job_name: job_name.to_string(),
            media_location,
            media_format: format.extension().to_string(),
            language_code: self.language_code.clone(),
            speaker_labels: self.speaker_labels,
            tags: BTreeMap::from([(JOB_ID_TAG.to_string(), job_id.to_string())]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitterSettings {
    pub max_upload_bytes: u64,
    pub upload_prefix: String,
    pub start_mode: StartMode,
    pub start_options: StartOptions,
}

/// One upload as received from the client.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub audio: Vec<u8>,
    pub filename: String,
    pub content_type: Option<String>,
    pub source: JobSource,
}

pub struct JobSubmitter {
    objects: Arc<dyn ObjectStore>,
    service: Arc<dyn TranscriptionService>,
    metadata: Arc<dyn MetadataStore>,
    max_upload_bytes: u64,
    upload_prefix: String,
    start_mode: StartMode,
    start_options: RwLock<StartOptions>,
}

impl JobSubmitter {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        service: Arc<dyn TranscriptionService>,
        metadata: Arc<dyn MetadataStore>,
        settings: SubmitterSettings,
    ) -> Self {
        Self {
            objects,
            service,
            metadata,
            max_upload_bytes: settings.max_upload_bytes.min(MAX_UPLOAD_BYTES),
            upload_prefix: settings.upload_prefix.trim_matches('/').to_string(),
            start_mode: settings.start_mode,
            start_options: RwLock::new(settings.start_options),
        }
    }

    pub fn upload_prefix(&self) -> &str {
        &self.upload_prefix
    }

    pub fn start_mode(&self) -> StartMode {
        self.start_mode
    }

    pub fn start_options(&self) -> StartOptions {
        self.start_options.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_start_options(&self, options: StartOptions) {
        *self.start_options.write().unwrap_or_else(PoisonError::into_inner) = options;
    }

    /// Checks that need no I/O.
    pub fn validate(&self, request: &SubmitRequest) -> JobResult<MediaFormat> {
        if request.audio.is_empty() {
            return Err(JobError::Validation("audio is empty".to_string()));
        }
        let size = request.audio.len() as u64;
        if size > self.max_upload_bytes {
            return Err(JobError::Validation(format!(
                "audio is {} bytes; the limit is {} bytes",
                size, self.max_upload_bytes
            )));
        }
        MediaFormat::detect(request.content_type.as_deref(), &request.filename)
    }

    /// Upload and register one job. Returns the row as recorded.
    pub async fn submit(&self, request: SubmitRequest) -> JobResult<TranscriptionJob> {
        let format = self.validate(&request)?;

        let key = format!("{}/{}.{}", self.upload_prefix, new_job_id(), format.extension());
        let credential = self
            .objects
            .write_credential(&key, format.content_type(), self.max_upload_bytes)
            .await?;
        let job_id = derive_from_key(&key);

        let now = Utc::now();
        let job_name = match self.start_mode {
            StartMode::Explicit => Some(compose_job_name(
                NamingPattern::Explicit,
                &job_id,
                now.timestamp_millis(),
                Some(&new_name_suffix()),
            )),
            StartMode::StorageTrigger => None,
        };

        let job = TranscriptionJob::submitted(
            job_id.clone(),
            request.filename.clone(),
            request.source,
            key.clone(),
            job_name.clone(),
            now,
        );
        self.metadata.put_record(&job).await?;
        debug!(job_id = %job_id, key = %key, %format, "Job row recorded");

        if let Err(e) = self.objects.put(&credential.url, request.audio).await {
            let reason = format!("upload failed: {}", e);
            self.mark_failed(&job_id, &reason).await;
            return Err(JobError::from(e));
        }

        if let Some(job_name) = &job_name {
            self.start_managed(&job_id, job_name, &key, format).await?;
        }

        info!(
            job_id = %job_id,
            job_name = job_name.as_deref().unwrap_or("<pending trigger>"),
            file = %job.original_file_name,
            "Job submitted"
        );
        Ok(job)
    }

    /// Start the managed job for an uploaded object, tagging it with the
    /// canonical id. A failed start moves the row to `FAILED`.
    pub async fn start_managed(&self, job_id: &str, job_name: &str, key: &str, format: MediaFormat) -> JobResult<()> {
        let request = self
            .start_options()
            .request(job_id, job_name, self.objects.media_location(key), format);

        match self.service.start_job(request).await {
            Ok(handle) => {
                debug!(job_id, job_name = %handle.job_name, "Managed job started");
                Ok(())
            }
            Err(e) => {
                let reason = format!("job start failed: {}", e);
                self.mark_failed(job_id, &reason).await;
                Err(JobError::from(e))
            }
        }
    }

    async fn mark_failed(&self, job_id: &str, reason: &str) {
        warn!(job_id, reason, "Marking job as failed");
        if let Err(e) = self.metadata.update_fields(job_id, &JobPatch::failed(reason)).await {
            warn!(job_id, error = %e, "Could not record job failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobStatus;
    use crate::jobs::testing::Harness;

    fn wav(size: usize) -> SubmitRequest {
        SubmitRequest {
            audio: vec![7; size],
            filename: "clip.wav".to_string(),
            content_type: Some("audio/wav".to_string()),
            source: JobSource::File,
        }
    }

    #[test]
    fn test_media_detection() {
        assert_eq!(MediaFormat::detect(Some("audio/mpeg"), "x.bin").unwrap(), MediaFormat::Mp3);
        assert_eq!(
            MediaFormat::detect(Some("audio/wav; codecs=1"), "x").unwrap(),
            MediaFormat::Wav
        );
        assert_eq!(
            MediaFormat::detect(Some("application/octet-stream"), "talk.M4A").unwrap(),
            MediaFormat::M4a
        );
        assert_eq!(MediaFormat::detect(None, "talk.mp4").unwrap(), MediaFormat::Mp4);
        assert!(MediaFormat::detect(Some("audio/ogg"), "clip.mp3").is_err());
        assert!(MediaFormat::detect(Some("audio/webm;codecs=opus"), "rec.webm").is_err());
        assert!(MediaFormat::detect(None, "clip.ogg").is_err());
        assert!(MediaFormat::detect(None, "noext").is_err());
    }

    #[tokio::test]
    async fn test_submit_wav_records_in_progress_row() {
        let harness = Harness::new();
        let submitter = harness.submitter(StartMode::Explicit);

        let job = submitter.submit(wav(10 * 1024 * 1024)).await.unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.original_file_name, "clip.wav");

        let key = job.audio_object_key.clone().unwrap();
        assert_eq!(key, format!("uploads/{}.wav", job.id));
        assert!(harness.objects.contains(&key).await);

        let stored = harness.metadata.get_record(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);

        let job_name = stored.job_name.unwrap();
        assert!(job_name.starts_with(&format!("transcribe-{}-", job.id)));
        let started = harness.simulator.job(&job_name).await.unwrap();
        assert_eq!(started.tags.get(JOB_ID_TAG), Some(&job.id));
        assert_eq!(started.media_format, "wav");
    }

    #[tokio::test]
    async fn test_unsupported_type_rejected_before_any_write() {
        let harness = Harness::new();
        let submitter = harness.submitter(StartMode::Explicit);

        let mut request = wav(128);
        request.content_type = Some("audio/ogg".to_string());
        request.filename = "clip.ogg".to_string();

        let err = submitter.submit(request).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert_eq!(harness.objects.len().await, 0);
        assert!(harness.metadata.query_by_status(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_and_empty_rejected() {
        let harness = Harness::new();
        let mut settings = harness.settings(StartMode::Explicit);
        settings.max_upload_bytes = 16;
        let submitter = harness.submitter_with(settings);

        assert!(matches!(submitter.submit(wav(17)).await, Err(JobError::Validation(_))));
        assert!(matches!(submitter.submit(wav(0)).await, Err(JobError::Validation(_))));
        assert!(submitter.submit(wav(16)).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_rejection_marks_row_failed() {
        let harness = Harness::new();
        let submitter = harness.submitter(StartMode::Explicit);
        harness.simulator.reject_next_start("unsupported sample rate").await;

        let err = submitter.submit(wav(64)).await.unwrap_err();
        assert!(matches!(err, JobError::JobStart(ref r) if r == "unsupported sample rate"));

        let failed = harness
            .metadata
            .query_by_status(Some(JobStatus::Failed), 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("unsupported sample rate"));
        assert!(harness.metadata.scan_in_progress().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_trigger_mode_leaves_start_to_trigger() {
        let harness = Harness::new();
        let submitter = harness.submitter(StartMode::StorageTrigger);

        let job = submitter.submit(wav(64)).await.unwrap();
        assert!(job.job_name.is_none());
        assert!(harness.simulator.jobs().await.is_empty());
    }

    #[test]
    fn test_start_options_are_live() {
        let harness = Harness::new();
        let submitter = harness.submitter(StartMode::Explicit);
        let mut options = submitter.start_options();
        options.language_code = "de-DE".to_string();
        submitter.set_start_options(options);

        let request = submitter
            .start_options()
            .request("abc", "transcribe-abc-1", "memory://x".into(), MediaFormat::Wav);
        assert_eq!(request.language_code, "de-DE");
        assert_eq!(request.tags.get(JOB_ID_TAG).map(String::as_str), Some("abc"));
    }
}
