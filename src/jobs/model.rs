//! # Transcription Job Model
//!
//! The `TranscriptionJob` row is the record clients query. It is created by the
//! submitter in `IN_PROGRESS` and moved to a terminal state by whichever of the
//! completion callback, the explicit status fetch, or the reconciliation sweep
//! sees the managed service finish first.
//!
//! ## State Transitions:
//! IN_PROGRESS → COMPLETED | FAILED
//!
//! A terminal row never returns to IN_PROGRESS. All writers go through
//! [`TranscriptionJob::apply`], so the memory and SQLite stores share the same
//! merge rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a job as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Where the audio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Microphone,
    File,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Microphone => "microphone",
            JobSource::File => "file",
        }
    }
}

impl FromStr for JobSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "microphone" | "mic" | "recording" => Ok(JobSource::Microphone),
            "file" | "upload" => Ok(JobSource::File),
            other => Err(format!("unknown job source '{}'", other)),
        }
    }
}

/// One audio-to-text request tracked end-to-end by its canonical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionJob {
    /// Canonical identifier, immutable after creation
    pub id: String,

    /// Name known to the managed service (unknown until the job is started)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    pub original_file_name: String,
    pub source: JobSource,
    pub status: JobStatus,

    /// Present only once COMPLETED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Mean per-token confidence in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_object_key: Option<String>,

    /// Present only when FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Row synthesized by the sweep for a completed job with no submission
    /// record. File name and source are guesses.
    #[serde(default)]
    pub orphaned: bool,
}

impl TranscriptionJob {
    /// Row written by the submitter before the managed job necessarily exists.
    pub fn submitted(
        id: impl Into<String>,
        original_file_name: impl Into<String>,
        source: JobSource,
        audio_object_key: impl Into<String>,
        job_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            job_name,
            original_file_name: original_file_name.into(),
            source,
            status: JobStatus::InProgress,
            text: None,
            confidence: None,
            duration_seconds: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            audio_object_key: Some(audio_object_key.into()),
            error: None,
            orphaned: false,
        }
    }

    /// Best-effort row for a completed managed job whose submission record
    /// was lost. Everything except `id` and `job_name` is inferred.
    pub fn orphan(id: impl Into<String>, job_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            original_file_name: format!("{}.audio", id),
            id,
            job_name: Some(job_name.into()),
            source: JobSource::File,
            status: JobStatus::InProgress,
            text: None,
            confidence: None,
            duration_seconds: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            audio_object_key: None,
            error: None,
            orphaned: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge a partial update into this row.
    ///
    /// ## Rules:
    /// - IN_PROGRESS is never written over a terminal status
    /// - COMPLETED requires non-empty text, otherwise the status part is ignored
    /// - terminal over terminal is last-writer-wins, clearing the fields of the
    ///   previous outcome so `text` stays present iff COMPLETED
    /// - `completed_at` moves only when terminal data actually changes
    ///
    /// Returns `false` (and leaves `updated_at` alone) when nothing changed,
    /// which is what makes repeated sweeps a no-op.
    pub fn apply(&mut self, patch: &JobPatch, now: DateTime<Utc>) -> bool {
        let mut next = self.clone();

        if let Some(name) = &patch.job_name {
            next.job_name = Some(name.clone());
        }

        match patch.status {
            None | Some(JobStatus::InProgress) => {}
            Some(JobStatus::Completed) => {
                if let Some(text) = patch.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                    next.status = JobStatus::Completed;
                    next.text = Some(text.to_string());
                    next.confidence = patch.confidence.map(|c| c.clamp(0.0, 1.0));
                    next.duration_seconds = patch.duration_seconds.map(|d| d.max(0.0));
                    next.error = None;
                }
            }
            Some(JobStatus::Failed) => {
                next.status = JobStatus::Failed;
                next.text = None;
                next.confidence = None;
                next.duration_seconds = None;
                next.error = Some(
                    patch
                        .error
                        .clone()
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "unknown failure".to_string()),
                );
            }
        }

        if next == *self {
            return false;
        }

        let terminal_changed = next.status != self.status
            || next.text != self.text
            || next.confidence != self.confidence
            || next.duration_seconds != self.duration_seconds
            || next.error != self.error;
        if next.status.is_terminal() && terminal_changed {
            next.completed_at = Some(patch.completed_at.unwrap_or(now));
        }

        next.updated_at = now;
        *self = next;
        true
    }
}

/// Partial update for a job row (`updateFields`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub job_name: Option<String>,
    pub status: Option<JobStatus>,
    pub text: Option<String>,
    pub confidence: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn job_name(name: impl Into<String>) -> Self {
        Self {
            job_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn completed(text: impl Into<String>, confidence: f64, duration_seconds: f64) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            text: Some(text.into()),
            confidence: Some(confidence),
            duration_seconds: Some(duration_seconds),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fresh() -> TranscriptionJob {
        TranscriptionJob::submitted(
            "abc",
            "clip.wav",
            JobSource::File,
            "uploads/abc.wav",
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("in_progress".parse::<JobStatus>(), Ok(JobStatus::InProgress));
        assert_eq!("COMPLETED".parse::<JobStatus>(), Ok(JobStatus::Completed));
        assert!("done".parse::<JobStatus>().is_err());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_serializes_with_wire_names() {
        let json = serde_json::to_value(fresh()).unwrap();
        assert_eq!(json["status"], "IN_PROGRESS");
        assert_eq!(json["source"], "file");
        assert_eq!(json["originalFileName"], "clip.wav");
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_completion_sets_terminal_fields() {
        let mut job = fresh();
        let now = job.created_at + Duration::seconds(30);
        assert!(job.apply(&JobPatch::completed("hello world", 0.925, 1.2), now));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.text.as_deref(), Some("hello world"));
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.updated_at, now);
    }

    #[test]
    fn test_reapplying_same_completion_is_noop() {
        let mut job = fresh();
        let first = job.created_at + Duration::seconds(10);
        job.apply(&JobPatch::completed("hello", 0.9, 1.0), first);
        let snapshot = job.clone();

        let later = first + Duration::seconds(60);
        assert!(!job.apply(&JobPatch::completed("hello", 0.9, 1.0), later));
        assert_eq!(job, snapshot);
    }

    #[test]
    fn test_terminal_status_never_reverts() {
        let mut job = fresh();
        job.apply(&JobPatch::failed("boom"), Utc::now());
        let patch = JobPatch {
            status: Some(JobStatus::InProgress),
            ..JobPatch::default()
        };
        assert!(!job.apply(&patch, Utc::now()));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_completion_without_text_is_ignored() {
        let mut job = fresh();
        assert!(!job.apply(&JobPatch::completed("   ", 0.5, 1.0), Utc::now()));
        assert_eq!(job.status, JobStatus::InProgress);
    }

    #[test]
    fn test_job_name_update_keeps_status() {
        let mut job = fresh();
        assert!(job.apply(&JobPatch::job_name("auto-abc-1700000000000"), Utc::now()));
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.completed_at.is_none());
    }

    /// Walks every combination of starting status and patch shape and checks
    /// that text is present exactly when the row is COMPLETED.
    #[test]
    fn test_text_present_iff_completed_for_all_combinations() {
        let statuses = [None, Some(JobStatus::InProgress), Some(JobStatus::Completed), Some(JobStatus::Failed)];
        let texts = [None, Some(""), Some("  "), Some("words")];
        let errors = [None, Some("reason")];
        let starts = [
            JobPatch::default(),
            JobPatch::completed("earlier text", 0.8, 2.0),
            JobPatch::failed("earlier failure"),
        ];

        for start in &starts {
            for status in statuses {
                for text in texts {
                    for error in errors {
                        let mut job = fresh();
                        job.apply(start, Utc::now());
                        let patch = JobPatch {
                            job_name: None,
                            status,
                            text: text.map(str::to_string),
                            confidence: Some(0.7),
                            duration_seconds: Some(3.0),
                            completed_at: None,
                            error: error.map(str::to_string),
                        };
                        job.apply(&patch, Utc::now());

                        let has_text = job.text.as_deref().map_or(false, |t| !t.is_empty());
                        assert_eq!(
                            has_text,
                            job.status == JobStatus::Completed,
                            "start={:?} patch={:?} -> {:?}",
                            start,
                            patch,
                            job
                        );
                        assert_eq!(job.error.is_some(), job.status == JobStatus::Failed);
                    }
                }
            }
        }
    }

    #[test]
    fn test_orphan_is_marked() {
        let job = TranscriptionJob::orphan("xyz", "auto-xyz-1700000000000", Utc::now());
        assert!(job.orphaned);
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.audio_object_key.is_none());
    }
}
