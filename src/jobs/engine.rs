//! Facade over the job components, shared by the HTTP handlers.

use super::error::JobResult;
use super::lifecycle::JobLifecycle;
use super::model::{JobStatus, TranscriptionJob};
use super::poller::{PollOutcome, PollSchedule, PollTarget, StatusPoller, WaitStrategy};
use super::submitter::{JobSubmitter, StartMode, StartOptions, SubmitRequest, SubmitterSettings};
use super::sweep::{Reconciler, SweepReport};
use super::trigger::StorageTrigger;
use crate::config::AppConfig;
use crate::stores::{Backends, MetadataStore, ServiceJobStatus, SpeakerLabelOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub submitter: SubmitterSettings,
    pub completed_page_size: usize,
    pub schedule: PollSchedule,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            submitter: SubmitterSettings {
                max_upload_bytes: config.storage.max_upload_bytes,
                upload_prefix: config.storage.upload_prefix.clone(),
                start_mode: config.service.start_mode,
                start_options: start_options(config),
            },
            completed_page_size: config.service.completed_page_size,
            schedule: PollSchedule::standard(),
        }
    }
}

pub fn start_options(config: &AppConfig) -> StartOptions {
    StartOptions {
        language_code: config.service.language_code.clone(),
        speaker_labels: SpeakerLabelOptions {
            enabled: config.service.show_speaker_labels,
            max_speakers: config.service.max_speaker_labels,
        },
    }
}

/// Running totals over every sweep this process has run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub runs: u64,
    pub processed: u64,
    pub fixed: u64,
    pub created: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_report: Option<SweepReport>,
}

impl SweepStats {
    fn record(&mut self, report: SweepReport, at: DateTime<Utc>) {
        self.runs += 1;
        self.processed += report.processed as u64;
        self.fixed += report.fixed as u64;
        self.created += report.created as u64;
        self.last_run = Some(at);
        self.last_report = Some(report);
    }
}

pub struct JobEngine {
    submitter: Arc<JobSubmitter>,
    lifecycle: Arc<JobLifecycle>,
    reconciler: Reconciler,
    poller: StatusPoller,
    metadata: Arc<dyn MetadataStore>,
    sweep_stats: Mutex<SweepStats>,
}

impl JobEngine {
    pub fn new(backends: &Backends, settings: EngineSettings) -> Self {
        let submitter = Arc::new(JobSubmitter::new(
            backends.objects.clone(),
            backends.service.clone(),
            backends.metadata.clone(),
            settings.submitter,
        ));
        let lifecycle = Arc::new(JobLifecycle::new(
            backends.objects.clone(),
            backends.service.clone(),
            backends.metadata.clone(),
        ));
        let reconciler = Reconciler::new(
            backends.service.clone(),
            backends.metadata.clone(),
            lifecycle.clone(),
            settings.completed_page_size,
        );

        Self {
            submitter,
            lifecycle,
            reconciler,
            poller: StatusPoller::new(settings.schedule),
            metadata: backends.metadata.clone(),
            sweep_stats: Mutex::new(SweepStats::default()),
        }
    }

    pub fn start_mode(&self) -> StartMode {
        self.submitter.start_mode()
    }

    /// Trigger that starts jobs from upload notifications.
    pub fn storage_trigger(&self) -> StorageTrigger {
        StorageTrigger::new(self.submitter.clone(), self.metadata.clone())
    }

    pub async fn submit(&self, request: SubmitRequest) -> JobResult<TranscriptionJob> {
        self.submitter.submit(request).await
    }

    pub async fn status(&self, id: &str) -> JobResult<TranscriptionJob> {
        self.lifecycle.refresh_status(id).await
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> JobResult<Vec<TranscriptionJob>> {
        self.lifecycle.list(status, limit).await
    }

    pub async fn remove(&self, id: &str) -> JobResult<()> {
        self.lifecycle.delete(id).await
    }

    pub async fn reconcile(&self) -> SweepReport {
        let report = self.reconciler.run().await;
        self.sweep_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(report, Utc::now());
        report
    }

    pub async fn notify(&self, job_name: &str, status: ServiceJobStatus) -> JobResult<Option<TranscriptionJob>> {
        self.lifecycle.on_service_notification(job_name, status).await
    }

    pub async fn wait(&self, id: &str, strategy: WaitStrategy, cancel: &CancellationToken) -> PollOutcome {
        self.poller.wait(self, id, strategy, cancel).await
    }

    pub fn sweep_stats(&self) -> SweepStats {
        self.sweep_stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn completed_page_size(&self) -> usize {
        self.reconciler.page_size()
    }

    pub fn set_completed_page_size(&self, page_size: usize) {
        self.reconciler.set_page_size(page_size);
    }

    pub fn set_start_options(&self, options: StartOptions) {
        self.submitter.set_start_options(options);
    }
}

#[async_trait]
impl PollTarget for JobEngine {
    async fn fetch(&self, id: &str) -> JobResult<TranscriptionJob> {
        self.status(id).await
    }

    async fn sweep(&self) -> SweepReport {
        self.reconcile().await
    }
}
