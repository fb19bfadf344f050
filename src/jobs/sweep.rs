//! # Reconciliation Sweep
//!
//! Repairs rows left `IN_PROGRESS` after the managed service finished a job
//! but the completion signal never arrived.
//!
//! ## Pass:
//! 1. List recently completed managed jobs (one bounded page, newest first)
//! 2. Scan rows still `IN_PROGRESS`
//! 3. Resolve each managed job to a canonical id: the `job_id` tag when
//!    present, otherwise [`id::derive`] on the job name
//! 4. Match by id first, then by literal job name, and upsert `COMPLETED`
//! 5. A managed job with no row at all becomes an orphan row
//!
//! A sweep never fails as a whole. Per-item errors are logged and skipped.

use super::id;
use super::lifecycle::JobLifecycle;
use super::model::TranscriptionJob;
use crate::stores::{CompletedJobSummary, MetadataStore, TranscriptionService, JOB_ID_TAG};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Completed managed jobs examined
    pub processed: usize,
    /// Existing rows moved to a terminal state
    pub fixed: usize,
    /// Orphan rows created
    pub created: usize,
}

pub struct Reconciler {
    service: Arc<dyn TranscriptionService>,
    metadata: Arc<dyn MetadataStore>,
    lifecycle: Arc<JobLifecycle>,
    page_size: AtomicUsize,
}

impl Reconciler {
    pub fn new(
        service: Arc<dyn TranscriptionService>,
        metadata: Arc<dyn MetadataStore>,
        lifecycle: Arc<JobLifecycle>,
        page_size: usize,
    ) -> Self {
        Self {
            service,
            metadata,
            lifecycle,
            page_size: AtomicUsize::new(page_size.max(1)),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size.load(Ordering::Relaxed)
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.page_size.store(page_size.max(1), Ordering::Relaxed);
    }

    pub async fn run(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let completed = match self.service.list_completed_jobs(self.page_size()).await {
            Ok(completed) => completed,
            Err(e) => {
                warn!(error = %e, "Sweep could not list completed jobs");
                return report;
            }
        };
        let in_progress = match self.metadata.scan_in_progress().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Sweep could not scan in-progress rows");
                return report;
            }
        };

        let by_id: HashMap<&str, &TranscriptionJob> = in_progress.iter().map(|job| (job.id.as_str(), job)).collect();
        let by_name: HashMap<&str, &TranscriptionJob> = in_progress
            .iter()
            .filter_map(|job| job.job_name.as_deref().map(|name| (name, job)))
            .collect();
        let mut seen: HashSet<String> = HashSet::new();

        for summary in &completed {
            report.processed += 1;

            let derived = id::derive(&summary.job_name);
            let canonical = summary.tags.get(JOB_ID_TAG).cloned().unwrap_or_else(|| derived.clone());

            let matched = by_id
                .get(canonical.as_str())
                .or_else(|| by_name.get(summary.job_name.as_str()))
                .or_else(|| by_id.get(derived.as_str()));

            match matched {
                Some(row) => {
                    if !seen.insert(row.id.clone()) {
                        continue;
                    }
                    match self.lifecycle.complete(&row.id, &summary.job_name, &summary.result_location).await {
                        Ok(outcome) if outcome.changed() => report.fixed += 1,
                        Ok(_) => {}
                        Err(e) => warn!(
                            job_id = %row.id,
                            job_name = %summary.job_name,
                            error = %e,
                            "Sweep could not complete job"
                        ),
                    }
                }
                None => {
                    if !seen.insert(canonical.clone()) {
                        continue;
                    }
                    match self.adopt_orphan(&canonical, summary).await {
                        Ok(true) => report.created += 1,
                        Ok(false) => {}
                        Err(e) => warn!(
                            job_id = %canonical,
                            job_name = %summary.job_name,
                            error = %e,
                            "Sweep could not adopt orphan job"
                        ),
                    }
                }
            }
        }

        if report.fixed > 0 || report.created > 0 {
            info!(processed = report.processed, fixed = report.fixed, created = report.created, "Sweep repaired rows");
        } else {
            debug!(processed = report.processed, "Sweep found nothing to repair");
        }
        report
    }

    /// Create a row for a completed managed job with no submission record.
    /// A row that exists but is already terminal is left untouched.
    async fn adopt_orphan(&self, id: &str, summary: &CompletedJobSummary) -> super::error::JobResult<bool> {
        if self.metadata.get_record(id).await?.is_some() {
            return Ok(false);
        }

        let orphan = TranscriptionJob::orphan(id, summary.job_name.clone(), summary.completed_at);
        self.metadata.put_record(&orphan).await?;
        self.lifecycle.complete(id, &summary.job_name, &summary.result_location).await?;
        info!(job_id = id, job_name = %summary.job_name, "Orphan job adopted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobSource, JobStatus};
    use crate::jobs::submitter::{StartMode, SubmitRequest};
    use crate::jobs::testing::{artifact, Harness};
    use crate::stores::{ObjectStore, SpeakerLabelOptions, StartJobRequest};
    use std::collections::BTreeMap;

    fn reconciler(harness: &Harness) -> Reconciler {
        let backends = harness.backends();
        Reconciler::new(
            backends.service.clone(),
            backends.metadata.clone(),
            Arc::new(harness.lifecycle()),
            100,
        )
    }

    async fn submit_clip(harness: &Harness, mode: StartMode) -> TranscriptionJob {
        harness
            .submitter(mode)
            .submit(SubmitRequest {
                audio: vec![0; 10 * 1024 * 1024],
                filename: "clip.wav".to_string(),
                content_type: Some("audio/wav".to_string()),
                source: JobSource::File,
            })
            .await
            .unwrap()
    }

    async fn start_untracked(harness: &Harness, job_name: &str, tags: BTreeMap<String, String>) {
        harness
            .simulator
            .start_job(StartJobRequest {
                job_name: job_name.to_string(),
                media_location: harness.objects.media_location("uploads/x.wav"),
                media_format: "wav".to_string(),
                language_code: "en-US".to_string(),
                speaker_labels: SpeakerLabelOptions {
                    enabled: false,
                    max_speakers: 2,
                },
                tags,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_completes_missed_job_once() {
        let harness = Harness::new();
        let sweep = reconciler(&harness);
        let job = submit_clip(&harness, StartMode::Explicit).await;
        let stored = harness.metadata.get_record(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);

        let job_name = stored.job_name.unwrap();
        harness
            .simulator
            .complete_job(&job_name, &artifact(&job_name, "hello world", &[0.9, 0.95]))
            .await
            .unwrap();

        let first = sweep.run().await;
        assert_eq!(first, SweepReport { processed: 1, fixed: 1, created: 0 });

        let repaired = harness.metadata.get_record(&job.id).await.unwrap().unwrap();
        assert_eq!(repaired.status, JobStatus::Completed);
        assert_eq!(repaired.text.as_deref(), Some("hello world"));
        assert!((repaired.confidence.unwrap() - 0.925).abs() < 1e-9);
        assert!(repaired.completed_at.is_some());

        let second = sweep.run().await;
        assert_eq!(second, SweepReport { processed: 1, fixed: 0, created: 0 });
        assert_eq!(harness.metadata.get_record(&job.id).await.unwrap().unwrap(), repaired);
    }

    #[tokio::test]
    async fn test_sweep_creates_marked_orphan() {
        let harness = Harness::new();
        let sweep = reconciler(&harness);
        let job_name = "auto-lost123-1726000000123";
        start_untracked(&harness, job_name, BTreeMap::new()).await;
        harness
            .simulator
            .complete_job(job_name, &artifact(job_name, "recovered text", &[0.8, 0.6]))
            .await
            .unwrap();

        assert_eq!(sweep.run().await, SweepReport { processed: 1, fixed: 0, created: 1 });

        let orphan = harness.metadata.get_record("lost123").await.unwrap().unwrap();
        assert!(orphan.orphaned);
        assert_eq!(orphan.status, JobStatus::Completed);
        assert_eq!(orphan.job_name.as_deref(), Some(job_name));
        assert_eq!(orphan.original_file_name, "lost123.audio");

        assert_eq!(sweep.run().await, SweepReport { processed: 1, fixed: 0, created: 0 });
    }

    #[tokio::test]
    async fn test_tag_wins_over_name_derivation() {
        let harness = Harness::new();
        let sweep = reconciler(&harness);
        let tags = BTreeMap::from([(JOB_ID_TAG.to_string(), "tagged-id".to_string())]);
        start_untracked(&harness, "meeting-notes-final", tags).await;
        harness
            .simulator
            .complete_job("meeting-notes-final", &artifact("meeting-notes-final", "notes", &[0.7]))
            .await
            .unwrap();

        assert_eq!(sweep.run().await.created, 1);
        assert!(harness.metadata.get_record("tagged-id").await.unwrap().is_some());
        assert!(harness.metadata.get_record("meeting-notes-final").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_bad_artifact_does_not_abort_the_pass() {
        let harness = Harness::new();
        let sweep = reconciler(&harness);
        let good = submit_clip(&harness, StartMode::Explicit).await;
        let bad = submit_clip(&harness, StartMode::Explicit).await;

        let good_name = harness.metadata.get_record(&good.id).await.unwrap().unwrap().job_name.unwrap();
        let bad_name = harness.metadata.get_record(&bad.id).await.unwrap().unwrap().job_name.unwrap();
        harness.simulator.complete_job(&good_name, &artifact(&good_name, "fine", &[0.9])).await.unwrap();

        // Overwrite the bad job's artifact with garbage.
        let location = harness.simulator.complete_job(&bad_name, &artifact(&bad_name, "x", &[0.9])).await.unwrap();
        let credential = harness.objects.write_credential(&location, "application/json", 64).await.unwrap();
        harness.objects.put(&credential.url, b"not json".to_vec()).await.unwrap();

        let report = sweep.run().await;
        assert_eq!(report.processed, 2);
        assert_eq!(report.fixed, 1);
        assert_eq!(
            harness.metadata.get_record(&bad.id).await.unwrap().unwrap().status,
            JobStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_service_outage_yields_empty_report() {
        let harness = Harness::new();
        let sweep = reconciler(&harness);
        harness.simulator.set_unavailable(true).await;
        assert_eq!(sweep.run().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_page_size_bounds_the_pass() {
        let harness = Harness::new();
        let sweep = reconciler(&harness);
        sweep.set_page_size(1);
        for name in ["auto-a-1726000000001", "auto-b-1726000000002"] {
            start_untracked(&harness, name, BTreeMap::new()).await;
            harness.simulator.complete_job(name, &artifact(name, "x", &[0.5])).await.unwrap();
        }

        assert_eq!(sweep.run().await.processed, 1);
        sweep.set_page_size(0);
        assert_eq!(sweep.page_size(), 1);
    }
}
