//! # Status Poller
//!
//! Caller-driven polling of one job until it is terminal or the attempt
//! budget runs out.
//!
//! ## Schedule:
//! - attempt k sleeps 2s for k ≤ 5, 3s for 6 ≤ k ≤ 10, 5s afterwards
//! - the reconciliation sweep runs before the status check on attempts 1, 4, 9
//!   and 16, because a completion signal may have been missed
//! - after the last attempt one more sweep and re-check run before timing out
//!
//! The schedule is a plain value so it can be tested without sleeping. A
//! `CancellationToken` is checked after every await; once it fires, no result
//! is reported even if an in-flight call completes.

use super::error::{JobError, JobResult};
use super::model::{JobStatus, TranscriptionJob};
use super::sweep::SweepReport;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Short front-loaded waits of the smart variant.
pub const SMART_WAITS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    max_attempts: u32,
    sweep_checkpoints: Vec<u32>,
}

impl PollSchedule {
    pub fn standard() -> Self {
        Self {
            max_attempts: 30,
            sweep_checkpoints: vec![1, 4, 9, 16],
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep after a non-terminal check on `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match attempt {
            0..=5 => Duration::from_secs(2),
            6..=10 => Duration::from_secs(3),
            _ => Duration::from_secs(5),
        }
    }

    pub fn sweeps_before(&self, attempt: u32) -> bool {
        self.sweep_checkpoints.contains(&attempt)
    }

    /// Total sleep before `attempt` starts.
    pub fn elapsed_before(&self, attempt: u32) -> Duration {
        (1..attempt).map(|k| self.delay_after(k)).sum()
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    #[default]
    Standard,
    Smart,
}

/// What the poller reads and repairs.
#[async_trait]
pub trait PollTarget: Send + Sync {
    async fn fetch(&self, id: &str) -> JobResult<TranscriptionJob>;

    /// Run a reconciliation sweep. Never fails.
    async fn sweep(&self) -> SweepReport;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(TranscriptionJob),
    Failed(TranscriptionJob),
    TimedOut { attempts: u32 },
    Missing,
    Cancelled,
}

impl PollOutcome {
    fn from_job(job: TranscriptionJob) -> Option<Self> {
        match job.status {
            JobStatus::Completed => Some(PollOutcome::Completed(job)),
            JobStatus::Failed => Some(PollOutcome::Failed(job)),
            JobStatus::InProgress => None,
        }
    }

    /// Typed result for the caller: a failed job, a timeout and an abandoned
    /// wait are distinct errors.
    pub fn into_result(self, id: &str) -> JobResult<TranscriptionJob> {
        match self {
            PollOutcome::Completed(job) => Ok(job),
            PollOutcome::Failed(job) => Err(JobError::JobFailure {
                job_id: job.id,
                reason: job.error.unwrap_or_else(|| "unknown failure".to_string()),
            }),
            PollOutcome::TimedOut { attempts } => Err(JobError::Timeout {
                job_id: id.to_string(),
                attempts,
            }),
            PollOutcome::Missing => Err(JobError::NotFound(id.to_string())),
            PollOutcome::Cancelled => Err(JobError::Cancelled(id.to_string())),
        }
    }
}

enum Check {
    Done(PollOutcome),
    Pending,
}

#[derive(Debug, Clone, Default)]
pub struct StatusPoller {
    schedule: PollSchedule,
}

impl StatusPoller {
    pub fn new(schedule: PollSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    pub async fn wait<T: PollTarget + ?Sized>(
        &self,
        target: &T,
        id: &str,
        strategy: WaitStrategy,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        match strategy {
            WaitStrategy::Standard => self.poll(target, id, cancel).await,
            WaitStrategy::Smart => self.smart_wait(target, id, cancel).await,
        }
    }

    /// Full schedule: up to `max_attempts` checks, then a final sweep and
    /// one re-check.
    pub async fn poll<T: PollTarget + ?Sized>(&self, target: &T, id: &str, cancel: &CancellationToken) -> PollOutcome {
        let max_attempts = self.schedule.max_attempts();

        for attempt in 1..=max_attempts {
            if self.schedule.sweeps_before(attempt) {
                let report = target.sweep().await;
                debug!(job_id = id, attempt, fixed = report.fixed, "Checkpoint sweep");
            }

            match self.check(target, id, attempt, cancel).await {
                Check::Done(outcome) => return outcome,
                Check::Pending => {}
            }

            if attempt < max_attempts && !self.sleep(self.schedule.delay_after(attempt), cancel).await {
                return PollOutcome::Cancelled;
            }
        }

        target.sweep().await;
        match self.check(target, id, max_attempts + 1, cancel).await {
            Check::Done(outcome) => outcome,
            Check::Pending => {
                info!(job_id = id, attempts = max_attempts, "Polling budget exhausted");
                PollOutcome::TimedOut {
                    attempts: max_attempts,
                }
            }
        }
    }

    /// Sweep and check immediately, then after each of [`SMART_WAITS`];
    /// falls back to [`StatusPoller::poll`].
    pub async fn smart_wait<T: PollTarget + ?Sized>(
        &self,
        target: &T,
        id: &str,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        for (step, wait) in std::iter::once(Duration::ZERO).chain(SMART_WAITS).enumerate() {
            if !wait.is_zero() && !self.sleep(wait, cancel).await {
                return PollOutcome::Cancelled;
            }
            target.sweep().await;
            match self.check(target, id, step as u32 + 1, cancel).await {
                Check::Done(outcome) => return outcome,
                Check::Pending => {}
            }
        }

        debug!(job_id = id, "Smart wait exhausted; falling back to full schedule");
        self.poll(target, id, cancel).await
    }

    async fn check<T: PollTarget + ?Sized>(
        &self,
        target: &T,
        id: &str,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Check {
        if cancel.is_cancelled() {
            return Check::Done(PollOutcome::Cancelled);
        }

        let fetched = target.fetch(id).await;
        if cancel.is_cancelled() {
            return Check::Done(PollOutcome::Cancelled);
        }

        match fetched {
            Ok(job) => match PollOutcome::from_job(job) {
                Some(outcome) => Check::Done(outcome),
                None => Check::Pending,
            },
            Err(JobError::NotFound(_)) => Check::Done(PollOutcome::Missing),
            Err(e) => {
                warn!(job_id = id, attempt, error = %e, "Status check failed; will retry");
                Check::Pending
            }
        }
    }

    /// Returns `false` when cancelled before the delay elapsed.
    async fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobPatch, JobSource};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Reports IN_PROGRESS until fetch number `complete_on`, failing every
    /// fetch listed in `errors`.
    struct ScriptedTarget {
        complete_on: Option<u32>,
        errors: Vec<u32>,
        fetches: AtomicU32,
        sweeps: AtomicU32,
    }

    impl ScriptedTarget {
        fn new(complete_on: Option<u32>) -> Self {
            Self {
                complete_on,
                errors: Vec::new(),
                fetches: AtomicU32::new(0),
                sweeps: AtomicU32::new(0),
            }
        }

        fn fetches(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }

        fn sweeps(&self) -> u32 {
            self.sweeps.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PollTarget for ScriptedTarget {
        async fn fetch(&self, id: &str) -> JobResult<TranscriptionJob> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if self.errors.contains(&n) {
                return Err(JobError::TransientIo("connection reset".into()));
            }
            let mut job = TranscriptionJob::submitted(id, "a.wav", JobSource::File, "uploads/a.wav", None, Utc::now());
            if self.complete_on.map_or(false, |k| n >= k) {
                job.apply(&JobPatch::completed("done", 0.9, 1.0), Utc::now());
            }
            Ok(job)
        }

        async fn sweep(&self) -> SweepReport {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            SweepReport::default()
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let schedule = PollSchedule::standard();
        assert_eq!(schedule.delay_after(1), Duration::from_secs(2));
        assert_eq!(schedule.delay_after(5), Duration::from_secs(2));
        assert_eq!(schedule.delay_after(6), Duration::from_secs(3));
        assert_eq!(schedule.delay_after(10), Duration::from_secs(3));
        assert_eq!(schedule.delay_after(11), Duration::from_secs(5));
        assert_eq!(schedule.elapsed_before(1), Duration::ZERO);
        assert_eq!(schedule.elapsed_before(11), Duration::from_secs(25));

        let checkpoints: Vec<u32> = (1..=30).filter(|k| schedule.sweeps_before(*k)).collect();
        assert_eq!(checkpoints, vec![1, 4, 9, 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_on_schedule() {
        let poller = StatusPoller::default();
        let target = ScriptedTarget::new(Some(11));
        let start = Instant::now();

        let outcome = poller.poll(&target, "abc", &CancellationToken::new()).await;
        assert!(matches!(outcome, PollOutcome::Completed(_)));
        assert_eq!(target.fetches(), 11);
        assert_eq!(target.sweeps(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_budget_with_final_recheck() {
        let poller = StatusPoller::default();
        let target = ScriptedTarget::new(None);
        let start = Instant::now();

        let outcome = poller.poll(&target, "abc", &CancellationToken::new()).await;
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 30 });
        assert_eq!(target.fetches(), 31);
        assert_eq!(target.sweeps(), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(120));

        let err = outcome.into_result("abc").unwrap_err();
        assert!(matches!(err, JobError::Timeout { attempts: 30, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_recheck_can_still_complete() {
        let poller = StatusPoller::default();
        let target = ScriptedTarget::new(Some(31));
        let outcome = poller.poll(&target, "abc", &CancellationToken::new()).await;
        assert!(matches!(outcome, PollOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_do_not_stop_polling() {
        let poller = StatusPoller::default();
        let mut target = ScriptedTarget::new(Some(4));
        target.errors = vec![1, 2, 3];

        let outcome = poller.poll(&target, "abc", &CancellationToken::new()).await;
        assert!(matches!(outcome, PollOutcome::Completed(_)));
        assert_eq!(target.fetches(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_wait_front_loads_checks() {
        let poller = StatusPoller::default();
        let target = ScriptedTarget::new(Some(3));
        let start = Instant::now();

        let outcome = poller
            .wait(&target, "abc", WaitStrategy::Smart, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, PollOutcome::Completed(_)));
        assert_eq!(target.sweeps(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_wait_falls_back_to_full_schedule() {
        let poller = StatusPoller::default();
        let target = ScriptedTarget::new(Some(7));
        let start = Instant::now();

        let outcome = poller.smart_wait(&target, "abc", &CancellationToken::new()).await;
        assert!(matches!(outcome, PollOutcome::Completed(_)));
        // 1+3+5+8 of smart waits, then one 2s sleep into the full schedule
        assert_eq!(start.elapsed(), Duration::from_secs(19));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_sleep() {
        let poller = StatusPoller::default();
        let target = ScriptedTarget::new(None);
        let cancel = CancellationToken::new();

        let abandon = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        };
        let (outcome, _) = tokio::join!(poller.poll(&target, "abc", &cancel), abandon);

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(target.fetches(), 2);
        assert!(matches!(outcome.into_result("abc"), Err(JobError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_failed_job_surfaces_reason() {
        struct FailedTarget;

        #[async_trait]
        impl PollTarget for FailedTarget {
            async fn fetch(&self, id: &str) -> JobResult<TranscriptionJob> {
                let mut job =
                    TranscriptionJob::submitted(id, "a.wav", JobSource::File, "uploads/a.wav", None, Utc::now());
                job.apply(&JobPatch::failed("unsupported codec"), Utc::now());
                Ok(job)
            }

            async fn sweep(&self) -> SweepReport {
                SweepReport::default()
            }
        }

        let outcome = StatusPoller::default()
            .poll(&FailedTarget, "abc", &CancellationToken::new())
            .await;
        let err = outcome.into_result("abc").unwrap_err();
        assert!(matches!(err, JobError::JobFailure { ref reason, .. } if reason == "unsupported codec"));
    }
}
