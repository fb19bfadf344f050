//! History view: authoritative server rows merged with optimistic local ones.

use super::model::TranscriptionJob;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Server,
    LocalPending,
}

/// A job as presented in history, with where the data came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub job: TranscriptionJob,
    pub provenance: Provenance,
}

/// Merge server rows with local-only rows.
///
/// A server row replaces any local row with the same id. Local rows the server
/// did not return are kept, since omission may only mean the row has not been
/// reconciled yet. Result is newest first with no duplicate ids.
pub fn merge(server: Vec<TranscriptionJob>, local: Vec<TranscriptionJob>) -> Vec<HistoryEntry> {
    let mut seen: HashSet<String> = HashSet::with_capacity(server.len() + local.len());
    let mut merged: Vec<HistoryEntry> = Vec::with_capacity(server.len() + local.len());

    for (jobs, provenance) in [(server, Provenance::Server), (local, Provenance::LocalPending)] {
        for job in jobs {
            if seen.insert(job.id.clone()) {
                merged.push(HistoryEntry { job, provenance });
            }
        }
    }

    merged.sort_by(|a, b| {
        b.job
            .created_at
            .cmp(&a.job.created_at)
            .then_with(|| a.job.id.cmp(&b.job.id))
    });
    merged
}

/// Lets a refresh through at most once per interval.
#[derive(Debug, Default)]
pub struct RefreshLimiter {
    last: Option<Instant>,
}

impl RefreshLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and allow a refresh at `now` unless one ran less than
    /// `min_interval` ago.
    pub fn try_acquire(&mut self, now: Instant, min_interval: Duration) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobPatch, JobSource, JobStatus};
    use chrono::{Duration as ChronoDuration, Utc};

    fn job(id: &str, offset_secs: i64) -> TranscriptionJob {
        TranscriptionJob::submitted(
            id,
            format!("{}.wav", id),
            JobSource::File,
            format!("uploads/{}.wav", id),
            None,
            Utc::now() + ChronoDuration::seconds(offset_secs),
        )
    }

    #[test]
    fn test_server_replaces_local_and_pending_is_kept() {
        let stale = job("1", -10);
        let mut fresh = stale.clone();
        fresh.apply(&JobPatch::completed("done", 0.9, 2.0), Utc::now());
        let pending = job("2", 0);

        let merged = merge(vec![fresh.clone()], vec![stale, pending.clone()]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].job.id, "2");
        assert_eq!(merged[0].provenance, Provenance::LocalPending);
        assert_eq!(merged[1].job, fresh);
        assert_eq!(merged[1].job.status, JobStatus::Completed);
        assert_eq!(merged[1].provenance, Provenance::Server);
    }

    #[test]
    fn test_sorted_newest_first_without_duplicates() {
        let server = vec![job("a", -30), job("b", -10), job("a", -30)];
        let local = vec![job("c", -20), job("b", 5)];

        let merged = merge(server, local);
        let ids: Vec<&str> = merged.iter().map(|e| e.job.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_empty_server_list_keeps_local_rows() {
        let merged = merge(Vec::new(), vec![job("x", 0)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].provenance, Provenance::LocalPending);
    }

    #[test]
    fn test_entry_serializes_flat() {
        let entry = HistoryEntry {
            job: job("x", 0),
            provenance: Provenance::LocalPending,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["id"], "x");
        assert_eq!(json["provenance"], "local-pending");
    }

    #[test]
    fn test_limiter_allows_once_per_interval() {
        let mut limiter = RefreshLimiter::new();
        let start = Instant::now();
        let interval = Duration::from_secs(2);

        assert!(limiter.try_acquire(start, interval));
        assert!(!limiter.try_acquire(start + Duration::from_millis(500), interval));
        assert!(!limiter.try_acquire(start + Duration::from_millis(1999), interval));
        assert!(limiter.try_acquire(start + interval, interval));
    }
}
