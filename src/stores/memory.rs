//! In-memory object and metadata stores.
//!
//! Used by tests and by the development server when no persistence is wanted.

use super::credentials::CredentialLedger;
use super::{
    MetadataStore, ObjectStore, ObjectWritten, StoreError, UpdateOutcome, WriteCredential,
};
use crate::jobs::model::{JobPatch, JobStatus, TranscriptionJob};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

const NOTIFICATION_CAPACITY: usize = 256;

pub struct MemoryObjectStore {
    ledger: CredentialLedger,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    notifications: broadcast::Sender<ObjectWritten>,
}

impl MemoryObjectStore {
    pub fn new(credential_ttl: Duration) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            ledger: CredentialLedger::new("memory://objects", credential_ttl),
            objects: RwLock::new(HashMap::new()),
            notifications,
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn write_credential(
        &self,
        key: &str,
        content_type: &str,
        max_bytes: u64,
    ) -> Result<WriteCredential, StoreError> {
        self.ledger.issue(key, content_type, max_bytes)
    }

    async fn put(&self, url: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let size = body.len() as u64;
        let write = self.ledger.redeem(url, size)?;
        self.objects.write().await.insert(write.key.clone(), body);

        // No subscribers is fine; notifications are best effort.
        let _ = self.notifications.send(ObjectWritten {
            key: write.key,
            content_type: write.content_type,
            size,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn media_location(&self, key: &str) -> String {
        format!("{}/{}", self.ledger.base_url(), key)
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectWritten> {
        self.notifications.subscribe()
    }
}

/// Newest first, ties broken by id so listings are stable.
pub(crate) fn sort_newest_first(jobs: &mut [TranscriptionJob]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    rows: RwLock<HashMap<String, TranscriptionJob>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put_record(&self, job: &TranscriptionJob) -> Result<(), StoreError> {
        self.rows.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<Option<TranscriptionJob>, StoreError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn update_fields(&self, id: &str, patch: &JobPatch) -> Result<UpdateOutcome, StoreError> {
        let mut rows = self.rows.write().await;
        let Some(job) = rows.get_mut(id) else {
            return Ok(UpdateOutcome::Missing);
        };

        if job.apply(patch, Utc::now()) {
            Ok(UpdateOutcome::Updated(job.clone()))
        } else {
            Ok(UpdateOutcome::Unchanged(job.clone()))
        }
    }

    async fn delete_record(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.rows.write().await.remove(id).is_some())
    }

    async fn query_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<TranscriptionJob>, StoreError> {
        let mut jobs: Vec<TranscriptionJob> = self
            .rows
            .read()
            .await
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        sort_newest_first(&mut jobs);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn scan_in_progress(&self) -> Result<Vec<TranscriptionJob>, StoreError> {
        let mut jobs: Vec<TranscriptionJob> = self
            .rows
            .read()
            .await
            .values()
            .filter(|job| job.status == JobStatus::InProgress)
            .cloned()
            .collect();
        sort_newest_first(&mut jobs);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobSource;
    use chrono::Duration as ChronoDuration;

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

    #[tokio::test]
    async fn test_object_put_get_and_notify() {
        let store = MemoryObjectStore::new(Duration::from_secs(60));
        let mut events = store.subscribe();

        let credential = store.write_credential("uploads/a.wav", "audio/wav", 4).await.unwrap();
        store.put(&credential.url, vec![1, 2, 3]).await.unwrap();

        assert_eq!(store.get("uploads/a.wav").await.unwrap(), vec![1, 2, 3]);
        let event = events.recv().await.unwrap();
        assert_eq!(event.key, "uploads/a.wav");
        assert_eq!(event.size, 3);
        assert!(matches!(store.get("missing").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_object_put_requires_valid_credential() {
        let store = MemoryObjectStore::new(Duration::from_secs(60));
        let result = store.put("memory://objects/uploads/a.wav?token=nope", vec![1]).await;
        assert!(matches!(result, Err(StoreError::CredentialRejected(_))));
        assert!(!store.contains("uploads/a.wav").await);
    }

    #[tokio::test]
    async fn test_metadata_query_order_and_filter() {
        let store = MemoryMetadataStore::new();
        store.put_record(&job("old", -60)).await.unwrap();
        store.put_record(&job("new", 0)).await.unwrap();
        store.put_record(&job("mid", -30)).await.unwrap();
        store.update_fields("mid", &JobPatch::failed("x")).await.unwrap();

        let all = store.query_by_status(None, 10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);

        let limited = store.query_by_status(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let failed = store.query_by_status(Some(JobStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(store.scan_in_progress().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_update_outcomes() {
        let store = MemoryMetadataStore::new();
        assert_eq!(
            store.update_fields("none", &JobPatch::failed("x")).await.unwrap(),
            UpdateOutcome::Missing
        );

        store.put_record(&job("a", 0)).await.unwrap();
        let patch = JobPatch::completed("hi", 0.9, 1.0);
        assert!(store.update_fields("a", &patch).await.unwrap().changed());
        assert!(!store.update_fields("a", &patch).await.unwrap().changed());

        assert!(store.delete_record("a").await.unwrap());
        assert!(!store.delete_record("a").await.unwrap());
        assert!(store.get_record("a").await.unwrap().is_none());
    }
}
