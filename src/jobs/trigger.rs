//! Storage-triggered job start.
//!
//! Subscribes to object-store write notifications and starts a managed job for
//! every new object under the upload prefix. Lagged notifications are skipped;
//! the sweep adopts anything the trigger misses.

use super::error::JobResult;
use super::id::{compose_job_name, derive_from_key, NamingPattern};
use super::model::JobPatch;
use super::submitter::{JobSubmitter, MediaFormat};
use crate::stores::{MetadataStore, ObjectWritten, UpdateOutcome};
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct StorageTrigger {
    submitter: Arc<JobSubmitter>,
    metadata: Arc<dyn MetadataStore>,
}

impl StorageTrigger {
    pub fn new(submitter: Arc<JobSubmitter>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { submitter, metadata }
    }

    /// Consume `events` until `shutdown` fires.
    pub fn spawn(
        self: Arc<Self>,
        events: broadcast::Receiver<ObjectWritten>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(events);
            info!(prefix = %self.submitter.upload_prefix(), "Storage trigger listening");

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = stream.next() => event,
                };

                match event {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle(&event).await {
                            warn!(key = %event.key, error = %e, "Storage trigger could not start job");
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "Storage trigger lagged; the sweep will repair skipped jobs");
                    }
                    None => break,
                }
            }

            info!("Storage trigger stopped");
        })
    }

    /// Start the managed job for one written object. Returns the job name,
    /// or `None` when the object is not an upload.
    pub async fn handle(&self, event: &ObjectWritten) -> JobResult<Option<String>> {
        let prefix = format!("{}/", self.submitter.upload_prefix());
        if !event.key.starts_with(&prefix) {
            return Ok(None);
        }

        let job_id = derive_from_key(&event.key);
        let format = match MediaFormat::from_filename(&event.key) {
            Ok(format) => format,
            Err(e) => {
                warn!(job_id = %job_id, key = %event.key, "Uploaded object has no supported format");
                self.metadata
                    .update_fields(&job_id, &JobPatch::failed(e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        let job_name = compose_job_name(
            NamingPattern::StorageTriggered,
            &job_id,
            Utc::now().timestamp_millis(),
            None,
        );
        if let UpdateOutcome::Missing = self.metadata.update_fields(&job_id, &JobPatch::job_name(&job_name)).await? {
            debug!(job_id = %job_id, "Upload without a job row; the sweep will adopt it");
        }

        self.submitter
            .start_managed(&job_id, &job_name, &event.key, format)
            .await?;
        debug!(job_id = %job_id, job_name = %job_name, "Triggered managed job");
        Ok(Some(job_name))
    }
}
