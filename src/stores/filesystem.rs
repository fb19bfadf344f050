//! Directory-backed object store.
//!
//! Object keys map to relative paths under the root directory. Writes go to a
//! temporary sibling file first and are renamed into place, so readers never
//! observe a partial object.

use super::credentials::{validate_key, CredentialLedger};
use super::{ObjectStore, ObjectWritten, StoreError, WriteCredential};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::debug;

const NOTIFICATION_CAPACITY: usize = 256;

pub struct FsObjectStore {
    root: PathBuf,
    ledger: CredentialLedger,
    notifications: broadcast::Sender<ObjectWritten>,
}

impl FsObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>, credential_ttl: Duration) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;

        let base_url = format!("file://{}", root.display());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        debug!(root = %root.display(), "Filesystem object store opened");

        Ok(Self {
            ledger: CredentialLedger::new(base_url, credential_ttl),
            root,
            notifications,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
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
        let path = self.path_for(&write.key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension(format!("partial-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&staging, &body).await?;
        if let Err(e) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!(key = %write.key, size, "Object written");
        let _ = self.notifications.send(ObjectWritten {
            key: write.key,
            content_type: write.content_type,
            size,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn media_location(&self, key: &str) -> String {
        format!("{}/{}", self.ledger.base_url(), key)
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectWritten> {
        self.notifications.subscribe()
    }
}
