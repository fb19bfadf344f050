//! Single-use, time-limited write credentials shared by the object stores.

use super::{StoreError, WriteCredential};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Grant {
    key: String,
    content_type: String,
    max_bytes: u64,
    expires_at: chrono::DateTime<Utc>,
}

/// What a redeemed credential allows the store to write.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeemedWrite {
    pub key: String,
    pub content_type: String,
}

#[derive(Debug)]
pub struct CredentialLedger {
    base_url: String,
    ttl: Duration,
    grants: Mutex<HashMap<String, Grant>>,
}

impl CredentialLedger {
    pub fn new(base_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ttl,
            grants: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn issue(&self, key: &str, content_type: &str, max_bytes: u64) -> Result<WriteCredential, StoreError> {
        validate_key(key)?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| StoreError::CredentialRejected(format!("invalid credential lifetime: {}", e)))?;
        let expires_at = now + ttl;
        let token = Uuid::new_v4().simple().to_string();

        let mut grants = self.grants.lock().unwrap_or_else(PoisonError::into_inner);
        grants.retain(|_, grant| grant.expires_at > now);
        grants.insert(
            token.clone(),
            Grant {
                key: key.to_string(),
                content_type: content_type.to_string(),
                max_bytes,
                expires_at,
            },
        );

        Ok(WriteCredential {
            key: key.to_string(),
            url: format!("{}/{}?token={}", self.base_url, key, token),
            expires_at,
            content_type: content_type.to_string(),
            max_bytes,
        })
    }

    /// Consume the credential behind `url` for a body of `size` bytes.
    pub fn redeem(&self, url: &str, size: u64) -> Result<RedeemedWrite, StoreError> {
        let (location, token) = url
            .rsplit_once("?token=")
            .ok_or_else(|| StoreError::CredentialRejected("missing token".to_string()))?;

        let grant = self
            .grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .ok_or_else(|| StoreError::CredentialRejected("unknown or already used token".to_string()))?;

        if location != format!("{}/{}", self.base_url, grant.key) {
            return Err(StoreError::CredentialRejected("token does not match location".to_string()));
        }
        if Utc::now() >= grant.expires_at {
            return Err(StoreError::CredentialRejected("credential expired".to_string()));
        }
        if size > grant.max_bytes {
            return Err(StoreError::TooLarge {
                size,
                limit: grant.max_bytes,
            });
        }

        Ok(RedeemedWrite {
            key: grant.key,
            content_type: grant.content_type,
        })
    }
}

/// Keys are relative, slash-separated and may not climb out of the store.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('?')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StoreError::CredentialRejected(format!("invalid object key '{}'", key)));
    }
    Ok(())
}
