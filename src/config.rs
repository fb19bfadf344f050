//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and TOML/JSON/env values
//! - **Enums with `rename_all`**: Backends and modes are typed, but read as plain strings
//! - **Result<T, E>**: Every loading step can fail and reports why
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_METADATA__BACKEND, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so field names that
//! contain underscores survive: `APP_STORAGE__MAX_UPLOAD_BYTES=1048576`.

use crate::jobs::submitter::MAX_UPLOAD_BYTES;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

pub use crate::jobs::submitter::StartMode;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP API listens
/// - `storage`: object store for audio and transcript artifacts
/// - `service`: how managed transcription jobs are started
/// - `metadata`: the store holding job rows
/// - `polling`: client-facing refresh limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub service: ServiceConfig,
    pub metadata: MetadataConfig,
    pub polling: PollingConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Filesystem,
}

/// Object store settings.
///
/// ## Fields:
/// - `root`: directory for the filesystem backend
/// - `max_upload_bytes`: per-upload ceiling, never above 200 MiB
/// - `credential_ttl_seconds`: lifetime of a write credential
/// - `upload_prefix`: key prefix for uploaded audio (and the trigger filter)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub root: String,
    pub max_upload_bytes: u64,
    pub credential_ttl_seconds: u64,
    pub upload_prefix: String,
}

/// Managed transcription service settings.
///
/// `language_code`, the speaker label options and `completed_page_size` can
/// be changed at runtime through `PUT /api/v1/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub start_mode: StartMode,
    pub language_code: String,
    pub show_speaker_labels: bool,
    pub max_speaker_labels: u8,
    /// Completed jobs fetched per reconciliation sweep
    pub completed_page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub backend: MetadataBackend,
    pub database_url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Minimum time between two history refreshes of one client session
    pub refresh_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                backend: StorageBackend::Filesystem,
                root: "./data/objects".to_string(),
                max_upload_bytes: MAX_UPLOAD_BYTES,
                credential_ttl_seconds: 900,
                upload_prefix: "uploads".to_string(),
            },
            service: ServiceConfig {
                start_mode: StartMode::Explicit,
                language_code: "en-US".to_string(),
                show_speaker_labels: false,
                max_speaker_labels: 2,
                completed_page_size: 100,
            },
            metadata: MetadataConfig {
                backend: MetadataBackend::Sqlite,
                database_url: "sqlite:data/jobs.db".to_string(),
                max_connections: 5,
            },
            polling: PollingConfig {
                refresh_interval_ms: 2000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_STORAGE__BACKEND=memory`: Keep objects in memory
    /// - `APP_SERVICE__START_MODE=storage_trigger`: Start jobs from upload notifications
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.storage.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Upload ceiling must be greater than 0"));
        }

        if self.storage.max_upload_bytes > MAX_UPLOAD_BYTES {
            return Err(anyhow::anyhow!(
                "Upload ceiling cannot exceed {} bytes",
                MAX_UPLOAD_BYTES
            ));
        }

        if self.storage.credential_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("Write credential lifetime must be greater than 0"));
        }

        if self.storage.upload_prefix.trim_matches('/').is_empty() {
            return Err(anyhow::anyhow!("Upload prefix cannot be empty"));
        }

        if self.service.completed_page_size == 0 {
            return Err(anyhow::anyhow!("Completed job page size must be greater than 0"));
        }

        if self.service.language_code.trim().is_empty() {
            return Err(anyhow::anyhow!("Language code cannot be empty"));
        }

        if self.service.show_speaker_labels && self.service.max_speaker_labels < 2 {
            return Err(anyhow::anyhow!(
                "At least 2 speakers are required when speaker labels are enabled"
            ));
        }

        if self.metadata.max_connections == 0 {
            return Err(anyhow::anyhow!("Metadata store needs at least one connection"));
        }

        Ok(())
    }

    /// Update the runtime-tunable settings from a JSON string.
    ///
    /// Only fields that are safe to change on a running server are read:
    /// `service.language_code`, `service.show_speaker_labels`,
    /// `service.max_speaker_labels`, `service.completed_page_size` and
    /// `polling.refresh_interval_ms`. Anything else is ignored.
    ///
    /// The update is all-or-nothing: if the result fails validation, `self`
    /// is left unchanged.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(service) = partial_config.get("service") {
            if let Some(language) = service.get("language_code").and_then(|v| v.as_str()) {
                updated.service.language_code = language.to_string();
            }
            if let Some(enabled) = service.get("show_speaker_labels").and_then(|v| v.as_bool()) {
                updated.service.show_speaker_labels = enabled;
            }
            if let Some(speakers) = service.get("max_speaker_labels").and_then(|v| v.as_u64()) {
                updated.service.max_speaker_labels = u8::try_from(speakers)
                    .map_err(|_| anyhow::anyhow!("max_speaker_labels is out of range"))?;
            }
            if let Some(page_size) = service.get("completed_page_size").and_then(|v| v.as_u64()) {
                updated.service.completed_page_size = page_size as usize;
            }
        }

        if let Some(polling) = partial_config.get("polling") {
            if let Some(interval) = polling.get("refresh_interval_ms").and_then(|v| v.as_u64()) {
                updated.polling.refresh_interval_ms = interval;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
