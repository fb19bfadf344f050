//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by multiple HTTP
//! request handlers simultaneously: the configuration, request metrics, the job
//! engine and the client session registry.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Many handlers share ownership of the same engine and registry
//! - **Thread safety**: actix-web runs one app instance per worker thread, and
//!   every clone of `AppState` points at the same underlying data
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Multiple readers OR one writer at a time
//! - **Why needed**: Every request reads the config; only `PUT /config` writes it
//!
//! ### Poisoned locks
//! A lock is "poisoned" when a thread panics while holding it. The counters and
//! config guarded here stay consistent on every write, so a poisoned lock is
//! recovered with `PoisonError::into_inner` instead of taking the server down.

use crate::config::AppConfig;
use crate::jobs::engine::start_options;
use crate::jobs::session::SessionRegistry;
use crate::jobs::JobEngine;
use crate::stores::simulated::SimulatedTranscriptionService;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Thread Safety Pattern:
/// - `config` and `metrics` are `Arc<RwLock<T>>`: shared and mutable
/// - `engine` and `sessions` are `Arc<T>`: they synchronize internally
/// - `start_time` never changes, so it is stored directly
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (runtime-tunable parts can be updated)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Submission, status, polling and reconciliation
    pub engine: Arc<JobEngine>,

    /// Per-client refresh limiters, pending rows and wait tokens
    pub sessions: Arc<SessionRegistry>,

    /// Present when the managed service is the in-process simulation
    pub simulator: Option<Arc<SimulatedTranscriptionService>>,
}

/// Request metrics collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count**: Total requests processed (for load monitoring)
/// - **error_count**: Total 4xx/5xx responses (for reliability monitoring)
/// - **active_waits**: Clients currently blocked in `GET /jobs/{id}/wait`
/// - **endpoint_metrics**: Per-route statistics
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_waits: u32,
    /// Key: method plus route pattern (e.g., "GET /api/v1/jobs/{id}")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState around an already-built engine and registry.
    pub fn new(
        config: AppConfig,
        engine: Arc<JobEngine>,
        sessions: Arc<SessionRegistry>,
        simulator: Option<Arc<SimulatedTranscriptionService>>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            engine,
            sessions,
            simulator,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately, so a slow handler never
    /// blocks a config update.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply a partial JSON update to the runtime-tunable settings.
    ///
    /// ## What this does:
    /// 1. Takes the write lock so two updates cannot interleave
    /// 2. Validates and applies the JSON through `AppConfig::update_from_json`
    /// 3. Pushes the new values into the running components: the history
    ///    refresh interval, the sweep page size and the job start options
    ///
    /// On error the stored config and the components are left unchanged.
    pub fn update_config(&self, json_str: &str) -> anyhow::Result<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config.update_from_json(json_str)?;

        self.sessions
            .set_refresh_interval(Duration::from_millis(config.polling.refresh_interval_ms));
        self.engine
            .set_completed_page_size(config.service.completed_page_size);
        self.engine.set_start_options(start_options(&config));

        Ok(config.clone())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called for every 4xx or 5xx response).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time an endpoint is seen, `.entry().or_default()` creates a
    /// zeroed `EndpointMetric`; later requests update it in place.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Called when a client starts waiting on a job.
    pub fn increment_active_waits(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_waits += 1;
    }

    /// Called when a wait ends, whatever the outcome. Never underflows.
    pub fn decrement_active_waits(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_waits = metrics.active_waits.saturating_sub(1);
    }

    /// Get a snapshot of current metrics (used for /health and /metrics).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds, 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, from 0.0 (none) to 1.0 (all).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
