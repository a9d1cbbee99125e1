//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **Configuration**: `Arc<RwLock<AppConfig>>`, readable by every request and
//!   updatable at runtime through `PUT /api/v1/config`
//! - **Metrics**: request/error counters and per-endpoint timings
//! - **Pipeline**: the loaded models and collaborators, read-only after startup
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread holds a handle to the same data
//! - **RwLock**: many concurrent readers or one writer
//! - Locks are held only long enough to clone or bump a counter, never across
//!   an `.await`
//!
//! Nothing request-specific is stored here: transcripts, triage records and
//! signals belong to the request that produced them.

use crate::config::AppConfig;        // Our configuration types
use crate::pipeline::TriagePipeline; // Per-request orchestration
use std::collections::HashMap;       // For storing per-endpoint metrics
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;              // For tracking server uptime

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Thread Safety Pattern:
/// Mutable data sits behind `Arc<RwLock<T>>`; the pipeline is immutable once
/// built, so a plain `Arc` is enough.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics (updated by the request middleware)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Loaded models and collaborators
    pub pipeline: Arc<TriagePipeline>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: load and reliability monitoring
/// - **active_requests**: calls currently inside the triage pipeline
/// - **endpoint_metrics**: per-endpoint latency, mostly dominated by transcription
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed HTTP requests since server start
    pub error_count: u64,

    /// Pipeline requests currently being processed
    pub active_requests: u32,

    /// Key: endpoint name (e.g., "POST /agent/generate_json/")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

/// Decrements `active_requests` when the request finishes or is dropped.
pub struct ActiveRequest {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        let mut metrics = write(&self.metrics);
        metrics.active_requests = metrics.active_requests.saturating_sub(1);
    }
}

// A poisoned lock still holds consistent counters and config; keep serving.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    /// Create a new AppState with the given configuration and loaded pipeline.
    pub fn new(config: AppConfig, pipeline: TriagePipeline) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            pipeline: Arc::new(pipeline),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so a slow request never blocks a
    /// config update.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *write(&self.config) = new_config;
        Ok(())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health", "POST /predict_audio/")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error status
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Mark a pipeline request as in progress until the guard is dropped.
    pub fn begin_request(&self) -> ActiveRequest {
        write(&self.metrics).active_requests += 1;
        ActiveRequest {
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{pipeline, ScriptedRuntime};

    fn state() -> AppState {
        AppState::new(AppConfig::default(), pipeline(Arc::new(ScriptedRuntime { json: None }), false))
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_active_request_guard() {
        let state = state();
        {
            let _a = state.begin_request();
            let _b = state.begin_request();
            assert_eq!(state.get_metrics_snapshot().active_requests, 2);
        }
        assert_eq!(state.get_metrics_snapshot().active_requests, 0);
    }

    #[test]
    fn test_update_config_validates() {
        let state = state();
        let mut config = state.get_config();
        config.severity.emotion_weight = 2.0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().severity.emotion_weight, 0.0);
    }
}
