//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Many handlers hold a reference to the same data at once
//! - **RwLock**: Many readers OR one writer, never both
//! - Used for the runtime-editable configuration and the request metrics
//!
//! ### Arc<LiveSessionController>
//! The controller does its own locking internally, so the state only needs
//! shared ownership of it. Every handler talks to the same single session.
//!
//! ### Poisoned locks
//! A lock is poisoned when a thread panics while holding it. The data behind
//! these locks is plain counters and configuration, so the guard is recovered
//! with `into_inner()` instead of propagating the panic to every later request.

use crate::config::AppConfig;
use crate::live::session::{LiveSessionController, SessionSettings};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime; the next session
    /// picks up the change)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// The live voice session
    pub session: Arc<LiveSessionController>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all requests and sessions.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed requests since server start
    pub error_count: u64,

    /// Sessions that reached `Listening`
    pub sessions_started: u64,

    /// Session starts that ended in an error
    pub sessions_failed: u64,

    /// Status feed WebSocket clients currently connected
    pub status_subscribers: u32,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one endpoint.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, session: Arc<LiveSessionController>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            session,
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current configuration. Cloning releases the lock immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    /// Session settings derived from the current configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from_config(&self.get_config())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record one request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Record the outcome of one `start()` call.
    pub fn record_session_start(&self, succeeded: bool) {
        let mut metrics = self.write_metrics();
        if succeeded {
            metrics.sessions_started += 1;
        } else {
            metrics.sessions_failed += 1;
        }
    }

    pub fn increment_status_subscribers(&self) {
        self.write_metrics().status_subscribers += 1;
    }

    /// Saturates at zero.
    pub fn decrement_status_subscribers(&self) {
        let mut metrics = self.write_metrics();
        metrics.status_subscribers = metrics.status_subscribers.saturating_sub(1);
    }

    /// Consistent copy of the metrics for serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
