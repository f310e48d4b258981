//! Prometheus metrics for the control plane.
//!
//! Exported in text format at `/metrics` on the API server. All metrics
//! use interior mutability and are safe to share across tasks.

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

/// Error types for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to register a metric.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Control-plane metrics.
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,

    /// API requests by endpoint and status class.
    api_requests_total: CounterVec,

    /// Task dispatches by path (`dispatcher` or `next_task`).
    dispatches_total: CounterVec,

    /// Heartbeats by outcome (`ok`, `abort`, `conflict`).
    heartbeats_total: CounterVec,

    /// Host terminations by flag reason.
    host_terminations_total: CounterVec,
}

impl ServerMetrics {
    /// Create the metrics and register them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let api_requests_total = CounterVec::new(
            Opts::new("mci_api_requests_total", "API requests"),
            &["endpoint", "status"],
        )?;
        let dispatches_total = CounterVec::new(
            Opts::new("mci_dispatches_total", "Task dispatches"),
            &["path"],
        )?;
        let heartbeats_total = CounterVec::new(
            Opts::new("mci_heartbeats_total", "Agent heartbeats"),
            &["outcome"],
        )?;
        let host_terminations_total = CounterVec::new(
            Opts::new("mci_host_terminations_total", "Host terminations"),
            &["reason"],
        )?;

        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(dispatches_total.clone()))?;
        registry.register(Box::new(heartbeats_total.clone()))?;
        registry.register(Box::new(host_terminations_total.clone()))?;

        Ok(Self {
            registry,
            api_requests_total,
            dispatches_total,
            heartbeats_total,
            host_terminations_total,
        })
    }

    /// Record one API request.
    pub fn api_request(&self, endpoint: &str, status: u16) {
        let class = match status {
            200..=299 => "2xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.api_requests_total
            .with_label_values(&[endpoint, class])
            .inc();
    }

    /// Record one task dispatch.
    pub fn dispatch(&self, path: &str) {
        self.dispatches_total.with_label_values(&[path]).inc();
    }

    /// Record one heartbeat outcome.
    pub fn heartbeat(&self, outcome: &str) {
        self.heartbeats_total.with_label_values(&[outcome]).inc();
    }

    /// Record one host termination.
    pub fn host_terminated(&self, reason: &str) {
        self.host_terminations_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Encode all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared handle to the server metrics.
pub type SharedMetrics = Arc<ServerMetrics>;
