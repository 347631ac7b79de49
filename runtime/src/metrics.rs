//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the bus components:
//! - Publisher writes and latency
//! - Consumption loop throughput, handler failures and receive faults
//! - Circuit breaker state per topic
//! - Topic provisioning outcomes
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, e.g. with [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use spider_bus_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder installer.
///
/// Installs the global recorder and keeps the handle used to render the
/// scrape output.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint is served on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// logs a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed"
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Publisher
    describe_counter!(
        "event_bus_messages_published_total",
        "Total number of messages acknowledged by the broker"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Total number of publish errors"
    );
    describe_counter!(
        "event_bus_publish_dropped_total",
        "Total number of null events dropped before publishing"
    );
    describe_histogram!(
        "event_bus_publish_duration_seconds",
        "Time taken to publish messages"
    );

    // Consumption loops
    describe_counter!(
        "event_bus_messages_consumed_total",
        "Total number of messages handed to subscription handlers"
    );
    describe_counter!(
        "event_bus_handler_failures_total",
        "Total number of handler invocations that failed or panicked"
    );
    describe_counter!(
        "event_bus_empty_payloads_total",
        "Total number of pulled messages without a payload"
    );
    describe_counter!(
        "event_bus_decode_failures_total",
        "Total number of payloads that could not be decoded"
    );
    describe_counter!(
        "event_bus_receive_faults_total",
        "Total number of broker faults while pulling"
    );
    describe_gauge!(
        "event_bus_active_subscriptions",
        "Number of registered subscriptions"
    );

    // Circuit breaker
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );

    // Provisioning
    describe_counter!(
        "topic_provisioning_total",
        "Topic provisioning outcomes by kind"
    );
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a message publish.
    pub fn record_publish(topic: &str, duration: Duration) {
        counter!("event_bus_messages_published_total", "topic" => topic.to_string()).increment(1);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish error.
    pub fn record_publish_error(topic: &str) {
        counter!("event_bus_publish_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a dropped null event.
    pub fn record_publish_dropped(topic: &str) {
        counter!("event_bus_publish_dropped_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message handed to a handler.
    pub fn record_consume(topic: &str) {
        counter!("event_bus_messages_consumed_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a handler failure.
    pub fn record_handler_failure(topic: &str) {
        counter!("event_bus_handler_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message without payload.
    pub fn record_empty_payload(topic: &str) {
        counter!("event_bus_empty_payloads_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record an undecodable payload.
    pub fn record_decode_failure(topic: &str) {
        counter!("event_bus_decode_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a broker receive fault.
    pub fn record_receive_fault(topic: &str) {
        counter!("event_bus_receive_faults_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record the number of registered subscriptions.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_active_subscriptions(count: usize) {
        gauge!("event_bus_active_subscriptions").set(count as f64);
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record the circuit state of a topic's loop.
    pub fn record_state(topic: &str, state: State) {
        gauge!("circuit_breaker_state", "topic" => topic.to_string()).set(state.as_gauge());
    }
}

/// Provisioning metrics recorder.
pub struct ProvisioningMetrics;

impl ProvisioningMetrics {
    /// Record a provisioning outcome (`created`, `expanded`, `sufficient`, `failed`).
    pub fn record_outcome(topic: &str, outcome: &'static str) {
        counter!(
            "topic_provisioning_total",
            "topic" => topic.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        server.start().unwrap();

        EventBusMetrics::record_publish("agent-requests", Duration::from_millis(50));
        EventBusMetrics::record_receive_fault("agent-requests");
        CircuitBreakerMetrics::record_state("agent-requests", State::Open);
        ProvisioningMetrics::record_outcome("agent-requests", "created");

        // If this test runs after another test initialized the recorder,
        // handle might be None. That's OK - metrics are still being recorded.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("event_bus_messages_published_total"));
            assert!(rendered.contains("event_bus_receive_faults_total"));
            assert!(rendered.contains("circuit_breaker_state"));
            assert!(rendered.contains("topic_provisioning_total"));
        }
    }
}
