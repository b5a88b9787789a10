//! Prometheus metrics for the bus.
//!
//! Every bus records into the global `metrics` recorder. Installing
//! [`MetricsServer`] exposes them for scraping; without it the calls are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use context_bus_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

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

/// Prometheus scrape endpoint for bus metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built, and
    /// [`MetricsError::Install`] if a global recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.000_1, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            // ExporterError implements neither Display nor Debug in
            // metrics-exporter-prometheus 0.15, so it cannot be logged.
            if let Err(_e) = exporter.await {
                tracing::error!("Metrics listener stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "context_bus_events_published_total",
        "Events published with at least one bound executor"
    );
    describe_counter!(
        "context_bus_events_dropped_total",
        "Events published with no bound executor"
    );
    describe_counter!(
        "context_bus_tasks_started_total",
        "Handler tasks started"
    );
    describe_counter!(
        "context_bus_tasks_failed_total",
        "Drains aborted by a failing handler task"
    );
    describe_counter!(
        "context_bus_batches_drained_total",
        "Batches awaited to completion"
    );
    describe_histogram!(
        "context_bus_batch_duration_seconds",
        "Time spent awaiting one batch"
    );
    describe_counter!(
        "context_bus_sessions_committed_total",
        "Sessions committed after a successful persistence handler"
    );
    describe_counter!(
        "context_bus_sessions_rolled_back_total",
        "Sessions rolled back after a failed persistence handler"
    );
}

/// Recorder for bus activity.
pub struct BusMetrics;

impl BusMetrics {
    /// Record a publish that started `tasks` handler tasks.
    pub fn record_publish(tasks: usize) {
        counter!("context_bus_events_published_total").increment(1);
        counter!("context_bus_tasks_started_total")
            .increment(u64::try_from(tasks).unwrap_or(u64::MAX));
    }

    /// Record a publish with no bound executor.
    pub fn record_dropped() {
        counter!("context_bus_events_dropped_total").increment(1);
    }

    /// Record a batch that completed.
    pub fn record_batch(duration: Duration) {
        counter!("context_bus_batches_drained_total").increment(1);
        histogram!("context_bus_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed batch.
    pub fn record_failure() {
        counter!("context_bus_tasks_failed_total").increment(1);
    }

    /// Record a committed session.
    pub fn record_commit() {
        counter!("context_bus_sessions_committed_total").increment(1);
    }

    /// Record a rolled back session.
    pub fn record_rollback() {
        counter!("context_bus_sessions_rolled_back_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_not_started_renders_nothing() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn second_install_is_rejected() {
        let mut first = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        first.start().unwrap();
        BusMetrics::record_publish(2);
        assert!(first.render().unwrap().contains("context_bus_tasks_started_total"));

        let mut second = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(matches!(second.start(), Err(MetricsError::Install(_))));
        assert!(second.render().is_none());
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        BusMetrics::record_publish(3);
        BusMetrics::record_dropped();
        BusMetrics::record_batch(Duration::from_millis(2));
        BusMetrics::record_failure();
        BusMetrics::record_commit();
        BusMetrics::record_rollback();
    }
}
