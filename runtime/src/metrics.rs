//! Prometheus metrics for the dispatcher and the outbox.
//!
//! The runtime records through the `metrics` facade whether or not a recorder is
//! installed. [`MetricsServer`] installs a Prometheus recorder and describes every metric:
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `courier_dispatch_total` | counter | `operation`, `outcome` |
//! | `courier_pipeline_build_total` | counter | `outcome` |
//! | `courier_outbox_deposit_total` | counter | `outcome` |
//! | `courier_outbox_clear_total` | counter | `outcome` |
//! | `courier_outbox_outstanding` | gauge | |
//! | `courier_sweep_duration_seconds` | histogram | |
//! | `circuit_breaker_state_change_total` | counter | `from`, `to` |
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(rendered) = server.render() {
//!     println!("{rendered}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
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

/// Prometheus recorder for the courier metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server that will report `addr` as its scrape address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// Succeeds without a handle when another recorder is already installed.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] when the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Scrape address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The Prometheus handle, once installed.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every courier metric to the installed recorder.
pub fn register_metrics() {
    describe_counter!(
        "courier_dispatch_total",
        "Requests dispatched through send, publish and post, by outcome"
    );
    describe_counter!(
        "courier_pipeline_build_total",
        "Pipelines built, by outcome"
    );
    describe_counter!(
        "courier_outbox_deposit_total",
        "Messages deposited to the outbox, by outcome"
    );
    describe_counter!(
        "courier_outbox_clear_total",
        "Producer sends attempted for outbox messages, by outcome"
    );
    describe_gauge!(
        "courier_outbox_outstanding",
        "Outbox messages not yet dispatched"
    );
    describe_histogram!(
        "courier_sweep_duration_seconds",
        "Time taken by one outbox sweep"
    );
    describe_counter!(
        "circuit_breaker_state_change_total",
        "Circuit breaker state transitions"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle_until_installed() {
        let Ok(addr) = "127.0.0.1:0".parse() else {
            unreachable!("valid socket address");
        };
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn start_is_idempotent() {
        let Ok(addr) = "127.0.0.1:0".parse() else {
            unreachable!("valid socket address");
        };
        let mut first = MetricsServer::new(addr);
        let mut second = MetricsServer::new(addr);

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());

        metrics::counter!(
            "courier_dispatch_total",
            "operation" => "send",
            "outcome" => "success"
        )
        .increment(1);
        // only the server that installed the recorder can render
        if let Some(rendered) = first.render().or_else(|| second.render()) {
            assert!(rendered.contains("courier_dispatch_total"));
        }
    }
}
