//! Metrics export for Parley.
//!
//! The relay records through the `metrics` facade; this module installs
//! the Prometheus exporter that serves them.

use crate::config::MetricsConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Initialize the metrics system.
///
/// The exporter is installed (when enabled) before any metric is described;
/// descriptions sent before a recorder exists are dropped.
pub fn init_metrics(config: &MetricsConfig) {
    if config.enabled {
        if let Err(e) = start_metrics_server(config.port) {
            warn!(error = %e, "Failed to start metrics server");
        }
    }

    parley_core::metrics::describe();
    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptions_reach_installed_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            parley_core::metrics::describe();
            parley_core::metrics::record_connection();
        });

        let rendered = handle.render();
        assert!(rendered.contains("# HELP parley_connections_total"));
        assert!(rendered.contains("parley_connections_total 1"));
    }
}
