//! Metrics for the lead pipeline
//!
//! Each pipeline phase owns its metric names in a dedicated submodule. Recording goes through
//! the `metrics` facade, so nothing is exported unless a recorder was installed by
//! [`init_metrics`].

pub mod gateway;
pub mod registry;
pub mod resilience;
pub mod worker;

pub use gateway::GatewayMetrics;
pub use resilience::ResilienceMetrics;
pub use worker::WorkerMetrics;

use std::net::SocketAddr;
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

use crate::config::MetricsConfig;

static INIT: Once = Once::new();
static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and register every phase's metrics
///
/// Idempotent. The HTTP listener is only started when a listen address is configured; the
/// handle is kept either way so `/metrics` on the gateway can render a snapshot.
pub fn init_metrics(config: &MetricsConfig) {
    if !config.enabled {
        return;
    }
    INIT.call_once(|| {
        let mut builder = metrics_exporter_prometheus::PrometheusBuilder::new();

        if let Some(addr_str) = config.listen_addr.as_deref() {
            match addr_str.parse::<SocketAddr>() {
                Ok(addr) => {
                    builder = builder.with_http_listener(addr);
                    info!("Prometheus HTTP exporter listening on http://{}/metrics", addr);
                }
                Err(e) => warn!("Invalid metrics listen address '{}': {}", addr_str, e),
            }
        }

        match builder.install_recorder() {
            Ok(handle) => {
                if HANDLE.set(handle).is_err() {
                    warn!("Prometheus handle was already set");
                }
                registry::register_all_metrics();
                info!("Prometheus recorder installed");
            }
            Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
        }
    });
}

/// Render the current snapshot in the Prometheus text format
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Registration and documentation of one phase's metrics
pub trait PhaseMetrics {
    /// Describe every metric of the phase with the installed recorder
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    #[allow(dead_code)]
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Build a metric name following `leads_{phase}_{name}[_total]`
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("leads_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("leads_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("leads_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
