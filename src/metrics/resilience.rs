//! Retry and circuit breaker metrics, labelled by dependency

use crate::common::error::Dependency;
use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct ResilienceMetrics;

impl ResilienceMetrics {
    pub fn record_retry(dependency: Dependency) {
        ::metrics::counter!(
            phase_metric!(counter, "resilience", "retries"),
            "dependency" => dependency.as_str()
        )
        .increment(1);
    }

    pub fn record_exhausted(dependency: Dependency) {
        ::metrics::counter!(
            phase_metric!(counter, "resilience", "retries_exhausted"),
            "dependency" => dependency.as_str()
        )
        .increment(1);
    }

    pub fn record_circuit_rejected(dependency: Dependency) {
        ::metrics::counter!(
            phase_metric!(counter, "resilience", "circuit_rejections"),
            "dependency" => dependency.as_str()
        )
        .increment(1);
    }

    /// 0 closed, 1 half-open, 2 open
    pub fn set_circuit_state(dependency: Dependency, state: f64) {
        ::metrics::gauge!(
            phase_metric!(gauge, "resilience", "circuit_state"),
            "dependency" => dependency.as_str()
        )
        .set(state);
    }
}

impl PhaseMetrics for ResilienceMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_gauge};

        describe_counter!(
            phase_metric!(counter, "resilience", "retries"),
            "Dependency calls retried after a transient failure"
        );
        describe_counter!(
            phase_metric!(counter, "resilience", "retries_exhausted"),
            "Dependency calls that failed after the whole retry budget"
        );
        describe_counter!(
            phase_metric!(counter, "resilience", "circuit_rejections"),
            "Dependency calls rejected by an open circuit"
        );
        describe_gauge!(
            phase_metric!(gauge, "resilience", "circuit_state"),
            "Circuit state per dependency (0 closed, 1 half-open, 2 open)"
        );
    }

    fn phase_name() -> &'static str {
        "resilience"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "resilience", "retries"),
                metric_type: MetricType::Counter,
                help: "Dependency calls retried after a transient failure",
                labels: vec!["dependency"],
            },
            MetricDoc {
                name: phase_metric!(counter, "resilience", "retries_exhausted"),
                metric_type: MetricType::Counter,
                help: "Dependency calls that failed after the whole retry budget",
                labels: vec!["dependency"],
            },
            MetricDoc {
                name: phase_metric!(counter, "resilience", "circuit_rejections"),
                metric_type: MetricType::Counter,
                help: "Dependency calls rejected by an open circuit",
                labels: vec!["dependency"],
            },
            MetricDoc {
                name: phase_metric!(gauge, "resilience", "circuit_state"),
                metric_type: MetricType::Gauge,
                help: "Circuit state per dependency (0 closed, 1 half-open, 2 open)",
                labels: vec!["dependency"],
            },
        ]
    }
}
