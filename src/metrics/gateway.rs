//! Gateway phase metrics: accepted, rejected and throttled submissions.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct GatewayMetrics;

impl GatewayMetrics {
    pub fn record_lead_accepted(duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "gateway", "leads_accepted")).increment(1);
        ::metrics::histogram!(phase_metric!(
            histogram,
            "gateway",
            "submit_duration_seconds"
        ))
        .record(duration_secs);
    }

    pub fn record_validation_rejected(violations: usize) {
        ::metrics::counter!(phase_metric!(counter, "gateway", "validation_rejected")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "gateway", "violations_per_rejection"))
            .record(violations as f64);
    }

    pub fn record_rate_limited() {
        ::metrics::counter!(phase_metric!(counter, "gateway", "rate_limited")).increment(1);
    }

    /// Enqueue failed after the queue policy gave up
    pub fn record_unavailable() {
        ::metrics::counter!(phase_metric!(counter, "gateway", "unavailable")).increment(1);
    }

    pub fn record_enqueued() {
        ::metrics::counter!(phase_metric!(counter, "gateway", "queue_publish")).increment(1);
    }
}

impl PhaseMetrics for GatewayMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_histogram};

        describe_counter!(
            phase_metric!(counter, "gateway", "leads_accepted"),
            "Submissions accepted and enqueued"
        );
        describe_counter!(
            phase_metric!(counter, "gateway", "validation_rejected"),
            "Submissions rejected by schema validation"
        );
        describe_counter!(
            phase_metric!(counter, "gateway", "rate_limited"),
            "Submissions rejected by the per-caller rate limiter"
        );
        describe_counter!(
            phase_metric!(counter, "gateway", "unavailable"),
            "Submissions refused because a dependency was unavailable"
        );
        describe_counter!(
            phase_metric!(counter, "gateway", "queue_publish"),
            "Messages published to the lead queue"
        );
        describe_histogram!(
            phase_metric!(histogram, "gateway", "submit_duration_seconds"),
            "Time from request to enqueue acknowledgement"
        );
        describe_histogram!(
            phase_metric!(histogram, "gateway", "violations_per_rejection"),
            "Number of field violations in a rejected submission"
        );
    }

    fn phase_name() -> &'static str {
        "gateway"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "gateway", "leads_accepted"),
                metric_type: MetricType::Counter,
                help: "Submissions accepted and enqueued",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "validation_rejected"),
                metric_type: MetricType::Counter,
                help: "Submissions rejected by schema validation",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "rate_limited"),
                metric_type: MetricType::Counter,
                help: "Submissions rejected by the per-caller rate limiter",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "unavailable"),
                metric_type: MetricType::Counter,
                help: "Submissions refused because a dependency was unavailable",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "queue_publish"),
                metric_type: MetricType::Counter,
                help: "Messages published to the lead queue",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "gateway", "submit_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time from request to enqueue acknowledgement",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(histogram, "gateway", "violations_per_rejection"),
                metric_type: MetricType::Histogram,
                help: "Number of field violations in a rejected submission",
                labels: vec![],
            },
        ]
    }
}
