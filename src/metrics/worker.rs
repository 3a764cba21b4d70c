//! Worker phase metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn record_received(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "worker", "messages_received"))
            .increment(count as u64);
    }

    pub fn record_stored(duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "worker", "leads_stored")).increment(1);
        ::metrics::histogram!(phase_metric!(
            histogram,
            "worker",
            "processing_duration_seconds"
        ))
        .record(duration_secs);
    }

    /// A redelivery absorbed by the ledger
    pub fn record_duplicate() {
        ::metrics::counter!(phase_metric!(counter, "worker", "duplicates_absorbed")).increment(1);
    }

    pub fn record_in_flight_skip() {
        ::metrics::counter!(phase_metric!(counter, "worker", "in_flight_skipped")).increment(1);
    }

    pub fn record_retry_scheduled(stage: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "worker", "retries_scheduled"), "stage" => stage)
            .increment(1);
    }

    pub fn record_dead_lettered(stage: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "worker", "dead_lettered"), "stage" => stage)
            .increment(1);
    }

    pub fn record_lost_ownership() {
        ::metrics::counter!(phase_metric!(counter, "worker", "lost_ownership")).increment(1);
    }

    pub fn record_lease_extended() {
        ::metrics::counter!(phase_metric!(counter, "worker", "leases_extended")).increment(1);
    }

    pub fn record_abandoned() {
        ::metrics::counter!(phase_metric!(counter, "worker", "tasks_abandoned")).increment(1);
    }

    pub fn set_in_flight(count: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "worker", "messages_in_flight")).set(count as f64);
    }
}

impl PhaseMetrics for WorkerMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_gauge, describe_histogram};

        describe_counter!(
            phase_metric!(counter, "worker", "messages_received"),
            "Messages leased from the queue"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "leads_stored"),
            "Leads written to storage and committed in the ledger"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "duplicates_absorbed"),
            "Deliveries acknowledged because the lead was already stored"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "in_flight_skipped"),
            "Deliveries left to expire because another attempt holds the lead"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "retries_scheduled"),
            "Deliveries returned to the queue after a transient failure"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "dead_lettered"),
            "Messages moved to the dead-letter store"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "lost_ownership"),
            "Commits refused because the ledger claim was taken over"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "leases_extended"),
            "Lease extensions issued by the lease keeper"
        );
        describe_counter!(
            phase_metric!(counter, "worker", "tasks_abandoned"),
            "Message tasks abandoned after the maximum processing time"
        );
        describe_histogram!(
            phase_metric!(histogram, "worker", "processing_duration_seconds"),
            "Time to process one message up to acknowledgement"
        );
        describe_gauge!(
            phase_metric!(gauge, "worker", "messages_in_flight"),
            "Messages currently being processed by a worker"
        );
    }

    fn phase_name() -> &'static str {
        "worker"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        let counter = |name, help| MetricDoc {
            name,
            metric_type: MetricType::Counter,
            help,
            labels: vec![],
        };
        vec![
            counter(
                phase_metric!(counter, "worker", "messages_received"),
                "Messages leased from the queue",
            ),
            counter(
                phase_metric!(counter, "worker", "leads_stored"),
                "Leads written to storage and committed in the ledger",
            ),
            counter(
                phase_metric!(counter, "worker", "duplicates_absorbed"),
                "Deliveries acknowledged because the lead was already stored",
            ),
            counter(
                phase_metric!(counter, "worker", "in_flight_skipped"),
                "Deliveries left to expire because another attempt holds the lead",
            ),
            MetricDoc {
                name: phase_metric!(counter, "worker", "retries_scheduled"),
                metric_type: MetricType::Counter,
                help: "Deliveries returned to the queue after a transient failure",
                labels: vec!["stage"],
            },
            MetricDoc {
                name: phase_metric!(counter, "worker", "dead_lettered"),
                metric_type: MetricType::Counter,
                help: "Messages moved to the dead-letter store",
                labels: vec!["stage"],
            },
            counter(
                phase_metric!(counter, "worker", "lost_ownership"),
                "Commits refused because the ledger claim was taken over",
            ),
            counter(
                phase_metric!(counter, "worker", "leases_extended"),
                "Lease extensions issued by the lease keeper",
            ),
            counter(
                phase_metric!(counter, "worker", "tasks_abandoned"),
                "Message tasks abandoned after the maximum processing time",
            ),
            MetricDoc {
                name: phase_metric!(histogram, "worker", "processing_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time to process one message up to acknowledgement",
                labels: vec![],
            },
            MetricDoc {
                name: phase_metric!(gauge, "worker", "messages_in_flight"),
                metric_type: MetricType::Gauge,
                help: "Messages currently being processed by a worker",
                labels: vec![],
            },
        ]
    }
}
