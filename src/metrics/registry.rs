//! Registration of every phase's metrics with conflict detection

use crate::metrics::{MetricDoc, PhaseMetrics};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub fn register_all_metrics() {
    let mut all_metrics = HashMap::new();

    register_phase_metrics::<super::gateway::GatewayMetrics>(&mut all_metrics);
    register_phase_metrics::<super::worker::WorkerMetrics>(&mut all_metrics);
    register_phase_metrics::<super::resilience::ResilienceMetrics>(&mut all_metrics);

    info!(
        "Registered {} total metrics across all phases",
        all_metrics.len()
    );
}

/// Returns the names that were already claimed by an earlier phase
fn register_phase_metrics<T: PhaseMetrics>(
    all_metrics: &mut HashMap<&'static str, (&'static str, MetricDoc)>,
) -> Vec<&'static str> {
    T::register_metrics();
    let phase_name = T::phase_name();
    let mut conflicts = Vec::new();

    for doc in T::metrics_documentation() {
        if extract_phase_from_metric_name(doc.name) != phase_name {
            warn!(
                "Metric '{}' does not carry the prefix of phase '{}'",
                doc.name, phase_name
            );
        }
        if let Some((owner, _)) = all_metrics.get(doc.name) {
            warn!(
                "Metric name conflict detected: '{}' is defined in both '{}' and '{}'",
                doc.name, owner, phase_name
            );
            conflicts.push(doc.name);
        } else {
            debug!("Registered metric {} ({:?})", doc.name, doc.metric_type);
            all_metrics.insert(doc.name, (phase_name, doc));
        }
    }
    conflicts
}

/// "leads_worker_leads_stored_total" -> "worker"
fn extract_phase_from_metric_name(metric_name: &str) -> &str {
    metric_name
        .strip_prefix("leads_")
        .and_then(|rest| rest.split_once('_'))
        .map(|(phase, _)| phase)
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{GatewayMetrics, ResilienceMetrics, WorkerMetrics};

    #[test]
    fn test_extract_phase_from_metric_name() {
        assert_eq!(
            extract_phase_from_metric_name("leads_gateway_leads_accepted_total"),
            "gateway"
        );
        assert_eq!(
            extract_phase_from_metric_name("leads_worker_messages_in_flight"),
            "worker"
        );
        assert_eq!(extract_phase_from_metric_name("other_metric"), "unknown");
    }

    #[test]
    fn test_phases_do_not_conflict() {
        let mut all = HashMap::new();
        assert!(register_phase_metrics::<GatewayMetrics>(&mut all).is_empty());
        assert!(register_phase_metrics::<WorkerMetrics>(&mut all).is_empty());
        assert!(register_phase_metrics::<ResilienceMetrics>(&mut all).is_empty());

        // Registering a phase twice reports every one of its names
        let again = register_phase_metrics::<GatewayMetrics>(&mut all);
        assert_eq!(again.len(), GatewayMetrics::metrics_documentation().len());
    }
}
