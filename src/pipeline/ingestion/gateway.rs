//! Synchronous half of the pipeline: throttle, validate, identify, protect, enqueue.
//!
//! The gateway never touches lead storage. A receipt means the lead is durably queued, not
//! stored.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::rate_limiter::RateLimiter;
use crate::app::ports::QueueClient;
use crate::common::error::SubmitError;
use crate::domain::schema::validate_submission;
use crate::domain::{AcceptanceReceipt, Lead, LeadId, LeadStatus};
use crate::metrics::GatewayMetrics;
use crate::pipeline::crypto::{CryptoBoundary, Purpose};
use crate::pipeline::resilience::ResiliencePolicy;

pub struct IngestionGateway {
    rate_limiter: RateLimiter,
    crypto: Arc<CryptoBoundary>,
    queue: Arc<dyn QueueClient>,
    queue_policy: Arc<ResiliencePolicy>,
}

impl IngestionGateway {
    pub fn new(
        rate_limiter: RateLimiter,
        crypto: Arc<CryptoBoundary>,
        queue: Arc<dyn QueueClient>,
        queue_policy: Arc<ResiliencePolicy>,
    ) -> Self {
        Self {
            rate_limiter,
            crypto,
            queue,
            queue_policy,
        }
    }

    pub async fn submit(
        &self,
        caller: &str,
        correlation_id: Option<String>,
        body: &Value,
    ) -> Result<AcceptanceReceipt, SubmitError> {
        let started = Instant::now();

        if let Err(limited) = self.rate_limiter.try_acquire(caller) {
            GatewayMetrics::record_rate_limited();
            debug!(caller, retry_after_ms = limited.retry_after.as_millis() as u64, "Rate limited");
            return Err(limited.into());
        }

        let submission = validate_submission(body).map_err(|invalid| {
            GatewayMetrics::record_validation_rejected(invalid.violations.len());
            debug!(violations = invalid.violations.len(), "Submission rejected");
            invalid
        })?;

        let lead_id = submission
            .lead_id
            .unwrap_or_else(|| LeadId::derive(&submission.payload));
        let correlation_id = correlation_id
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let protected = self
            .crypto
            .encrypt_sensitive(&lead_id, Purpose::Transit, &submission.payload)
            .await
            .map_err(|e| self.unavailable(&lead_id, e))?;

        let lead = Lead::accepted(lead_id.clone(), protected, correlation_id.clone());
        let message_id = self
            .queue_policy
            .call("enqueue", || self.queue.enqueue(&lead))
            .await
            .map_err(|e| self.unavailable(&lead_id, e.into()))?;

        GatewayMetrics::record_enqueued();
        GatewayMetrics::record_lead_accepted(started.elapsed().as_secs_f64());
        info!(
            lead_id = %lead_id,
            message_id = %message_id,
            correlation_id = %correlation_id,
            "Lead accepted"
        );

        Ok(AcceptanceReceipt {
            lead_id,
            message_id,
            correlation_id,
            status: LeadStatus::Accepted,
            accepted_at: Utc::now(),
        })
    }

    fn unavailable(
        &self,
        lead_id: &LeadId,
        err: crate::common::error::PipelineError,
    ) -> SubmitError {
        GatewayMetrics::record_unavailable();
        warn!(lead_id = %lead_id, error = %err, "Lead could not be accepted");
        SubmitError::Unavailable(err)
    }
}
