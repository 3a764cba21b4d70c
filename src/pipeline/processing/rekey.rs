//! Re-wrap stored leads after a master key rotation.

use tracing::{info, warn};

use crate::app::ports::LeadStore;
use crate::common::error::PipelineError;
use crate::pipeline::crypto::CryptoBoundary;
use crate::pipeline::resilience::ResiliencePolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RekeyReport {
    pub scanned: usize,
    pub rewrapped: usize,
    pub failed: usize,
}

/// Walk storage in lead-id order and move every field off stale key versions.
/// A lead that cannot be re-keyed is counted and skipped; a failed scan aborts.
pub async fn rekey_stored_leads(
    store: &dyn LeadStore,
    crypto: &CryptoBoundary,
    storage_policy: &ResiliencePolicy,
    page_size: usize,
) -> Result<RekeyReport, PipelineError> {
    let mut report = RekeyReport::default();
    let mut cursor = None;

    loop {
        let page = storage_policy
            .call("scan", || store.scan(cursor.as_ref(), page_size.max(1)))
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(last.lead_id.clone());

        for lead in &page {
            report.scanned += 1;
            let (payload, changed) = match crypto.rewrap(&lead.lead_id, &lead.payload).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(lead_id = %lead.lead_id, error = %e, "Re-key failed");
                    report.failed += 1;
                    continue;
                }
            };
            if !changed {
                continue;
            }
            let mut updated = lead.clone();
            updated.payload = payload;
            match storage_policy.call("replace", || store.replace(&updated)).await {
                Ok(()) => report.rewrapped += 1,
                Err(e) => {
                    warn!(lead_id = %lead.lead_id, error = %e, "Re-keyed record not saved");
                    report.failed += 1;
                }
            }
        }
    }

    info!(
        scanned = report.scanned,
        rewrapped = report.rewrapped,
        failed = report.failed,
        "Re-key finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::aead;
    use crate::common::error::Dependency;
    use crate::domain::{FieldValue, Lead, LeadId, LeadPayload, StoredLead};
    use crate::infra::{InMemoryLeadStore, LocalKms};
    use crate::pipeline::crypto::Purpose;
    use crate::pipeline::resilience::PolicyConfig;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rekey_after_rotation() {
        let kms = Arc::new(LocalKms::ephemeral("local/test", "v1"));
        let policy = Arc::new(ResiliencePolicy::new(
            Dependency::KeyManagement,
            &PolicyConfig::default(),
        ));
        let crypto = CryptoBoundary::new(kms.clone(), policy, ["email"]);
        let storage_policy = ResiliencePolicy::new(Dependency::Storage, &PolicyConfig::default());
        let store = InMemoryLeadStore::new();

        for i in 0..5 {
            let lead_id = LeadId::parse(&format!("L{i}")).unwrap();
            let payload = crypto
                .encrypt_sensitive(
                    &lead_id,
                    Purpose::Storage,
                    &LeadPayload::default().with_field("email", format!("u{i}@x.io")),
                )
                .await
                .unwrap();
            let lead = Lead::accepted(lead_id, payload.clone(), "c".into());
            store
                .put_if_absent(&StoredLead::from_lead(&lead, payload))
                .await
                .unwrap();
        }

        let report = rekey_stored_leads(&store, &crypto, &storage_policy, 2).await.unwrap();
        assert_eq!(report, RekeyReport { scanned: 5, rewrapped: 0, failed: 0 });

        kms.rotate("v2", aead::random_key());
        let report = rekey_stored_leads(&store, &crypto, &storage_policy, 2).await.unwrap();
        assert_eq!(report.rewrapped, 5);

        let lead_id = LeadId::parse("L3").unwrap();
        let stored = store.get(&lead_id).await.unwrap().unwrap();
        let FieldValue::Encrypted(email) = &stored.payload.fields["email"] else {
            panic!("email must stay encrypted");
        };
        assert_eq!(email.key_version, "v2");
        let plain = crypto.decrypt_sensitive(&lead_id, &stored.payload).await.unwrap();
        assert_eq!(plain.text("email"), Some("u3@x.io"));
    }
}
