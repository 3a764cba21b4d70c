use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::app::ports::{LeadStore, PutOutcome};
use crate::common::constants::MEMORY_STORAGE_PREFIX;
use crate::common::error::{Dependency, DependencyError};
use crate::domain::{LeadId, StoredLead};

/// In-memory lead storage for development and tests
#[derive(Debug, Default)]
pub struct InMemoryLeadStore {
    records: Mutex<BTreeMap<LeadId, StoredLead>>,
    creates: AtomicUsize,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<LeadId, StoredLead>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of puts that actually created a record
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn storage_ref(lead_id: &LeadId) -> String {
        format!("{MEMORY_STORAGE_PREFIX}{lead_id}")
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn put_if_absent(&self, lead: &StoredLead) -> Result<PutOutcome, DependencyError> {
        let storage_ref = Self::storage_ref(&lead.lead_id);
        let mut records = self.lock();
        if records.contains_key(&lead.lead_id) {
            return Ok(PutOutcome::AlreadyExists { storage_ref });
        }
        records.insert(lead.lead_id.clone(), lead.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(PutOutcome::Created { storage_ref })
    }

    async fn get(&self, lead_id: &LeadId) -> Result<Option<StoredLead>, DependencyError> {
        Ok(self.lock().get(lead_id).cloned())
    }

    async fn scan(
        &self,
        after: Option<&LeadId>,
        limit: usize,
    ) -> Result<Vec<StoredLead>, DependencyError> {
        let records = self.lock();
        let lower = match after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };
        Ok(records
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, lead)| lead.clone())
            .collect())
    }

    async fn replace(&self, lead: &StoredLead) -> Result<(), DependencyError> {
        let mut records = self.lock();
        match records.get_mut(&lead.lead_id) {
            Some(existing) => {
                *existing = lead.clone();
                Ok(())
            }
            None => Err(DependencyError::permanent(
                Dependency::Storage,
                format!("no stored record for {}", lead.lead_id),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Lead, LeadPayload};

    fn stored(id: &str) -> StoredLead {
        let lead = Lead::accepted(
            LeadId::parse(id).unwrap(),
            LeadPayload::default(),
            "corr".into(),
        );
        StoredLead::from_lead(&lead, LeadPayload::default())
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_first_record() {
        let store = InMemoryLeadStore::new();
        let first = store.put_if_absent(&stored("L1")).await.unwrap();
        let second = store.put_if_absent(&stored("L1")).await.unwrap();
        assert!(matches!(first, PutOutcome::Created { .. }));
        assert!(matches!(second, PutOutcome::AlreadyExists { .. }));
        assert_eq!(first.storage_ref(), second.storage_ref());
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_pages_in_id_order() {
        let store = InMemoryLeadStore::new();
        for id in ["c", "a", "b"] {
            store.put_if_absent(&stored(id)).await.unwrap();
        }
        let page = store.scan(None, 2).await.unwrap();
        let ids: Vec<_> = page.iter().map(|l| l.lead_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        let rest = store.scan(Some(&page[1].lead_id), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].lead_id.as_str(), "c");
    }

    #[tokio::test]
    async fn test_replace_requires_existing_record() {
        let store = InMemoryLeadStore::new();
        assert!(store.replace(&stored("L1")).await.is_err());
    }
}
