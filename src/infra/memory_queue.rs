use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::app::ports::QueueClient;
use crate::common::constants::MAX_RECEIVE_BATCH;
use crate::common::error::{Dependency, DependencyError};
use crate::domain::{DeadLetter, Lead, QueueMessage, ReceiptHandle};

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<Entry>,
    dead_letters: Vec<DeadLetter>,
}

/// Process-local queue with lease semantics; visibility uses tokio time so tests can pause it
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages still in circulation, leased or not
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a raw body; lets tests inject bodies that do not decode
    pub fn enqueue_raw(&self, body: impl Into<String>) -> String {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.lock().messages.push(Entry {
            message_id: message_id.clone(),
            body: body.into(),
            enqueued_at: Utc::now(),
            delivery_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        message_id
    }
}

fn stale(receipt: &ReceiptHandle) -> DependencyError {
    DependencyError::permanent(
        Dependency::Queue,
        format!("stale receipt handle {receipt}"),
    )
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn enqueue(&self, lead: &Lead) -> Result<String, DependencyError> {
        let body = serde_json::to_string(lead)
            .map_err(|e| DependencyError::permanent(Dependency::Queue, e.to_string()))?;
        Ok(self.enqueue_raw(body))
    }

    async fn receive(
        &self,
        max_messages: usize,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, DependencyError> {
        let now = Instant::now();
        let limit = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let mut state = self.lock();
        let mut out = Vec::new();
        for entry in state.messages.iter_mut() {
            if out.len() >= limit {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let receipt = ReceiptHandle::generate();
            entry.delivery_count += 1;
            entry.visible_at = now + lease;
            entry.receipt = Some(receipt.clone());
            out.push(QueueMessage {
                message_id: entry.message_id.clone(),
                receipt_handle: receipt,
                body: entry.body.clone(),
                delivery_count: entry.delivery_count,
                enqueued_at: entry.enqueued_at,
            });
        }
        Ok(out)
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), DependencyError> {
        let mut state = self.lock();
        let idx = state
            .messages
            .iter()
            .position(|e| e.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| stale(receipt))?;
        state.messages.remove(idx);
        Ok(())
    }

    async fn extend_lease(
        &self,
        receipt: &ReceiptHandle,
        duration: Duration,
    ) -> Result<(), DependencyError> {
        let mut state = self.lock();
        let entry = state
            .messages
            .iter_mut()
            .find(|e| e.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| stale(receipt))?;
        entry.visible_at = Instant::now() + duration;
        Ok(())
    }

    async fn dead_letter(
        &self,
        receipt: &ReceiptHandle,
        reason: &str,
    ) -> Result<(), DependencyError> {
        if reason.trim().is_empty() {
            return Err(DependencyError::permanent(
                Dependency::Queue,
                "dead letter reason must not be empty",
            ));
        }
        let mut state = self.lock();
        let idx = state
            .messages
            .iter()
            .position(|e| e.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| stale(receipt))?;
        let entry = state.messages.remove(idx);
        state.dead_letters.push(DeadLetter {
            message_id: entry.message_id,
            body: entry.body,
            reason: reason.to_string(),
            delivery_count: entry.delivery_count,
            enqueued_at: entry.enqueued_at,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, DependencyError> {
        Ok(self.lock().dead_letters.clone())
    }
}
