use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use super::sqlite::{from_millis, now_millis, SqliteDb};
use crate::app::ports::QueueClient;
use crate::common::constants::MAX_RECEIVE_BATCH;
use crate::common::error::{Dependency, DependencyError};
use crate::domain::{DeadLetter, Lead, QueueMessage, ReceiptHandle};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_messages (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id     TEXT NOT NULL UNIQUE,
    body           TEXT NOT NULL,
    enqueued_at    INTEGER NOT NULL,
    visible_at     INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    receipt        TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_messages_visible ON queue_messages (visible_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_messages_receipt ON queue_messages (receipt);
CREATE TABLE IF NOT EXISTS dead_letters (
    message_id       TEXT PRIMARY KEY,
    body             TEXT NOT NULL,
    reason           TEXT NOT NULL,
    delivery_count   INTEGER NOT NULL,
    enqueued_at      INTEGER NOT NULL,
    dead_lettered_at INTEGER NOT NULL
);
"#;

/// Durable queue in a SQLite file; leases are `visible_at` timestamps
pub struct SqliteQueue {
    db: SqliteDb,
}

impl SqliteQueue {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DependencyError> {
        Ok(Self {
            db: SqliteDb::open(path, Dependency::Queue, SCHEMA)?,
        })
    }

    /// Messages still in circulation, leased or not
    pub fn depth(&self) -> Result<usize, DependencyError> {
        self.db.with_conn(|c| {
            c.query_row("SELECT COUNT(*) FROM queue_messages", [], |r| r.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }

    fn stale(receipt: &ReceiptHandle) -> DependencyError {
        DependencyError::permanent(Dependency::Queue, format!("stale receipt handle {receipt}"))
    }
}

#[async_trait]
impl QueueClient for SqliteQueue {
    async fn enqueue(&self, lead: &Lead) -> Result<String, DependencyError> {
        let body = serde_json::to_string(lead)
            .map_err(|e| DependencyError::permanent(Dependency::Queue, e.to_string()))?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        self.db.with_conn(|c| {
            c.execute(
                "INSERT INTO queue_messages (message_id, body, enqueued_at, visible_at, delivery_count)
                 VALUES (?1, ?2, ?3, ?3, 0)",
                params![message_id, body, now],
            )
        })?;
        Ok(message_id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        lease: Duration,
    ) -> Result<Vec<QueueMessage>, DependencyError> {
        let limit = max_messages.clamp(1, MAX_RECEIVE_BATCH) as i64;
        let now = now_millis();
        let visible_at = now + lease.as_millis() as i64;

        self.db.with_conn(|c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let candidates = {
                let mut stmt = tx.prepare(
                    "SELECT seq, message_id, body, enqueued_at, delivery_count
                     FROM queue_messages WHERE visible_at <= ?1 ORDER BY seq LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![now, limit], |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut out = Vec::with_capacity(candidates.len());
            for (seq, message_id, body, enqueued_at, delivery_count) in candidates {
                let receipt = ReceiptHandle::generate();
                // Conditional on visibility so a concurrent receiver cannot lease it twice
                let leased = tx.execute(
                    "UPDATE queue_messages
                     SET delivery_count = delivery_count + 1, receipt = ?1, visible_at = ?2
                     WHERE seq = ?3 AND visible_at <= ?4",
                    params![receipt.as_str(), visible_at, seq, now],
                )?;
                if leased == 1 {
                    out.push(QueueMessage {
                        message_id,
                        receipt_handle: receipt,
                        body,
                        delivery_count: (delivery_count + 1) as u32,
                        enqueued_at: from_millis(enqueued_at),
                    });
                }
            }
            tx.commit()?;
            Ok(out)
        })
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), DependencyError> {
        let deleted = self.db.with_conn(|c| {
            c.execute(
                "DELETE FROM queue_messages WHERE receipt = ?1",
                params![receipt.as_str()],
            )
        })?;
        if deleted == 0 {
            return Err(Self::stale(receipt));
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        receipt: &ReceiptHandle,
        duration: Duration,
    ) -> Result<(), DependencyError> {
        let visible_at = now_millis() + duration.as_millis() as i64;
        let updated = self.db.with_conn(|c| {
            c.execute(
                "UPDATE queue_messages SET visible_at = ?1 WHERE receipt = ?2",
                params![visible_at, receipt.as_str()],
            )
        })?;
        if updated == 0 {
            return Err(Self::stale(receipt));
        }
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
        let moved = self.db.with_conn(|c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row = tx
                .query_row(
                    "SELECT message_id, body, delivery_count, enqueued_at
                     FROM queue_messages WHERE receipt = ?1",
                    params![receipt.as_str()],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, i64>(2)?,
                            r.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((message_id, body, delivery_count, enqueued_at)) = row else {
                return Ok(false);
            };
            tx.execute(
                "INSERT OR REPLACE INTO dead_letters
                 (message_id, body, reason, delivery_count, enqueued_at, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message_id,
                    body,
                    reason,
                    delivery_count,
                    enqueued_at,
                    Utc::now().timestamp_millis()
                ],
            )?;
            tx.execute(
                "DELETE FROM queue_messages WHERE receipt = ?1",
                params![receipt.as_str()],
            )?;
            tx.commit()?;
            Ok(true)
        })?;
        if !moved {
            return Err(Self::stale(receipt));
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, DependencyError> {
        self.db.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT message_id, body, reason, delivery_count, enqueued_at, dead_lettered_at
                 FROM dead_letters ORDER BY dead_lettered_at, message_id",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(DeadLetter {
                    message_id: r.get(0)?,
                    body: r.get(1)?,
                    reason: r.get(2)?,
                    delivery_count: r.get::<_, i64>(3)? as u32,
                    enqueued_at: from_millis(r.get(4)?),
                    dead_lettered_at: from_millis(r.get(5)?),
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LeadId, LeadPayload};

    fn lead() -> Lead {
        Lead::accepted(
            LeadId::parse("L1").unwrap(),
            LeadPayload::default().with_field("email", "a@b.com"),
            "corr-1".into(),
        )
    }

    #[tokio::test]
    async fn test_receive_ack_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteQueue::open(dir.path().join("queue.db")).unwrap();
        let id = q.enqueue(&lead()).await.unwrap();

        let batch = q.receive(5, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].delivery_count, 1);
        assert_eq!(batch[0].decode_lead().unwrap().lead_id.as_str(), "L1");

        // Leased: invisible to a second receive
        assert!(q.receive(5, Duration::from_secs(30)).await.unwrap().is_empty());

        q.acknowledge(&batch[0].receipt_handle).await.unwrap();
        assert_eq!(q.depth().unwrap(), 0);
        assert!(q.acknowledge(&batch[0].receipt_handle).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_lease_redelivers_with_new_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let q = SqliteQueue::open(dir.path().join("queue.db")).unwrap();
        q.enqueue(&lead()).await.unwrap();

        let first = q.receive(1, Duration::ZERO).await.unwrap().remove(0);
        let second = q.receive(1, Duration::from_secs(30)).await.unwrap().remove(0);
        assert_eq!(second.delivery_count, 2);
        assert!(q.extend_lease(&first.receipt_handle, Duration::ZERO).await.is_err());
        q.extend_lease(&second.receipt_handle, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(q.receive(1, Duration::from_secs(30)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letters_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let q = SqliteQueue::open(&path).unwrap();
            q.enqueue(&lead()).await.unwrap();
            let msg = q.receive(1, Duration::from_secs(30)).await.unwrap().remove(0);
            q.dead_letter(&msg.receipt_handle, "writing: permanent storage failure")
                .await
                .unwrap();
        }
        let q = SqliteQueue::open(&path).unwrap();
        assert_eq!(q.depth().unwrap(), 0);
        let dead = q.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "writing: permanent storage failure");
        assert_eq!(dead[0].delivery_count, 1);
    }
}
