//! Persistent priority-FIFO message queue.
//!
//! Each agent has an inbox of `pending` messages. Fetch order is
//! `(priority DESC, created_at ASC)`, with insertion order (rowid) breaking
//! ties so the result is a stable sort of the pending set. Status moves are
//! forward-only: `pending -> delivered -> processed`, with `pending ->
//! processed` allowed for consumers that skip the delivery step.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::models::{BroadcastOutcome, MessageRecord, MessageStatus, QueueStatistics};
use crate::store::{with_transient_retry, Store};
use crate::KernelError;

#[derive(Debug, Clone)]
pub struct MessageQueue {
    store: Store,
    retry_limit: u32,
}

impl MessageQueue {
    pub fn new(store: Store, retry_limit: u32) -> Self {
        Self { store, retry_limit }
    }

    /// Enqueue one message for `recipient`.
    pub async fn send(
        &self,
        sender: Uuid,
        recipient: Uuid,
        payload: serde_json::Value,
        priority: i64,
        thread: Option<Uuid>,
    ) -> Result<MessageRecord, KernelError> {
        with_transient_retry("queue.send", self.retry_limit, || {
            Box::pin(self.try_send(sender, recipient, payload.clone(), priority, thread))
        })
        .await
    }

    async fn try_send(
        &self,
        sender: Uuid,
        recipient: Uuid,
        payload: serde_json::Value,
        priority: i64,
        thread: Option<Uuid>,
    ) -> Result<MessageRecord, KernelError> {
        let mut tx = self.store.pool().begin().await?;
        for (agent, kind) in [(sender, "sender"), (recipient, "recipient")] {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM agents WHERE id = ?1")
                .bind(agent)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                tracing::debug!(agent = %agent, kind, "message endpoint missing");
                return Err(KernelError::not_found("agent", agent));
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, recipient_id, payload, priority, status, thread_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)
            "#,
        )
        .bind(id)
        .bind(sender)
        .bind(recipient)
        .bind(serde_json::to_string(&payload)?)
        .bind(priority)
        .bind(thread)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(MessageRecord {
            id,
            sender,
            recipient,
            payload,
            priority,
            status: MessageStatus::Pending,
            thread,
            created_at: now,
            processed_at: None,
        })
    }

    /// Enqueue the same payload for every recipient. Failures are collected
    /// per recipient instead of aborting the whole broadcast.
    pub async fn send_broadcast(
        &self,
        sender: Uuid,
        recipients: &[Uuid],
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<BroadcastOutcome, KernelError> {
        let mut outcome = BroadcastOutcome::default();
        for recipient in recipients {
            match self
                .send(sender, *recipient, payload.clone(), priority, None)
                .await
            {
                Ok(message) => outcome.sent.push(message),
                Err(err) => {
                    tracing::warn!(recipient = %recipient, error = %err, "broadcast delivery failed");
                    outcome.failed.push((*recipient, err.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    /// Fetch up to `limit` pending messages for `recipient` without changing
    /// their status.
    pub async fn receive(&self, recipient: Uuid, limit: i64) -> Result<Vec<MessageRecord>, KernelError> {
        let rows = sqlx::query(
            r#"
            SELECT id, sender_id, recipient_id, payload, priority, status, thread_id, created_at, processed_at
            FROM messages
            WHERE recipient_id = ?1 AND status = 'pending'
            ORDER BY priority DESC, created_at ASC, rowid ASC
            LIMIT ?2
            "#,
        )
        .bind(recipient)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Fetch and transition to `delivered` in one transaction, for consumers
    /// that need at-most-once hand-off.
    pub async fn receive_and_mark_delivered(
        &self,
        recipient: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, KernelError> {
        with_transient_retry("queue.receive_and_mark_delivered", self.retry_limit, || {
            Box::pin(self.try_receive_and_mark_delivered(recipient, limit))
        })
        .await
    }

    async fn try_receive_and_mark_delivered(
        &self,
        recipient: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, KernelError> {
        let mut tx = self.store.pool().begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, sender_id, recipient_id, payload, priority, status, thread_id, created_at, processed_at
            FROM messages
            WHERE recipient_id = ?1 AND status = 'pending'
            ORDER BY priority DESC, created_at ASC, rowid ASC
            LIMIT ?2
            "#,
        )
        .bind(recipient)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        let mut messages: Vec<MessageRecord> =
            rows.iter().map(message_from_row).collect::<Result<_, _>>()?;

        for message in &mut messages {
            sqlx::query("UPDATE messages SET status = 'delivered' WHERE id = ?1")
                .bind(message.id)
                .execute(&mut *tx)
                .await?;
            message.status = MessageStatus::Delivered;
        }
        tx.commit().await?;
        Ok(messages)
    }

    /// `pending -> delivered`.
    pub async fn mark_delivered(&self, id: Uuid) -> Result<MessageRecord, KernelError> {
        with_transient_retry("queue.mark_delivered", self.retry_limit, || {
            Box::pin(self.try_transition(id, MessageStatus::Delivered))
        })
        .await
    }

    /// `pending|delivered -> processed`, stamping `processed_at`. A repeated
    /// call fails with an invalid-transition error rather than silently
    /// rewriting the timestamp.
    pub async fn mark_processed(&self, id: Uuid) -> Result<MessageRecord, KernelError> {
        with_transient_retry("queue.mark_processed", self.retry_limit, || {
            Box::pin(self.try_transition(id, MessageStatus::Processed))
        })
        .await
    }

    async fn try_transition(
        &self,
        id: Uuid,
        next: MessageStatus,
    ) -> Result<MessageRecord, KernelError> {
        let mut tx = self.store.pool().begin().await?;
        let row = sqlx::query(
            r#"
            SELECT id, sender_id, recipient_id, payload, priority, status, thread_id, created_at, processed_at
            FROM messages WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut message = row
            .as_ref()
            .map(message_from_row)
            .transpose()?
            .ok_or_else(|| KernelError::not_found("message", id))?;

        if !message.status.can_advance_to(next) {
            return Err(KernelError::InvalidTransition(format!(
                "message {id} cannot move from {} to {}",
                message.status.as_str(),
                next.as_str()
            )));
        }

        let processed_at = (next == MessageStatus::Processed).then(Utc::now);
        let updated = sqlx::query(
            "UPDATE messages SET status = ?2, processed_at = ?3 WHERE id = ?1 AND status = ?4",
        )
        .bind(id)
        .bind(next.as_str())
        .bind(processed_at)
        .bind(message.status.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(KernelError::Conflict(format!(
                "message {id} changed concurrently"
            )));
        }
        tx.commit().await?;

        message.status = next;
        message.processed_at = processed_at;
        Ok(message)
    }

    /// Chronological two-way thread between `a` and `b`.
    pub async fn conversation(
        &self,
        a: Uuid,
        b: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, KernelError> {
        let rows = sqlx::query(
            r#"
            SELECT id, sender_id, recipient_id, payload, priority, status, thread_id, created_at, processed_at
            FROM messages
            WHERE (sender_id = ?1 AND recipient_id = ?2) OR (sender_id = ?2 AND recipient_id = ?1)
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?3
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Message counts by status.
    pub async fn statistics(&self) -> Result<QueueStatistics, KernelError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM messages GROUP BY status")
            .fetch_all(self.store.pool())
            .await?;
        let mut stats = QueueStatistics::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let count = count as u64;
            stats.total += count;
            match MessageStatus::parse(&status)? {
                MessageStatus::Pending => stats.pending = count,
                MessageStatus::Delivered => stats.delivered = count,
                MessageStatus::Processed => stats.processed = count,
            }
        }
        Ok(stats)
    }

    /// Bulk-delete processed messages older than `cutoff`. Only `processed`
    /// rows are eligible; this is the retention path.
    pub async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, KernelError> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE status = 'processed' AND processed_at < ?1",
        )
        .bind(cutoff)
        .execute(self.store.pool())
        .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "purged processed messages");
        }
        Ok(purged)
    }
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord, KernelError> {
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        sender: row.try_get("sender_id")?,
        recipient: row.try_get("recipient_id")?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get("priority")?,
        status: MessageStatus::parse(&status)?,
        thread: row.try_get("thread_id")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}
