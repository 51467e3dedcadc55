//! Delivery channel between the dispatcher and the workers.
//!
//! Payloads travel as JSON bytes. Delivery is at-least-once: a message may be
//! seen again if a consumer dies before acknowledging it.

use crate::{
    errors::{MediaError, MediaResult},
    models::message::TransformMessage,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A message handed to a consumer, still undecoded.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait TransformQueue: Send + Sync {
    async fn publish(&self, message: &TransformMessage) -> MediaResult<()>;

    /// Wait for the next delivery. `None` once the queue is closed.
    async fn receive(&self) -> MediaResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> MediaResult<()>;
}

/// Process-local queue on a tokio channel; all consumers share the receiver.
pub struct MemoryQueue {
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    next_id: parking_lot::Mutex<i64>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            next_id: parking_lot::Mutex::new(0),
        }
    }

    /// Stop accepting messages; consumers drain what is left and then see `None`.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Non-blocking receive, for callers that drive consumption by hand.
    pub async fn try_receive(&self) -> Option<Delivery> {
        self.receiver.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl TransformQueue for MemoryQueue {
    async fn publish(&self, message: &TransformMessage) -> MediaResult<()> {
        let payload = message.encode()?;
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| MediaError::TransientIo("queue is closed".into()))?;
        sender
            .send(Delivery {
                id,
                attempt: 1,
                payload,
            })
            .map_err(|_| MediaError::TransientIo("queue is closed".into()))
    }

    async fn receive(&self) -> MediaResult<Option<Delivery>> {
        Ok(self.receiver.lock().await.recv().await)
    }

    async fn ack(&self, _delivery: &Delivery) -> MediaResult<()> {
        Ok(())
    }
}

/// Durable queue in the `transform_queue` table.
///
/// A claim hides the row for `visibility_timeout`; if it is not acknowledged
/// in time it becomes visible again. Rows claimed more than `max_deliveries`
/// times are discarded.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Arc<SqlitePool>,
    poll_interval: Duration,
    visibility_timeout: Duration,
    max_deliveries: u32,
}

impl SqliteQueue {
    pub fn new(
        db: Arc<SqlitePool>,
        poll_interval: Duration,
        visibility_timeout: Duration,
        max_deliveries: u32,
    ) -> Self {
        Self {
            db,
            poll_interval,
            visibility_timeout,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Claim the oldest visible row, if any.
    pub async fn try_claim(&self) -> MediaResult<Option<Delivery>> {
        loop {
            let now = Utc::now().timestamp_millis();
            let hidden_until = now + self.visibility_timeout.as_millis() as i64;
            let claimed: Option<(i64, String, i64)> = sqlx::query_as(
                "UPDATE transform_queue
                 SET deliveries = deliveries + 1, visible_at = ?
                 WHERE id = (
                     SELECT id FROM transform_queue
                     WHERE visible_at <= ?
                     ORDER BY id ASC
                     LIMIT 1
                 )
                 RETURNING id, payload, deliveries",
            )
            .bind(hidden_until)
            .bind(now)
            .fetch_optional(&*self.db)
            .await?;

            let Some((id, payload, deliveries)) = claimed else {
                return Ok(None);
            };
            if deliveries > i64::from(self.max_deliveries) {
                warn!(
                    "dropping queue message {} after {} deliveries",
                    id,
                    deliveries - 1
                );
                self.delete(id).await?;
                continue;
            }
            return Ok(Some(Delivery {
                id,
                attempt: deliveries as u32,
                payload: payload.into_bytes(),
            }));
        }
    }

    /// Number of rows still queued, visible or not.
    pub async fn depth(&self) -> MediaResult<i64> {
        let depth = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM transform_queue")
            .fetch_one(&*self.db)
            .await?;
        Ok(depth)
    }

    async fn delete(&self, id: i64) -> MediaResult<()> {
        sqlx::query("DELETE FROM transform_queue WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TransformQueue for SqliteQueue {
    async fn publish(&self, message: &TransformMessage) -> MediaResult<()> {
        let payload = serde_json::to_string(message)?;
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO transform_queue (payload, enqueued_at, visible_at, deliveries)
             VALUES (?, ?, ?, 0)",
        )
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        debug!("enqueued transform message {}", result.last_insert_rowid());
        Ok(())
    }

    async fn receive(&self) -> MediaResult<Option<Delivery>> {
        loop {
            if let Some(delivery) = self.try_claim().await? {
                return Ok(Some(delivery));
            }
            if self.db.is_closed() {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> MediaResult<()> {
        self.delete(delivery.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, models::transform::TransformSpec};
    use uuid::Uuid;

    fn message() -> TransformMessage {
        TransformMessage {
            owner_id: Uuid::new_v4(),
            source_object_id: Uuid::new_v4(),
            transform_spec: TransformSpec {
                rotate: Some(90.0),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn memory_queue_delivers_in_order_then_closes() {
        let queue = MemoryQueue::new();
        let (a, b) = (message(), message());
        queue.publish(&a).await.unwrap();
        queue.publish(&b).await.unwrap();
        queue.close();

        let first = queue.receive().await.unwrap().unwrap();
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(TransformMessage::decode(&first.payload).unwrap(), a);
        assert_eq!(TransformMessage::decode(&second.payload).unwrap(), b);
        assert!(queue.receive().await.unwrap().is_none());
        assert!(queue.publish(&a).await.is_err());
    }

    async fn sqlite_queue(visibility: Duration, max_deliveries: u32) -> SqliteQueue {
        SqliteQueue::new(
            db::connect_in_memory().await.unwrap(),
            Duration::from_millis(5),
            visibility,
            max_deliveries,
        )
    }

    #[tokio::test]
    async fn sqlite_queue_ack_removes_message() {
        let queue = sqlite_queue(Duration::from_secs(60), 3).await;
        let sent = message();
        queue.publish(&sent).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(TransformMessage::decode(&delivery.payload).unwrap(), sent);
        // hidden while claimed
        assert!(queue.try_claim().await.unwrap().is_none());

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_until_limit() {
        let queue = sqlite_queue(Duration::ZERO, 2).await;
        queue.publish(&message()).await.unwrap();

        let first = queue.try_claim().await.unwrap().unwrap();
        let second = queue.try_claim().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt, 2);

        assert!(queue.try_claim().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}
