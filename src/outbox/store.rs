//! Outbox storage trait and the in-memory store

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use ulid::Ulid;

use super::event::OutboxEvent;
use crate::error::StoreError;

/// Append-mostly event table owned by one service.
///
/// Domain stores write events through their own atomic unit; this trait is
/// the dispatcher's view (poll, acknowledge, record failures).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append events outside of any domain mutation.
    async fn append(&self, events: Vec<OutboxEvent>) -> Result<(), StoreError>;

    /// Unprocessed events, oldest first.
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_processed(&self, id: Ulid) -> Result<(), StoreError>;

    /// Record a failed delivery attempt (retry_count += 1).
    async fn mark_failed(&self, id: Ulid, error: &str) -> Result<(), StoreError>;

    async fn pending_count(&self) -> Result<i64, StoreError>;
}

/// In-memory outbox. Insertion order is delivery order.
#[derive(Default)]
pub struct MemoryOutbox {
    events: Mutex<Vec<OutboxEvent>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous append, used by memory stores while they hold their own row lock.
    pub fn push(&self, events: impl IntoIterator<Item = OutboxEvent>) {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        guard.extend(events);
    }

    /// Snapshot of every event, processed or not.
    pub fn all(&self) -> Vec<OutboxEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn update<F: FnOnce(&mut OutboxEvent)>(&self, id: Ulid, f: F) {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(e) = guard.iter_mut().find(|e| e.id == id) {
            f(e);
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn append(&self, events: Vec<OutboxEvent>) -> Result<(), StoreError> {
        self.push(events);
        Ok(())
    }

    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard
            .iter()
            .filter(|e| !e.processed)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, id: Ulid) -> Result<(), StoreError> {
        self.update(id, |e| {
            e.processed = true;
            e.processed_at = Some(Utc::now());
            e.error_message = None;
        });
        Ok(())
    }

    async fn mark_failed(&self, id: Ulid, error: &str) -> Result<(), StoreError> {
        self.update(id, |e| e.mark_failed(error));
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, StoreError> {
        let guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.iter().filter(|e| !e.processed).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::event::EventType;
    use serde_json::json;

    fn event(key: &str) -> OutboxEvent {
        OutboxEvent::new(
            EventType::OrderQueued,
            "Order",
            key,
            Some(key.to_string()),
            json!({}),
        )
    }

    #[tokio::test]
    async fn test_fetch_oldest_first_and_ack() {
        let outbox = MemoryOutbox::new();
        let a = event("a");
        let b = event("b");
        outbox.append(vec![a.clone(), b.clone()]).await.unwrap();

        let batch = outbox.fetch_unprocessed(10).await.unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        outbox.mark_processed(a.id).await.unwrap();
        assert_eq!(outbox.pending_count().await.unwrap(), 1);
        let batch = outbox.fetch_unprocessed(10).await.unwrap();
        assert_eq!(batch[0].id, b.id);
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_event_pending() {
        let outbox = MemoryOutbox::new();
        let a = event("a");
        outbox.push([a.clone()]);
        outbox.mark_failed(a.id, "timeout").await.unwrap();
        outbox.mark_failed(a.id, "timeout").await.unwrap();

        let batch = outbox.fetch_unprocessed(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].retry_count, 2);
        assert_eq!(batch[0].error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_fetch_respects_limit() {
        let outbox = MemoryOutbox::new();
        outbox.push((0..5).map(|i| event(&i.to_string())));
        assert_eq!(outbox.fetch_unprocessed(3).await.unwrap().len(), 3);
        assert_eq!(outbox.fetch_unprocessed(0).await.unwrap().len(), 0);
    }
}
