//! Event publishers
//!
//! The dispatcher hands each outbox row to an [`EventPublisher`]. Delivery is
//! at-least-once, so every consumer must tolerate duplicates.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use super::event::OutboxEvent;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("No route for topic {0}")]
    NoRoute(String),

    #[error("Subscriber for topic {0} is gone")]
    Closed(String),

    #[error("Consumer rejected event: {0}")]
    Consumer(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns Ok only once delivery is confirmed.
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError>;
}

/// In-process fan-out over tokio mpsc channels, keyed by topic.
///
/// Topics without subscribers are acknowledged (nobody to deliver to) unless
/// the publisher was built with `strict`.
pub struct ChannelPublisher {
    routes: RwLock<HashMap<String, Vec<mpsc::Sender<OutboxEvent>>>>,
    capacity: usize,
    strict: bool,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            capacity,
            strict: false,
        }
    }

    /// Fail publication when a topic has no subscriber.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<OutboxEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut routes = self.routes.write().unwrap_or_else(|p| p.into_inner());
        routes.entry(topic.to_string()).or_default().push(tx);
        rx
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let senders = {
            let routes = self.routes.read().unwrap_or_else(|p| p.into_inner());
            routes.get(&event.topic).cloned().unwrap_or_default()
        };
        if senders.is_empty() {
            return if self.strict {
                Err(PublishError::NoRoute(event.topic.clone()))
            } else {
                Ok(())
            };
        }
        for tx in senders {
            tx.send(event.clone())
                .await
                .map_err(|_| PublishError::Closed(event.topic.clone()))?;
        }
        Ok(())
    }
}

/// Delivers to every inner publisher in order; confirmed only if all confirm.
///
/// A partial failure means redelivery to all of them, so inner publishers
/// must be idempotent.
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl EventPublisher for FanoutPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        for p in &self.publishers {
            p.publish(event).await?;
        }
        Ok(())
    }
}

/// Writes every event to the log. Used when no broker is configured.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            topic = %event.topic,
            envelope = %event.envelope(),
            "Published event"
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records deliveries; can be told to fail for chosen aggregate ids.
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub delivered: Mutex<Vec<OutboxEvent>>,
        pub failing: Mutex<HashSet<String>>,
    }

    impl RecordingPublisher {
        pub fn fail_for(&self, aggregate_id: &str) {
            self.failing.lock().unwrap().insert(aggregate_id.to_string());
        }

        pub fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        pub fn delivered_ids(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.aggregate_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
            if self.failing.lock().unwrap().contains(&event.aggregate_id) {
                return Err(PublishError::Closed(event.topic.clone()));
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::event::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_publisher_routes_by_topic() {
        let publisher = ChannelPublisher::new(8);
        let mut trades = publisher.subscribe("trade-events");

        let trade = OutboxEvent::new(EventType::TradeExecuted, "Trade", "t1", None, json!({}));
        let queued = OutboxEvent::new(EventType::OrderQueued, "Order", "o1", None, json!({}));
        publisher.publish(&trade).await.unwrap();
        publisher.publish(&queued).await.unwrap();

        let got = trades.recv().await.unwrap();
        assert_eq!(got.id, trade.id);
        assert!(trades.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_strict_publisher_rejects_unrouted() {
        let publisher = ChannelPublisher::new(8).strict();
        let e = OutboxEvent::new(EventType::OrderQueued, "Order", "o1", None, json!({}));
        assert!(matches!(
            publisher.publish(&e).await,
            Err(PublishError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_fanout_stops_at_first_failure() {
        let ok = Arc::new(mock::RecordingPublisher::default());
        let bad = Arc::new(mock::RecordingPublisher::default());
        bad.fail_for("o1");
        let fanout = FanoutPublisher::new(vec![ok.clone(), bad.clone()]);

        let e = OutboxEvent::new(EventType::OrderQueued, "Order", "o1", None, json!({}));
        assert!(fanout.publish(&e).await.is_err());
        assert_eq!(ok.delivered_ids(), vec!["o1"]);
        assert!(bad.delivered_ids().is_empty());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_an_error() {
        let publisher = ChannelPublisher::new(8);
        drop(publisher.subscribe("order-events"));
        let e = OutboxEvent::new(EventType::OrderQueued, "Order", "o1", None, json!({}));
        assert!(matches!(
            publisher.publish(&e).await,
            Err(PublishError::Closed(_))
        ));
    }
}
