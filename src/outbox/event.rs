//! Outbox event model

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

pub const TOPIC_ORDER_EVENTS: &str = "order-events";
pub const TOPIC_TRADE_EVENTS: &str = "trade-events";
pub const TOPIC_SAGA_EVENTS: &str = "saga-events";

/// Every event type the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Asset Ledger
    AssetReserved,
    AssetReleased,
    SettlementCompleted,
    DepositCompleted,
    WithdrawalCompleted,
    // Orders / saga / matching
    OrderCreated,
    OrderReserved,
    OrderQueued,
    OrderCancelled,
    OrderRejected,
    TradeExecuted,
    SagaCompleted,
    SagaFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AssetReserved => "AssetReserved",
            EventType::AssetReleased => "AssetReleased",
            EventType::SettlementCompleted => "SettlementCompleted",
            EventType::DepositCompleted => "DepositCompleted",
            EventType::WithdrawalCompleted => "WithdrawalCompleted",
            EventType::OrderCreated => "OrderCreated",
            EventType::OrderReserved => "OrderReserved",
            EventType::OrderQueued => "OrderQueued",
            EventType::OrderCancelled => "OrderCancelled",
            EventType::OrderRejected => "OrderRejected",
            EventType::TradeExecuted => "TradeExecuted",
            EventType::SagaCompleted => "SagaCompleted",
            EventType::SagaFailed => "SagaFailed",
        }
    }

    /// Destination topic. Ledger events go to `asset.<kind>`.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::AssetReserved => "asset.reserved",
            EventType::AssetReleased => "asset.released",
            EventType::SettlementCompleted => "asset.settlement_completed",
            EventType::DepositCompleted => "asset.deposit_completed",
            EventType::WithdrawalCompleted => "asset.withdrawal_completed",
            EventType::OrderCreated
            | EventType::OrderReserved
            | EventType::OrderQueued
            | EventType::OrderCancelled
            | EventType::OrderRejected => TOPIC_ORDER_EVENTS,
            EventType::TradeExecuted => TOPIC_TRADE_EVENTS,
            EventType::SagaCompleted | EventType::SagaFailed => TOPIC_SAGA_EVENTS,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [EventType; 13] = [
            EventType::AssetReserved,
            EventType::AssetReleased,
            EventType::SettlementCompleted,
            EventType::DepositCompleted,
            EventType::WithdrawalCompleted,
            EventType::OrderCreated,
            EventType::OrderReserved,
            EventType::OrderQueued,
            EventType::OrderCancelled,
            EventType::OrderRejected,
            EventType::TradeExecuted,
            EventType::SagaCompleted,
            EventType::SagaFailed,
        ];
        ALL.into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// One row of an outbox table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    /// Time-ordered id
    pub id: Ulid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: EventType,
    pub topic: String,
    pub partition_key: Option<String>,
    /// Monetary and size fields are decimal strings
    pub payload: Value,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(
        event_type: EventType,
        aggregate_type: &str,
        aggregate_id: impl ToString,
        partition_key: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Ulid::new(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            event_type,
            topic: event_type.topic().to_string(),
            partition_key,
            payload,
            processed: false,
            processed_at: None,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn mark_processed(&mut self) {
        self.processed = true;
        self.processed_at = Some(Utc::now());
        self.error_message = None;
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.retry_count += 1;
        self.error_message = Some(error.to_string());
    }

    /// Wire form handed to publishers.
    pub fn envelope(&self) -> Value {
        json!({
            "eventId": self.id.to_string(),
            "eventType": self.event_type.as_str(),
            "aggregateId": self.aggregate_id,
            "aggregateType": self.aggregate_type,
            "topic": self.topic,
            "partitionKey": self.partition_key,
            "payload": self.payload,
            "timestamp": self.created_at.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parse() {
        for t in [EventType::TradeExecuted, EventType::AssetReleased, EventType::SagaFailed] {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("Nope".parse::<EventType>().is_err());
    }

    #[test]
    fn test_topics() {
        assert_eq!(EventType::AssetReserved.topic(), "asset.reserved");
        assert_eq!(EventType::TradeExecuted.topic(), TOPIC_TRADE_EVENTS);
        assert_eq!(EventType::OrderQueued.topic(), TOPIC_ORDER_EVENTS);
    }

    #[test]
    fn test_mark_failed_then_processed() {
        let mut e = OutboxEvent::new(
            EventType::OrderQueued,
            "Order",
            "o-1",
            Some("AAPL".into()),
            json!({}),
        );
        e.mark_failed("broker down");
        e.mark_failed("broker down");
        assert_eq!(e.retry_count, 2);
        assert!(!e.processed);
        e.mark_processed();
        assert!(e.processed);
        assert!(e.error_message.is_none());
        assert!(e.processed_at.is_some());
    }

    #[test]
    fn test_envelope_shape() {
        let e = OutboxEvent::new(
            EventType::TradeExecuted,
            "Trade",
            "t-1",
            Some("AAPL".into()),
            json!({"quantity": "10"}),
        );
        let env = e.envelope();
        assert_eq!(env["eventType"], "TradeExecuted");
        assert_eq!(env["topic"], "trade-events");
        assert_eq!(env["partitionKey"], "AAPL");
        assert_eq!(env["payload"]["quantity"], "10");
    }
}
