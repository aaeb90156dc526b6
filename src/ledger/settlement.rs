//! Trade settlement consumer
//!
//! Sits behind the order-side outbox dispatcher. Every `TradeExecuted` event
//! carries a `settlement` object; applying it is idempotent per trade id, so
//! redelivery is harmless. Delivery is only confirmed once the ledger commit
//! succeeded.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

use super::error::LedgerError;
use super::types::TradeSettlement;
use super::AssetLedger;
use crate::error::ErrorKind;
use crate::outbox::{EventPublisher, EventType, OutboxEvent, PublishError};

pub struct SettlementConsumer {
    ledger: Arc<dyn AssetLedger>,
}

impl SettlementConsumer {
    pub fn new(ledger: Arc<dyn AssetLedger>) -> Self {
        Self { ledger }
    }

    /// Apply one event. Ok(false) for duplicates and unrelated events.
    pub async fn handle(&self, event: &OutboxEvent) -> Result<bool, LedgerError> {
        if event.event_type != EventType::TradeExecuted {
            return Ok(false);
        }
        let settlement: TradeSettlement =
            serde_json::from_value(event.payload["settlement"].clone()).map_err(|e| {
                LedgerError::InvalidState(format!("bad settlement payload {}: {}", event.id, e))
            })?;
        self.ledger.apply_trade_settlement(&settlement).await
    }
}

#[async_trait]
impl EventPublisher for SettlementConsumer {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        match self.handle(event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == ErrorKind::Transient {
                    warn!(event_id = %event.id, error = %e, "Settlement deferred");
                } else {
                    error!(event_id = %event.id, error = %e, "Settlement rejected, needs remediation");
                }
                Err(PublishError::Consumer(e.to_string()))
            }
        }
    }
}
