//! Projects saga progress onto the customer-facing order record.
//!
//! Every write is a read-modify-CAS loop so concurrent projections (a maker
//! filled by another saga while its own cancel runs) never lose an update.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::store::OrderStore;
use super::types::{Order, OrderStatus};
use crate::core_types::OrderId;
use crate::error::StoreError;
use crate::matching::engine::AGGREGATE_ORDER;
use crate::outbox::{EventType, OutboxEvent};
use crate::saga::{SagaInstance, SagaListener};
use crate::trade::{Trade, TradeLedger};

const MAX_CAS_ATTEMPTS: usize = 16;

pub struct OrderProjector {
    store: Arc<dyn OrderStore>,
    trades: Arc<dyn TradeLedger>,
}

impl OrderProjector {
    pub fn new(store: Arc<dyn OrderStore>, trades: Arc<dyn TradeLedger>) -> Self {
        Self { store, trades }
    }

    /// Apply `change` to the latest version until the CAS succeeds.
    ///
    /// `change` returns the events to write, or `None` when there is nothing to do.
    pub(crate) async fn update<F>(
        &self,
        order_id: OrderId,
        mut change: F,
    ) -> Result<Option<Order>, StoreError>
    where
        F: FnMut(&mut Order) -> Option<Vec<OutboxEvent>> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut order) = self.store.get(order_id).await? else {
                warn!(order_id = %order_id, "Projection target missing");
                return Ok(None);
            };
            let Some(events) = change(&mut order) else {
                return Ok(Some(order));
            };
            if let Some(saved) = self.store.save(&order, events).await? {
                return Ok(Some(saved));
            }
            debug!(order_id = %order_id, "Order version moved, reprojecting");
        }
        Err(StoreError::Corrupt(format!(
            "order {} still contended after {} attempts",
            order_id, MAX_CAS_ATTEMPTS
        )))
    }

    /// Recompute `filled_size` from the trade ledger.
    pub async fn sync_fills(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let filled: Decimal = self
            .trades
            .trades_for_order(order_id)
            .await?
            .iter()
            .map(|t| t.quantity)
            .sum();
        self.update(order_id, |o| o.apply_filled(filled).then(Vec::new))
            .await
    }

    pub async fn mark_reserved(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        self.update(order_id, |o| {
            if !o.status.can_transition_to(OrderStatus::AssetReserved) {
                return None;
            }
            o.status = OrderStatus::AssetReserved;
            Some(vec![order_event(EventType::OrderReserved, o)])
        })
        .await
    }

    /// PENDING ends REJECTED; anything reserved ends CANCELED.
    pub async fn mark_failed(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> Result<Option<Order>, StoreError> {
        self.update(order_id, |o| {
            let (next, event_type) = if o.status == OrderStatus::Pending {
                (OrderStatus::Rejected, EventType::OrderRejected)
            } else {
                (OrderStatus::Canceled, EventType::OrderCancelled)
            };
            if !o.status.can_transition_to(next) {
                return None;
            }
            o.status = next;
            o.reason = Some(reason.to_string());
            Some(vec![order_event(event_type, o)])
        })
        .await
    }

    pub async fn mark_canceled(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> Result<Option<Order>, StoreError> {
        self.update(order_id, |o| {
            if !o.status.can_transition_to(OrderStatus::Canceled) {
                return None;
            }
            o.status = OrderStatus::Canceled;
            o.reason = Some(reason.to_string());
            Some(vec![order_event(EventType::OrderCancelled, o)])
        })
        .await
    }
}

pub(crate) fn order_event(event_type: EventType, o: &Order) -> OutboxEvent {
    OutboxEvent::new(
        event_type,
        AGGREGATE_ORDER,
        o.order_id,
        Some(o.order_id.to_string()),
        json!({
            "orderId": o.order_id,
            "customerId": o.customer_id,
            "instrument": o.instrument,
            "side": o.side,
            "price": o.price,
            "size": o.size,
            "filledSize": o.filled_size,
            "status": o.status,
            "reason": o.reason,
        }),
    )
}

#[async_trait]
impl SagaListener for OrderProjector {
    async fn on_reserved(&self, saga: &SagaInstance) -> Result<(), StoreError> {
        self.mark_reserved(saga.payload.order_id).await?;
        Ok(())
    }

    async fn on_trades(&self, _saga: &SagaInstance, trades: &[Trade]) -> Result<(), StoreError> {
        let mut touched: Vec<OrderId> = Vec::with_capacity(trades.len() * 2);
        for t in trades {
            for id in [t.buy_order_id, t.sell_order_id] {
                if !touched.contains(&id) {
                    touched.push(id);
                }
            }
        }
        futures::future::try_join_all(touched.into_iter().map(|id| self.sync_fills(id))).await?;
        Ok(())
    }

    async fn on_completed(&self, saga: &SagaInstance) -> Result<(), StoreError> {
        self.sync_fills(saga.payload.order_id).await?;
        Ok(())
    }

    async fn on_failed(&self, saga: &SagaInstance) -> Result<(), StoreError> {
        let order_id = saga.payload.order_id;
        // Fills that landed before the failure stay on record
        self.sync_fills(order_id).await?;
        let reason = saga
            .error_message
            .clone()
            .unwrap_or_else(|| "saga failed".to_string());
        self.mark_failed(order_id, &reason).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{CustomerTier, Side};
    use crate::order::store::MemoryOrderStore;
    use crate::order::types::CreateOrderRequest;
    use crate::outbox::MemoryOutbox;
    use crate::trade::{Counterparties, MemoryTradeLedger};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct Fixture {
        projector: OrderProjector,
        orders: Arc<MemoryOrderStore>,
        trades: Arc<MemoryTradeLedger>,
        outbox: Arc<MemoryOutbox>,
    }

    fn fixture() -> Fixture {
        let outbox = Arc::new(MemoryOutbox::new());
        let orders = Arc::new(MemoryOrderStore::new(outbox.clone()));
        let trades = Arc::new(MemoryTradeLedger::new());
        Fixture {
            projector: OrderProjector::new(orders.clone(), trades.clone()),
            orders,
            trades,
            outbox,
        }
    }

    async fn insert(f: &Fixture, side: Side, size: Decimal) -> Order {
        let o = Order::new(&CreateOrderRequest {
            order_id: None,
            customer_id: Uuid::new_v4(),
            instrument: "AAPL".into(),
            side,
            price: dec!(150),
            size,
            tier: CustomerTier::Standard,
            idempotency_key: None,
        });
        f.orders.insert(&o, vec![]).await.unwrap().0
    }

    #[tokio::test]
    async fn test_reserved_then_fills() {
        let f = fixture();
        let buy = insert(&f, Side::Buy, dec!(10)).await;
        let sell = insert(&f, Side::Sell, dec!(4)).await;
        f.projector.mark_reserved(buy.order_id).await.unwrap();
        f.projector.mark_reserved(sell.order_id).await.unwrap();

        let parties = Counterparties {
            buy_order_id: buy.order_id,
            sell_order_id: sell.order_id,
            buyer_customer_id: buy.customer_id,
            seller_customer_id: sell.customer_id,
        };
        let trade = Trade::new(parties, "AAPL", dec!(4), dec!(150), Side::Buy).unwrap();
        f.trades.save_trade(&trade).await.unwrap();

        // Delivering the same trades twice changes nothing the second time
        for _ in 0..2 {
            f.projector
                .on_trades(&dummy_saga(&buy), std::slice::from_ref(&trade))
                .await
                .unwrap();
        }

        let buy = f.orders.get(buy.order_id).await.unwrap().unwrap();
        assert_eq!(buy.status, OrderStatus::PartiallyFilled);
        assert_eq!(buy.filled_size, dec!(4));
        let sell = f.orders.get(sell.order_id).await.unwrap().unwrap();
        assert_eq!(sell.status, OrderStatus::Matched);

        let reserved = f
            .outbox
            .all()
            .into_iter()
            .filter(|e| e.event_type == EventType::OrderReserved)
            .count();
        assert_eq!(reserved, 2);
    }

    #[tokio::test]
    async fn test_failure_before_reservation_rejects() {
        let f = fixture();
        let o = insert(&f, Side::Buy, dec!(1)).await;
        let rejected = f
            .projector
            .mark_failed(o.order_id, "insufficient balance")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("insufficient balance"));

        // Terminal: a second failure is a no-op
        let again = f.projector.mark_failed(o.order_id, "x").await.unwrap().unwrap();
        assert_eq!(again.version, rejected.version);
    }

    #[tokio::test]
    async fn test_failure_after_reservation_cancels() {
        let f = fixture();
        let o = insert(&f, Side::Sell, dec!(1)).await;
        f.projector.mark_reserved(o.order_id).await.unwrap();
        let canceled = f
            .projector
            .mark_failed(o.order_id, "queue unavailable")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
    }

    fn dummy_saga(o: &Order) -> SagaInstance {
        SagaInstance::new(
            o.order_id,
            o.saga_payload(),
            3,
            chrono::Duration::seconds(30),
        )
    }
}
