//! Order entry point: create, cancel, query.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::OrderError;
use super::projector::{order_event, OrderProjector};
use super::store::OrderStore;
use super::types::{CreateOrderRequest, Order, OrderStatus};
use crate::balance::checked_mul;
use crate::core_types::{CustomerId, OrderId};
use crate::instruments::InstrumentRegistry;
use crate::ledger::{LedgerClient, ReleaseRequest};
use crate::matching::{MatchingEngine, QueueStatus};
use crate::outbox::EventType;
use crate::saga::SagaOrchestrator;

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    projector: Arc<OrderProjector>,
    orchestrator: Arc<SagaOrchestrator>,
    matching: Arc<MatchingEngine>,
    ledger: Arc<dyn LedgerClient>,
    registry: Arc<InstrumentRegistry>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        projector: Arc<OrderProjector>,
        orchestrator: Arc<SagaOrchestrator>,
        matching: Arc<MatchingEngine>,
        ledger: Arc<dyn LedgerClient>,
        registry: Arc<InstrumentRegistry>,
    ) -> Self {
        Self {
            store,
            projector,
            orchestrator,
            matching,
            ledger,
            registry,
        }
    }

    fn validate(&self, req: &CreateOrderRequest) -> Result<(), OrderError> {
        if !self.registry.is_tradable(&req.instrument) {
            return Err(OrderError::UnknownInstrument(req.instrument.clone()));
        }
        if req.size <= Decimal::ZERO {
            return Err(OrderError::InvalidRequest(format!(
                "size must be positive, got {}",
                req.size
            )));
        }
        if req.price <= Decimal::ZERO {
            return Err(OrderError::InvalidRequest(format!(
                "price must be positive, got {}",
                req.price
            )));
        }
        // A BUY blocks size × price; refuse orders whose notional cannot be represented
        checked_mul(req.size, req.price).map_err(|e| {
            OrderError::InvalidRequest(format!("order notional out of range: {}", e))
        })?;
        if req.idempotency_key.as_deref().is_some_and(str::is_empty) {
            return Err(OrderError::InvalidRequest(
                "idempotency key must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Persist PENDING and start its saga. Returns the order and whether it is new.
    async fn accept(&self, req: &CreateOrderRequest) -> Result<(Order, bool), OrderError> {
        self.validate(req)?;

        if let Some(key) = &req.idempotency_key
            && let Some(existing) = self.store.find_by_idempotency_key(key).await?
        {
            info!(order_id = %existing.order_id, key = %key, "Duplicate order request");
            return Ok((existing, false));
        }

        let order = Order::new(req);
        let event = order_event(EventType::OrderCreated, &order);
        let (order, created) = self.store.insert(&order, vec![event]).await?;
        if !created {
            return Ok((order, false));
        }
        info!(
            order_id = %order.order_id,
            customer_id = %order.customer_id,
            instrument = %order.instrument,
            side = %order.side,
            price = %order.price,
            size = %order.size,
            "Order accepted"
        );
        self.orchestrator
            .start_saga(order.order_id, order.saga_payload())
            .await?;
        Ok((order, true))
    }

    /// Accept the order and drive its saga to an outcome before returning.
    ///
    /// A saga error after acceptance is logged; the order keeps whatever
    /// status the saga reached and the recovery worker takes it from there.
    pub async fn create_order(&self, req: CreateOrderRequest) -> Result<Order, OrderError> {
        let (order, created) = self.accept(&req).await?;
        if !created {
            return Ok(order);
        }
        if let Err(e) = self.orchestrator.run(order.order_id).await {
            error!(order_id = %order.order_id, error = %e, "Saga run failed");
        }
        self.get_order(order.order_id).await
    }

    /// Accept the order and run its saga in the background; returns PENDING.
    pub async fn submit_order(
        self: &Arc<Self>,
        req: CreateOrderRequest,
    ) -> Result<Order, OrderError> {
        let (order, created) = self.accept(&req).await?;
        if created {
            let orchestrator = self.orchestrator.clone();
            let order_id = order.order_id;
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(order_id).await {
                    error!(order_id = %order_id, error = %e, "Saga run failed");
                }
            });
        }
        Ok(order)
    }

    /// Withdraw the unfilled remainder and release its reservation.
    ///
    /// Runs under the order's saga lock so it never interleaves with the
    /// saga itself. Repeating a cancel returns the CANCELED order.
    pub async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<Order, OrderError> {
        let _guard = self.orchestrator.lock(order_id).await;

        let order = self.get_order(order_id).await?;
        if order.status == OrderStatus::Canceled {
            return Ok(order);
        }
        if !order.status.is_cancelable() {
            return Err(OrderError::NotCancelable {
                order_id,
                status: order.status,
            });
        }

        let entry = self.matching.cancel_order(order_id, reason).await?;
        let remaining = match &entry {
            Some(e) if e.status == QueueStatus::Filled => {
                // Filled between our read and the cancel; project it and refuse
                let order = self.projector.sync_fills(order_id).await?;
                return Err(OrderError::NotCancelable {
                    order_id,
                    status: order.map(|o| o.status).unwrap_or(OrderStatus::Matched),
                });
            }
            Some(e) => e.remaining_size,
            None => {
                warn!(order_id = %order_id, "Cancel found no queue entry, releasing full remainder");
                order.remaining_size()
            }
        };

        let (asset, amount) = self
            .registry
            .reservation_for(order.side, &order.instrument, remaining, order.price)
            .map_err(|e| OrderError::InvalidRequest(e.to_string()))?;
        if amount > Decimal::ZERO {
            self.ledger
                .release(&ReleaseRequest {
                    customer_id: order.customer_id,
                    instrument: asset,
                    amount,
                    order_id: Some(order_id),
                })
                .await?;
        }

        self.projector.sync_fills(order_id).await?;
        let canceled = self
            .projector
            .mark_canceled(order_id, reason)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        info!(
            order_id = %order_id,
            released = %amount,
            filled = %canceled.filled_size,
            "Order canceled"
        );
        Ok(canceled)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order, OrderError> {
        self.store
            .get(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    pub async fn orders_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Order>, OrderError> {
        Ok(self.store.orders_for_customer(customer_id).await?)
    }
}
