//! Order persistence

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

use super::types::Order;
use crate::core_types::{CustomerId, OrderId};
use crate::error::StoreError;
use crate::outbox::{MemoryOutbox, OutboxEvent};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert with its events unless the order id or idempotency key is taken.
    /// Returns the stored order and whether it was created.
    async fn insert(
        &self,
        order: &Order,
        events: Vec<OutboxEvent>,
    ) -> Result<(Order, bool), StoreError>;

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError>;

    /// Compare-and-swap on `order.version`; `None` if someone else saved first.
    async fn save(
        &self,
        order: &Order,
        events: Vec<OutboxEvent>,
    ) -> Result<Option<Order>, StoreError>;

    /// Newest first
    async fn orders_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Order>, StoreError>;
}

pub struct MemoryOrderStore {
    orders: DashMap<OrderId, Order>,
    // Serializes inserts so the id and key checks are one step
    keys: Mutex<std::collections::HashMap<String, OrderId>>,
    outbox: Arc<MemoryOutbox>,
}

impl MemoryOrderStore {
    pub fn new(outbox: Arc<MemoryOutbox>) -> Self {
        Self {
            orders: DashMap::new(),
            keys: Mutex::new(std::collections::HashMap::new()),
            outbox,
        }
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(
        &self,
        order: &Order,
        events: Vec<OutboxEvent>,
    ) -> Result<(Order, bool), StoreError> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = self.orders.get(&order.order_id) {
            return Ok((existing.clone(), false));
        }
        if let Some(key) = &order.idempotency_key {
            if let Some(id) = keys.get(key) {
                if let Some(existing) = self.orders.get(id) {
                    return Ok((existing.clone(), false));
                }
            }
            keys.insert(key.clone(), order.order_id);
        }
        self.orders.insert(order.order_id, order.clone());
        self.outbox.push(events);
        Ok((order.clone(), true))
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&order_id).map(|o| o.value().clone()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError> {
        let id = self
            .keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied();
        Ok(id.and_then(|id| self.orders.get(&id).map(|o| o.value().clone())))
    }

    async fn save(
        &self,
        order: &Order,
        events: Vec<OutboxEvent>,
    ) -> Result<Option<Order>, StoreError> {
        let Some(mut slot) = self.orders.get_mut(&order.order_id) else {
            return Ok(None);
        };
        if slot.version != order.version {
            return Ok(None);
        }
        let mut next = order.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *slot = next.clone();
        self.outbox.push(events);
        Ok(Some(next))
    }

    async fn orders_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Order>, StoreError> {
        let mut found: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| o.customer_id == customer_id)
            .map(|o| o.value().clone())
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}
