//! Trade Ledger
//!
//! Append-only record of executed matches. Trades are written by the
//! matching engine in the same atomic unit as the maker's queue update and
//! the `TradeExecuted` outbox event; they are never updated or deleted.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryTradeLedger;
pub use postgres::PgTradeLedger;

use crate::balance::{AmountOverflow, checked_mul};
use crate::core_types::{CustomerId, OrderId, Side, TradeId};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub trade_id: TradeId,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buyer_customer_id: CustomerId,
    pub seller_customer_id: CustomerId,
    pub instrument: String,
    pub quantity: Decimal,
    pub price: Decimal,
    /// quantity × price
    pub total_value: Decimal,
    pub taker_side: Side,
    pub created_at: DateTime<Utc>,
}

/// Who bought and who sold, resolved from taker/maker roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counterparties {
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buyer_customer_id: CustomerId,
    pub seller_customer_id: CustomerId,
}

impl Trade {
    /// Canonical form: fresh id, `total_value = quantity × price`, stamped now.
    pub fn new(
        parties: Counterparties,
        instrument: &str,
        quantity: Decimal,
        price: Decimal,
        taker_side: Side,
    ) -> Result<Self, AmountOverflow> {
        Ok(Self {
            trade_id: Uuid::new_v4(),
            buy_order_id: parties.buy_order_id,
            sell_order_id: parties.sell_order_id,
            buyer_customer_id: parties.buyer_customer_id,
            seller_customer_id: parties.seller_customer_id,
            instrument: instrument.to_string(),
            quantity,
            price,
            total_value: checked_mul(quantity, price)?,
            taker_side,
            created_at: Utc::now(),
        })
    }

    pub fn involves(&self, order_id: OrderId) -> bool {
        self.buy_order_id == order_id || self.sell_order_id == order_id
    }
}

#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Persist one trade; saving the same trade id again returns the stored record.
    async fn save_trade(&self, trade: &Trade) -> Result<Trade, StoreError>;

    async fn get(&self, trade_id: TradeId) -> Result<Option<Trade>, StoreError>;

    /// Oldest first
    async fn trades_for_order(&self, order_id: OrderId) -> Result<Vec<Trade>, StoreError>;

    async fn trades_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Trade>, StoreError>;

    /// Most recent first
    async fn trades_for_instrument(
        &self,
        instrument: &str,
        limit: i64,
    ) -> Result<Vec<Trade>, StoreError>;

    async fn count_for_instrument(&self, instrument: &str) -> Result<i64, StoreError>;
}
