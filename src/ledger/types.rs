//! Asset Ledger types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::balance::{AmountOverflow, checked_mul};
use crate::core_types::{CustomerId, OrderId, TradeId};

/// Balance row key. The derived `Ord` is the canonical lock order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BalanceKey {
    pub customer_id: CustomerId,
    pub instrument: String,
}

impl BalanceKey {
    pub fn new(customer_id: CustomerId, instrument: impl Into<String>) -> Self {
        Self {
            customer_id,
            instrument: instrument.into(),
        }
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.customer_id, self.instrument)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ReservationStatus {
    Active = 1,
    Released = 2,
}

impl ReservationStatus {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(ReservationStatus::Active),
            2 => Some(ReservationStatus::Released),
            _ => None,
        }
    }
}

/// Funds blocked on behalf of one order.
///
/// Makes reserve/release idempotent per order id.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetReservation {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub instrument: String,
    pub amount: Decimal,
    pub released_amount: Decimal,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// An active reservation for this order already exists
    AlreadyReserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(Decimal),
    AlreadyReleased,
    NoReservation,
}

/// Everything the ledger needs to settle one trade.
///
/// Travels inside the `TradeExecuted` event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSettlement {
    pub trade_id: TradeId,
    pub instrument: String,
    pub currency: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub buyer_customer_id: CustomerId,
    pub seller_customer_id: CustomerId,
    /// Limit of the BUY order; above `price` when the buyer took liquidity
    pub buyer_limit_price: Decimal,
}

impl TradeSettlement {
    /// Currency changing hands (quantity × price)
    pub fn notional(&self) -> Result<Decimal, AmountOverflow> {
        checked_mul(self.quantity, self.price)
    }

    /// Currency the buyer blocked above the execution price
    pub fn buyer_refund(&self) -> Result<Decimal, AmountOverflow> {
        let diff = self.buyer_limit_price - self.price;
        if diff > Decimal::ZERO {
            checked_mul(self.quantity, diff)
        } else {
            Ok(Decimal::ZERO)
        }
    }
}
