//! Matching queue entry - the resting form of an order inside the matcher

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::{CustomerId, CustomerTier, OrderId, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum QueueStatus {
    Active = 1,
    Filled = 2,
    Canceled = 3,
}

impl QueueStatus {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(QueueStatus::Active),
            2 => Some(QueueStatus::Filled),
            3 => Some(QueueStatus::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Active => "ACTIVE",
            QueueStatus::Filled => "FILLED",
            QueueStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Active)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the saga hands to `add_to_queue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOrder {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub tier: CustomerTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingQueueEntry {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub requested_size: Decimal,
    pub remaining_size: Decimal,
    /// Higher matches first among equal prices
    pub priority_tier: i16,
    pub queued_at: DateTime<Utc>,
    /// Tie-break for identical `queued_at`
    pub seq: i64,
    pub status: QueueStatus,
    pub matched_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
    pub remove_reason: Option<String>,
}

impl MatchingQueueEntry {
    pub fn new(order: &QueueOrder, seq: i64) -> Self {
        Self {
            order_id: order.order_id,
            customer_id: order.customer_id,
            instrument: order.instrument.clone(),
            side: order.side,
            price: order.price,
            requested_size: order.size,
            remaining_size: order.size,
            priority_tier: order.tier.rank(),
            queued_at: Utc::now(),
            seq,
            status: QueueStatus::Active,
            matched_at: None,
            removed_at: None,
            remove_reason: None,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == QueueStatus::Active && self.remaining_size > Decimal::ZERO
    }

    #[inline]
    pub fn filled_size(&self) -> Decimal {
        self.requested_size - self.remaining_size
    }

    /// Would this resting order trade with a taker on the other side at `limit`?
    pub fn crosses(&self, limit: Decimal) -> bool {
        match self.side {
            // Resting SELL is eligible for a BUY taker at or above its ask
            Side::Sell => self.price <= limit,
            // Resting BUY is eligible for a SELL taker at or below its bid
            Side::Buy => self.price >= limit,
        }
    }

    /// Apply one fill. Caller guarantees `qty <= remaining_size`.
    pub fn fill(&mut self, qty: Decimal) {
        self.remaining_size -= qty;
        self.matched_at = Some(Utc::now());
        if self.remaining_size <= Decimal::ZERO {
            self.remaining_size = Decimal::ZERO;
            self.status = QueueStatus::Filled;
            self.removed_at = self.matched_at;
            self.remove_reason = Some("FILLED".to_string());
        }
    }

    /// Neutralize the entry; remaining size is kept as of cancel time.
    pub fn cancel(&mut self, reason: &str) {
        self.status = QueueStatus::Canceled;
        self.removed_at = Some(Utc::now());
        self.remove_reason = Some(reason.to_string());
    }
}
