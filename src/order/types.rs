use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core_types::{CustomerId, CustomerTier, OrderId, Side};
use crate::saga::OrderPayload;

/// Order status as the customer sees it.
///
/// ```text
/// PENDING ──→ ASSET_RESERVED ──→ PARTIALLY_FILLED ──→ MATCHED
///    │              │                   │
///    ↓              └──────→ CANCELED ←─┘
/// REJECTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    AssetReserved,
    PartiallyFilled,
    Matched,
    Canceled,
    Rejected,
}

const TRANSITIONS: &[(OrderStatus, OrderStatus)] = &[
    (OrderStatus::Pending, OrderStatus::AssetReserved),
    (OrderStatus::Pending, OrderStatus::Rejected),
    (OrderStatus::AssetReserved, OrderStatus::PartiallyFilled),
    (OrderStatus::AssetReserved, OrderStatus::Matched),
    (OrderStatus::AssetReserved, OrderStatus::Canceled),
    (OrderStatus::PartiallyFilled, OrderStatus::PartiallyFilled),
    (OrderStatus::PartiallyFilled, OrderStatus::Matched),
    (OrderStatus::PartiallyFilled, OrderStatus::Canceled),
];

impl OrderStatus {
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        TRANSITIONS.iter().any(|(f, t)| f == self && *t == next)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Matched | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }

    /// Customer cancel allowed (reserved, not fully matched)
    #[inline]
    pub fn is_cancelable(&self) -> bool {
        matches!(self, OrderStatus::AssetReserved | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::AssetReserved => "ASSET_RESERVED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Matched => "MATCHED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "ASSET_RESERVED" => Ok(OrderStatus::AssetReserved),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "MATCHED" => Ok(OrderStatus::Matched),
            "CANCELED" => Ok(OrderStatus::Canceled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Inbound order request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Caller-supplied id; generated when absent
    #[serde(default)]
    pub order_id: Option<OrderId>,
    pub customer_id: CustomerId,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    #[serde(default)]
    pub tier: CustomerTier,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub instrument: String,
    pub side: Side,
    /// Limit price
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
    pub tier: CustomerTier,
    pub idempotency_key: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: i64,
}

impl Order {
    pub fn new(req: &CreateOrderRequest) -> Self {
        let now = Utc::now();
        Self {
            order_id: req.order_id.unwrap_or_else(Uuid::new_v4),
            customer_id: req.customer_id,
            instrument: req.instrument.clone(),
            side: req.side,
            price: req.price,
            size: req.size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::Pending,
            tier: req.tier,
            idempotency_key: req.idempotency_key.clone(),
            reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[inline]
    pub fn remaining_size(&self) -> Decimal {
        self.size - self.filled_size
    }

    pub fn saga_payload(&self) -> OrderPayload {
        OrderPayload {
            order_id: self.order_id,
            customer_id: self.customer_id,
            instrument: self.instrument.clone(),
            side: self.side,
            price: self.price,
            size: self.size,
            tier: self.tier,
        }
    }

    /// Raise `filled_size` to `filled` (capped at size) and derive the status.
    /// Returns whether anything changed.
    ///
    /// A CANCELED order only records the fill; it never comes back.
    pub fn apply_filled(&mut self, filled: Decimal) -> bool {
        let filled = filled.min(self.size);
        if filled <= self.filled_size {
            return false;
        }
        self.filled_size = filled;
        if self.status == OrderStatus::Pending {
            // Reservation projection was missed; fills prove it happened
            self.status = OrderStatus::AssetReserved;
        }
        let next = if self.filled_size == self.size {
            OrderStatus::Matched
        } else {
            OrderStatus::PartiallyFilled
        };
        if self.status.can_transition_to(next) {
            self.status = next;
        }
        true
    }
}
