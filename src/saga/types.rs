use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::state::{SagaStatus, SagaStep};
use crate::core_types::{CustomerId, CustomerTier, OrderId, Side};

/// Saga correlation key; for order processing it is the order id.
pub type CorrelationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SagaType {
    OrderProcessing,
}

impl SagaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaType::OrderProcessing => "ORDER_PROCESSING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ORDER_PROCESSING" => Some(SagaType::OrderProcessing),
            _ => None,
        }
    }
}

impl fmt::Display for SagaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order facts the saga needs at every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub instrument: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub tier: CustomerTier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaInstance {
    pub saga_id: Uuid,
    pub correlation_id: CorrelationId,
    pub saga_type: SagaType,
    pub status: SagaStatus,
    pub current_step: SagaStep,
    /// Steps whose effects currently stand, in commit order
    pub completed_steps: Vec<SagaStep>,
    pub payload: OrderPayload,
    pub retry_count: i32,
    pub max_retries: i32,
    pub failed_step: Option<SagaStep>,
    /// Last failure was infrastructure, not business
    pub transient_failure: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every save
    pub version: i64,
}

impl SagaInstance {
    pub fn new(
        correlation_id: CorrelationId,
        payload: OrderPayload,
        max_retries: i32,
        expiry: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id: Uuid::new_v4(),
            correlation_id,
            saga_type: SagaType::OrderProcessing,
            status: SagaStatus::Started,
            current_step: SagaStep::FIRST,
            completed_steps: Vec::new(),
            payload,
            retry_count: 0,
            max_retries,
            failed_step: None,
            transient_failure: false,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: now + expiry,
            version: 0,
        }
    }

    pub fn has_completed(&self, step: SagaStep) -> bool {
        self.completed_steps.contains(&step)
    }

    /// FAILED, transient, and retry budget left
    pub fn is_retryable(&self) -> bool {
        self.status == SagaStatus::Failed
            && self.transient_failure
            && self.failed_step.is_none_or(|s| s.is_retryable())
            && self.retry_count < self.max_retries
    }

    /// FAILED with no further retry coming
    pub fn is_final_failure(&self) -> bool {
        self.status == SagaStatus::Failed && !self.is_retryable()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && self.expires_at < now
    }
}
