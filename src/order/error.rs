//! Order Error Types
//!
//! Error codes are stable across releases; `http_status` is what an outer
//! HTTP layer should answer with.

use thiserror::Error;

use super::types::OrderStatus;
use crate::core_types::OrderId;
use crate::error::{ErrorKind, StoreError};
use crate::ledger::LedgerError;
use crate::matching::MatchingError;
use crate::saga::SagaError;

#[derive(Error, Debug)]
pub enum OrderError {
    // === Validation ===
    #[error("Invalid order request: {0}")]
    InvalidRequest(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    // === Business ===
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    #[error("Order {order_id} is not cancelable in status {status}")]
    NotCancelable {
        order_id: OrderId,
        status: OrderStatus,
    },

    // === Downstream ===
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Matching(#[from] MatchingError),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error("Order {0} was modified concurrently")]
    Conflict(OrderId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for OrderError {
    fn from(e: sqlx::Error) -> Self {
        OrderError::Store(StoreError::Database(e))
    }
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidRequest(_) | OrderError::UnknownInstrument(_) => {
                ErrorKind::Validation
            }
            OrderError::NotFound(_) | OrderError::NotCancelable { .. } => ErrorKind::Business,
            OrderError::Conflict(_) => ErrorKind::Transient,
            OrderError::Ledger(e) => e.kind(),
            OrderError::Matching(e) => e.kind(),
            OrderError::Saga(e) => e.kind(),
            OrderError::Store(e) => e.kind(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            OrderError::InvalidRequest(_) => 1001,
            OrderError::UnknownInstrument(_) => 1002,
            OrderError::NotFound(_) => 1101,
            OrderError::NotCancelable { .. } => 1102,
            OrderError::Conflict(_) => 1201,
            OrderError::Ledger(e) => e.code(),
            OrderError::Matching(e) => e.code(),
            OrderError::Saga(e) => e.code(),
            OrderError::Store(_) => 1301,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            OrderError::NotFound(_) => 404,
            OrderError::NotCancelable { .. } | OrderError::Conflict(_) => 409,
            other => match other.kind() {
                ErrorKind::Validation => 400,
                ErrorKind::Business => 422,
                ErrorKind::Transient => 503,
                ErrorKind::Invariant => 500,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
