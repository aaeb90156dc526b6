//! Asset Ledger errors

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

use crate::balance::{AmountOverflow, BalanceError};
use crate::core_types::CustomerId;
use crate::error::{ErrorKind, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    // === Validation ===
    #[error("Amount must be positive: {0}")]
    InvalidAmount(Decimal),

    #[error("Settlement source and destination must differ: {0}")]
    SameInstrument(String),

    #[error(transparent)]
    Overflow(#[from] AmountOverflow),

    // === Business ===
    #[error("Balance not found: customer={customer_id}, instrument={instrument}")]
    NotFound {
        customer_id: CustomerId,
        instrument: String,
    },

    #[error(
        "Insufficient balance: customer={customer_id}, instrument={instrument}, usable={usable}, required={required}"
    )]
    InsufficientBalance {
        customer_id: CustomerId,
        instrument: String,
        usable: Decimal,
        required: Decimal,
    },

    // === Invariant ===
    #[error("Invalid ledger state: {0}")]
    InvalidState(String),

    // === Transient ===
    #[error("Ledger call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Store(StoreError::Database(e))
    }
}

impl LedgerError {
    /// Map a row-level failure onto the ledger taxonomy.
    pub fn from_balance(customer_id: CustomerId, instrument: &str, err: BalanceError) -> Self {
        match err {
            BalanceError::NonPositiveAmount(a) => LedgerError::InvalidAmount(a),
            BalanceError::InsufficientUsable { usable, required } => {
                LedgerError::InsufficientBalance {
                    customer_id,
                    instrument: instrument.to_string(),
                    usable,
                    required,
                }
            }
            BalanceError::InsufficientBlocked { blocked, required } => LedgerError::InvalidState(
                format!(
                    "customer={} instrument={} blocked={} < required={}",
                    customer_id, instrument, blocked, required
                ),
            ),
            BalanceError::Overflow(o) => LedgerError::Overflow(o),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::SameInstrument(_)
            | LedgerError::Overflow(_) => ErrorKind::Validation,
            LedgerError::NotFound { .. } | LedgerError::InsufficientBalance { .. } => {
                ErrorKind::Business
            }
            LedgerError::InvalidState(_) => ErrorKind::Invariant,
            LedgerError::Timeout(_) | LedgerError::Unavailable(_) => ErrorKind::Transient,
            LedgerError::Store(e) => e.kind(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            LedgerError::InvalidAmount(_) => 2001,
            LedgerError::SameInstrument(_) => 2002,
            LedgerError::Overflow(_) => 2003,
            LedgerError::NotFound { .. } => 2101,
            LedgerError::InsufficientBalance { .. } => 2102,
            LedgerError::InvalidState(_) => 2201,
            LedgerError::Timeout(_) => 2301,
            LedgerError::Unavailable(_) => 2302,
            LedgerError::Store(_) => 2303,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
