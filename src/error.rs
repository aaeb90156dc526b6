//! Shared error plumbing
//!
//! Every component error maps onto one of four kinds:
//!
//! | Kind       | Example                               | Retried?               |
//! |------------|---------------------------------------|------------------------|
//! | Validation | unknown instrument, amount <= 0       | never                  |
//! | Business   | insufficient balance, not cancelable  | never (saga compensates)|
//! | Transient  | ledger timeout, database unavailable  | bounded saga retry     |
//! | Invariant  | release exceeds blocked               | never, fails closed    |

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Business,
    Transient,
    Invariant,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Storage layer failure, shared by every store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Database(_) => ErrorKind::Transient,
            StoreError::Serialization(_) | StoreError::Corrupt(_) => ErrorKind::Invariant,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            StoreError::Database(_) => 9001,
            StoreError::Serialization(_) => 9002,
            StoreError::Corrupt(_) => 9003,
        }
    }
}
