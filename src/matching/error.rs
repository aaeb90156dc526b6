use thiserror::Error;

use crate::balance::AmountOverflow;
use crate::error::{ErrorKind, StoreError};

#[derive(Error, Debug)]
pub enum MatchingError {
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error(transparent)]
    Overflow(#[from] AmountOverflow),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for MatchingError {
    fn from(e: sqlx::Error) -> Self {
        MatchingError::Store(StoreError::Database(e))
    }
}

impl MatchingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchingError::InvalidOrder(_)
            | MatchingError::UnknownInstrument(_)
            | MatchingError::Overflow(_) => ErrorKind::Validation,
            MatchingError::Store(e) => e.kind(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            MatchingError::InvalidOrder(_) => 4001,
            MatchingError::UnknownInstrument(_) => 4002,
            MatchingError::Overflow(_) => 4003,
            MatchingError::Store(e) => e.code(),
        }
    }
}
