use thiserror::Error;

use super::state::{SagaStatus, SagaStep};
use super::types::CorrelationId;
use crate::error::{ErrorKind, StoreError};

#[derive(Error, Debug)]
pub enum SagaError {
    #[error("Saga not found: {0}")]
    NotFound(CorrelationId),

    #[error("Saga {correlation_id} was modified concurrently (expected version {expected})")]
    Conflict {
        correlation_id: CorrelationId,
        expected: i64,
    },

    #[error("Saga {correlation_id}: cannot {action} while {status} at {step}")]
    InvalidTransition {
        correlation_id: CorrelationId,
        action: &'static str,
        status: SagaStatus,
        step: SagaStep,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for SagaError {
    fn from(e: sqlx::Error) -> Self {
        SagaError::Store(StoreError::Database(e))
    }
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::NotFound(_) | SagaError::InvalidTransition { .. } => ErrorKind::Business,
            SagaError::Conflict { .. } => ErrorKind::Transient,
            SagaError::Store(e) => e.kind(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            SagaError::NotFound(_) => 3001,
            SagaError::InvalidTransition { .. } => 3002,
            SagaError::Conflict { .. } => 3101,
            SagaError::Store(_) => 3201,
        }
    }
}

/// Why a step did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: SagaStep,
    pub message: String,
    pub transient: bool,
}

impl StepFailure {
    pub fn business(step: SagaStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(step: SagaStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            transient: true,
        }
    }

    pub fn from_kind(step: SagaStep, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            transient: kind.is_retryable(),
        }
    }
}
