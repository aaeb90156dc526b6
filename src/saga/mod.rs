//! Saga Orchestrator
//!
//! # Lifecycle
//!
//! ```text
//! STARTED → IN_PROGRESS → COMPLETED
//!    │           │
//!    └───────────┴──→ COMPENSATING → FAILED ──(bounded retry)──→ IN_PROGRESS
//! ```
//!
//! Steps: `VALIDATE → RESERVE_ASSETS → QUEUE_ORDER → COMPLETE`.

pub mod error;
pub mod orchestrator;
pub mod postgres;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

pub use error::{SagaError, StepFailure};
pub use orchestrator::{NoopListener, OrchestratorConfig, SagaListener, SagaOrchestrator};
pub use postgres::PgSagaStore;
pub use state::{Compensation, SagaStatus, SagaStep};
pub use store::{MemorySagaStore, SagaStore};
pub use types::{CorrelationId, OrderPayload, SagaInstance, SagaType};
pub use worker::{RecoveryStats, RecoveryWorker, WorkerConfig};
