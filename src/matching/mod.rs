//! Matching Queue & Matching Engine
//!
//! Resting orders live in [`MatchingQueueEntry`] rows (the durable queue) and
//! in per-instrument [`InstrumentBook`]s (the in-memory index the engine
//! matches against).

pub mod book;
pub mod engine;
pub mod error;
pub mod postgres;
pub mod queue;
pub mod roles;
pub mod store;

pub use book::InstrumentBook;
pub use engine::{MatchOutcome, MatchingEngine};
pub use error::MatchingError;
pub use postgres::PgMatchingStore;
pub use queue::{MatchingQueueEntry, QueueOrder, QueueStatus};
pub use roles::{resolve_roles, Party};
pub use store::{FillCommit, MatchingStore, MemoryMatchingStore};
