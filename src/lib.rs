//! Brokerage Core - order processing for a brokerage
//!
//! An order is accepted, its funds are blocked in the Asset Ledger, it rests
//! in a price/tier/time priority queue, and crossing orders become trades
//! whose settlement reaches the ledger through a transactional outbox.
//!
//! # Modules
//!
//! - [`core_types`] - Ids, side, customer tier
//! - [`balance`] - Enforced balance type
//! - [`ledger`] - Asset Ledger: reserve / release / settle / credit / debit
//! - [`saga`] - Order saga orchestrator and recovery worker
//! - [`matching`] - Matching queue and engine
//! - [`trade`] - Append-only trade ledger
//! - [`outbox`] - Transactional outbox and dispatcher
//! - [`order`] - Customer-facing orders: create, cancel, query
//! - [`services`] - Component wiring (in-memory or PostgreSQL)
//! - [`csv_io`] - Fixture loading and snapshot dumps

// Core types - must be first!
pub mod core_types;

// Ambient
pub mod config;
pub mod db;
pub mod error;
pub mod keyed_lock;
pub mod logging;

// Domain
pub mod balance;
pub mod instruments;
pub mod ledger;
pub mod matching;
pub mod order;
pub mod outbox;
pub mod saga;
pub mod trade;

// Wiring and I/O
pub mod csv_io;
pub mod services;

// Convenient re-exports at crate root
pub use balance::Balance;
pub use core_types::{CustomerId, CustomerTier, OrderId, Side, TradeId};
pub use instruments::InstrumentRegistry;
pub use ledger::{AssetLedger, LedgerClient, LedgerError};
pub use matching::{MatchingEngine, MatchingQueueEntry};
pub use order::{CreateOrderRequest, Order, OrderError, OrderService, OrderStatus};
pub use saga::{SagaInstance, SagaOrchestrator, SagaStatus, SagaStep};
pub use services::Services;
pub use trade::{Trade, TradeLedger};
