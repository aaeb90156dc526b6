//! Orders
//!
//! The customer-facing record of an order. [`OrderService`] accepts and
//! cancels orders; [`OrderProjector`] follows the saga and the matching
//! engine to keep status and `filled_size` current.

pub mod error;
pub mod postgres;
pub mod projector;
pub mod service;
pub mod store;
pub mod types;

pub use error::OrderError;
pub use postgres::PgOrderStore;
pub use projector::OrderProjector;
pub use service::OrderService;
pub use store::{MemoryOrderStore, OrderStore};
pub use types::{CreateOrderRequest, Order, OrderStatus};
