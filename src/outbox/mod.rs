//! Transactional Outbox
//!
//! Every state change another service must observe is written as an
//! [`OutboxEvent`] in the same atomic unit as the change itself, then relayed
//! asynchronously by the [`OutboxDispatcher`]. Delivery is at-least-once.
//!
//! Tables (one per owning service):
//! - `ledger_outbox`: balance movements written by the Asset Ledger
//! - `order_outbox`: order, saga, queue and trade events

pub mod dispatcher;
pub mod event;
pub mod postgres;
pub mod publisher;
pub mod store;

pub use dispatcher::{DispatchStats, DispatcherConfig, OutboxDispatcher};
pub use event::{EventType, OutboxEvent};
pub use postgres::{LEDGER_OUTBOX_TABLE, ORDER_OUTBOX_TABLE, PgOutbox};
pub use publisher::{
    ChannelPublisher, EventPublisher, FanoutPublisher, LogPublisher, PublishError,
};
pub use store::{MemoryOutbox, OutboxStore};
