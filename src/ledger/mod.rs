//! Asset Ledger
//!
//! Single source of truth for what a customer may commit to new orders
//! (`usable`) and what is already committed (`blocked`).
//!
//! # Concurrency
//!
//! - Every mutation locks its balance row(s) for the read-check-write only,
//!   never across a network call.
//! - Multi-row operations (settle, trade settlement) lock rows sorted by
//!   `(customer_id, instrument)`, so two settlements touching the same rows
//!   in opposite directions cannot deadlock.
//! - Each mutation and its outbox event commit in one atomic unit.
//!
//! # Components
//!
//! - [`AssetLedger`]: the ledger operations ([`MemoryLedger`], [`PgLedger`])
//! - [`LedgerClient`]: the remote boundary the saga calls, bounded by a timeout
//! - [`SettlementConsumer`]: applies dispatched `TradeExecuted` events

pub mod client;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod rules;
pub mod settlement;
pub mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use client::{
    LedgerClient, LocalLedgerClient, ReleaseRequest, ReserveRequest, TimeoutLedgerClient,
};
pub use error::LedgerError;
pub use memory::MemoryLedger;
pub use postgres::PgLedger;
pub use settlement::SettlementConsumer;
pub use types::{
    AssetReservation, BalanceKey, ReleaseOutcome, ReservationStatus, ReserveOutcome,
    TradeSettlement,
};

use crate::balance::Balance;
use crate::core_types::{CustomerId, OrderId};

#[async_trait]
pub trait AssetLedger: Send + Sync {
    /// Move `amount` usable → blocked. Fails `NotFound` if the row does not exist.
    async fn reserve(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError>;

    /// `reserve` recorded against an order; repeat calls while active are no-ops.
    async fn reserve_for_order(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<ReserveOutcome, LedgerError>;

    /// Move `amount` blocked → usable. Fails `InvalidState` if it exceeds blocked.
    async fn release(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError>;

    /// Release an order's active reservation at most once.
    ///
    /// `amount` defaults to (and is capped at) the reserved amount.
    async fn release_for_order(
        &self,
        order_id: OrderId,
        amount: Option<Decimal>,
    ) -> Result<ReleaseOutcome, LedgerError>;

    /// Spend `from_amount` blocked of `from_instrument`, credit `to_amount`
    /// usable of `to_instrument` (row created if absent). Both legs or neither.
    async fn settle(
        &self,
        customer_id: CustomerId,
        from_instrument: &str,
        from_amount: Decimal,
        to_instrument: &str,
        to_amount: Decimal,
    ) -> Result<(), LedgerError>;

    /// Deposit to usable; creates the row on first credit.
    async fn credit(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError>;

    /// Withdraw from usable; never below zero.
    async fn debit(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError>;

    /// Settle both sides of a trade atomically. Returns false if already applied.
    async fn apply_trade_settlement(&self, settlement: &TradeSettlement)
    -> Result<bool, LedgerError>;

    async fn balance(
        &self,
        customer_id: CustomerId,
        instrument: &str,
    ) -> Result<Option<Balance>, LedgerError>;

    async fn balances_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<(String, Balance)>, LedgerError>;

    async fn reservation(&self, order_id: OrderId) -> Result<Option<AssetReservation>, LedgerError>;

    async fn usable_balance(
        &self,
        customer_id: CustomerId,
        instrument: &str,
    ) -> Result<Decimal, LedgerError> {
        Ok(self
            .balance(customer_id, instrument)
            .await?
            .map(|b| b.usable())
            .unwrap_or(Decimal::ZERO))
    }

    /// Advisory only; commitment always goes through `reserve`.
    async fn balance_check(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<bool, LedgerError> {
        Ok(self.usable_balance(customer_id, instrument).await? >= amount)
    }
}
