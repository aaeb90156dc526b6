//! In-memory Asset Ledger
//!
//! One `std::sync::Mutex` per balance row. An operation locks every row it
//! touches in canonical key order, works on copies, and writes the copies
//! back together with its outbox events only if every rule passed. No lock
//! is held across an `.await`.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

use super::error::LedgerError;
use super::rules::{self, LockPlan, Rows};
use super::types::{
    AssetReservation, BalanceKey, ReleaseOutcome, ReservationStatus, ReserveOutcome,
    TradeSettlement,
};
use super::AssetLedger;
use crate::balance::Balance;
use crate::core_types::{CustomerId, OrderId, TradeId};
use crate::outbox::{MemoryOutbox, OutboxEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct MemoryLedger {
    rows: DashMap<BalanceKey, Arc<Mutex<Balance>>>,
    reservations: Mutex<HashMap<OrderId, AssetReservation>>,
    settled_trades: Mutex<HashSet<TradeId>>,
    outbox: Arc<MemoryOutbox>,
}

impl MemoryLedger {
    pub fn new(outbox: Arc<MemoryOutbox>) -> Self {
        Self {
            rows: DashMap::new(),
            reservations: Mutex::new(HashMap::new()),
            settled_trades: Mutex::new(HashSet::new()),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Arc<MemoryOutbox> {
        &self.outbox
    }

    fn cell(&self, key: &BalanceKey, create: bool) -> Option<Arc<Mutex<Balance>>> {
        if create {
            return Some(self.rows.entry(key.clone()).or_default().value().clone());
        }
        self.rows.get(key).map(|r| r.value().clone())
    }

    /// Lock the planned rows, run `f` on copies, commit on success.
    fn with_rows<R>(
        &self,
        plan: LockPlan,
        f: impl FnOnce(&mut Rows) -> Result<(R, Vec<OutboxEvent>), LedgerError>,
    ) -> Result<R, LedgerError> {
        let plan = rules::canonical(plan);
        let cells: Vec<(BalanceKey, Arc<Mutex<Balance>>)> = plan
            .iter()
            .filter_map(|(key, create)| self.cell(key, *create).map(|c| (key.clone(), c)))
            .collect();

        // Canonical order: `plan` is sorted and `cells` preserves it
        let mut guards: Vec<(BalanceKey, MutexGuard<'_, Balance>)> = cells
            .iter()
            .map(|(key, cell)| (key.clone(), lock(cell)))
            .collect();

        let mut rows = Rows::new();
        for (key, guard) in &guards {
            rows.insert(key.clone(), **guard);
        }

        let (result, events) = f(&mut rows)?;

        self.outbox.push(events);
        let mut updated = rows.into_inner();
        for (key, guard) in guards.iter_mut() {
            if let Some(b) = updated.remove(key) {
                **guard = b;
            }
        }
        Ok(result)
    }

    fn log_invariant(op: &str, key: &BalanceKey, err: &LedgerError) {
        if matches!(err, LedgerError::InvalidState(_)) {
            error!(op, key = %key, error = %err, "Ledger invariant violation, operation refused");
        }
    }
}

#[async_trait]
impl AssetLedger for MemoryLedger {
    async fn reserve(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        self.with_rows(vec![(key.clone(), false)], |rows| {
            rules::reserve(rows, &key, amount, None)
        })
    }

    async fn reserve_for_order(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<ReserveOutcome, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        let outcome = self.with_rows(vec![(key.clone(), false)], |rows| {
            let mut reservations = lock(&self.reservations);
            if let Some(r) = reservations.get(&order_id) {
                if r.status == ReservationStatus::Active {
                    return Ok((ReserveOutcome::AlreadyReserved, Vec::new()));
                }
            }
            let (_, events) = rules::reserve(rows, &key, amount, Some(order_id))?;
            let now = Utc::now();
            reservations.insert(
                order_id,
                AssetReservation {
                    order_id,
                    customer_id,
                    instrument: instrument.to_string(),
                    amount,
                    released_amount: Decimal::ZERO,
                    status: ReservationStatus::Active,
                    created_at: now,
                    updated_at: now,
                },
            );
            Ok((ReserveOutcome::Reserved, events))
        })?;
        match outcome {
            ReserveOutcome::Reserved => {
                info!(order_id = %order_id, key = %key, amount = %amount, "Reserved for order")
            }
            ReserveOutcome::AlreadyReserved => {
                debug!(order_id = %order_id, "Reservation already active")
            }
        }
        Ok(outcome)
    }

    async fn release(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        self.with_rows(vec![(key.clone(), false)], |rows| {
            rules::release(rows, &key, amount, None)
        })
        .inspect_err(|e| Self::log_invariant("release", &key, e))
    }

    async fn release_for_order(
        &self,
        order_id: OrderId,
        amount: Option<Decimal>,
    ) -> Result<ReleaseOutcome, LedgerError> {
        let key = match lock(&self.reservations).get(&order_id) {
            Some(r) => BalanceKey::new(r.customer_id, &r.instrument),
            None => return Ok(ReleaseOutcome::NoReservation),
        };

        self.with_rows(vec![(key.clone(), false)], |rows| {
            let mut reservations = lock(&self.reservations);
            let Some(r) = reservations.get_mut(&order_id) else {
                return Ok((ReleaseOutcome::NoReservation, Vec::new()));
            };
            if r.status == ReservationStatus::Released {
                return Ok((ReleaseOutcome::AlreadyReleased, Vec::new()));
            }
            let to_release = amount.unwrap_or(r.amount).min(r.amount);
            let events = if to_release > Decimal::ZERO {
                rules::release(rows, &key, to_release, Some(order_id))?.1
            } else {
                Vec::new()
            };
            r.status = ReservationStatus::Released;
            r.released_amount = to_release;
            r.updated_at = Utc::now();
            Ok((ReleaseOutcome::Released(to_release), events))
        })
        .inspect_err(|e| Self::log_invariant("release_for_order", &key, e))
    }

    async fn settle(
        &self,
        customer_id: CustomerId,
        from_instrument: &str,
        from_amount: Decimal,
        to_instrument: &str,
        to_amount: Decimal,
    ) -> Result<(), LedgerError> {
        let plan = rules::settle_plan(customer_id, from_instrument, to_instrument)?;
        self.with_rows(plan, |rows| {
            let events = rules::settle(
                rows,
                customer_id,
                from_instrument,
                from_amount,
                to_instrument,
                to_amount,
            )?;
            Ok(((), events))
        })
    }

    async fn credit(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        rules::ensure_positive(amount)?;
        let key = BalanceKey::new(customer_id, instrument);
        self.with_rows(vec![(key.clone(), true)], |rows| {
            rules::credit(rows, &key, amount)
        })
    }

    async fn debit(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        self.with_rows(vec![(key.clone(), false)], |rows| {
            rules::debit(rows, &key, amount)
        })
    }

    async fn apply_trade_settlement(&self, s: &TradeSettlement) -> Result<bool, LedgerError> {
        let applied = self.with_rows(rules::trade_plan(s), |rows| {
            let mut settled = lock(&self.settled_trades);
            if settled.contains(&s.trade_id) {
                return Ok((false, Vec::new()));
            }
            let events = rules::settle_trade(rows, s)?;
            settled.insert(s.trade_id);
            Ok((true, events))
        })?;
        if applied {
            info!(trade_id = %s.trade_id, instrument = %s.instrument, "Trade settled");
        } else {
            debug!(trade_id = %s.trade_id, "Trade already settled");
        }
        Ok(applied)
    }

    async fn balance(
        &self,
        customer_id: CustomerId,
        instrument: &str,
    ) -> Result<Option<Balance>, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        Ok(self.cell(&key, false).map(|c| {
            let b = *lock(&c);
            b
        }))
    }

    async fn balances_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<(String, Balance)>, LedgerError> {
        let cells: Vec<(String, Arc<Mutex<Balance>>)> = self
            .rows
            .iter()
            .filter(|r| r.key().customer_id == customer_id)
            .map(|r| (r.key().instrument.clone(), r.value().clone()))
            .collect();
        let mut out: Vec<(String, Balance)> = cells
            .into_iter()
            .map(|(i, c)| {
                let b = *lock(&c);
                (i, b)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn reservation(&self, order_id: OrderId) -> Result<Option<AssetReservation>, LedgerError> {
        Ok(lock(&self.reservations).get(&order_id).cloned())
    }
}
