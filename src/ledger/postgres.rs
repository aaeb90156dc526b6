//! PostgreSQL Asset Ledger
//!
//! Same rules as the in-memory ledger; row locks are `SELECT … FOR UPDATE`
//! taken in canonical key order inside one transaction, and the outbox rows
//! are inserted in that same transaction.
//!
//! Lock order across tables: `asset_reservations` / `settled_trades` first,
//! then `balances` rows.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{PgConnection, Row};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

use super::error::LedgerError;
use super::rules::{self, LockPlan, Rows};
use super::types::{
    AssetReservation, BalanceKey, ReleaseOutcome, ReservationStatus, ReserveOutcome,
    TradeSettlement,
};
use super::AssetLedger;
use crate::balance::Balance;
use crate::core_types::{CustomerId, OrderId};
use crate::error::StoreError;
use crate::outbox::postgres::{LEDGER_OUTBOX_TABLE, insert_events};
use crate::outbox::OutboxEvent;

type Snapshot = BTreeMap<BalanceKey, Balance>;

fn balance_from_row(row: &sqlx::postgres::PgRow) -> Result<Balance, LedgerError> {
    let usable: Decimal = row.try_get("usable")?;
    let blocked: Decimal = row.try_get("blocked")?;
    let version: i64 = row.try_get("version")?;
    Balance::from_parts(usable, blocked, version).ok_or_else(|| {
        LedgerError::Store(StoreError::Corrupt(format!(
            "negative balance row: usable={} blocked={}",
            usable, blocked
        )))
    })
}

/// Lock planned rows (creating where allowed) in canonical order.
async fn lock_rows(conn: &mut PgConnection, plan: LockPlan) -> Result<(Rows, Snapshot), LedgerError> {
    let mut rows = Rows::new();
    let mut snapshot = Snapshot::new();
    for (key, create) in rules::canonical(plan) {
        if create {
            sqlx::query(
                r#"
                INSERT INTO balances (customer_id, instrument, usable, blocked, version)
                VALUES ($1, $2, 0, 0, 0)
                ON CONFLICT (customer_id, instrument) DO NOTHING
                "#,
            )
            .bind(key.customer_id)
            .bind(&key.instrument)
            .execute(&mut *conn)
            .await?;
        }
        let row = sqlx::query(
            r#"
            SELECT usable, blocked, version FROM balances
            WHERE customer_id = $1 AND instrument = $2
            FOR UPDATE
            "#,
        )
        .bind(key.customer_id)
        .bind(&key.instrument)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = row {
            let b = balance_from_row(&row)?;
            snapshot.insert(key.clone(), b);
            rows.insert(key, b);
        }
    }
    Ok((rows, snapshot))
}

/// Write back changed rows and the outbox events.
async fn write_back(
    conn: &mut PgConnection,
    snapshot: &Snapshot,
    rows: Rows,
    events: &[OutboxEvent],
) -> Result<(), LedgerError> {
    for (key, b) in rows.into_inner() {
        if snapshot.get(&key) == Some(&b) {
            continue;
        }
        sqlx::query(
            r#"
            UPDATE balances
            SET usable = $3, blocked = $4, version = $5, updated_at = NOW()
            WHERE customer_id = $1 AND instrument = $2
            "#,
        )
        .bind(key.customer_id)
        .bind(&key.instrument)
        .bind(b.usable())
        .bind(b.blocked())
        .bind(b.version())
        .execute(&mut *conn)
        .await?;
    }
    insert_events(conn, LEDGER_OUTBOX_TABLE, events).await?;
    Ok(())
}

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Single-transaction helper for operations with no side tables.
    async fn run<R>(
        &self,
        plan: LockPlan,
        f: impl FnOnce(&mut Rows) -> Result<(R, Vec<OutboxEvent>), LedgerError> + Send,
    ) -> Result<R, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let (mut rows, snapshot) = lock_rows(&mut tx, plan).await?;
        let (result, events) = f(&mut rows)?;
        write_back(&mut tx, &snapshot, rows, &events).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn load_reservation(
        conn: &mut PgConnection,
        order_id: OrderId,
        for_update: bool,
    ) -> Result<Option<AssetReservation>, LedgerError> {
        let sql = if for_update {
            "SELECT * FROM asset_reservations WHERE order_id = $1 FOR UPDATE"
        } else {
            "SELECT * FROM asset_reservations WHERE order_id = $1"
        };
        let row = sqlx::query(sql)
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: i16 = row.try_get("status")?;
        Ok(Some(AssetReservation {
            order_id: row.try_get("order_id")?,
            customer_id: row.try_get("customer_id")?,
            instrument: row.try_get("instrument")?,
            amount: row.try_get("amount")?,
            released_amount: row.try_get("released_amount")?,
            status: ReservationStatus::from_id(status).ok_or_else(|| {
                LedgerError::Store(StoreError::Corrupt(format!(
                    "reservation status {}",
                    status
                )))
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

#[async_trait]
impl AssetLedger for PgLedger {
    async fn reserve(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        let k = key.clone();
        self.run(vec![(key, false)], move |rows| {
            rules::reserve(rows, &k, amount, None)
        })
        .await
    }

    async fn reserve_for_order(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<ReserveOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        if let Some(r) = Self::load_reservation(&mut tx, order_id, true).await? {
            if r.status == ReservationStatus::Active {
                tx.rollback().await?;
                debug!(order_id = %order_id, "Reservation already active");
                return Ok(ReserveOutcome::AlreadyReserved);
            }
        }

        let key = BalanceKey::new(customer_id, instrument);
        let (mut rows, snapshot) = lock_rows(&mut tx, vec![(key.clone(), false)]).await?;
        let (_, events) = rules::reserve(&mut rows, &key, amount, Some(order_id))?;

        sqlx::query(
            r#"
            INSERT INTO asset_reservations
                (order_id, customer_id, instrument, amount, released_amount, status)
            VALUES ($1, $2, $3, $4, 0, $5)
            ON CONFLICT (order_id) DO UPDATE
            SET customer_id = EXCLUDED.customer_id,
                instrument = EXCLUDED.instrument,
                amount = EXCLUDED.amount,
                released_amount = 0,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(order_id)
        .bind(customer_id)
        .bind(instrument)
        .bind(amount)
        .bind(ReservationStatus::Active.id())
        .execute(&mut *tx)
        .await?;

        write_back(&mut tx, &snapshot, rows, &events).await?;
        tx.commit().await?;
        info!(order_id = %order_id, key = %key, amount = %amount, "Reserved for order");
        Ok(ReserveOutcome::Reserved)
    }

    async fn release(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        let k = key.clone();
        self.run(vec![(key.clone(), false)], move |rows| {
            rules::release(rows, &k, amount, None)
        })
        .await
        .inspect_err(|e| {
            if matches!(e, LedgerError::InvalidState(_)) {
                error!(key = %key, error = %e, "Ledger invariant violation, release refused");
            }
        })
    }

    async fn release_for_order(
        &self,
        order_id: OrderId,
        amount: Option<Decimal>,
    ) -> Result<ReleaseOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let Some(r) = Self::load_reservation(&mut tx, order_id, true).await? else {
            tx.rollback().await?;
            return Ok(ReleaseOutcome::NoReservation);
        };
        if r.status == ReservationStatus::Released {
            tx.rollback().await?;
            return Ok(ReleaseOutcome::AlreadyReleased);
        }

        let key = BalanceKey::new(r.customer_id, &r.instrument);
        let to_release = amount.unwrap_or(r.amount).min(r.amount);
        let (mut rows, snapshot) = lock_rows(&mut tx, vec![(key.clone(), false)]).await?;
        let events = if to_release > Decimal::ZERO {
            match rules::release(&mut rows, &key, to_release, Some(order_id)) {
                Ok((_, events)) => events,
                Err(e) => {
                    error!(order_id = %order_id, key = %key, error = %e, "Order release refused");
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        sqlx::query(
            r#"
            UPDATE asset_reservations
            SET status = $2, released_amount = $3, updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(ReservationStatus::Released.id())
        .bind(to_release)
        .execute(&mut *tx)
        .await?;

        write_back(&mut tx, &snapshot, rows, &events).await?;
        tx.commit().await?;
        Ok(ReleaseOutcome::Released(to_release))
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
        let (from, to) = (from_instrument.to_string(), to_instrument.to_string());
        self.run(plan, move |rows| {
            let events = rules::settle(rows, customer_id, &from, from_amount, &to, to_amount)?;
            Ok(((), events))
        })
        .await
    }

    async fn credit(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        rules::ensure_positive(amount)?;
        let key = BalanceKey::new(customer_id, instrument);
        let k = key.clone();
        self.run(vec![(key, true)], move |rows| rules::credit(rows, &k, amount))
            .await
    }

    async fn debit(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<Balance, LedgerError> {
        let key = BalanceKey::new(customer_id, instrument);
        let k = key.clone();
        self.run(vec![(key, false)], move |rows| rules::debit(rows, &k, amount))
            .await
    }

    async fn apply_trade_settlement(&self, s: &TradeSettlement) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO settled_trades (trade_id) VALUES ($1) ON CONFLICT (trade_id) DO NOTHING",
        )
        .bind(s.trade_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            debug!(trade_id = %s.trade_id, "Trade already settled");
            return Ok(false);
        }

        let (mut rows, snapshot) = lock_rows(&mut tx, rules::trade_plan(s)).await?;
        let events = rules::settle_trade(&mut rows, s)?;
        write_back(&mut tx, &snapshot, rows, &events).await?;
        tx.commit().await?;
        info!(trade_id = %s.trade_id, instrument = %s.instrument, "Trade settled");
        Ok(true)
    }

    async fn balance(
        &self,
        customer_id: CustomerId,
        instrument: &str,
    ) -> Result<Option<Balance>, LedgerError> {
        let row = sqlx::query(
            "SELECT usable, blocked, version FROM balances WHERE customer_id = $1 AND instrument = $2",
        )
        .bind(customer_id)
        .bind(instrument)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn balances_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<(String, Balance)>, LedgerError> {
        let rows = sqlx::query(
            "SELECT instrument, usable, blocked, version FROM balances WHERE customer_id = $1 ORDER BY instrument",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("instrument")?, balance_from_row(row)?)))
            .collect()
    }

    async fn reservation(&self, order_id: OrderId) -> Result<Option<AssetReservation>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        Self::load_reservation(&mut conn, order_id, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn ledger() -> PgLedger {
        let url = std::env::var("DATABASE_URL").unwrap();
        let db = crate::db::Database::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        PgLedger::new(db.pool().clone())
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_pg_reserve_release_round_trip() {
        let l = ledger().await;
        let c = Uuid::new_v4();
        l.credit(c, "TRY", dec!(10000)).await.unwrap();
        let b = l.reserve(c, "TRY", dec!(1500)).await.unwrap();
        assert_eq!((b.usable(), b.blocked()), (dec!(8500), dec!(1500)));
        let b = l.release(c, "TRY", dec!(1500)).await.unwrap();
        assert_eq!((b.usable(), b.blocked()), (dec!(10000), dec!(0)));
        assert!(l.release(c, "TRY", dec!(1)).await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_pg_trade_settlement_idempotent() {
        let l = ledger().await;
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        l.credit(buyer, "TRY", dec!(1500)).await.unwrap();
        l.reserve(buyer, "TRY", dec!(1500)).await.unwrap();
        l.credit(seller, "AAPL", dec!(10)).await.unwrap();
        l.reserve(seller, "AAPL", dec!(10)).await.unwrap();

        let s = TradeSettlement {
            trade_id: Uuid::new_v4(),
            instrument: "AAPL".into(),
            currency: "TRY".into(),
            quantity: dec!(10),
            price: dec!(150),
            buyer_customer_id: buyer,
            seller_customer_id: seller,
            buyer_limit_price: dec!(150),
        };
        assert!(l.apply_trade_settlement(&s).await.unwrap());
        assert!(!l.apply_trade_settlement(&s).await.unwrap());
        assert_eq!(l.usable_balance(seller, "TRY").await.unwrap(), dec!(1500));
        assert_eq!(l.usable_balance(buyer, "AAPL").await.unwrap(), dec!(10));
    }
}
