use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use std::str::FromStr;

use super::queue::{MatchingQueueEntry, QueueStatus};
use super::store::{FillCommit, MatchingStore};
use crate::core_types::{OrderId, Side};
use crate::error::StoreError;
use crate::outbox::postgres::{insert_events, ORDER_OUTBOX_TABLE};
use crate::outbox::OutboxEvent;
use crate::trade::postgres::insert_trade;

fn entry_from_row(row: &PgRow) -> Result<MatchingQueueEntry, StoreError> {
    let side: String = row.try_get("side")?;
    let status: i16 = row.try_get("status")?;
    Ok(MatchingQueueEntry {
        order_id: row.try_get("order_id")?,
        customer_id: row.try_get("customer_id")?,
        instrument: row.try_get("instrument")?,
        side: Side::from_str(&side).map_err(StoreError::Corrupt)?,
        price: row.try_get("price")?,
        requested_size: row.try_get("requested_size")?,
        remaining_size: row.try_get("remaining_size")?,
        priority_tier: row.try_get("priority_tier")?,
        queued_at: row.try_get("queued_at")?,
        seq: row.try_get("seq")?,
        status: QueueStatus::from_id(status)
            .ok_or_else(|| StoreError::Corrupt(format!("queue status {}", status)))?,
        matched_at: row.try_get("matched_at")?,
        removed_at: row.try_get("removed_at")?,
        remove_reason: row.try_get("remove_reason")?,
    })
}

async fn update_entry(conn: &mut PgConnection, e: &MatchingQueueEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE matching_queue
        SET remaining_size = $2, status = $3, matched_at = $4,
            removed_at = $5, remove_reason = $6
        WHERE order_id = $1
        "#,
    )
    .bind(e.order_id)
    .bind(e.remaining_size)
    .bind(e.status.id())
    .bind(e.matched_at)
    .bind(e.removed_at)
    .bind(&e.remove_reason)
    .execute(conn)
    .await?;
    Ok(())
}

pub struct PgMatchingStore {
    pool: PgPool,
}

impl PgMatchingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MatchingStore for PgMatchingStore {
    async fn insert_entry(
        &self,
        e: &MatchingQueueEntry,
        events: Vec<OutboxEvent>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO matching_queue (order_id, customer_id, instrument, side, price,
                                        requested_size, remaining_size, priority_tier,
                                        queued_at, seq, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(e.order_id)
        .bind(e.customer_id)
        .bind(&e.instrument)
        .bind(e.side.as_str())
        .bind(e.price)
        .bind(e.requested_size)
        .bind(e.remaining_size)
        .bind(e.priority_tier)
        .bind(e.queued_at)
        .bind(e.seq)
        .bind(e.status.id())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_events(&mut tx, ORDER_OUTBOX_TABLE, &events).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_entry(&self, order_id: OrderId) -> Result<Option<MatchingQueueEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM matching_queue WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn save_entry(&self, entry: &MatchingQueueEntry) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_entry(&mut conn, entry).await?;
        Ok(())
    }

    async fn commit_fill(&self, fill: &FillCommit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_trade(&mut tx, &fill.trade).await?;
        update_entry(&mut tx, &fill.maker).await?;
        insert_events(&mut tx, ORDER_OUTBOX_TABLE, std::slice::from_ref(&fill.event)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_active(&self) -> Result<Vec<MatchingQueueEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM matching_queue WHERE status = $1 ORDER BY seq ASC")
            .bind(QueueStatus::Active.id())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn max_seq(&self) -> Result<i64, StoreError> {
        let n: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM matching_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.unwrap_or(0))
    }

    async fn active_count(&self) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM matching_queue WHERE status = $1")
            .bind(QueueStatus::Active.id())
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn active_count_for(&self, instrument: &str) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM matching_queue WHERE status = $1 AND instrument = $2",
        )
        .bind(QueueStatus::Active.id())
        .bind(instrument)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::CustomerTier;
    use crate::db::Database;
    use crate::matching::queue::QueueOrder;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_insert_is_idempotent() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let db = Database::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        let store = PgMatchingStore::new(db.pool().clone());

        let seq = store.max_seq().await.unwrap() + 1;
        let entry = MatchingQueueEntry::new(
            &QueueOrder {
                order_id: Uuid::new_v4(),
                customer_id: Uuid::new_v4(),
                instrument: "AAPL".into(),
                side: Side::Buy,
                price: dec!(150),
                size: dec!(10),
                tier: CustomerTier::Vip,
            },
            seq,
        );
        assert!(store.insert_entry(&entry, vec![]).await.unwrap());
        assert!(!store.insert_entry(&entry, vec![]).await.unwrap());

        let loaded = store.get_entry(entry.order_id).await.unwrap().unwrap();
        assert_eq!(loaded.priority_tier, 2);
        assert_eq!(loaded.remaining_size, dec!(10));
    }
}
