//! PostgreSQL outbox table
//!
//! Each owning service has its own table (`ledger_outbox`, `order_outbox`),
//! sharing one layout. Domain stores call [`insert_events`] inside their own
//! transaction; [`PgOutbox`] is the dispatcher side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use std::str::FromStr;
use ulid::Ulid;

use super::event::{EventType, OutboxEvent};
use super::store::OutboxStore;
use crate::error::StoreError;

pub const LEDGER_OUTBOX_TABLE: &str = "ledger_outbox";
pub const ORDER_OUTBOX_TABLE: &str = "order_outbox";

/// Insert events on an open connection (normally a transaction).
pub async fn insert_events(
    conn: &mut PgConnection,
    table: &str,
    events: &[OutboxEvent],
) -> Result<(), sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO {table} (id, aggregate_id, aggregate_type, event_type, topic,
                             partition_key, payload, processed, retry_count, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, 0, $8)
        "#
    );
    for e in events {
        sqlx::query(&sql)
            .bind(e.id.to_string())
            .bind(&e.aggregate_id)
            .bind(&e.aggregate_type)
            .bind(e.event_type.as_str())
            .bind(&e.topic)
            .bind(&e.partition_key)
            .bind(&e.payload)
            .bind(e.created_at)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    let id: String = row.try_get("id")?;
    let event_type: String = row.try_get("event_type")?;
    Ok(OutboxEvent {
        id: Ulid::from_str(&id).map_err(|e| StoreError::Corrupt(format!("outbox id {}: {}", id, e)))?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: EventType::from_str(&event_type).map_err(StoreError::Corrupt)?,
        topic: row.try_get("topic")?,
        partition_key: row.try_get("partition_key")?,
        payload: row.try_get("payload")?,
        processed: row.try_get("processed")?,
        processed_at: row.try_get::<Option<DateTime<Utc>>, _>("processed_at")?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

pub struct PgOutbox {
    pool: PgPool,
    table: &'static str,
}

impl PgOutbox {
    pub fn new(pool: PgPool, table: &'static str) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl OutboxStore for PgOutbox {
    async fn append(&self, events: Vec<OutboxEvent>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_events(&mut tx, self.table, &events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE processed = FALSE ORDER BY seq ASC LIMIT $1",
            self.table
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn mark_processed(&self, id: Ulid) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET processed = TRUE, processed_at = NOW(), error_message = NULL WHERE id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Ulid, error: &str) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET retry_count = retry_count + 1, error_message = $2 WHERE id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE processed = FALSE", self.table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}
