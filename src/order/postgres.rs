use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::str::FromStr;

use super::store::OrderStore;
use super::types::{Order, OrderStatus};
use crate::core_types::{CustomerId, CustomerTier, OrderId, Side};
use crate::error::StoreError;
use crate::outbox::postgres::{insert_events, ORDER_OUTBOX_TABLE};
use crate::outbox::OutboxEvent;

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    let tier: String = row.try_get("tier")?;
    Ok(Order {
        order_id: row.try_get("order_id")?,
        customer_id: row.try_get("customer_id")?,
        instrument: row.try_get("instrument")?,
        side: Side::from_str(&side).map_err(StoreError::Corrupt)?,
        price: row.try_get("price")?,
        size: row.try_get("size")?,
        filled_size: row.try_get("filled_size")?,
        status: OrderStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        tier: CustomerTier::from_str(&tier).map_err(StoreError::Corrupt)?,
        idempotency_key: row.try_get("idempotency_key")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(
        &self,
        o: &Order,
        events: Vec<OutboxEvent>,
    ) -> Result<(Order, bool), StoreError> {
        let mut tx = self.pool.begin().await?;
        // Unique indexes on order_id and idempotency_key both count as "exists"
        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (order_id, customer_id, instrument, side, price, size,
                                filled_size, status, tier, idempotency_key, reason,
                                created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(o.order_id)
        .bind(o.customer_id)
        .bind(&o.instrument)
        .bind(o.side.as_str())
        .bind(o.price)
        .bind(o.size)
        .bind(o.filled_size)
        .bind(o.status.as_str())
        .bind(o.tier.as_str())
        .bind(&o.idempotency_key)
        .bind(&o.reason)
        .bind(o.created_at)
        .bind(o.updated_at)
        .bind(o.version)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            insert_events(&mut tx, ORDER_OUTBOX_TABLE, &events).await?;
            tx.commit().await?;
            return Ok((o.clone(), true));
        }
        tx.rollback().await?;

        let existing = match &o.idempotency_key {
            Some(key) => self.find_by_idempotency_key(key).await?,
            None => None,
        };
        let existing = match existing {
            Some(e) => Some(e),
            None => self.get(o.order_id).await?,
        };
        existing
            .map(|e| (e, false))
            .ok_or_else(|| StoreError::Corrupt(format!("order {} conflict without row", o.order_id)))
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn save(
        &self,
        o: &Order,
        events: Vec<OutboxEvent>,
    ) -> Result<Option<Order>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE orders
            SET filled_size = $3, status = $4, reason = $5,
                updated_at = NOW(), version = version + 1
            WHERE order_id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(o.order_id)
        .bind(o.version)
        .bind(o.filled_size)
        .bind(o.status.as_str())
        .bind(&o.reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let saved = order_from_row(&row)?;
        insert_events(&mut tx, ORDER_OUTBOX_TABLE, &events).await?;
        tx.commit().await?;
        Ok(Some(saved))
    }

    async fn orders_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Order>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM orders WHERE customer_id = $1 ORDER BY created_at DESC")
                .bind(customer_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(order_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::order::types::CreateOrderRequest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_idempotent_insert_and_versioned_save() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let db = Database::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        let store = PgOrderStore::new(db.pool().clone());

        let key = format!("req-{}", Uuid::new_v4());
        let req = CreateOrderRequest {
            order_id: None,
            customer_id: Uuid::new_v4(),
            instrument: "THYAO".into(),
            side: Side::Buy,
            price: dec!(95.5),
            size: dec!(20),
            tier: CustomerTier::Premium,
            idempotency_key: Some(key.clone()),
        };
        let first = Order::new(&req);
        let (stored, created) = store.insert(&first, vec![]).await.unwrap();
        assert!(created);
        assert_eq!(stored.tier, CustomerTier::Premium);

        let (dup, created) = store.insert(&Order::new(&req), vec![]).await.unwrap();
        assert!(!created);
        assert_eq!(dup.order_id, first.order_id);

        let mut next = stored.clone();
        next.status = OrderStatus::AssetReserved;
        let saved = store.save(&next, vec![]).await.unwrap().unwrap();
        assert_eq!(saved.version, stored.version + 1);
        assert!(store.save(&next, vec![]).await.unwrap().is_none());

        let by_key = store.find_by_idempotency_key(&key).await.unwrap().unwrap();
        assert_eq!(by_key.status, OrderStatus::AssetReserved);
    }
}
