use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use std::str::FromStr;

use super::{Trade, TradeLedger};
use crate::core_types::{CustomerId, OrderId, Side, TradeId};
use crate::error::StoreError;

/// Insert one trade on an open connection; a repeated id is ignored.
pub async fn insert_trade(conn: &mut PgConnection, t: &Trade) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO trades (trade_id, buy_order_id, sell_order_id, buyer_customer_id,
                            seller_customer_id, instrument, quantity, price, total_value,
                            taker_side, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (trade_id) DO NOTHING
        "#,
    )
    .bind(t.trade_id)
    .bind(t.buy_order_id)
    .bind(t.sell_order_id)
    .bind(t.buyer_customer_id)
    .bind(t.seller_customer_id)
    .bind(&t.instrument)
    .bind(t.quantity)
    .bind(t.price)
    .bind(t.total_value)
    .bind(t.taker_side.as_str())
    .bind(t.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn trade_from_row(row: &PgRow) -> Result<Trade, StoreError> {
    let side: String = row.try_get("taker_side")?;
    Ok(Trade {
        trade_id: row.try_get("trade_id")?,
        buy_order_id: row.try_get("buy_order_id")?,
        sell_order_id: row.try_get("sell_order_id")?,
        buyer_customer_id: row.try_get("buyer_customer_id")?,
        seller_customer_id: row.try_get("seller_customer_id")?,
        instrument: row.try_get("instrument")?,
        quantity: row.try_get("quantity")?,
        price: row.try_get("price")?,
        total_value: row.try_get("total_value")?,
        taker_side: Side::from_str(&side).map_err(StoreError::Corrupt)?,
        created_at: row.try_get("created_at")?,
    })
}

pub struct PgTradeLedger {
    pool: PgPool,
}

impl PgTradeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeLedger for PgTradeLedger {
    async fn save_trade(&self, trade: &Trade) -> Result<Trade, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_trade(&mut conn, trade).await?;
        self.get(trade.trade_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("trade {} vanished", trade.trade_id)))
    }

    async fn get(&self, trade_id: TradeId) -> Result<Option<Trade>, StoreError> {
        let row = sqlx::query("SELECT * FROM trades WHERE trade_id = $1")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn trades_for_order(&self, order_id: OrderId) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE buy_order_id = $1 OR sell_order_id = $1 ORDER BY seq ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn trades_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE buyer_customer_id = $1 OR seller_customer_id = $1 ORDER BY seq ASC",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn trades_for_instrument(
        &self,
        instrument: &str,
        limit: i64,
    ) -> Result<Vec<Trade>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM trades WHERE instrument = $1 ORDER BY seq DESC LIMIT $2")
                .bind(instrument)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn count_for_instrument(&self, instrument: &str) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades WHERE instrument = $1")
            .bind(instrument)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
