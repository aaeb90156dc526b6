use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::str::FromStr;

use super::state::{SagaStatus, SagaStep};
use super::store::SagaStore;
use super::types::{CorrelationId, OrderPayload, SagaInstance, SagaType};
use crate::error::StoreError;
use crate::outbox::postgres::{insert_events, ORDER_OUTBOX_TABLE};
use crate::outbox::OutboxEvent;

fn saga_from_row(row: &PgRow) -> Result<SagaInstance, StoreError> {
    let saga_type: String = row.try_get("saga_type")?;
    let status: i16 = row.try_get("status")?;
    let current_step: String = row.try_get("current_step")?;
    let completed: serde_json::Value = row.try_get("completed_steps")?;
    let completed: Vec<String> = serde_json::from_value(completed)?;
    let failed_step: Option<String> = row.try_get("failed_step")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload: OrderPayload = serde_json::from_value(payload)?;

    Ok(SagaInstance {
        saga_id: row.try_get("saga_id")?,
        correlation_id: row.try_get("correlation_id")?,
        saga_type: SagaType::parse(&saga_type)
            .ok_or_else(|| StoreError::Corrupt(format!("saga type {}", saga_type)))?,
        status: SagaStatus::from_id(status)
            .ok_or_else(|| StoreError::Corrupt(format!("saga status {}", status)))?,
        current_step: SagaStep::from_str(&current_step).map_err(StoreError::Corrupt)?,
        completed_steps: completed
            .iter()
            .map(|s| SagaStep::from_str(s))
            .collect::<Result<_, _>>()
            .map_err(StoreError::Corrupt)?,
        payload,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        failed_step: failed_step
            .as_deref()
            .map(SagaStep::from_str)
            .transpose()
            .map_err(StoreError::Corrupt)?,
        transient_failure: row.try_get("transient_failure")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
        version: row.try_get("version")?,
    })
}

fn steps_json(steps: &[SagaStep]) -> serde_json::Value {
    serde_json::Value::from(steps.iter().map(|s| s.as_str()).collect::<Vec<_>>())
}

pub struct PgSagaStore {
    pool: PgPool,
}

impl PgSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select(
        &self,
        where_clause: &str,
        status: SagaStatus,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        let sql = format!(
            "SELECT * FROM sagas WHERE {} ORDER BY updated_at ASC LIMIT $2",
            where_clause
        );
        let rows = sqlx::query(&sql)
            .bind(status.id())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(saga_from_row).collect()
    }
}

#[async_trait]
impl SagaStore for PgSagaStore {
    async fn create_if_absent(
        &self,
        s: &SagaInstance,
    ) -> Result<(SagaInstance, bool), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sagas (saga_id, correlation_id, saga_type, status, current_step,
                               completed_steps, payload, retry_count, max_retries,
                               failed_step, transient_failure, error_message,
                               created_at, updated_at, completed_at, expires_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(s.saga_id)
        .bind(s.correlation_id)
        .bind(s.saga_type.as_str())
        .bind(s.status.id())
        .bind(s.current_step.as_str())
        .bind(steps_json(&s.completed_steps))
        .bind(serde_json::to_value(&s.payload)?)
        .bind(s.retry_count)
        .bind(s.max_retries)
        .bind(s.failed_step.map(|f| f.as_str()))
        .bind(s.transient_failure)
        .bind(&s.error_message)
        .bind(s.created_at)
        .bind(s.updated_at)
        .bind(s.completed_at)
        .bind(s.expires_at)
        .bind(s.version)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let stored = self
            .get(s.correlation_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("saga {} vanished", s.correlation_id)))?;
        Ok((stored, inserted))
    }

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM sagas WHERE correlation_id = $1")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(saga_from_row).transpose()
    }

    async fn save(
        &self,
        s: &SagaInstance,
        events: Vec<OutboxEvent>,
    ) -> Result<Option<SagaInstance>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $3, current_step = $4, completed_steps = $5, retry_count = $6,
                failed_step = $7, transient_failure = $8, error_message = $9,
                completed_at = $10, expires_at = $11, updated_at = NOW(),
                version = version + 1
            WHERE correlation_id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(s.correlation_id)
        .bind(s.version)
        .bind(s.status.id())
        .bind(s.current_step.as_str())
        .bind(steps_json(&s.completed_steps))
        .bind(s.retry_count)
        .bind(s.failed_step.map(|f| f.as_str()))
        .bind(s.transient_failure)
        .bind(&s.error_message)
        .bind(s.completed_at)
        .bind(s.expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let saved = saga_from_row(&row)?;
        insert_events(&mut tx, ORDER_OUTBOX_TABLE, &events).await?;
        tx.commit().await?;
        Ok(Some(saved))
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sagas
            WHERE status IN ($1, $2) AND expires_at < $3
            ORDER BY updated_at ASC
            LIMIT $4
            "#,
        )
        .bind(SagaStatus::Started.id())
        .bind(SagaStatus::InProgress.id())
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(saga_from_row).collect()
    }

    async fn find_retryable(&self, limit: usize) -> Result<Vec<SagaInstance>, StoreError> {
        let candidates = self
            .select(
                "status = $1 AND transient_failure AND retry_count < max_retries",
                SagaStatus::Failed,
                limit,
            )
            .await?;
        // Step-level retry rules live in code
        Ok(candidates.into_iter().filter(|s| s.is_retryable()).collect())
    }

    async fn find_by_status(
        &self,
        status: SagaStatus,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        self.select("status = $1", status, limit).await
    }

    async fn count_by_status(&self, status: SagaStatus) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sagas WHERE status = $1")
            .bind(status.id())
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
