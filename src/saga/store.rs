//! Saga persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

use super::state::SagaStatus;
use super::types::{CorrelationId, SagaInstance};
use crate::error::StoreError;
use crate::outbox::{MemoryOutbox, OutboxEvent};

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert unless a saga with this correlation id exists.
    /// Returns the stored instance and whether it was created.
    async fn create_if_absent(
        &self,
        saga: &SagaInstance,
    ) -> Result<(SagaInstance, bool), StoreError>;

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>, StoreError>;

    /// Compare-and-swap on `saga.version`; the stored version becomes
    /// `saga.version + 1`. `None` if the stored version moved on.
    async fn save(
        &self,
        saga: &SagaInstance,
        events: Vec<OutboxEvent>,
    ) -> Result<Option<SagaInstance>, StoreError>;

    /// In-flight sagas past `expires_at`
    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, StoreError>;

    /// FAILED, transient, with retries left
    async fn find_retryable(&self, limit: usize) -> Result<Vec<SagaInstance>, StoreError>;

    async fn find_by_status(
        &self,
        status: SagaStatus,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, StoreError>;

    async fn count_by_status(&self, status: SagaStatus) -> Result<i64, StoreError>;
}

pub struct MemorySagaStore {
    sagas: DashMap<CorrelationId, SagaInstance>,
    outbox: Arc<MemoryOutbox>,
}

impl MemorySagaStore {
    pub fn new(outbox: Arc<MemoryOutbox>) -> Self {
        Self {
            sagas: DashMap::new(),
            outbox,
        }
    }

    fn collect<F: Fn(&SagaInstance) -> bool>(&self, f: F, limit: usize) -> Vec<SagaInstance> {
        let mut found: Vec<SagaInstance> = self
            .sagas
            .iter()
            .filter(|s| f(s.value()))
            .map(|s| s.value().clone())
            .collect();
        found.sort_by_key(|s| s.updated_at);
        found.truncate(limit);
        found
    }
}

#[async_trait]
impl SagaStore for MemorySagaStore {
    async fn create_if_absent(
        &self,
        saga: &SagaInstance,
    ) -> Result<(SagaInstance, bool), StoreError> {
        match self.sagas.entry(saga.correlation_id) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                slot.insert(saga.clone());
                Ok((saga.clone(), true))
            }
        }
    }

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>, StoreError> {
        Ok(self.sagas.get(&correlation_id).map(|s| s.value().clone()))
    }

    async fn save(
        &self,
        saga: &SagaInstance,
        events: Vec<OutboxEvent>,
    ) -> Result<Option<SagaInstance>, StoreError> {
        let Some(mut slot) = self.sagas.get_mut(&saga.correlation_id) else {
            return Ok(None);
        };
        if slot.version != saga.version {
            return Ok(None);
        }
        let mut next = saga.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *slot = next.clone();
        // Still holding the shard lock
        self.outbox.push(events);
        Ok(Some(next))
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        Ok(self.collect(|s| s.is_expired(now), limit))
    }

    async fn find_retryable(&self, limit: usize) -> Result<Vec<SagaInstance>, StoreError> {
        Ok(self.collect(|s| s.is_retryable(), limit))
    }

    async fn find_by_status(
        &self,
        status: SagaStatus,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        Ok(self.collect(|s| s.status == status, limit))
    }

    async fn count_by_status(&self, status: SagaStatus) -> Result<i64, StoreError> {
        Ok(self.sagas.iter().filter(|s| s.status == status).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{CustomerTier, Side};
    use crate::saga::types::OrderPayload;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn saga() -> SagaInstance {
        let id = Uuid::new_v4();
        SagaInstance::new(
            id,
            OrderPayload {
                order_id: id,
                customer_id: Uuid::new_v4(),
                instrument: "AAPL".into(),
                side: Side::Sell,
                price: dec!(10),
                size: dec!(1),
                tier: CustomerTier::Standard,
            },
            3,
            Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn test_create_if_absent_returns_existing() {
        let store = MemorySagaStore::new(Arc::new(MemoryOutbox::new()));
        let first = saga();
        let (stored, created) = store.create_if_absent(&first).await.unwrap();
        assert!(created);

        let mut dup = saga();
        dup.correlation_id = first.correlation_id;
        let (again, created) = store.create_if_absent(&dup).await.unwrap();
        assert!(!created);
        assert_eq!(again.saga_id, stored.saga_id);
    }

    #[tokio::test]
    async fn test_save_rejects_stale_version() {
        let store = MemorySagaStore::new(Arc::new(MemoryOutbox::new()));
        let (s, _) = store.create_if_absent(&saga()).await.unwrap();

        let mut a = s.clone();
        a.status = SagaStatus::InProgress;
        let saved = store.save(&a, vec![]).await.unwrap().unwrap();
        assert_eq!(saved.version, 1);

        // Second writer still holds version 0
        let mut b = s.clone();
        b.status = SagaStatus::Compensating;
        assert!(store.save(&b, vec![]).await.unwrap().is_none());
        assert_eq!(
            store.get(s.correlation_id).await.unwrap().unwrap().status,
            SagaStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_queries() {
        let store = MemorySagaStore::new(Arc::new(MemoryOutbox::new()));
        let (s, _) = store.create_if_absent(&saga()).await.unwrap();
        let later = Utc::now() + Duration::minutes(10);
        assert_eq!(store.find_expired(later, 10).await.unwrap().len(), 1);
        assert!(store.find_expired(Utc::now(), 10).await.unwrap().is_empty());

        let mut failed = s.clone();
        failed.status = SagaStatus::Failed;
        failed.transient_failure = true;
        store.save(&failed, vec![]).await.unwrap().unwrap();
        assert_eq!(store.find_retryable(10).await.unwrap().len(), 1);
        assert_eq!(store.count_by_status(SagaStatus::Failed).await.unwrap(), 1);
        assert!(store.find_expired(later, 10).await.unwrap().is_empty());
    }
}
