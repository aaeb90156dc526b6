//! Matching queue persistence

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::queue::{MatchingQueueEntry, QueueStatus};
use crate::core_types::OrderId;
use crate::error::StoreError;
use crate::outbox::{MemoryOutbox, OutboxEvent};
use crate::trade::{MemoryTradeLedger, Trade};

/// One executed fill: trade row, maker's new state and the trade event.
#[derive(Debug, Clone)]
pub struct FillCommit {
    pub trade: Trade,
    pub maker: MatchingQueueEntry,
    pub event: OutboxEvent,
}

#[async_trait]
pub trait MatchingStore: Send + Sync {
    /// Insert a new entry with its events; `false` if the order is already queued.
    async fn insert_entry(
        &self,
        entry: &MatchingQueueEntry,
        events: Vec<OutboxEvent>,
    ) -> Result<bool, StoreError>;

    async fn get_entry(&self, order_id: OrderId) -> Result<Option<MatchingQueueEntry>, StoreError>;

    async fn save_entry(&self, entry: &MatchingQueueEntry) -> Result<(), StoreError>;

    /// Trade, maker update and event as one atomic unit.
    async fn commit_fill(&self, fill: &FillCommit) -> Result<(), StoreError>;

    async fn load_active(&self) -> Result<Vec<MatchingQueueEntry>, StoreError>;

    async fn max_seq(&self) -> Result<i64, StoreError>;

    async fn active_count(&self) -> Result<i64, StoreError>;

    async fn active_count_for(&self, instrument: &str) -> Result<i64, StoreError>;
}

pub struct MemoryMatchingStore {
    entries: Mutex<HashMap<OrderId, MatchingQueueEntry>>,
    trades: Arc<MemoryTradeLedger>,
    outbox: Arc<MemoryOutbox>,
}

impl MemoryMatchingStore {
    pub fn new(trades: Arc<MemoryTradeLedger>, outbox: Arc<MemoryOutbox>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            trades,
            outbox,
        }
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<OrderId, MatchingQueueEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl MatchingStore for MemoryMatchingStore {
    async fn insert_entry(
        &self,
        entry: &MatchingQueueEntry,
        events: Vec<OutboxEvent>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.guard();
        if entries.contains_key(&entry.order_id) {
            return Ok(false);
        }
        entries.insert(entry.order_id, entry.clone());
        self.outbox.push(events);
        Ok(true)
    }

    async fn get_entry(&self, order_id: OrderId) -> Result<Option<MatchingQueueEntry>, StoreError> {
        Ok(self.guard().get(&order_id).cloned())
    }

    async fn save_entry(&self, entry: &MatchingQueueEntry) -> Result<(), StoreError> {
        self.guard().insert(entry.order_id, entry.clone());
        Ok(())
    }

    async fn commit_fill(&self, fill: &FillCommit) -> Result<(), StoreError> {
        let mut entries = self.guard();
        self.trades.insert(&fill.trade);
        entries.insert(fill.maker.order_id, fill.maker.clone());
        self.outbox.push([fill.event.clone()]);
        Ok(())
    }

    async fn load_active(&self) -> Result<Vec<MatchingQueueEntry>, StoreError> {
        let mut active: Vec<_> = self
            .guard()
            .values()
            .filter(|e| e.status == QueueStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|e| e.seq);
        Ok(active)
    }

    async fn max_seq(&self) -> Result<i64, StoreError> {
        Ok(self.guard().values().map(|e| e.seq).max().unwrap_or(0))
    }

    async fn active_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .guard()
            .values()
            .filter(|e| e.status == QueueStatus::Active)
            .count() as i64)
    }

    async fn active_count_for(&self, instrument: &str) -> Result<i64, StoreError> {
        Ok(self
            .guard()
            .values()
            .filter(|e| e.status == QueueStatus::Active && e.instrument == instrument)
            .count() as i64)
    }
}
