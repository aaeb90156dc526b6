//! Outbox Dispatcher
//!
//! Polls unprocessed outbox rows and publishes them, marking each processed
//! only after the publisher confirms delivery.
//!
//! ```text
//! fetch_unprocessed(batch) ──► publish ──ok──► mark_processed
//!                                 │
//!                                 └─err──► mark_failed (retry_count++)
//!                                          skip rest of this partition key
//! ```
//!
//! Redelivery is unbounded. Skipping the remainder of a failed partition key
//! keeps per-key order (e.g. trades of one instrument) intact.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::publisher::EventPublisher;
use super::store::OutboxStore;
use crate::config::OutboxConfig;
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

impl From<&OutboxConfig> for DispatcherConfig {
    fn from(cfg: &OutboxConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            batch_size: cfg.batch_size,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub published: usize,
    pub failed: usize,
    pub deferred: usize,
}

pub struct OutboxDispatcher {
    name: &'static str,
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        name: &'static str,
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            name,
            store,
            publisher,
            config,
        }
    }

    /// Poll forever.
    pub async fn run(&self) -> ! {
        info!(
            outbox = self.name,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox dispatcher"
        );

        loop {
            match self.dispatch_once().await {
                // A full batch means more is waiting
                Ok(stats) if stats.published as i64 >= self.config.batch_size => continue,
                Ok(_) => {}
                Err(e) => error!(outbox = self.name, error = %e, "Outbox poll failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Publish one batch.
    pub async fn dispatch_once(&self) -> Result<DispatchStats, StoreError> {
        let batch = self.store.fetch_unprocessed(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(DispatchStats::default());
        }

        let mut stats = DispatchStats::default();
        let mut blocked_keys: HashSet<String> = HashSet::new();

        for event in &batch {
            if let Some(key) = &event.partition_key {
                if blocked_keys.contains(key) {
                    stats.deferred += 1;
                    continue;
                }
            }

            match self.publisher.publish(event).await {
                Ok(()) => {
                    self.store.mark_processed(event.id).await?;
                    stats.published += 1;
                }
                Err(e) => {
                    warn!(
                        outbox = self.name,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = event.retry_count + 1,
                        error = %e,
                        "Outbox publish failed"
                    );
                    self.store.mark_failed(event.id, &e.to_string()).await?;
                    if let Some(key) = &event.partition_key {
                        blocked_keys.insert(key.clone());
                    }
                    stats.failed += 1;
                }
            }
        }

        debug!(
            outbox = self.name,
            published = stats.published,
            failed = stats.failed,
            deferred = stats.deferred,
            "Outbox batch dispatched"
        );
        Ok(stats)
    }

    /// Dispatch until nothing publishable is left (bounded by `max_rounds`).
    pub async fn drain(&self, max_rounds: usize) -> Result<usize, StoreError> {
        let mut total = 0;
        for _ in 0..max_rounds {
            let stats = self.dispatch_once().await?;
            total += stats.published;
            if stats.published == 0 {
                break;
            }
        }
        Ok(total)
    }
}
