//! Recovery Worker
//!
//! Background worker that resumes sagas a crash or timeout left behind.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::error::SagaError;
use super::orchestrator::SagaOrchestrator;
use crate::config::RecoveryConfig;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scan_interval: Duration,
    /// Maximum sagas per category per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        (&RecoveryConfig::default()).into()
    }
}

impl From<&RecoveryConfig> for WorkerConfig {
    fn from(c: &RecoveryConfig) -> Self {
        Self {
            scan_interval: Duration::from_millis(c.scan_interval_ms),
            batch_size: c.batch_size.max(1) as usize,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub expired: usize,
    pub compensated: usize,
    pub retried: usize,
}

impl RecoveryStats {
    pub fn total(&self) -> usize {
        self.expired + self.compensated + self.retried
    }
}

/// Periodically:
/// 1. fails in-flight sagas past their expiry (transient, so retryable)
/// 2. finishes compensations that stopped half way
/// 3. retries retryable failures and runs them again
pub struct RecoveryWorker {
    orchestrator: Arc<SagaOrchestrator>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(orchestrator: Arc<SagaOrchestrator>, config: WorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn run(&self) -> ! {
        info!(
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting saga recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Saga recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    pub async fn scan_and_recover(&self) -> Result<RecoveryStats, SagaError> {
        let mut stats = RecoveryStats::default();

        for saga in self.orchestrator.find_expired(self.config.batch_size).await? {
            match self.orchestrator.expire_saga(saga.correlation_id).await {
                Ok(s) if s.status != saga.status => stats.expired += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(correlation_id = %saga.correlation_id, error = %e, "Failed to expire saga")
                }
            }
        }

        for saga in self.orchestrator.find_compensating(self.config.batch_size).await? {
            match self.orchestrator.resume_compensation(saga.correlation_id).await {
                Ok(s) if !s.status.is_in_flight() && s.status != saga.status => {
                    stats.compensated += 1
                }
                Ok(_) => {}
                Err(e) => error!(
                    correlation_id = %saga.correlation_id,
                    error = %e,
                    "Failed to resume compensation"
                ),
            }
        }

        for saga in self.orchestrator.find_retryable(self.config.batch_size).await? {
            let id = saga.correlation_id;
            debug!(correlation_id = %id, retry_count = saga.retry_count, "Retrying saga");
            let result = match self.orchestrator.retry_saga(id).await {
                Ok(s) if s.status.is_in_flight() => self.orchestrator.run(id).await,
                other => other,
            };
            match result {
                Ok(s) => {
                    stats.retried += 1;
                    info!(correlation_id = %id, status = %s.status, retry = s.retry_count, "Saga retried");
                }
                Err(e) => error!(correlation_id = %id, error = %e, "Saga retry failed"),
            }
        }

        if stats.total() > 0 {
            info!(
                expired = stats.expired,
                compensated = stats.compensated,
                retried = stats.retried,
                "Saga recovery scan"
            );
        }
        Ok(stats)
    }
}
