//! Saga Orchestrator
//!
//! Drives one order through `VALIDATE → RESERVE_ASSETS → QUEUE_ORDER → COMPLETE`.
//! State is persisted after every transition, so a restarted process picks up
//! where the last one stopped. All operations on one correlation id are
//! serialized by a per-id async lock; different sagas run concurrently.
//!
//! The orchestrator is the only component that starts compensation. It
//! reaches the ledger through [`LedgerClient`] (bounded by a timeout) and the
//! matcher through [`MatchingEngine`]; order status projection is pushed out
//! through [`SagaListener`].

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::{SagaError, StepFailure};
use super::state::{compensation_plan, Compensation, SagaStatus, SagaStep};
use super::store::SagaStore;
use super::types::{CorrelationId, OrderPayload, SagaInstance};
use crate::balance::checked_mul;
use crate::config::SagaConfig;
use crate::error::StoreError;
use crate::instruments::InstrumentRegistry;
use crate::keyed_lock::{KeyedGuard, KeyedLocks};
use crate::ledger::{LedgerClient, ReleaseRequest, ReserveRequest};
use crate::matching::{MatchingEngine, QueueOrder};
use crate::outbox::{EventType, OutboxEvent};
use crate::trade::Trade;

pub const AGGREGATE_SAGA: &str = "Saga";

/// Receives saga progress that other components project (order status).
///
/// Calls are idempotent; a failed projection is logged and never rolls the
/// saga back.
#[async_trait]
pub trait SagaListener: Send + Sync {
    async fn on_reserved(&self, saga: &SagaInstance) -> Result<(), StoreError>;

    async fn on_trades(&self, saga: &SagaInstance, trades: &[Trade]) -> Result<(), StoreError>;

    async fn on_completed(&self, saga: &SagaInstance) -> Result<(), StoreError>;

    /// Final failure only; not called while a retry is still possible
    async fn on_failed(&self, saga: &SagaInstance) -> Result<(), StoreError>;
}

pub struct NoopListener;

#[async_trait]
impl SagaListener for NoopListener {
    async fn on_reserved(&self, _saga: &SagaInstance) -> Result<(), StoreError> {
        Ok(())
    }

    async fn on_trades(&self, _saga: &SagaInstance, _trades: &[Trade]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn on_completed(&self, _saga: &SagaInstance) -> Result<(), StoreError> {
        Ok(())
    }

    async fn on_failed(&self, _saga: &SagaInstance) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_retries: i32,
    pub expiry: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        (&SagaConfig::default()).into()
    }
}

impl From<&SagaConfig> for OrchestratorConfig {
    fn from(c: &SagaConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            expiry: c.expiry(),
        }
    }
}

pub struct SagaOrchestrator {
    store: Arc<dyn SagaStore>,
    ledger: Arc<dyn LedgerClient>,
    matching: Arc<MatchingEngine>,
    registry: Arc<InstrumentRegistry>,
    listener: Arc<dyn SagaListener>,
    locks: KeyedLocks<CorrelationId>,
    config: OrchestratorConfig,
}

impl SagaOrchestrator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        ledger: Arc<dyn LedgerClient>,
        matching: Arc<MatchingEngine>,
        registry: Arc<InstrumentRegistry>,
        listener: Arc<dyn SagaListener>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            matching,
            registry,
            listener,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Exclusive access to one saga; held by every operation below.
    pub async fn lock(&self, correlation_id: CorrelationId) -> KeyedGuard<CorrelationId> {
        self.locks.lock(&correlation_id).await
    }

    /// Sagas currently locked or waited on
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>, SagaError> {
        Ok(self.store.get(correlation_id).await?)
    }

    async fn load(&self, correlation_id: CorrelationId) -> Result<SagaInstance, SagaError> {
        self.store
            .get(correlation_id)
            .await?
            .ok_or(SagaError::NotFound(correlation_id))
    }

    async fn persist(
        &self,
        saga: &SagaInstance,
        events: Vec<OutboxEvent>,
    ) -> Result<SagaInstance, SagaError> {
        self.store
            .save(saga, events)
            .await?
            .ok_or(SagaError::Conflict {
                correlation_id: saga.correlation_id,
                expected: saga.version,
            })
    }

    // ============================================================
    // Lifecycle operations
    // ============================================================

    /// Create the saga at VALIDATE; an existing saga is returned unchanged.
    pub async fn start_saga(
        &self,
        correlation_id: CorrelationId,
        payload: OrderPayload,
    ) -> Result<SagaInstance, SagaError> {
        let _guard = self.lock(correlation_id).await;
        let saga = SagaInstance::new(
            correlation_id,
            payload,
            self.config.max_retries,
            self.config.expiry,
        );
        let (stored, created) = self.store.create_if_absent(&saga).await?;
        if created {
            info!(correlation_id = %correlation_id, saga_id = %stored.saga_id, "Saga started");
        } else {
            debug!(correlation_id = %correlation_id, status = %stored.status, "Saga already exists");
        }
        Ok(stored)
    }

    pub async fn advance_saga(
        &self,
        correlation_id: CorrelationId,
        completed_step: SagaStep,
    ) -> Result<SagaInstance, SagaError> {
        let _guard = self.lock(correlation_id).await;
        let saga = self.load(correlation_id).await?;
        self.advance_locked(saga, completed_step).await
    }

    /// Record the failure, compensate committed steps, end FAILED.
    ///
    /// If a compensation fails the saga stays COMPENSATING for the recovery
    /// worker to resume.
    pub async fn fail_saga(
        &self,
        correlation_id: CorrelationId,
        failed_step: SagaStep,
        error_message: &str,
        transient: bool,
    ) -> Result<SagaInstance, SagaError> {
        let _guard = self.lock(correlation_id).await;
        let saga = self.load(correlation_id).await?;
        let failure = StepFailure {
            step: failed_step,
            message: error_message.to_string(),
            transient,
        };
        self.fail_locked(saga, failure).await
    }

    /// Return a retryable FAILED saga to IN_PROGRESS at its first undone step.
    /// Non-retryable sagas are returned unchanged (still FAILED).
    pub async fn retry_saga(&self, correlation_id: CorrelationId) -> Result<SagaInstance, SagaError> {
        let _guard = self.lock(correlation_id).await;
        let saga = self.load(correlation_id).await?;
        self.retry_locked(saga).await
    }

    /// Execute steps from the current one until COMPLETED or FAILED.
    pub async fn run(&self, correlation_id: CorrelationId) -> Result<SagaInstance, SagaError> {
        let _guard = self.lock(correlation_id).await;
        let saga = self.load(correlation_id).await?;
        self.run_locked(saga).await
    }

    /// Finish an interrupted compensation.
    pub async fn resume_compensation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<SagaInstance, SagaError> {
        let _guard = self.lock(correlation_id).await;
        let saga = self.load(correlation_id).await?;
        if saga.status != SagaStatus::Compensating {
            return Ok(saga);
        }
        self.compensate_locked(saga).await
    }

    /// Fail an in-flight saga that outlived its expiry (transient, so retryable).
    pub async fn expire_saga(&self, correlation_id: CorrelationId) -> Result<SagaInstance, SagaError> {
        let _guard = self.lock(correlation_id).await;
        let saga = self.load(correlation_id).await?;
        if !saga.is_expired(Utc::now()) {
            return Ok(saga);
        }
        warn!(
            correlation_id = %correlation_id,
            step = %saga.current_step,
            expires_at = %saga.expires_at,
            "Saga expired"
        );
        let failure = StepFailure::transient(saga.current_step, "saga expired");
        self.fail_locked(saga, failure).await
    }

    // ============================================================
    // Queries
    // ============================================================

    pub async fn find_expired(&self, limit: usize) -> Result<Vec<SagaInstance>, SagaError> {
        Ok(self.store.find_expired(Utc::now(), limit).await?)
    }

    pub async fn find_retryable(&self, limit: usize) -> Result<Vec<SagaInstance>, SagaError> {
        Ok(self.store.find_retryable(limit).await?)
    }

    pub async fn find_compensating(&self, limit: usize) -> Result<Vec<SagaInstance>, SagaError> {
        Ok(self
            .store
            .find_by_status(SagaStatus::Compensating, limit)
            .await?)
    }

    pub async fn count_by_status(&self, status: SagaStatus) -> Result<i64, SagaError> {
        Ok(self.store.count_by_status(status).await?)
    }

    // ============================================================
    // Transitions (caller holds the correlation lock)
    // ============================================================

    async fn advance_locked(
        &self,
        mut saga: SagaInstance,
        completed_step: SagaStep,
    ) -> Result<SagaInstance, SagaError> {
        if completed_step != saga.current_step || !saga.status.is_in_flight() {
            if saga.has_completed(completed_step) {
                debug!(
                    correlation_id = %saga.correlation_id,
                    step = %completed_step,
                    "Step already completed"
                );
                return Ok(saga);
            }
            return Err(invalid(&saga, "advance"));
        }

        saga.completed_steps.push(completed_step);
        let mut events = Vec::new();
        match completed_step.next() {
            Some(next) => {
                set_status(&mut saga, SagaStatus::InProgress, "advance")?;
                saga.current_step = next;
            }
            None => {
                set_status(&mut saga, SagaStatus::Completed, "advance")?;
                saga.completed_at = Some(Utc::now());
                events.push(saga_completed_event(&saga));
            }
        }

        let saved = self.persist(&saga, events).await?;
        if saved.status == SagaStatus::Completed {
            info!(correlation_id = %saved.correlation_id, "Saga completed");
        } else {
            debug!(
                correlation_id = %saved.correlation_id,
                completed = %completed_step,
                next = %saved.current_step,
                "Saga advanced"
            );
        }
        Ok(saved)
    }

    async fn fail_locked(
        &self,
        mut saga: SagaInstance,
        failure: StepFailure,
    ) -> Result<SagaInstance, SagaError> {
        match saga.status {
            SagaStatus::Failed => return Ok(saga),
            SagaStatus::Compensating => return self.compensate_locked(saga).await,
            SagaStatus::Completed => return Err(invalid(&saga, "fail")),
            SagaStatus::Started | SagaStatus::InProgress => {}
        }

        warn!(
            correlation_id = %saga.correlation_id,
            step = %failure.step,
            transient = failure.transient,
            error = %failure.message,
            "Saga step failed, compensating"
        );
        set_status(&mut saga, SagaStatus::Compensating, "fail")?;
        saga.failed_step = Some(failure.step);
        saga.transient_failure = failure.transient;
        saga.error_message = Some(failure.message);
        let saga = self.persist(&saga, Vec::new()).await?;
        self.compensate_locked(saga).await
    }

    async fn compensate_locked(&self, mut saga: SagaInstance) -> Result<SagaInstance, SagaError> {
        if saga.status != SagaStatus::Compensating {
            return Err(invalid(&saga, "compensate"));
        }
        let failed_step = saga.failed_step.unwrap_or(saga.current_step);
        let plan = compensation_plan(&saga.completed_steps, failed_step, saga.transient_failure);

        for (step, compensation) in plan {
            if let Err(e) = self.apply_compensation(&saga.payload, compensation).await {
                error!(
                    correlation_id = %saga.correlation_id,
                    step = %step,
                    error = %e,
                    "Compensation failed, saga left COMPENSATING"
                );
                return self.persist(&saga, Vec::new()).await;
            }
            saga.completed_steps.retain(|s| *s != step);
            debug!(correlation_id = %saga.correlation_id, step = %step, "Step compensated");
        }

        set_status(&mut saga, SagaStatus::Failed, "compensate")?;
        let event = saga_failed_event(&saga);
        let saved = self.persist(&saga, vec![event]).await?;
        info!(
            correlation_id = %saved.correlation_id,
            retryable = saved.is_retryable(),
            retry_count = saved.retry_count,
            "Saga failed"
        );
        if saved.is_final_failure() {
            self.notify("on_failed", &saved, self.listener.on_failed(&saved).await);
        }
        Ok(saved)
    }

    async fn retry_locked(&self, mut saga: SagaInstance) -> Result<SagaInstance, SagaError> {
        if saga.status != SagaStatus::Failed {
            return Err(invalid(&saga, "retry"));
        }
        if !saga.is_retryable() {
            info!(
                correlation_id = %saga.correlation_id,
                retry_count = saga.retry_count,
                transient = saga.transient_failure,
                "Retry refused, saga stays FAILED"
            );
            return Ok(saga);
        }

        set_status(&mut saga, SagaStatus::InProgress, "retry")?;
        saga.retry_count += 1;
        saga.current_step = first_undone_step(&saga.completed_steps);
        saga.failed_step = None;
        saga.transient_failure = false;
        saga.error_message = None;
        saga.expires_at = Utc::now() + self.config.expiry;
        let saved = self.persist(&saga, Vec::new()).await?;
        info!(
            correlation_id = %saved.correlation_id,
            retry = saved.retry_count,
            step = %saved.current_step,
            "Saga retry scheduled"
        );
        Ok(saved)
    }

    async fn run_locked(&self, mut saga: SagaInstance) -> Result<SagaInstance, SagaError> {
        loop {
            match saga.status {
                SagaStatus::Compensating => return self.compensate_locked(saga).await,
                SagaStatus::Completed | SagaStatus::Failed => return Ok(saga),
                SagaStatus::Started | SagaStatus::InProgress => {}
            }
            let step = saga.current_step;
            saga = match self.execute_step(&saga, step).await {
                Ok(()) => self.advance_locked(saga, step).await?,
                Err(failure) => return self.fail_locked(saga, failure).await,
            };
        }
    }

    // ============================================================
    // Steps and compensations
    // ============================================================

    async fn execute_step(&self, saga: &SagaInstance, step: SagaStep) -> Result<(), StepFailure> {
        let p = &saga.payload;
        match step {
            SagaStep::Validate => {
                if !self.registry.is_tradable(&p.instrument) {
                    return Err(StepFailure::business(
                        step,
                        format!("unknown instrument: {}", p.instrument),
                    ));
                }
                if p.size <= Decimal::ZERO || p.price <= Decimal::ZERO {
                    return Err(StepFailure::business(
                        step,
                        format!("non-positive size {} or price {}", p.size, p.price),
                    ));
                }
                checked_mul(p.size, p.price)
                    .map_err(|e| StepFailure::business(step, e.to_string()))?;
                Ok(())
            }
            SagaStep::ReserveAssets => {
                let (asset, amount) = self
                    .registry
                    .reservation_for(p.side, &p.instrument, p.size, p.price)
                    .map_err(|e| StepFailure::business(step, e.to_string()))?;
                let req = ReserveRequest {
                    customer_id: p.customer_id,
                    instrument: asset,
                    amount,
                    order_id: p.order_id,
                };
                let outcome = self
                    .ledger
                    .reserve(&req)
                    .await
                    .map_err(|e| StepFailure::from_kind(step, e.kind(), e.to_string()))?;
                debug!(order_id = %p.order_id, ?outcome, amount = %amount, "Assets reserved");
                self.notify("on_reserved", saga, self.listener.on_reserved(saga).await);
                Ok(())
            }
            SagaStep::QueueOrder => {
                let outcome = self
                    .matching
                    .add_to_queue(QueueOrder {
                        order_id: p.order_id,
                        customer_id: p.customer_id,
                        instrument: p.instrument.clone(),
                        side: p.side,
                        price: p.price,
                        size: p.size,
                        tier: p.tier,
                    })
                    .await
                    .map_err(|e| StepFailure::from_kind(step, e.kind(), e.to_string()))?;
                self.notify(
                    "on_trades",
                    saga,
                    self.listener.on_trades(saga, &outcome.trades).await,
                );
                Ok(())
            }
            SagaStep::Complete => {
                self.notify("on_completed", saga, self.listener.on_completed(saga).await);
                Ok(())
            }
        }
    }

    async fn apply_compensation(
        &self,
        p: &OrderPayload,
        compensation: Compensation,
    ) -> Result<(), String> {
        match compensation {
            Compensation::CancelQueueEntry => {
                self.matching
                    .cancel_order(p.order_id, "saga compensation")
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(())
            }
            Compensation::ReleaseReservation => {
                // What is still outstanding: the queue entry knows if it was queued
                let outstanding = self
                    .matching
                    .get_entry(p.order_id)
                    .await
                    .map_err(|e| e.to_string())?
                    .map(|e| e.remaining_size)
                    .unwrap_or(p.size);
                let (asset, amount) = self
                    .registry
                    .reservation_for(p.side, &p.instrument, outstanding, p.price)
                    .map_err(|e| e.to_string())?;
                if amount <= Decimal::ZERO {
                    return Ok(());
                }
                self.ledger
                    .release(&ReleaseRequest {
                        customer_id: p.customer_id,
                        instrument: asset,
                        amount,
                        order_id: Some(p.order_id),
                    })
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }

    fn notify(&self, hook: &'static str, saga: &SagaInstance, result: Result<(), StoreError>) {
        if let Err(e) = result {
            error!(
                correlation_id = %saga.correlation_id,
                hook,
                error = %e,
                "Saga listener failed"
            );
        }
    }
}

fn invalid(saga: &SagaInstance, action: &'static str) -> SagaError {
    SagaError::InvalidTransition {
        correlation_id: saga.correlation_id,
        action,
        status: saga.status,
        step: saga.current_step,
    }
}

/// Every status write goes through the transition table.
fn set_status(
    saga: &mut SagaInstance,
    next: SagaStatus,
    action: &'static str,
) -> Result<(), SagaError> {
    if !saga.status.can_transition_to(next) {
        return Err(invalid(saga, action));
    }
    saga.status = next;
    Ok(())
}

fn first_undone_step(completed: &[SagaStep]) -> SagaStep {
    let mut step = SagaStep::FIRST;
    while completed.contains(&step) {
        match step.next() {
            Some(next) => step = next,
            None => break,
        }
    }
    step
}

fn saga_completed_event(s: &SagaInstance) -> OutboxEvent {
    OutboxEvent::new(
        EventType::SagaCompleted,
        AGGREGATE_SAGA,
        s.correlation_id,
        Some(s.correlation_id.to_string()),
        json!({
            "sagaId": s.saga_id,
            "correlationId": s.correlation_id,
            "sagaType": s.saga_type.as_str(),
            "orderId": s.payload.order_id,
            "completedSteps": s.completed_steps.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "retryCount": s.retry_count,
        }),
    )
}

fn saga_failed_event(s: &SagaInstance) -> OutboxEvent {
    OutboxEvent::new(
        EventType::SagaFailed,
        AGGREGATE_SAGA,
        s.correlation_id,
        Some(s.correlation_id.to_string()),
        json!({
            "sagaId": s.saga_id,
            "correlationId": s.correlation_id,
            "sagaType": s.saga_type.as_str(),
            "orderId": s.payload.order_id,
            "failedStep": s.failed_step.map(|f| f.as_str()),
            "errorMessage": s.error_message,
            "transient": s.transient_failure,
            "retryCount": s.retry_count,
            "final": s.is_final_failure(),
        }),
    )
}
