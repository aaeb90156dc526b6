//! Service wiring
//!
//! Builds the full component graph from [`AppConfig`]: PostgreSQL-backed
//! when `postgres_url` is set, in-memory otherwise.
//!
//! ```text
//! OrderService ──► SagaOrchestrator ──► LedgerClient ──► AssetLedger ──► ledger_outbox
//!                        │
//!                        └──► MatchingEngine ──► trades + order_outbox
//!                                                       │
//!                                   OutboxDispatcher ◄──┘──► SettlementConsumer ──► AssetLedger
//! ```

use anyhow::Context;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::AppConfig;
use crate::db::Database;
use crate::instruments::InstrumentRegistry;
use crate::ledger::{
    AssetLedger, LedgerClient, LocalLedgerClient, MemoryLedger, PgLedger, SettlementConsumer,
    TimeoutLedgerClient,
};
use crate::matching::{MatchingEngine, MatchingStore, MemoryMatchingStore, PgMatchingStore};
use crate::order::{MemoryOrderStore, OrderProjector, OrderService, OrderStore, PgOrderStore};
use crate::outbox::{
    DispatcherConfig, EventPublisher, FanoutPublisher, LogPublisher, MemoryOutbox,
    OutboxDispatcher, OutboxStore, PgOutbox, LEDGER_OUTBOX_TABLE, ORDER_OUTBOX_TABLE,
};
use crate::saga::{
    MemorySagaStore, OrchestratorConfig, PgSagaStore, RecoveryWorker, SagaOrchestrator,
    SagaStore, WorkerConfig,
};
use crate::trade::{MemoryTradeLedger, PgTradeLedger, TradeLedger};

/// Storage backends, before wiring.
struct Stores {
    ledger: Arc<dyn AssetLedger>,
    trades: Arc<dyn TradeLedger>,
    matching: Arc<dyn MatchingStore>,
    sagas: Arc<dyn SagaStore>,
    orders: Arc<dyn OrderStore>,
    ledger_outbox: Arc<dyn OutboxStore>,
    order_outbox: Arc<dyn OutboxStore>,
}

pub struct Services {
    pub registry: Arc<InstrumentRegistry>,
    pub ledger: Arc<dyn AssetLedger>,
    pub trades: Arc<dyn TradeLedger>,
    pub matching: Arc<MatchingEngine>,
    pub orchestrator: Arc<SagaOrchestrator>,
    pub orders: Arc<OrderService>,
    /// Publishes `order_outbox` (orders, trades, sagas) and settles trades
    pub order_dispatcher: Arc<OutboxDispatcher>,
    /// Publishes `ledger_outbox`
    pub ledger_dispatcher: Arc<OutboxDispatcher>,
    pub recovery: Arc<RecoveryWorker>,
}

impl Services {
    /// Build from config and restore the order book from the matching queue.
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let stores = match &config.postgres_url {
            Some(url) => {
                let db = Database::connect_with(url, &config.database)
                    .await
                    .with_context(|| "Failed to connect to PostgreSQL")?;
                db.migrate().await.context("Failed to apply schema")?;
                pg_stores(db.pool().clone())
            }
            None => {
                info!("No postgres_url configured, using in-memory stores");
                memory_stores()
            }
        };
        let services = Self::assemble(config, stores);
        let restored = services
            .matching
            .restore()
            .await
            .context("Failed to restore matching queue")?;
        info!(restored, "Order book restored");
        Ok(services)
    }

    /// In-memory graph, nothing restored.
    pub fn in_memory(config: &AppConfig) -> Self {
        Self::assemble(config, memory_stores())
    }

    fn assemble(config: &AppConfig, stores: Stores) -> Self {
        let registry = Arc::new(InstrumentRegistry::new(
            config.instruments.iter().cloned(),
            config.settlement_currency.clone(),
        ));

        let local: Arc<dyn LedgerClient> = Arc::new(LocalLedgerClient::new(stores.ledger.clone()));
        let ledger_client: Arc<dyn LedgerClient> = Arc::new(TimeoutLedgerClient::new(
            local,
            config.ledger.call_timeout(),
        ));

        let matching = Arc::new(MatchingEngine::new(
            stores.matching,
            config.settlement_currency.clone(),
        ));
        let projector = Arc::new(OrderProjector::new(
            stores.orders.clone(),
            stores.trades.clone(),
        ));
        let orchestrator = Arc::new(SagaOrchestrator::new(
            stores.sagas,
            ledger_client.clone(),
            matching.clone(),
            registry.clone(),
            projector.clone(),
            OrchestratorConfig::from(&config.saga),
        ));
        let orders = Arc::new(OrderService::new(
            stores.orders,
            projector,
            orchestrator.clone(),
            matching.clone(),
            ledger_client,
            registry.clone(),
        ));

        let dispatch = DispatcherConfig::from(&config.outbox);
        let order_publisher: Arc<dyn EventPublisher> = Arc::new(FanoutPublisher::new(vec![
            Arc::new(SettlementConsumer::new(stores.ledger.clone())),
            Arc::new(LogPublisher),
        ]));
        let order_dispatcher = Arc::new(OutboxDispatcher::new(
            ORDER_OUTBOX_TABLE,
            stores.order_outbox,
            order_publisher,
            dispatch.clone(),
        ));
        let ledger_dispatcher = Arc::new(OutboxDispatcher::new(
            LEDGER_OUTBOX_TABLE,
            stores.ledger_outbox,
            Arc::new(LogPublisher),
            dispatch,
        ));
        let recovery = Arc::new(RecoveryWorker::new(
            orchestrator.clone(),
            WorkerConfig::from(&config.recovery),
        ));

        Self {
            registry,
            ledger: stores.ledger,
            trades: stores.trades,
            matching,
            orchestrator,
            orders,
            order_dispatcher,
            ledger_dispatcher,
            recovery,
        }
    }

    /// Start both dispatchers and the recovery worker.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let order = self.order_dispatcher.clone();
        let ledger = self.ledger_dispatcher.clone();
        let recovery = self.recovery.clone();
        vec![
            tokio::spawn(async move {
                order.run().await;
            }),
            tokio::spawn(async move {
                ledger.run().await;
            }),
            tokio::spawn(async move {
                recovery.run().await;
            }),
        ]
    }

    /// Publish everything pending on both outboxes (settlement included).
    pub async fn drain_outboxes(&self, max_rounds: usize) -> anyhow::Result<usize> {
        let orders = self.order_dispatcher.drain(max_rounds).await?;
        let ledger = self.ledger_dispatcher.drain(max_rounds).await?;
        Ok(orders + ledger)
    }
}

fn memory_stores() -> Stores {
    let ledger_outbox = Arc::new(MemoryOutbox::new());
    let order_outbox = Arc::new(MemoryOutbox::new());
    let trades = Arc::new(MemoryTradeLedger::new());
    Stores {
        ledger: Arc::new(MemoryLedger::new(ledger_outbox.clone())),
        matching: Arc::new(MemoryMatchingStore::new(
            trades.clone(),
            order_outbox.clone(),
        )),
        sagas: Arc::new(MemorySagaStore::new(order_outbox.clone())),
        orders: Arc::new(MemoryOrderStore::new(order_outbox.clone())),
        trades,
        ledger_outbox,
        order_outbox,
    }
}

fn pg_stores(pool: sqlx::PgPool) -> Stores {
    Stores {
        ledger: Arc::new(PgLedger::new(pool.clone())),
        trades: Arc::new(PgTradeLedger::new(pool.clone())),
        matching: Arc::new(PgMatchingStore::new(pool.clone())),
        sagas: Arc::new(PgSagaStore::new(pool.clone())),
        orders: Arc::new(PgOrderStore::new(pool.clone())),
        ledger_outbox: Arc::new(PgOutbox::new(pool.clone(), LEDGER_OUTBOX_TABLE)),
        order_outbox: Arc::new(PgOutbox::new(pool, ORDER_OUTBOX_TABLE)),
    }
}
