//! Matching Engine - per-instrument price/tier/time priority matching
//!
//! Every instrument has its own book behind a tokio mutex; takers for one
//! instrument are processed one at a time, different instruments run in
//! parallel. Trades always execute at the maker's price.

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::book::InstrumentBook;
use super::error::MatchingError;
use super::queue::{MatchingQueueEntry, QueueOrder, QueueStatus};
use super::roles::{resolve_roles, Party};
use super::store::{FillCommit, MatchingStore};
use crate::core_types::{OrderId, Side};
use crate::error::StoreError;
use crate::ledger::TradeSettlement;
use crate::outbox::{EventType, OutboxEvent};
use crate::trade::Trade;

pub const AGGREGATE_ORDER: &str = "Order";
pub const AGGREGATE_TRADE: &str = "Trade";

/// Result of `add_to_queue`.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Taker entry after the matching attempt
    pub entry: MatchingQueueEntry,
    /// Trades executed by this call, in execution order
    pub trades: Vec<Trade>,
    /// The order was already queued; nothing was done
    pub already_queued: bool,
}

pub struct MatchingEngine {
    store: Arc<dyn MatchingStore>,
    books: DashMap<String, Arc<Mutex<InstrumentBook>>>,
    currency: String,
    next_seq: AtomicI64,
}

impl MatchingEngine {
    pub fn new(store: Arc<dyn MatchingStore>, currency: impl Into<String>) -> Self {
        Self {
            store,
            books: DashMap::new(),
            currency: currency.into(),
            next_seq: AtomicI64::new(1),
        }
    }

    /// Rebuild the books from persisted ACTIVE entries.
    pub async fn restore(&self) -> Result<usize, MatchingError> {
        let active = self.store.load_active().await?;
        let max_seq = self.store.max_seq().await?;
        self.next_seq.fetch_max(max_seq + 1, Ordering::SeqCst);

        let mut restored = 0;
        for entry in active {
            let book = self.book(&entry.instrument);
            let mut book = book.lock().await;
            if book.insert(entry) {
                restored += 1;
            }
        }
        info!(restored, next_seq = max_seq + 1, "Matching books restored");
        Ok(restored)
    }

    fn book(&self, instrument: &str) -> Arc<Mutex<InstrumentBook>> {
        self.books
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(InstrumentBook::default())))
            .value()
            .clone()
    }

    /// Queue a new order and match it as taker. Re-delivery is a no-op.
    pub async fn add_to_queue(&self, order: QueueOrder) -> Result<MatchOutcome, MatchingError> {
        if order.size <= Decimal::ZERO {
            return Err(MatchingError::InvalidOrder(format!("size {}", order.size)));
        }
        if order.price <= Decimal::ZERO {
            return Err(MatchingError::InvalidOrder(format!("price {}", order.price)));
        }
        if order.instrument == self.currency {
            return Err(MatchingError::UnknownInstrument(order.instrument));
        }

        let book = self.book(&order.instrument);
        let mut book = book.lock().await;

        if let Some(existing) = self.store.get_entry(order.order_id).await? {
            debug!(order_id = %order.order_id, status = %existing.status, "Order already queued");
            return Ok(MatchOutcome {
                entry: existing,
                trades: Vec::new(),
                already_queued: true,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut taker = MatchingQueueEntry::new(&order, seq);
        if !self
            .store
            .insert_entry(&taker, vec![order_queued_event(&taker)])
            .await?
        {
            // Another instance won the insert
            let existing = self.store.get_entry(order.order_id).await?.ok_or_else(|| {
                StoreError::Corrupt(format!("queue entry {} vanished", order.order_id))
            })?;
            return Ok(MatchOutcome {
                entry: existing,
                trades: Vec::new(),
                already_queued: true,
            });
        }

        info!(
            order_id = %taker.order_id,
            instrument = %taker.instrument,
            side = %taker.side,
            price = %taker.price,
            size = %taker.requested_size,
            tier = taker.priority_tier,
            "Order queued"
        );

        let mut trades = Vec::new();
        let matched = self.match_taker(&mut book, &mut taker, &mut trades).await;
        self.finish_taker(&mut book, &taker).await?;
        matched?;

        Ok(MatchOutcome {
            entry: taker,
            trades,
            already_queued: false,
        })
    }

    /// Re-run matching for a resting order against the current book.
    pub async fn try_match(&self, order_id: OrderId) -> Result<Vec<Trade>, MatchingError> {
        let Some(entry) = self.store.get_entry(order_id).await? else {
            return Ok(Vec::new());
        };
        if !entry.is_active() {
            return Ok(Vec::new());
        }

        let book = self.book(&entry.instrument);
        let mut book = book.lock().await;
        // Take the taker out so it can't match itself
        let mut taker = book.remove(&order_id).unwrap_or(entry);

        let mut trades = Vec::new();
        let matched = self.match_taker(&mut book, &mut taker, &mut trades).await;
        self.finish_taker(&mut book, &taker).await?;
        matched?;
        Ok(trades)
    }

    /// Fill `taker` against the book until it is done or nothing crosses.
    ///
    /// Trades are pushed to `trades` as they commit so the caller sees
    /// everything that became durable even if a later fill fails.
    async fn match_taker(
        &self,
        book: &mut InstrumentBook,
        taker: &mut MatchingQueueEntry,
        trades: &mut Vec<Trade>,
    ) -> Result<(), MatchingError> {
        while taker.is_active() {
            let Some(best) = book.best_counter(taker.side, taker.price) else {
                break;
            };
            let mut maker = best.clone();

            let qty = taker.remaining_size.min(maker.remaining_size);
            let price = maker.price;
            let parties = resolve_roles(
                taker.side,
                Party {
                    order_id: taker.order_id,
                    customer_id: taker.customer_id,
                },
                Party {
                    order_id: maker.order_id,
                    customer_id: maker.customer_id,
                },
            );
            let trade = Trade::new(parties, &taker.instrument, qty, price, taker.side)?;
            let buyer_limit = match taker.side {
                Side::Buy => taker.price,
                Side::Sell => maker.price,
            };
            let settlement = TradeSettlement {
                trade_id: trade.trade_id,
                instrument: trade.instrument.clone(),
                currency: self.currency.clone(),
                quantity: qty,
                price,
                buyer_customer_id: trade.buyer_customer_id,
                seller_customer_id: trade.seller_customer_id,
                buyer_limit_price: buyer_limit,
            };

            maker.fill(qty);
            let fill = FillCommit {
                event: trade_executed_event(&trade, &settlement, buyer_limit)?,
                trade,
                maker,
            };
            self.store.commit_fill(&fill).await?;

            taker.fill(qty);
            book.update(fill.maker.clone());
            debug!(
                trade_id = %fill.trade.trade_id,
                maker = %fill.maker.order_id,
                taker = %taker.order_id,
                qty = %qty,
                price = %price,
                "Trade executed"
            );
            trades.push(fill.trade);
        }
        Ok(())
    }

    /// Persist the taker once and rest it if it is still active.
    async fn finish_taker(
        &self,
        book: &mut InstrumentBook,
        taker: &MatchingQueueEntry,
    ) -> Result<(), MatchingError> {
        if let Err(e) = self.store.save_entry(taker).await {
            error!(order_id = %taker.order_id, error = %e, "Failed to persist taker entry");
            return Err(e.into());
        }
        if taker.is_active() {
            book.insert(taker.clone());
        }
        Ok(())
    }

    /// Mark the entry CANCELED. Returns the entry as stored afterwards,
    /// `None` if the order never reached the queue.
    ///
    /// Terminal entries are returned unchanged. Ledger reservations are the
    /// caller's business.
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> Result<Option<MatchingQueueEntry>, MatchingError> {
        let Some(entry) = self.store.get_entry(order_id).await? else {
            debug!(order_id = %order_id, "Cancel: order not in queue");
            return Ok(None);
        };

        let book = self.book(&entry.instrument);
        let mut book = book.lock().await;

        // Re-read under the instrument lock; a taker may have filled it
        let Some(mut entry) = self.store.get_entry(order_id).await? else {
            return Ok(None);
        };
        if entry.status.is_terminal() {
            return Ok(Some(entry));
        }

        entry.cancel(reason);
        self.store.save_entry(&entry).await?;
        book.remove(&order_id);
        info!(
            order_id = %order_id,
            remaining = %entry.remaining_size,
            reason,
            "Queue entry canceled"
        );
        Ok(Some(entry))
    }

    pub async fn get_entry(
        &self,
        order_id: OrderId,
    ) -> Result<Option<MatchingQueueEntry>, MatchingError> {
        Ok(self.store.get_entry(order_id).await?)
    }

    pub async fn active_order_count(&self) -> Result<i64, MatchingError> {
        Ok(self.store.active_count().await?)
    }

    pub async fn active_order_count_by_instrument(
        &self,
        instrument: &str,
    ) -> Result<i64, MatchingError> {
        Ok(self.store.active_count_for(instrument).await?)
    }

    /// (best bid, best ask) from the in-memory book
    pub async fn top_of_book(&self, instrument: &str) -> (Option<Decimal>, Option<Decimal>) {
        let Some(book) = self.books.get(instrument).map(|b| b.value().clone()) else {
            return (None, None);
        };
        let book = book.lock().await;
        (book.best_bid(), book.best_ask())
    }
}

fn order_queued_event(e: &MatchingQueueEntry) -> OutboxEvent {
    OutboxEvent::new(
        EventType::OrderQueued,
        AGGREGATE_ORDER,
        e.order_id,
        Some(e.instrument.clone()),
        json!({
            "orderId": e.order_id,
            "customerId": e.customer_id,
            "instrument": e.instrument,
            "side": e.side.as_str(),
            "price": e.price.to_string(),
            "size": e.requested_size.to_string(),
            "priorityTier": e.priority_tier,
            "status": QueueStatus::Active.as_str(),
            "queuedAt": e.queued_at.to_rfc3339(),
        }),
    )
}

fn trade_executed_event(
    t: &Trade,
    settlement: &TradeSettlement,
    buyer_limit: Decimal,
) -> Result<OutboxEvent, StoreError> {
    Ok(OutboxEvent::new(
        EventType::TradeExecuted,
        AGGREGATE_TRADE,
        t.trade_id,
        Some(t.instrument.clone()),
        json!({
            "tradeId": t.trade_id,
            "buyOrderId": t.buy_order_id,
            "sellOrderId": t.sell_order_id,
            "buyerCustomerId": t.buyer_customer_id,
            "sellerCustomerId": t.seller_customer_id,
            "instrument": t.instrument,
            "quantity": t.quantity.to_string(),
            "price": t.price.to_string(),
            "totalValue": t.total_value.to_string(),
            "takerSide": t.taker_side.as_str(),
            "buyerLimitPrice": buyer_limit.to_string(),
            "timestamp": t.created_at.to_rfc3339(),
            "settlement": serde_json::to_value(settlement)?,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::CustomerTier;
    use crate::matching::store::MemoryMatchingStore;
    use crate::outbox::MemoryOutbox;
    use crate::trade::{MemoryTradeLedger, TradeLedger};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct Harness {
        engine: MatchingEngine,
        trades: Arc<MemoryTradeLedger>,
        outbox: Arc<MemoryOutbox>,
    }

    fn harness() -> Harness {
        let trades = Arc::new(MemoryTradeLedger::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let store = Arc::new(MemoryMatchingStore::new(trades.clone(), outbox.clone()));
        Harness {
            engine: MatchingEngine::new(store, "TRY"),
            trades,
            outbox,
        }
    }

    fn order(side: Side, price: Decimal, size: Decimal, tier: CustomerTier) -> QueueOrder {
        QueueOrder {
            order_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            instrument: "AAPL".into(),
            side,
            price,
            size,
            tier,
        }
    }

    #[tokio::test]
    async fn test_taker_gets_maker_price_and_both_fill() {
        let h = harness();
        let sell = order(Side::Sell, dec!(150.00), dec!(10), CustomerTier::Standard);
        let buy = order(Side::Buy, dec!(155.00), dec!(10), CustomerTier::Standard);

        let rested = h.engine.add_to_queue(sell.clone()).await.unwrap();
        assert!(rested.trades.is_empty());
        assert_eq!(rested.entry.status, QueueStatus::Active);

        let out = h.engine.add_to_queue(buy.clone()).await.unwrap();
        assert_eq!(out.trades.len(), 1);
        let t = &out.trades[0];
        assert_eq!(t.quantity, dec!(10));
        assert_eq!(t.price, dec!(150.00));
        assert_eq!(t.buy_order_id, buy.order_id);
        assert_eq!(t.sell_order_id, sell.order_id);
        assert_eq!(t.taker_side, Side::Buy);
        assert_eq!(out.entry.status, QueueStatus::Filled);

        let maker = h.engine.get_entry(sell.order_id).await.unwrap().unwrap();
        assert_eq!(maker.status, QueueStatus::Filled);
        assert_eq!(h.engine.active_order_count().await.unwrap(), 0);
        assert_eq!(h.engine.top_of_book("AAPL").await, (None, None));
        assert_eq!(h.trades.count_for_instrument("AAPL").await.unwrap(), 1);

        let event = h
            .outbox
            .all()
            .into_iter()
            .find(|e| e.event_type == EventType::TradeExecuted)
            .unwrap();
        assert_eq!(event.partition_key.as_deref(), Some("AAPL"));
        assert_eq!(event.payload["price"], "150.00");
        assert_eq!(event.payload["totalValue"], "1500.00");
        assert_eq!(event.payload["buyerLimitPrice"], "155.00");
        let s: TradeSettlement = serde_json::from_value(event.payload["settlement"].clone()).unwrap();
        assert_eq!(s.currency, "TRY");
        assert_eq!(s.buyer_refund().unwrap(), dec!(50.00));
    }

    #[tokio::test]
    async fn test_partial_fill_leaves_taker_resting() {
        let h = harness();
        let sell = order(Side::Sell, dec!(150.00), dec!(10), CustomerTier::Standard);
        let buy = order(Side::Buy, dec!(150.00), dec!(15), CustomerTier::Standard);
        h.engine.add_to_queue(sell).await.unwrap();

        let out = h.engine.add_to_queue(buy.clone()).await.unwrap();
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].quantity, dec!(10));
        assert_eq!(out.trades[0].price, dec!(150.00));
        assert_eq!(out.entry.status, QueueStatus::Active);
        assert_eq!(out.entry.remaining_size, dec!(5));

        let stored = h.engine.get_entry(buy.order_id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_size, dec!(5));
        assert_eq!(h.engine.active_order_count_by_instrument("AAPL").await.unwrap(), 1);
        assert_eq!(h.engine.top_of_book("AAPL").await, (Some(dec!(150.00)), None));
    }

    #[tokio::test]
    async fn test_earlier_order_matches_first_within_tier() {
        let h = harness();
        let first = order(Side::Buy, dec!(100), dec!(5), CustomerTier::Premium);
        let second = order(Side::Buy, dec!(100), dec!(5), CustomerTier::Premium);
        h.engine.add_to_queue(first.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        h.engine.add_to_queue(second.clone()).await.unwrap();

        let sell = order(Side::Sell, dec!(100), dec!(5), CustomerTier::Standard);
        let out = h.engine.add_to_queue(sell).await.unwrap();
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].buy_order_id, first.order_id);
        assert_eq!(out.trades[0].taker_side, Side::Sell);

        let untouched = h.engine.get_entry(second.order_id).await.unwrap().unwrap();
        assert_eq!(untouched.remaining_size, dec!(5));
    }

    #[tokio::test]
    async fn test_higher_tier_beats_earlier_order_at_same_price() {
        let h = harness();
        let standard = order(Side::Sell, dec!(50), dec!(3), CustomerTier::Standard);
        let vip = order(Side::Sell, dec!(50), dec!(3), CustomerTier::Vip);
        h.engine.add_to_queue(standard.clone()).await.unwrap();
        h.engine.add_to_queue(vip.clone()).await.unwrap();

        let buy = order(Side::Buy, dec!(50), dec!(4), CustomerTier::Standard);
        let out = h.engine.add_to_queue(buy).await.unwrap();
        assert_eq!(out.trades.len(), 2);
        assert_eq!(out.trades[0].sell_order_id, vip.order_id);
        assert_eq!(out.trades[0].quantity, dec!(3));
        assert_eq!(out.trades[1].sell_order_id, standard.order_id);
        assert_eq!(out.trades[1].quantity, dec!(1));
    }

    #[tokio::test]
    async fn test_sweeps_levels_best_price_first() {
        let h = harness();
        for price in [dec!(103), dec!(101), dec!(102)] {
            h.engine
                .add_to_queue(order(Side::Sell, price, dec!(2), CustomerTier::Standard))
                .await
                .unwrap();
        }
        let buy = order(Side::Buy, dec!(102), dec!(10), CustomerTier::Standard);
        let out = h.engine.add_to_queue(buy).await.unwrap();

        let prices: Vec<_> = out.trades.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![dec!(101), dec!(102)]);
        assert!(out.trades.iter().all(|t| t.price <= dec!(102)));
        assert_eq!(out.entry.remaining_size, dec!(6));
        assert_eq!(h.engine.top_of_book("AAPL").await, (Some(dec!(102)), Some(dec!(103))));
    }

    #[tokio::test]
    async fn test_add_to_queue_is_idempotent() {
        let h = harness();
        let sell = order(Side::Sell, dec!(10), dec!(1), CustomerTier::Standard);
        h.engine.add_to_queue(sell.clone()).await.unwrap();
        let again = h.engine.add_to_queue(sell.clone()).await.unwrap();
        assert!(again.already_queued);
        assert!(again.trades.is_empty());
        assert_eq!(h.engine.active_order_count().await.unwrap(), 1);

        let queued = h
            .outbox
            .all()
            .iter()
            .filter(|e| e.event_type == EventType::OrderQueued)
            .count();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_entry_from_matching() {
        let h = harness();
        let sell = order(Side::Sell, dec!(10), dec!(4), CustomerTier::Standard);
        h.engine.add_to_queue(sell.clone()).await.unwrap();

        let canceled = h
            .engine
            .cancel_order(sell.order_id, "customer request")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canceled.status, QueueStatus::Canceled);
        assert_eq!(canceled.remaining_size, dec!(4));

        let buy = order(Side::Buy, dec!(10), dec!(4), CustomerTier::Standard);
        let out = h.engine.add_to_queue(buy).await.unwrap();
        assert!(out.trades.is_empty());

        // Second cancel returns the terminal entry; unknown id is a no-op
        let again = h.engine.cancel_order(sell.order_id, "again").await.unwrap().unwrap();
        assert_eq!(again.remove_reason.as_deref(), Some("customer request"));
        assert!(h.engine.cancel_order(Uuid::new_v4(), "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_books() {
        let trades = Arc::new(MemoryTradeLedger::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let store: Arc<dyn MatchingStore> =
            Arc::new(MemoryMatchingStore::new(trades.clone(), outbox.clone()));

        let first = MatchingEngine::new(store.clone(), "TRY");
        let sell = order(Side::Sell, dec!(20), dec!(3), CustomerTier::Standard);
        first.add_to_queue(sell.clone()).await.unwrap();
        drop(first);

        let second = MatchingEngine::new(store, "TRY");
        assert_eq!(second.restore().await.unwrap(), 1);
        let out = second
            .add_to_queue(order(Side::Buy, dec!(20), dec!(3), CustomerTier::Standard))
            .await
            .unwrap();
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].sell_order_id, sell.order_id);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_size() {
        let h = harness();
        let bad = order(Side::Buy, dec!(10), dec!(0), CustomerTier::Standard);
        assert!(matches!(
            h.engine.add_to_queue(bad).await,
            Err(MatchingError::InvalidOrder(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takers_never_overfill_maker() {
        let h = Arc::new(harness());
        let sell = order(Side::Sell, dec!(10), dec!(10), CustomerTier::Standard);
        h.engine.add_to_queue(sell.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.engine
                    .add_to_queue(order(Side::Buy, dec!(10), dec!(3), CustomerTier::Standard))
                    .await
                    .unwrap()
            }));
        }
        let mut filled = Decimal::ZERO;
        for handle in handles {
            filled += handle.await.unwrap().trades.iter().map(|t| t.quantity).sum::<Decimal>();
        }
        assert_eq!(filled, dec!(10));

        let maker = h.engine.get_entry(sell.order_id).await.unwrap().unwrap();
        assert_eq!(maker.status, QueueStatus::Filled);
        let total: Decimal = h
            .trades
            .trades_for_order(sell.order_id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.quantity)
            .sum();
        assert!(total <= maker.requested_size);
    }
}
