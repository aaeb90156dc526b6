use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

use super::{Trade, TradeLedger};
use crate::core_types::{CustomerId, OrderId, TradeId};
use crate::error::StoreError;

/// Append-only in-memory trade ledger.
#[derive(Default)]
pub struct MemoryTradeLedger {
    trades: Mutex<Vec<Trade>>,
}

impl MemoryTradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<Trade>> {
        self.trades.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Synchronous insert for stores that hold their own lock.
    pub fn insert(&self, trade: &Trade) -> Trade {
        let mut trades = self.guard();
        if let Some(existing) = trades.iter().find(|t| t.trade_id == trade.trade_id) {
            return existing.clone();
        }
        trades.push(trade.clone());
        trade.clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

#[async_trait]
impl TradeLedger for MemoryTradeLedger {
    async fn save_trade(&self, trade: &Trade) -> Result<Trade, StoreError> {
        Ok(self.insert(trade))
    }

    async fn get(&self, trade_id: TradeId) -> Result<Option<Trade>, StoreError> {
        Ok(self.guard().iter().find(|t| t.trade_id == trade_id).cloned())
    }

    async fn trades_for_order(&self, order_id: OrderId) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .guard()
            .iter()
            .filter(|t| t.involves(order_id))
            .cloned()
            .collect())
    }

    async fn trades_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .guard()
            .iter()
            .filter(|t| t.buyer_customer_id == customer_id || t.seller_customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn trades_for_instrument(
        &self,
        instrument: &str,
        limit: i64,
    ) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .guard()
            .iter()
            .rev()
            .filter(|t| t.instrument == instrument)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_for_instrument(&self, instrument: &str) -> Result<i64, StoreError> {
        Ok(self
            .guard()
            .iter()
            .filter(|t| t.instrument == instrument)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Side;
    use crate::trade::Counterparties;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(instrument: &str, buyer: CustomerId) -> Trade {
        Trade::new(
            Counterparties {
                buy_order_id: Uuid::new_v4(),
                sell_order_id: Uuid::new_v4(),
                buyer_customer_id: buyer,
                seller_customer_id: Uuid::new_v4(),
            },
            instrument,
            dec!(1),
            dec!(10),
            Side::Sell,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_is_idempotent_and_append_only() {
        let ledger = MemoryTradeLedger::new();
        let t = trade("AAPL", Uuid::new_v4());
        let saved = ledger.save_trade(&t).await.unwrap();
        assert_eq!(saved, t);

        let mut altered = t.clone();
        altered.quantity = dec!(999);
        let again = ledger.save_trade(&altered).await.unwrap();
        assert_eq!(again.quantity, dec!(1));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_queries() {
        let ledger = MemoryTradeLedger::new();
        let buyer = Uuid::new_v4();
        let a = trade("AAPL", buyer);
        let b = trade("AAPL", Uuid::new_v4());
        let c = trade("THYAO", buyer);
        for t in [&a, &b, &c] {
            ledger.save_trade(t).await.unwrap();
        }

        assert_eq!(ledger.count_for_instrument("AAPL").await.unwrap(), 2);
        let recent = ledger.trades_for_instrument("AAPL", 1).await.unwrap();
        assert_eq!(recent[0].trade_id, b.trade_id);
        assert_eq!(ledger.trades_for_customer(buyer).await.unwrap().len(), 2);
        assert_eq!(
            ledger.trades_for_order(a.sell_order_id).await.unwrap()[0].trade_id,
            a.trade_id
        );
        assert!(ledger.get(c.trade_id).await.unwrap().is_some());
    }
}
