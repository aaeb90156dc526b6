//! Ledger operation rules
//!
//! Pure functions over a locked working set of balance rows. Storage
//! backends lock the rows (in canonical key order), hand the copies here,
//! and persist the result only if every rule passed. A failed rule leaves
//! no trace: the working copies are dropped and nothing is written.

use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeMap;

use super::error::LedgerError;
use super::types::{BalanceKey, TradeSettlement};
use crate::balance::Balance;
use crate::core_types::{CustomerId, OrderId};
use crate::outbox::{EventType, OutboxEvent};

pub const AGGREGATE_ASSET: &str = "Asset";

/// Locked copies of the rows one operation touches.
#[derive(Debug, Default)]
pub struct Rows {
    rows: BTreeMap<BalanceKey, Balance>,
}

impl Rows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: BalanceKey, balance: Balance) {
        self.rows.insert(key, balance);
    }

    pub fn get(&self, key: &BalanceKey) -> Option<&Balance> {
        self.rows.get(key)
    }

    pub fn into_inner(self) -> BTreeMap<BalanceKey, Balance> {
        self.rows
    }

    fn row(&mut self, key: &BalanceKey) -> Result<&mut Balance, LedgerError> {
        self.rows.get_mut(key).ok_or_else(|| LedgerError::NotFound {
            customer_id: key.customer_id,
            instrument: key.instrument.clone(),
        })
    }

    fn apply(
        &mut self,
        key: &BalanceKey,
        f: impl FnOnce(&mut Balance) -> Result<(), crate::balance::BalanceError>,
    ) -> Result<Balance, LedgerError> {
        let row = self.row(key)?;
        f(row).map_err(|e| LedgerError::from_balance(key.customer_id, &key.instrument, e))?;
        Ok(*row)
    }
}

/// Keys one operation must lock, with whether each row may be created.
pub type LockPlan = Vec<(BalanceKey, bool)>;

/// Sort and merge a lock plan into canonical order.
pub fn canonical(mut plan: LockPlan) -> LockPlan {
    plan.sort_by(|a, b| a.0.cmp(&b.0));
    let mut merged: LockPlan = Vec::with_capacity(plan.len());
    for (key, create) in plan {
        match merged.last_mut() {
            Some((last, c)) if *last == key => *c |= create,
            _ => merged.push((key, create)),
        }
    }
    merged
}

pub fn ensure_positive(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

fn asset_event(
    event_type: EventType,
    customer_id: CustomerId,
    payload: serde_json::Value,
) -> OutboxEvent {
    OutboxEvent::new(
        event_type,
        AGGREGATE_ASSET,
        customer_id,
        Some(customer_id.to_string()),
        payload,
    )
}

fn movement_payload(
    key: &BalanceKey,
    amount: Decimal,
    order_id: Option<OrderId>,
    after: &Balance,
) -> serde_json::Value {
    json!({
        "customerId": key.customer_id.to_string(),
        "instrument": key.instrument,
        "amount": amount.to_string(),
        "orderId": order_id.map(|o| o.to_string()),
        "usable": after.usable().to_string(),
        "blocked": after.blocked().to_string(),
    })
}

// ============================================================
// Single-row operations
// ============================================================

pub fn reserve(
    rows: &mut Rows,
    key: &BalanceKey,
    amount: Decimal,
    order_id: Option<OrderId>,
) -> Result<(Balance, Vec<OutboxEvent>), LedgerError> {
    ensure_positive(amount)?;
    let after = rows.apply(key, |b| b.reserve(amount))?;
    let event = asset_event(
        EventType::AssetReserved,
        key.customer_id,
        movement_payload(key, amount, order_id, &after),
    );
    Ok((after, vec![event]))
}

pub fn release(
    rows: &mut Rows,
    key: &BalanceKey,
    amount: Decimal,
    order_id: Option<OrderId>,
) -> Result<(Balance, Vec<OutboxEvent>), LedgerError> {
    ensure_positive(amount)?;
    let after = rows.apply(key, |b| b.release(amount))?;
    let event = asset_event(
        EventType::AssetReleased,
        key.customer_id,
        movement_payload(key, amount, order_id, &after),
    );
    Ok((after, vec![event]))
}

pub fn credit(
    rows: &mut Rows,
    key: &BalanceKey,
    amount: Decimal,
) -> Result<(Balance, Vec<OutboxEvent>), LedgerError> {
    ensure_positive(amount)?;
    let after = rows.apply(key, |b| b.credit(amount))?;
    let event = asset_event(
        EventType::DepositCompleted,
        key.customer_id,
        movement_payload(key, amount, None, &after),
    );
    Ok((after, vec![event]))
}

pub fn debit(
    rows: &mut Rows,
    key: &BalanceKey,
    amount: Decimal,
) -> Result<(Balance, Vec<OutboxEvent>), LedgerError> {
    ensure_positive(amount)?;
    let after = rows.apply(key, |b| b.debit(amount))?;
    let event = asset_event(
        EventType::WithdrawalCompleted,
        key.customer_id,
        movement_payload(key, amount, None, &after),
    );
    Ok((after, vec![event]))
}

// ============================================================
// Two-leg settlement
// ============================================================

pub fn settle_plan(customer_id: CustomerId, from: &str, to: &str) -> Result<LockPlan, LedgerError> {
    if from == to {
        return Err(LedgerError::SameInstrument(from.to_string()));
    }
    Ok(canonical(vec![
        (BalanceKey::new(customer_id, from), false),
        (BalanceKey::new(customer_id, to), true),
    ]))
}

/// Spend `from_amount` blocked, credit `to_amount` usable. Both or neither.
pub fn settle(
    rows: &mut Rows,
    customer_id: CustomerId,
    from_instrument: &str,
    from_amount: Decimal,
    to_instrument: &str,
    to_amount: Decimal,
) -> Result<Vec<OutboxEvent>, LedgerError> {
    if from_instrument == to_instrument {
        return Err(LedgerError::SameInstrument(from_instrument.to_string()));
    }
    ensure_positive(from_amount)?;
    ensure_positive(to_amount)?;

    let from = BalanceKey::new(customer_id, from_instrument);
    let to = BalanceKey::new(customer_id, to_instrument);
    rows.apply(&from, |b| b.spend_blocked(from_amount))?;
    rows.apply(&to, |b| b.credit(to_amount))?;

    Ok(vec![asset_event(
        EventType::SettlementCompleted,
        customer_id,
        json!({
            "customerId": customer_id.to_string(),
            "fromInstrument": from_instrument,
            "fromAmount": from_amount.to_string(),
            "toInstrument": to_instrument,
            "toAmount": to_amount.to_string(),
        }),
    )])
}

pub fn trade_plan(s: &TradeSettlement) -> LockPlan {
    canonical(vec![
        (BalanceKey::new(s.buyer_customer_id, &s.currency), false),
        (BalanceKey::new(s.buyer_customer_id, &s.instrument), true),
        (BalanceKey::new(s.seller_customer_id, &s.instrument), false),
        (BalanceKey::new(s.seller_customer_id, &s.currency), true),
    ])
}

/// Both customers' legs of one trade, plus the buyer's price-improvement refund.
pub fn settle_trade(rows: &mut Rows, s: &TradeSettlement) -> Result<Vec<OutboxEvent>, LedgerError> {
    let notional = s.notional()?;
    let mut events = settle(
        rows,
        s.buyer_customer_id,
        &s.currency,
        notional,
        &s.instrument,
        s.quantity,
    )?;
    events.extend(settle(
        rows,
        s.seller_customer_id,
        &s.instrument,
        s.quantity,
        &s.currency,
        notional,
    )?);

    let refund = s.buyer_refund()?;
    if refund > Decimal::ZERO {
        let key = BalanceKey::new(s.buyer_customer_id, &s.currency);
        let (_, refund_events) = release(rows, &key, refund, None)?;
        events.extend(refund_events);
    }

    for e in events.iter_mut() {
        if let Some(obj) = e.payload.as_object_mut() {
            obj.insert("tradeId".into(), json!(s.trade_id.to_string()));
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn funded(key: &BalanceKey, usable: Decimal) -> Rows {
        let mut rows = Rows::new();
        let mut b = Balance::default();
        if usable > Decimal::ZERO {
            b.credit(usable).unwrap();
        }
        rows.insert(key.clone(), b);
        rows
    }

    #[test]
    fn test_reserve_emits_event_with_decimal_strings() {
        let key = BalanceKey::new(Uuid::new_v4(), "TRY");
        let mut rows = funded(&key, dec!(10000));
        let (after, events) = reserve(&mut rows, &key, dec!(1500), None).unwrap();
        assert_eq!(after.usable(), dec!(8500));
        assert_eq!(after.blocked(), dec!(1500));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::AssetReserved);
        assert_eq!(events[0].payload["amount"], "1500");
        assert_eq!(events[0].topic, "asset.reserved");
    }

    #[test]
    fn test_reserve_missing_row_is_not_found() {
        let key = BalanceKey::new(Uuid::new_v4(), "TRY");
        let mut rows = Rows::new();
        assert!(matches!(
            reserve(&mut rows, &key, dec!(1), None),
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_settle_is_all_or_nothing() {
        let c = Uuid::new_v4();
        let from = BalanceKey::new(c, "TRY");
        let to = BalanceKey::new(c, "AAPL");
        let mut rows = funded(&from, dec!(100));
        rows.insert(to.clone(), Balance::default());
        rows.apply(&from, |b| b.reserve(dec!(50))).unwrap();

        // Source leg fails: blocked 50 < 60
        let err = settle(&mut rows, c, "TRY", dec!(60), "AAPL", dec!(1)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));

        let events = settle(&mut rows, c, "TRY", dec!(50), "AAPL", dec!(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(rows.get(&from).unwrap().blocked(), dec!(0));
        assert_eq!(rows.get(&to).unwrap().usable(), dec!(1));
    }

    #[test]
    fn test_settle_same_instrument_rejected() {
        assert!(matches!(
            settle_plan(Uuid::new_v4(), "TRY", "TRY"),
            Err(LedgerError::SameInstrument(_))
        ));
    }

    #[test]
    fn test_canonical_merges_duplicates() {
        let c = Uuid::from_u128(7);
        let plan = canonical(vec![
            (BalanceKey::new(c, "TRY"), false),
            (BalanceKey::new(c, "AAPL"), true),
            (BalanceKey::new(c, "TRY"), true),
        ]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0], (BalanceKey::new(c, "AAPL"), true));
        assert_eq!(plan[1], (BalanceKey::new(c, "TRY"), true));
    }

    #[test]
    fn test_settle_trade_with_price_improvement() {
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let s = TradeSettlement {
            trade_id: Uuid::new_v4(),
            instrument: "AAPL".into(),
            currency: "TRY".into(),
            quantity: dec!(10),
            price: dec!(150),
            buyer_customer_id: buyer,
            seller_customer_id: seller,
            buyer_limit_price: dec!(155),
        };

        let mut rows = Rows::new();
        for (key, _) in trade_plan(&s) {
            rows.insert(key, Balance::default());
        }
        let bc = BalanceKey::new(buyer, "TRY");
        let si = BalanceKey::new(seller, "AAPL");
        rows.apply(&bc, |b| b.credit(dec!(2000))).unwrap();
        rows.apply(&bc, |b| b.reserve(dec!(1550))).unwrap();
        rows.apply(&si, |b| b.credit(dec!(10))).unwrap();
        rows.apply(&si, |b| b.reserve(dec!(10))).unwrap();

        let events = settle_trade(&mut rows, &s).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.payload["tradeId"] == s.trade_id.to_string()));

        let buyer_try = rows.get(&bc).unwrap();
        assert_eq!(buyer_try.blocked(), dec!(0));
        assert_eq!(buyer_try.usable(), dec!(500));
        assert_eq!(rows.get(&BalanceKey::new(buyer, "AAPL")).unwrap().usable(), dec!(10));
        assert_eq!(rows.get(&si).unwrap().total(), dec!(0));
        assert_eq!(rows.get(&BalanceKey::new(seller, "TRY")).unwrap().usable(), dec!(1500));
    }
}
