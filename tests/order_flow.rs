//! End-to-end order flow over the in-memory service graph.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use brokerage_core::config::AppConfig;
use brokerage_core::core_types::{CustomerId, CustomerTier, Side};
use brokerage_core::ledger::AssetLedger;
use brokerage_core::order::{CreateOrderRequest, OrderError, OrderStatus};
use brokerage_core::saga::SagaStatus;
use brokerage_core::services::Services;
use brokerage_core::trade::TradeLedger;

fn services() -> Services {
    let config = AppConfig {
        instruments: vec!["AAPL".into(), "THYAO".into()],
        ..AppConfig::default()
    };
    Services::in_memory(&config)
}

fn order(customer: CustomerId, side: Side, price: Decimal, size: Decimal) -> CreateOrderRequest {
    CreateOrderRequest {
        order_id: None,
        customer_id: customer,
        instrument: "AAPL".into(),
        side,
        price,
        size,
        tier: CustomerTier::Standard,
        idempotency_key: None,
    }
}

async fn funded(s: &Services, instrument: &str, amount: Decimal) -> CustomerId {
    let c = Uuid::new_v4();
    s.ledger.credit(c, instrument, amount).await.unwrap();
    c
}

async fn usable_blocked(s: &Services, c: CustomerId, instrument: &str) -> (Decimal, Decimal) {
    s.ledger
        .balance(c, instrument)
        .await
        .unwrap()
        .map(|b| (b.usable(), b.blocked()))
        .unwrap_or((Decimal::ZERO, Decimal::ZERO))
}

#[tokio::test]
async fn test_cross_settles_at_maker_price_with_refund() {
    let s = services();
    let seller = funded(&s, "AAPL", dec!(10)).await;
    let buyer = funded(&s, "TRY", dec!(2000)).await;

    let sell = s
        .orders
        .create_order(order(seller, Side::Sell, dec!(150), dec!(10)))
        .await
        .unwrap();
    assert_eq!(sell.status, OrderStatus::AssetReserved);

    let buy = s
        .orders
        .create_order(order(buyer, Side::Buy, dec!(155), dec!(10)))
        .await
        .unwrap();
    assert_eq!(buy.status, OrderStatus::Matched);
    assert_eq!(
        s.orders.get_order(sell.order_id).await.unwrap().status,
        OrderStatus::Matched
    );

    let trades = s.trades.trades_for_order(buy.order_id).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].price, dec!(150));
    assert_eq!(trades[0].quantity, dec!(10));
    assert_eq!(s.matching.active_order_count().await.unwrap(), 0);

    // Before settlement the buyer still has 10 × 155 blocked
    assert_eq!(usable_blocked(&s, buyer, "TRY").await, (dec!(450), dec!(1550)));

    s.drain_outboxes(100).await.unwrap();

    assert_eq!(usable_blocked(&s, buyer, "TRY").await, (dec!(500), dec!(0)));
    assert_eq!(usable_blocked(&s, buyer, "AAPL").await, (dec!(10), dec!(0)));
    assert_eq!(usable_blocked(&s, seller, "AAPL").await, (dec!(0), dec!(0)));
    assert_eq!(usable_blocked(&s, seller, "TRY").await, (dec!(1500), dec!(0)));

    // Redelivery does not settle twice
    s.drain_outboxes(100).await.unwrap();
    assert_eq!(usable_blocked(&s, seller, "TRY").await, (dec!(1500), dec!(0)));
}

#[tokio::test]
async fn test_partial_fill_then_cancel_settles_filled_part_only() {
    let s = services();
    let seller = funded(&s, "AAPL", dec!(10)).await;
    let buyer = funded(&s, "TRY", dec!(3000)).await;

    s.orders
        .create_order(order(seller, Side::Sell, dec!(150), dec!(10)))
        .await
        .unwrap();
    let buy = s
        .orders
        .create_order(order(buyer, Side::Buy, dec!(150), dec!(15)))
        .await
        .unwrap();
    assert_eq!(buy.status, OrderStatus::PartiallyFilled);
    assert_eq!(buy.filled_size, dec!(10));

    let entry = s.matching.get_entry(buy.order_id).await.unwrap().unwrap();
    assert!(entry.is_active());
    assert_eq!(entry.remaining_size, dec!(5));

    let canceled = s.orders.cancel_order(buy.order_id, "customer").await.unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert_eq!(canceled.filled_size, dec!(10));

    s.drain_outboxes(100).await.unwrap();
    assert_eq!(usable_blocked(&s, buyer, "TRY").await, (dec!(1500), dec!(0)));
    assert_eq!(usable_blocked(&s, buyer, "AAPL").await, (dec!(10), dec!(0)));
    assert_eq!(usable_blocked(&s, seller, "TRY").await, (dec!(1500), dec!(0)));
}

#[tokio::test]
async fn test_insufficient_balance_never_queues() {
    let s = services();
    let buyer = funded(&s, "TRY", dec!(100)).await;

    let o = s
        .orders
        .create_order(order(buyer, Side::Buy, dec!(150), dec!(10)))
        .await
        .unwrap();
    assert_eq!(o.status, OrderStatus::Rejected);
    assert!(s.matching.get_entry(o.order_id).await.unwrap().is_none());

    let saga = s.orchestrator.get(o.order_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Failed);
    assert!(!saga.is_retryable());
    assert_eq!(usable_blocked(&s, buyer, "TRY").await, (dec!(100), dec!(0)));
}

#[tokio::test]
async fn test_unknown_instrument_is_refused_synchronously() {
    let s = services();
    let err = s
        .orders
        .create_order(CreateOrderRequest {
            instrument: "MSFT".into(),
            ..order(Uuid::new_v4(), Side::Buy, dec!(1), dec!(1))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::UnknownInstrument(_)));
}

#[tokio::test]
async fn test_earlier_order_matches_first_then_tier_beats_time() {
    let s = services();
    let b1 = funded(&s, "TRY", dec!(10000)).await;
    let b2 = funded(&s, "TRY", dec!(10000)).await;
    let b3 = funded(&s, "TRY", dec!(10000)).await;
    let seller = funded(&s, "AAPL", dec!(10)).await;

    let first = s
        .orders
        .create_order(order(b1, Side::Buy, dec!(100), dec!(5)))
        .await
        .unwrap();
    let second = s
        .orders
        .create_order(order(b2, Side::Buy, dec!(100), dec!(5)))
        .await
        .unwrap();
    let vip = s
        .orders
        .create_order(CreateOrderRequest {
            tier: CustomerTier::Vip,
            ..order(b3, Side::Buy, dec!(100), dec!(5))
        })
        .await
        .unwrap();

    s.orders
        .create_order(order(seller, Side::Sell, dec!(100), dec!(10)))
        .await
        .unwrap();

    for (o, expected) in [
        (&vip, OrderStatus::Matched),
        (&first, OrderStatus::Matched),
        (&second, OrderStatus::AssetReserved),
    ] {
        assert_eq!(s.orders.get_order(o.order_id).await.unwrap().status, expected);
    }
}

#[tokio::test]
async fn test_idempotent_resubmission() {
    let s = services();
    let seller = funded(&s, "AAPL", dec!(5)).await;
    let req = CreateOrderRequest {
        idempotency_key: Some("ext-1".into()),
        ..order(seller, Side::Sell, dec!(100), dec!(5))
    };
    let a = s.orders.create_order(req.clone()).await.unwrap();
    let b = s.orders.create_order(req).await.unwrap();
    assert_eq!(a.order_id, b.order_id);
    assert_eq!(usable_blocked(&s, seller, "AAPL").await, (dec!(0), dec!(5)));
    assert_eq!(s.matching.active_order_count().await.unwrap(), 1);

    // Same saga returned on restart of the same correlation id
    let saga = s
        .orchestrator
        .start_saga(a.order_id, a.saga_payload())
        .await
        .unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(usable_blocked(&s, seller, "AAPL").await, (dec!(0), dec!(5)));
}

/// Deterministic mixed flow; checks the conservation and bound properties.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_flow_conserves_assets() {
    let s = Arc::new(services());
    let mut customers = Vec::new();
    for _ in 0..6 {
        let c = Uuid::new_v4();
        s.ledger.credit(c, "TRY", dec!(50000)).await.unwrap();
        s.ledger.credit(c, "AAPL", dec!(200)).await.unwrap();
        customers.push(c);
    }

    // Linear congruential generator, fixed seed
    let mut seed: u64 = 0x5eed;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as u32
    };

    let mut requests = Vec::new();
    for i in 0..60 {
        let side = if next() % 2 == 0 { Side::Buy } else { Side::Sell };
        let price = Decimal::from(95 + next() % 11);
        let size = Decimal::from(1 + next() % 20);
        let tier = match next() % 3 {
            0 => CustomerTier::Standard,
            1 => CustomerTier::Premium,
            _ => CustomerTier::Vip,
        };
        requests.push(CreateOrderRequest {
            tier,
            idempotency_key: Some(format!("flow-{}", i)),
            ..order(customers[i % customers.len()], side, price, size)
        });
    }

    let handles: Vec<_> = requests
        .into_iter()
        .map(|req| {
            let s = s.clone();
            tokio::spawn(async move { s.orders.create_order(req).await })
        })
        .collect();
    let mut placed = Vec::new();
    for h in handles {
        placed.push(h.await.unwrap().unwrap());
    }

    // Cancel whatever is still resting on every third order
    for o in placed.iter().step_by(3) {
        match s.orders.cancel_order(o.order_id, "cleanup").await {
            Ok(_) | Err(OrderError::NotCancelable { .. }) => {}
            Err(e) => panic!("unexpected cancel error: {}", e),
        }
    }

    s.drain_outboxes(1000).await.unwrap();

    let mut filled_by_order: HashMap<Uuid, Decimal> = HashMap::new();
    for o in &placed {
        let o = s.orders.get_order(o.order_id).await.unwrap();
        assert!(o.filled_size >= Decimal::ZERO && o.filled_size <= o.size);
        for t in s.trades.trades_for_order(o.order_id).await.unwrap() {
            // Never worse than the taker's limit
            let taker_is_this = (t.taker_side == Side::Buy && t.buy_order_id == o.order_id)
                || (t.taker_side == Side::Sell && t.sell_order_id == o.order_id);
            if taker_is_this {
                match o.side {
                    Side::Buy => assert!(t.price <= o.price),
                    Side::Sell => assert!(t.price >= o.price),
                }
            }
            *filled_by_order.entry(o.order_id).or_default() += t.quantity;
        }
        let traded = filled_by_order.get(&o.order_id).copied().unwrap_or_default();
        assert!(traded <= o.size);
        assert_eq!(traded, o.filled_size, "order {} projection", o.order_id);
    }

    let mut total_try = Decimal::ZERO;
    let mut total_aapl = Decimal::ZERO;
    let mut total_blocked = Decimal::ZERO;
    for &c in &customers {
        for (instrument, b) in s.ledger.balances_for_customer(c).await.unwrap() {
            assert!(b.usable() >= Decimal::ZERO && b.blocked() >= Decimal::ZERO);
            match instrument.as_str() {
                "TRY" => total_try += b.total(),
                "AAPL" => total_aapl += b.total(),
                other => panic!("unexpected row {}", other),
            }
        }
    }
    assert_eq!(total_try, dec!(300000));
    assert_eq!(total_aapl, dec!(1200));

    // Blocked equals what resting orders still need
    let mut still_needed = Decimal::ZERO;
    for &c in &customers {
        for (_, b) in s.ledger.balances_for_customer(c).await.unwrap() {
            total_blocked += b.blocked();
        }
        for o in s.orders.orders_for_customer(c).await.unwrap() {
            if o.status.is_cancelable() {
                still_needed += match o.side {
                    Side::Buy => o.remaining_size() * o.price,
                    Side::Sell => o.remaining_size(),
                };
            }
        }
    }
    assert_eq!(total_blocked, still_needed);
}
