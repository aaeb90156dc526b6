//! CSV I/O - Load fixtures and dump snapshots
//!
//! Input:
//! - `balances.csv`: `customer_id,instrument,amount` (credited to usable)
//! - `orders.csv`: `order_id,customer_id,action,instrument,side,price,size,tier`
//!   where `action` is `place` or `cancel` (cancel only needs the order id)
//!
//! Output: balances, orders and trades snapshots, one row per record.

use anyhow::{Context, Result, bail};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::balance::Balance;
use crate::core_types::{CustomerId, CustomerTier, OrderId, Side};
use crate::order::{CreateOrderRequest, Order};
use crate::trade::Trade;

pub const BALANCES_CSV: &str = "balances.csv";
pub const ORDERS_CSV: &str = "orders.csv";

pub const ACTION_PLACE: &str = "place";
pub const ACTION_CANCEL: &str = "cancel";

// ============================================================
// Input
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialBalance {
    pub customer_id: CustomerId,
    pub instrument: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    Place(CreateOrderRequest),
    Cancel(OrderId),
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn column<'a>(parts: &[&'a str], idx: usize, name: &str, line: usize) -> Result<&'a str> {
    match parts.get(idx).map(|s| s.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => bail!("Missing {} at line {}", name, line),
    }
}

fn parse_col<T>(parts: &[&str], idx: usize, name: &str, line: usize) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = column(parts, idx, name, line)?;
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid {} '{}' at line {}: {}", name, raw, line, e))
}

/// Parse `customer_id,instrument,amount` rows (header skipped).
pub fn parse_balances(reader: impl BufRead) -> Result<Vec<InitialBalance>> {
    let mut rows = Vec::new();
    for (line_num, line) in reader.lines().skip(1).enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = line_num + 2;
        let parts: Vec<&str> = line.split(',').collect();
        rows.push(InitialBalance {
            customer_id: parse_col::<Uuid>(&parts, 0, "customer_id", line_no)?,
            instrument: column(&parts, 1, "instrument", line_no)?.to_string(),
            amount: parse_col::<Decimal>(&parts, 2, "amount", line_no)?,
        });
    }
    Ok(rows)
}

/// Parse order actions (header skipped). Tier defaults to STANDARD.
pub fn parse_orders(reader: impl BufRead) -> Result<Vec<InputAction>> {
    let mut actions = Vec::new();
    for (line_num, line) in reader.lines().skip(1).enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = line_num + 2;
        let parts: Vec<&str> = line.split(',').collect();
        let order_id = parse_col::<Uuid>(&parts, 0, "order_id", line_no)?;
        let action = column(&parts, 2, "action", line_no)?.to_lowercase();

        match action.as_str() {
            ACTION_CANCEL => actions.push(InputAction::Cancel(order_id)),
            ACTION_PLACE => {
                let tier = match parts.get(7).map(|s| s.trim()) {
                    Some(t) if !t.is_empty() => CustomerTier::from_str(&t.to_uppercase())
                        .map_err(|e| anyhow::anyhow!("{} at line {}", e, line_no))?,
                    _ => CustomerTier::default(),
                };
                let side = column(&parts, 4, "side", line_no)?.to_uppercase();
                actions.push(InputAction::Place(CreateOrderRequest {
                    order_id: Some(order_id),
                    customer_id: parse_col::<Uuid>(&parts, 1, "customer_id", line_no)?,
                    instrument: column(&parts, 3, "instrument", line_no)?.to_string(),
                    side: Side::from_str(&side)
                        .map_err(|e| anyhow::anyhow!("{} at line {}", e, line_no))?,
                    price: parse_col::<Decimal>(&parts, 5, "price", line_no)?,
                    size: parse_col::<Decimal>(&parts, 6, "size", line_no)?,
                    tier,
                    idempotency_key: None,
                }));
            }
            other => bail!("Unknown action '{}' at line {}", other, line_no),
        }
    }
    Ok(actions)
}

pub fn load_balances(dir: &Path) -> Result<Vec<InitialBalance>> {
    let path = dir.join(BALANCES_CSV);
    let rows = parse_balances(open(&path)?)?;
    tracing::info!(count = rows.len(), path = %path.display(), "Loaded balances");
    Ok(rows)
}

pub fn load_orders(dir: &Path) -> Result<Vec<InputAction>> {
    let path = dir.join(ORDERS_CSV);
    let actions = parse_orders(open(&path)?)?;
    tracing::info!(count = actions.len(), path = %path.display(), "Loaded order actions");
    Ok(actions)
}

// ============================================================
// Output
// ============================================================

pub fn write_balances(
    w: &mut impl Write,
    rows: &[(CustomerId, String, Balance)],
) -> std::io::Result<()> {
    writeln!(w, "customer_id,instrument,usable,blocked,version")?;
    for (customer_id, instrument, b) in rows {
        writeln!(
            w,
            "{},{},{},{},{}",
            customer_id,
            instrument,
            b.usable(),
            b.blocked(),
            b.version()
        )?;
    }
    Ok(())
}

pub fn write_orders(w: &mut impl Write, orders: &[Order]) -> std::io::Result<()> {
    writeln!(
        w,
        "order_id,customer_id,instrument,side,price,size,filled_size,status,reason"
    )?;
    for o in orders {
        writeln!(
            w,
            "{},{},{},{},{},{},{},{},{}",
            o.order_id,
            o.customer_id,
            o.instrument,
            o.side,
            o.price,
            o.size,
            o.filled_size,
            o.status,
            o.reason.as_deref().unwrap_or("").replace(',', ";")
        )?;
    }
    Ok(())
}

pub fn write_trades(w: &mut impl Write, trades: &[Trade]) -> std::io::Result<()> {
    writeln!(
        w,
        "trade_id,instrument,buy_order_id,sell_order_id,quantity,price,total_value,taker_side"
    )?;
    for t in trades {
        writeln!(
            w,
            "{},{},{},{},{},{},{},{}",
            t.trade_id,
            t.instrument,
            t.buy_order_id,
            t.sell_order_id,
            t.quantity,
            t.price,
            t.total_value,
            t.taker_side
        )?;
    }
    Ok(())
}

/// Create `path` and fill it with `write`.
pub fn dump<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    write(&mut file).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "Dumped snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_balances() {
        let csv = "customer_id,instrument,amount\n\
                   7f1c1b8e-3d5a-4c1e-9a51-0c6e2b1d4a01,TRY,10000\n\
                   \n\
                   7f1c1b8e-3d5a-4c1e-9a51-0c6e2b1d4a02,AAPL,25.5\n";
        let rows = parse_balances(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].instrument, "TRY");
        assert_eq!(rows[1].amount, dec!(25.5));
    }

    #[test]
    fn test_parse_orders_place_and_cancel() {
        let csv = "order_id,customer_id,action,instrument,side,price,size,tier\n\
                   a0000000-0000-4000-8000-000000000001,7f1c1b8e-3d5a-4c1e-9a51-0c6e2b1d4a01,place,AAPL,buy,150,10,vip\n\
                   a0000000-0000-4000-8000-000000000002,7f1c1b8e-3d5a-4c1e-9a51-0c6e2b1d4a02,place,AAPL,SELL,151,4,\n\
                   a0000000-0000-4000-8000-000000000001,,cancel,,,,,\n";
        let actions = parse_orders(csv.as_bytes()).unwrap();
        assert_eq!(actions.len(), 3);
        match &actions[0] {
            InputAction::Place(req) => {
                assert_eq!(req.side, Side::Buy);
                assert_eq!(req.tier, CustomerTier::Vip);
                assert_eq!(req.price, dec!(150));
            }
            other => panic!("expected place, got {:?}", other),
        }
        match &actions[1] {
            InputAction::Place(req) => assert_eq!(req.tier, CustomerTier::Standard),
            other => panic!("expected place, got {:?}", other),
        }
        assert!(matches!(actions[2], InputAction::Cancel(_)));
    }

    #[test]
    fn test_parse_orders_reports_line() {
        let csv = "header\n\
                   a0000000-0000-4000-8000-000000000001,7f1c1b8e-3d5a-4c1e-9a51-0c6e2b1d4a01,place,AAPL,buy,abc,10,\n";
        let err = parse_orders(csv.as_bytes()).unwrap_err().to_string();
        assert!(err.contains("price"), "{}", err);
        assert!(err.contains("line 2"), "{}", err);
    }

    #[test]
    fn test_write_trades_header() {
        let mut out = Vec::new();
        write_trades(&mut out, &[]).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("trade_id,"));
    }
}
