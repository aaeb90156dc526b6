//! Brokerage core
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │ Fixtures │───▶│   Saga   │───▶│ Matching │───▶│  Outbox  │
//! │  (CSV)   │    │ (Ledger) │    │ (Trades) │    │ (Settle) │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Default mode replays `orders.csv` against `balances.csv` and dumps
//! snapshots; `--serve` runs the dispatchers and the recovery worker until
//! Ctrl-C.

use anyhow::Context;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use brokerage_core::config::AppConfig;
use brokerage_core::core_types::CustomerId;
use brokerage_core::csv_io::{self, InputAction};
use brokerage_core::ledger::AssetLedger;
use brokerage_core::services::Services;
use brokerage_core::trade::TradeLedger;

const DRAIN_ROUNDS: usize = 1000;

fn arg_value(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| names.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1).cloned())
}

fn get_env() -> String {
    arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_input_dir() -> PathBuf {
    PathBuf::from(arg_value(&["--input"]).unwrap_or_else(|| "fixtures".to_string()))
}

fn get_output_dir() -> PathBuf {
    PathBuf::from(arg_value(&["--output"]).unwrap_or_else(|| "output".to_string()))
}

fn use_serve_mode() -> bool {
    std::env::args().any(|a| a == "--serve")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = brokerage_core::logging::init_logging(&config);

    tracing::info!(env = %env, instruments = ?config.instruments, "Starting brokerage core");
    let services = Services::build(&config).await?;

    if use_serve_mode() {
        return serve(&services).await;
    }
    replay(&services, &get_input_dir(), &get_output_dir()).await
}

async fn serve(services: &Services) -> anyhow::Result<()> {
    let handles = services.spawn_background();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    for h in handles {
        h.abort();
    }
    Ok(())
}

async fn replay(services: &Services, input: &Path, output: &Path) -> anyhow::Result<()> {
    let balances = csv_io::load_balances(input)?;
    let actions = csv_io::load_orders(input)?;

    let mut customers = BTreeSet::new();
    for b in &balances {
        services
            .ledger
            .credit(b.customer_id, &b.instrument, b.amount)
            .await
            .with_context(|| format!("Failed to credit {} {}", b.customer_id, b.instrument))?;
        customers.insert(b.customer_id);
    }

    let (mut placed, mut canceled, mut failed) = (0usize, 0usize, 0usize);
    for action in actions {
        match action {
            InputAction::Place(req) => {
                customers.insert(req.customer_id);
                match services.orders.create_order(req).await {
                    Ok(order) => {
                        placed += 1;
                        tracing::info!(order_id = %order.order_id, status = %order.status, "Order processed");
                    }
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(code = e.code(), error = %e, "Order refused");
                    }
                }
            }
            InputAction::Cancel(order_id) => {
                match services.orders.cancel_order(order_id, "fixture cancel").await {
                    Ok(_) => canceled += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(order_id = %order_id, code = e.code(), error = %e, "Cancel refused");
                    }
                }
            }
        }
    }

    let published = services.drain_outboxes(DRAIN_ROUNDS).await?;
    tracing::info!(placed, canceled, failed, published, "Replay finished");

    dump_snapshots(services, &customers, output).await
}

async fn dump_snapshots(
    services: &Services,
    customers: &BTreeSet<CustomerId>,
    output: &Path,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let mut balances = Vec::new();
    let mut orders = Vec::new();
    for &customer_id in customers {
        for (instrument, b) in services.ledger.balances_for_customer(customer_id).await? {
            balances.push((customer_id, instrument, b));
        }
        orders.extend(services.orders.orders_for_customer(customer_id).await?);
    }
    orders.sort_by_key(|o| o.created_at);

    let mut trades = Vec::new();
    let mut instruments: Vec<&str> = services.registry.instruments().collect();
    instruments.sort_unstable();
    for instrument in instruments {
        let mut recent = services
            .trades
            .trades_for_instrument(instrument, i64::MAX)
            .await?;
        recent.reverse();
        trades.extend(recent);
    }

    csv_io::dump(&output.join("balances_final.csv"), |f| {
        csv_io::write_balances(f, &balances)
    })?;
    csv_io::dump(&output.join("orders_final.csv"), |f| {
        csv_io::write_orders(f, &orders)
    })?;
    csv_io::dump(&output.join("trades.csv"), |f| csv_io::write_trades(f, &trades))?;
    Ok(())
}
