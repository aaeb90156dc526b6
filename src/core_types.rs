//! Core types used throughout the system
//!
//! Identifiers and small enums shared by the ledger, saga, matching and
//! order modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Order ID - externally supplied, also the saga correlation id.
pub type OrderId = Uuid;

/// Customer ID - owner of balance rows and orders.
pub type CustomerId = Uuid;

/// Trade ID - assigned by the matching engine when a trade executes.
pub type TradeId = Uuid;

/// Instrument symbol (e.g. "AAPL", or the settlement currency "TRY").
pub type Symbol = String;

// ============================================================
// Side
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

// ============================================================
// Customer tier
// ============================================================

/// Customer tier. Higher rank matches first among equal-priced orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CustomerTier {
    #[default]
    Standard,
    Premium,
    Vip,
}

impl CustomerTier {
    /// Priority rank stored on queue entries (VIP=2, PREMIUM=1, STANDARD=0).
    pub fn rank(&self) -> i16 {
        match self {
            CustomerTier::Standard => 0,
            CustomerTier::Premium => 1,
            CustomerTier::Vip => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerTier::Standard => "STANDARD",
            CustomerTier::Premium => "PREMIUM",
            CustomerTier::Vip => "VIP",
        }
    }
}

impl FromStr for CustomerTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STANDARD" => Ok(CustomerTier::Standard),
            "PREMIUM" => Ok(CustomerTier::Premium),
            "VIP" => Ok(CustomerTier::Vip),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}
