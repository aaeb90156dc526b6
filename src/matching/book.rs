//! In-memory book of ACTIVE entries for one instrument.
//!
//! # Data Structure
//!
//! ```text
//! asks: BTreeMap<AskKey, OrderId>  (price ASC, tier DESC, time ASC, seq ASC)
//! bids: BTreeMap<BidKey, OrderId>  (price DESC, tier DESC, time ASC, seq ASC)
//! entries: FxHashMap<OrderId, MatchingQueueEntry>
//! ```
//!
//! The first key of each map is the best maker for an incoming taker on the
//! opposite side, so priority is a single `first_key_value`.
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | best      | O(log n)   |
//! | insert    | O(log n)   |
//! | remove    | O(log n)   |
//! | update    | O(1)       |

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::queue::MatchingQueueEntry;
use crate::core_types::{OrderId, Side};

type AskKey = (Decimal, Reverse<i16>, DateTime<Utc>, i64);
type BidKey = (Reverse<Decimal>, Reverse<i16>, DateTime<Utc>, i64);

fn ask_key(e: &MatchingQueueEntry) -> AskKey {
    (e.price, Reverse(e.priority_tier), e.queued_at, e.seq)
}

fn bid_key(e: &MatchingQueueEntry) -> BidKey {
    (Reverse(e.price), Reverse(e.priority_tier), e.queued_at, e.seq)
}

#[derive(Debug, Default)]
pub struct InstrumentBook {
    asks: BTreeMap<AskKey, OrderId>,
    bids: BTreeMap<BidKey, OrderId>,
    entries: FxHashMap<OrderId, MatchingQueueEntry>,
}

impl InstrumentBook {
    /// Rest an entry. Inactive entries and duplicates are ignored.
    pub fn insert(&mut self, entry: MatchingQueueEntry) -> bool {
        if !entry.is_active() || self.entries.contains_key(&entry.order_id) {
            return false;
        }
        match entry.side {
            Side::Sell => {
                self.asks.insert(ask_key(&entry), entry.order_id);
            }
            Side::Buy => {
                self.bids.insert(bid_key(&entry), entry.order_id);
            }
        }
        self.entries.insert(entry.order_id, entry);
        true
    }

    pub fn remove(&mut self, order_id: &OrderId) -> Option<MatchingQueueEntry> {
        let entry = self.entries.remove(order_id)?;
        match entry.side {
            Side::Sell => {
                self.asks.remove(&ask_key(&entry));
            }
            Side::Buy => {
                self.bids.remove(&bid_key(&entry));
            }
        }
        Some(entry)
    }

    /// Replace a resting entry after a fill; drops it once no longer active.
    ///
    /// Price, tier and time never change after queueing so the key is stable.
    pub fn update(&mut self, entry: MatchingQueueEntry) {
        if entry.is_active() {
            if let Some(slot) = self.entries.get_mut(&entry.order_id) {
                *slot = entry;
            }
        } else {
            self.remove(&entry.order_id);
        }
    }

    /// Highest-priority resting order that would trade with a `taker_side`
    /// taker limited at `limit`.
    pub fn best_counter(&self, taker_side: Side, limit: Decimal) -> Option<&MatchingQueueEntry> {
        let id = match taker_side {
            Side::Buy => self.asks.first_key_value().map(|(_, id)| id),
            Side::Sell => self.bids.first_key_value().map(|(_, id)| id),
        }?;
        self.entries.get(id).filter(|e| e.crosses(limit))
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().map(|k| k.0)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|k| k.0 .0)
    }
}
