//! Instrument registry
//!
//! Known tradable instruments plus the settlement currency every BUY is paid in.

use crate::balance::{AmountOverflow, checked_mul};
use crate::core_types::Side;
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;

#[derive(Debug, Clone)]
pub struct InstrumentRegistry {
    instruments: FxHashSet<String>,
    currency: String,
}

impl InstrumentRegistry {
    pub fn new<I, S>(instruments: I, currency: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instruments: instruments.into_iter().map(Into::into).collect(),
            currency: currency.into(),
        }
    }

    /// Settlement currency symbol (e.g. "TRY")
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Is `symbol` tradable? The currency itself is not.
    pub fn is_tradable(&self, symbol: &str) -> bool {
        symbol != self.currency && self.instruments.contains(symbol)
    }

    /// Is `symbol` a valid balance row (tradable instrument or currency)?
    pub fn is_known_asset(&self, symbol: &str) -> bool {
        symbol == self.currency || self.instruments.contains(symbol)
    }

    /// Which asset and how much an order must block before it may rest in the book.
    ///
    /// BUY blocks `size × price` of the currency, SELL blocks `size` of the instrument.
    pub fn reservation_for(
        &self,
        side: Side,
        instrument: &str,
        size: Decimal,
        price: Decimal,
    ) -> Result<(String, Decimal), AmountOverflow> {
        match side {
            Side::Buy => Ok((self.currency.clone(), checked_mul(size, price)?)),
            Side::Sell => Ok((instrument.to_string(), size)),
        }
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.instruments.iter().map(String::as_str)
    }
}
