/// ENFORCED BALANCE TYPE - Used by the Asset Ledger
///
/// All balance mutations go through these methods.
///
/// # Enforcement Strategy:
/// 1. Fields are PRIVATE - no direct access
/// 2. All mutations return Result - errors are explicit
/// 3. Version increments on every successful mutation
/// 4. Amounts must be strictly positive
/// 5. A failed mutation leaves the value untouched
/// 6. Arithmetic is checked: `usable + blocked` always fits in a Decimal
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal arithmetic left the representable range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Amount overflow: {0}")]
pub struct AmountOverflow(pub String);

/// `a × b`, or [`AmountOverflow`] instead of a panic.
pub fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal, AmountOverflow> {
    a.checked_mul(b)
        .ok_or_else(|| AmountOverflow(format!("{} x {}", a, b)))
}

/// `a + b`, or [`AmountOverflow`] instead of a panic.
pub fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal, AmountOverflow> {
    a.checked_add(b)
        .ok_or_else(|| AmountOverflow(format!("{} + {}", a, b)))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("Amount must be positive: {0}")]
    NonPositiveAmount(Decimal),

    #[error("Insufficient usable balance: usable={usable}, required={required}")]
    InsufficientUsable { usable: Decimal, required: Decimal },

    #[error("Insufficient blocked balance: blocked={blocked}, required={required}")]
    InsufficientBlocked { blocked: Decimal, required: Decimal },

    #[error(transparent)]
    Overflow(#[from] AmountOverflow),
}

/// Balance of one (customer, instrument) row
///
/// # Invariants (ENFORCED by private fields):
/// - usable >= 0
/// - blocked >= 0
/// - total = usable + blocked
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Balance {
    usable: Decimal,
    blocked: Decimal,
    version: i64,
}

impl Balance {
    /// Rebuild a balance from persisted columns.
    ///
    /// Rejects rows that already violate the non-negativity invariant
    /// or whose total does not fit.
    pub fn from_parts(usable: Decimal, blocked: Decimal, version: i64) -> Option<Self> {
        if usable.is_sign_negative() || blocked.is_sign_negative() {
            return None;
        }
        usable.checked_add(blocked)?;
        Some(Self {
            usable,
            blocked,
            version,
        })
    }

    // ============================================================
    // READ-ONLY GETTERS
    // ============================================================

    #[inline(always)]
    pub fn usable(&self) -> Decimal {
        self.usable
    }

    #[inline(always)]
    pub fn blocked(&self) -> Decimal {
        self.blocked
    }

    #[inline(always)]
    pub fn total(&self) -> Decimal {
        // Bounded by credit()/from_parts()
        self.usable.checked_add(self.blocked).unwrap_or(Decimal::MAX)
    }

    #[inline(always)]
    pub fn version(&self) -> i64 {
        self.version
    }

    // ============================================================
    // VALIDATED MUTATIONS
    // ============================================================

    /// Credit usable balance (deposit, settlement destination leg)
    pub fn credit(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        ensure_positive(amount)?;
        // The total must stay representable, not just the usable side
        checked_add(self.total(), amount)?;
        self.usable = checked_add(self.usable, amount)?;
        self.bump();
        Ok(())
    }

    /// Debit usable balance (withdrawal)
    pub fn debit(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        ensure_positive(amount)?;
        if self.usable < amount {
            return Err(BalanceError::InsufficientUsable {
                usable: self.usable,
                required: amount,
            });
        }
        self.usable -= amount;
        self.bump();
        Ok(())
    }

    /// Reserve funds (move from usable to blocked)
    pub fn reserve(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        ensure_positive(amount)?;
        if self.usable < amount {
            return Err(BalanceError::InsufficientUsable {
                usable: self.usable,
                required: amount,
            });
        }
        let blocked = checked_add(self.blocked, amount)?;
        self.usable -= amount;
        self.blocked = blocked;
        self.bump();
        Ok(())
    }

    /// Release funds (move from blocked back to usable)
    pub fn release(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        ensure_positive(amount)?;
        if self.blocked < amount {
            return Err(BalanceError::InsufficientBlocked {
                blocked: self.blocked,
                required: amount,
            });
        }
        let usable = checked_add(self.usable, amount)?;
        self.blocked -= amount;
        self.usable = usable;
        self.bump();
        Ok(())
    }

    /// Spend blocked funds (settlement source leg, leaves the row for good)
    pub fn spend_blocked(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        ensure_positive(amount)?;
        if self.blocked < amount {
            return Err(BalanceError::InsufficientBlocked {
                blocked: self.blocked,
                required: amount,
            });
        }
        self.blocked -= amount;
        self.bump();
        Ok(())
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}

fn ensure_positive(amount: Decimal) -> Result<(), BalanceError> {
    if amount <= Decimal::ZERO {
        return Err(BalanceError::NonPositiveAmount(amount));
    }
    Ok(())
}
