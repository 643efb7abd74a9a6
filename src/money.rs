//! Fixed-point money arithmetic.
//!
//! All monetary amounts in the ledger are carried as [`rust_decimal::Decimal`]
//! truncated to two decimal places. Floating point is never used for money
//! (spec §3 Invariant 7, §9 "Currency").

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A non-negative-by-convention monetary amount with two decimal places.
///
/// `Money` wraps a [`Decimal`] and normalizes every value it is constructed
/// from to two fractional digits using round-half-away-from-zero, matching
/// typical financial rounding conventions. Negative values are representable
/// (e.g. as intermediate deltas) but the ledger never persists a negative
/// balance (Invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Money(Decimal);

impl Money {
    /// The additive identity.
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Build a `Money` from a [`Decimal`], rounding to two decimal places.
    pub fn new(value: Decimal) -> Self {
        Self(round2(value))
    }

    /// Build a `Money` from an integer number of whole units.
    pub fn from_i64(value: i64) -> Self {
        Self(Decimal::from(value))
    }

    /// Parse a decimal string, rejecting NaN-equivalents and non-numeric input.
    ///
    /// Per spec §6, incoming numeric strings are sanitized to `[0-9.\-]`
    /// before parsing; this function assumes sanitization already happened
    /// and only validates that the result parses to a finite decimal.
    pub fn parse(s: &str) -> Result<Self, MoneyParseError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        let value = Decimal::from_str(trimmed).map_err(|_| MoneyParseError::NotNumeric)?;
        Ok(Self::new(value))
    }

    /// The underlying two-decimal-place [`Decimal`].
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// `true` when the amount is strictly positive.
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// `true` when the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == Decimal::ZERO
    }

    /// Saturating-to-zero subtraction: `self - other`, floored at zero.
    pub fn saturating_sub(&self, other: Money) -> Money {
        let diff = self.0 - other.0;
        Money(if diff < Decimal::ZERO {
            Decimal::ZERO
        } else {
            round2(diff)
        })
    }

    /// `self` multiplied by a percentage (0..=100), rounded to two places.
    ///
    /// `bonus_amount = round2(purchaseAmount * bonusPercent / 100)` (spec §4.2).
    pub fn percent_of(&self, percent: Decimal) -> Money {
        Money::new(self.0 * percent / Decimal::ONE_HUNDRED)
    }

    /// Minimum of two amounts.
    pub fn min(self, other: Money) -> Money {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::ZERO
    }
}

impl std::ops::Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money::new(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Round a decimal to two places, half-away-from-zero.
fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Errors from parsing a storefront-supplied numeric string into [`Money`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyParseError {
    /// The sanitized string was empty.
    #[error("numeric value is empty")]
    Empty,
    /// The sanitized string did not parse as a finite decimal.
    #[error("value is not a valid number")]
    NotNumeric,
}

/// Strip everything outside `[0-9.\-]` from a storefront numeric field
/// (spec §6, "Numeric strings").
pub fn sanitize_numeric(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_away_from_zero() {
        let m = Money::new(Decimal::from_str("12.345").unwrap());
        assert_eq!(m.to_string(), "12.35");
        let m2 = Money::new(Decimal::from_str("12.344").unwrap());
        assert_eq!(m2.to_string(), "12.34");
    }

    #[test]
    fn percent_of_computes_bonus() {
        let purchase = Money::new(Decimal::from(1000));
        let bonus = purchase.percent_of(Decimal::from(5));
        assert_eq!(bonus.to_string(), "50.00");
    }

    #[test]
    fn percent_of_tiered_rate() {
        let purchase = Money::new(Decimal::from(200));
        let bonus = purchase.percent_of(Decimal::from(7));
        assert_eq!(bonus.to_string(), "14.00");
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let a = Money::new(Decimal::from(10));
        let b = Money::new(Decimal::from(25));
        assert_eq!(a.saturating_sub(b), Money::ZERO);
    }

    #[test]
    fn sanitize_strips_non_numeric() {
        assert_eq!(sanitize_numeric("1,200.50 RUB"), "1200.50");
        assert_eq!(sanitize_numeric("-15.00"), "-15.00");
    }

    #[test]
    fn parse_rejects_empty_and_nan() {
        assert_eq!(Money::parse("").unwrap_err(), MoneyParseError::Empty);
        assert_eq!(Money::parse("abc").unwrap_err(), MoneyParseError::NotNumeric);
        assert!(Money::parse("42.5").is_ok());
    }

    #[test]
    fn sum_over_iterator() {
        let lots = vec![Money::from_i64(10), Money::from_i64(20), Money::from_i64(5)];
        let total: Money = lots.into_iter().sum();
        assert_eq!(total.to_string(), "35.00");
    }
}
