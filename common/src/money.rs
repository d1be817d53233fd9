//! An XAF (CFA franc) amount newtype and commission rates.
//!
//! XAF has no sub-units, so every monetary value in the system is a signed
//! integer number of francs. Ledger credits are positive, debits negative.
//!
//! Note that we don't impl `Mul`/`Div` directly; the only multiplication the
//! core performs is amount-by-rate, which must round to a whole franc, so it
//! goes through the explicit [`Xaf::mul_rate`] / [`Xaf::mul_decimal`].

use std::fmt::{self, Display};
use std::iter::Sum;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

use anyhow::{ensure, Context};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A signed amount of CFA francs.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash,
    Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Xaf(i64);

impl Xaf {
    pub const ZERO: Self = Self(0);

    pub const fn new(francs: i64) -> Self {
        Self(francs)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Flip a credit into a debit (and vice versa).
    pub const fn negated(self) -> Self {
        Self(-self.0)
    }

    pub fn checked_add(self, rhs: Self) -> anyhow::Result<Self> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .context("XAF amount overflow in add")
    }

    pub fn checked_sub(self, rhs: Self) -> anyhow::Result<Self> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .context("XAF amount overflow in sub")
    }

    /// Multiply by a commission rate, rounding to the nearest whole franc
    /// (half away from zero).
    pub fn mul_rate(self, rate: CommissionRate) -> anyhow::Result<Self> {
        self.mul_decimal(rate.0)
    }

    /// Multiply by an arbitrary decimal factor (bonus multipliers), rounding
    /// to the nearest whole franc (half away from zero).
    pub fn mul_decimal(self, factor: Decimal) -> anyhow::Result<Self> {
        let product = Decimal::from(self.0)
            .checked_mul(factor)
            .context("XAF amount overflow in mul")?;
        product
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .map(Self)
            .context("XAF amount does not fit in i64")
    }
}

impl Add for Xaf {
    type Output = Xaf;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Xaf {
    type Output = Xaf;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Neg for Xaf {
    type Output = Xaf;
    fn neg(self) -> Self {
        self.negated()
    }
}

impl Sum for Xaf {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|x| x.0).sum())
    }
}

impl Display for Xaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for Xaf {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        i64::from_str(s).map(Self)
    }
}

/// A commission rate in `[0, 1]`, held at 4 decimal places.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionRate(Decimal);

impl CommissionRate {
    /// The fallback applied when no COMMISSION_PERCENT rule matches a trip.
    pub const DEFAULT: Self = Self(dec!(0.15));

    pub fn new(rate: Decimal) -> anyhow::Result<Self> {
        ensure!(rate >= Decimal::ZERO, "commission rate must be >= 0");
        ensure!(rate <= Decimal::ONE, "commission rate must be <= 1");
        Ok(Self(rate.round_dp(4)))
    }

    pub const fn as_decimal(self) -> Decimal {
        self.0
    }
}

impl Display for CommissionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commission_rounds_to_nearest_franc() {
        let rate = CommissionRate::new(dec!(0.10)).unwrap();
        assert_eq!(Xaf::new(3000).mul_rate(rate).unwrap(), Xaf::new(300));

        // 2505 * 0.1 = 250.5, rounds away from zero
        assert_eq!(Xaf::new(2505).mul_rate(rate).unwrap(), Xaf::new(251));
        // 2504 * 0.1 = 250.4, rounds down
        assert_eq!(Xaf::new(2504).mul_rate(rate).unwrap(), Xaf::new(250));
    }

    #[test]
    fn default_commission_is_fifteen_percent() {
        assert_eq!(
            Xaf::new(1000).mul_rate(CommissionRate::DEFAULT).unwrap(),
            Xaf::new(150),
        );
    }

    #[test]
    fn rate_bounds_enforced() {
        assert!(CommissionRate::new(dec!(-0.01)).is_err());
        assert!(CommissionRate::new(dec!(1.01)).is_err());
        assert!(CommissionRate::new(Decimal::ONE).is_ok());
        assert!(CommissionRate::new(Decimal::ZERO).is_ok());
    }

    #[test]
    fn ledger_sum() {
        let entries = [Xaf::new(3000), Xaf::new(-300)];
        let total: Xaf = entries.into_iter().sum();
        assert_eq!(total, Xaf::new(2700));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;
        use crate::test_utils::any_fare;

        proptest! {
            #[test]
            fn commission_never_exceeds_fare(fare in any_fare()) {
                let rate = CommissionRate::new(dec!(0.25)).unwrap();
                let commission = fare.mul_rate(rate).unwrap();
                prop_assert!(commission >= Xaf::ZERO);
                prop_assert!(commission <= fare);
            }

            #[test]
            fn net_plus_commission_reassembles_fare(fare in any_fare()) {
                let rate = CommissionRate::DEFAULT;
                let commission = fare.mul_rate(rate).unwrap();
                let net = fare.checked_sub(commission).unwrap();
                prop_assert_eq!(net.checked_add(commission).unwrap(), fare);
            }
        }
    }
}
