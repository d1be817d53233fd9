//! The fare-estimate parity function.
//!
//! Kept bit-identical with the external fare estimator:
//! `fare = max(base + km * per_km + min * per_min, min_fare) * surge`,
//! rounded to a whole franc. The dispatch core never estimates fares itself
//! (the client submits the estimate with the trip request); this function
//! exists so receipts and audits can be cross-checked against the same
//! arithmetic the estimator used.

use anyhow::Context;
use common::money::Xaf;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// The active pricing row for a (city, vehicle type) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceRule {
    pub base_fare: Xaf,
    pub per_km: Xaf,
    pub per_min: Xaf,
    pub min_fare: Xaf,
    pub surge_mult: Decimal,
}

/// Estimate a fare in whole XAF.
pub fn estimate(
    rule: &PriceRule,
    distance_km: f64,
    duration_min: f64,
) -> anyhow::Result<Xaf> {
    anyhow::ensure!(
        distance_km.is_finite() && distance_km >= 0.0,
        "distance must be non-negative",
    );
    anyhow::ensure!(
        duration_min.is_finite() && duration_min >= 0.0,
        "duration must be non-negative",
    );
    let km = Decimal::from_f64(distance_km).context("distance not decimal")?;
    let minutes =
        Decimal::from_f64(duration_min).context("duration not decimal")?;

    let metered = Decimal::from(rule.base_fare.as_i64())
        + km * Decimal::from(rule.per_km.as_i64())
        + minutes * Decimal::from(rule.per_min.as_i64());
    let floored = metered.max(Decimal::from(rule.min_fare.as_i64()));
    let surged = floored
        .checked_mul(rule.surge_mult)
        .context("fare overflow")?;
    surged
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .map(Xaf::new)
        .context("fare does not fit in i64")
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use super::*;

    fn douala_economy() -> PriceRule {
        PriceRule {
            base_fare: Xaf::new(500),
            per_km: Xaf::new(250),
            per_min: Xaf::new(50),
            min_fare: Xaf::new(1000),
            surge_mult: dec!(1.00),
        }
    }

    #[test]
    fn metered_fare() {
        // 500 + 4km * 250 + 10min * 50 = 2000
        let fare = estimate(&douala_economy(), 4.0, 10.0).unwrap();
        assert_eq!(fare, Xaf::new(2000));
    }

    #[test]
    fn min_fare_floor_applies_before_surge() {
        let mut rule = douala_economy();
        rule.surge_mult = dec!(1.50);
        // Metered = 500 + 250 + 50 = 800 < min 1000; 1000 * 1.5 = 1500.
        let fare = estimate(&rule, 1.0, 1.0).unwrap();
        assert_eq!(fare, Xaf::new(1500));
    }

    #[test]
    fn rejects_negative_inputs() {
        assert!(estimate(&douala_economy(), -1.0, 5.0).is_err());
        assert!(estimate(&douala_economy(), 1.0, f64::NAN).is_err());
    }

    proptest! {
        #[test]
        fn never_below_surged_min_fare(
            km in 0.0f64..100.0,
            minutes in 0.0f64..240.0,
        ) {
            let rule = douala_economy();
            let fare = estimate(&rule, km, minutes).unwrap();
            prop_assert!(fare >= rule.min_fare);
        }

        #[test]
        fn monotonic_in_distance(
            km in 0.0f64..100.0,
            extra in 0.1f64..50.0,
        ) {
            let rule = douala_economy();
            let near = estimate(&rule, km, 10.0).unwrap();
            let far = estimate(&rule, km + extra, 10.0).unwrap();
            prop_assert!(far >= near);
        }

        #[test]
        fn surge_scales_up(km in 0.0f64..100.0) {
            let base_rule = douala_economy();
            let mut surged_rule = douala_economy();
            surged_rule.surge_mult = dec!(2.00);
            let base = estimate(&base_rule, km, 10.0).unwrap();
            let surged = estimate(&surged_rule, km, 10.0).unwrap();
            prop_assert_eq!(surged, Xaf::new(base.as_i64() * 2));
        }
    }
}
