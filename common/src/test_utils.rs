//! Proptest strategies and roundtrip helpers shared across workspace tests.
//!
//! Gate: compiled under `cfg(test)` or the `test-utils` feature only.

use proptest::arbitrary::{any, Arbitrary};
use proptest::strategy::Strategy;
use proptest::{prop_assert_eq, proptest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::geo::Coord;
use crate::money::Xaf;
use crate::time::TimestampMs;

/// Any valid coordinate, including the poles and the antimeridian.
pub fn any_coord() -> impl Strategy<Value = Coord> {
    (-90.0f64..=90.0, -180.0f64..=180.0)
        .prop_map(|(lat, lng)| Coord::new(lat, lng).unwrap())
}

/// Any fare-sized amount (non-negative, below 10M XAF).
pub fn any_fare() -> impl Strategy<Value = Xaf> {
    (0i64..10_000_000).prop_map(Xaf::new)
}

/// Any signed ledger amount.
pub fn any_amount() -> impl Strategy<Value = Xaf> {
    (-10_000_000i64..10_000_000).prop_map(Xaf::new)
}

pub fn any_uuid() -> impl Strategy<Value = Uuid> {
    any::<[u8; 16]>().prop_map(Uuid::from_bytes)
}

pub fn any_timestamp() -> impl Strategy<Value = TimestampMs> {
    // Up to ~year 5138.
    (0i64..100_000_000_000_000)
        .prop_map(|ms| TimestampMs::from_i64(ms).unwrap())
}

/// Verify that `T` roundtrips through its [`serde_json::Value`]
/// representation. Comparing `Value`s keeps the check field-order-invariant.
pub fn json_value_roundtrip_proptest<T>()
where
    T: Arbitrary + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned,
{
    proptest!(|(value1: T)| {
        let json1 = serde_json::to_value(&value1).unwrap();
        let value2 = serde_json::from_value::<T>(json1.clone()).unwrap();
        let json2 = serde_json::to_value(&value2).unwrap();
        prop_assert_eq!(&value1, &value2);
        prop_assert_eq!(&json1, &json2);
    });
}
