//! Validated coordinates and great-circle distance.

use std::fmt;

use anyhow::ensure;
use serde::{de, Deserialize, Deserializer, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated WGS84 coordinate: `lat` in [-90, 90], `lng` in [-180, 180],
/// both inclusive.
#[derive(Copy, Clone, PartialEq, Serialize)]
pub struct Coord {
    lat: f64,
    lng: f64,
}

impl Coord {
    pub fn new(lat: f64, lng: f64) -> anyhow::Result<Self> {
        ensure!(
            lat.is_finite() && (-90.0..=90.0).contains(&lat),
            "latitude {lat} out of range [-90, 90]",
        );
        ensure!(
            lng.is_finite() && (-180.0..=180.0).contains(&lng),
            "longitude {lng} out of range [-180, 180]",
        );
        Ok(Self { lat, lng })
    }

    pub const fn lat(&self) -> f64 {
        self.lat
    }

    pub const fn lng(&self) -> f64 {
        self.lng
    }

    /// Haversine great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coord) -> f64 {
        let (lat1, lng1) = (self.lat.to_radians(), self.lng.to_radians());
        let (lat2, lng2) = (other.lat.to_radians(), other.lng.to_radians());
        let dlat = lat2 - lat1;
        let dlng = lng2 - lng1;
        let sin_dlat = (dlat * 0.5).sin();
        let sin_dlng = (dlng * 0.5).sin();
        let h = sin_dlat * sin_dlat
            + lat1.cos() * lat2.cos() * sin_dlng * sin_dlng;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        EARTH_RADIUS_KM * c
    }
}

impl fmt::Debug for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.lat, self.lng)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Deserialization revalidates the bounds, so a [`Coord`] read back from the
/// store or the wire upholds the same invariant as a constructed one.
impl<'de> Deserialize<'de> for Coord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            lat: f64,
            lng: f64,
        }
        let raw = Raw::deserialize(deserializer)?;
        Coord::new(raw.lat, raw.lng).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boundary_coordinates() {
        assert!(Coord::new(90.0, 180.0).is_ok());
        assert!(Coord::new(-90.0, -180.0).is_ok());
        assert!(Coord::new(90.0001, 0.0).is_err());
        assert!(Coord::new(-90.0001, 0.0).is_err());
        assert!(Coord::new(0.0, 180.0001).is_err());
        assert!(Coord::new(0.0, -180.0001).is_err());
        assert!(Coord::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn distance_douala_short_hop() {
        // ~100m apart in central Douala.
        let a = Coord::new(4.0511, 9.7679).unwrap();
        let b = Coord::new(4.0519, 9.7682).unwrap();
        let km = a.distance_km(&b);
        assert!(km > 0.05 && km < 0.15, "got {km}");
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = Coord::new(4.05, 9.76).unwrap();
        let b = Coord::new(4.10, 9.80).unwrap();
        assert!((a.distance_km(&b) - b.distance_km(&a)).abs() < 1e-9);
        assert!(a.distance_km(&a) < 1e-9);
    }

    #[test]
    fn deserialize_revalidates() {
        let ok: Result<Coord, _> =
            serde_json::from_str(r#"{"lat": 4.05, "lng": 9.76}"#);
        assert!(ok.is_ok());
        let bad: Result<Coord, _> =
            serde_json::from_str(r#"{"lat": 91.0, "lng": 9.76}"#);
        assert!(bad.is_err());
    }

    mod properties {
        use proptest::prelude::*;

        use crate::test_utils::any_coord;

        proptest! {
            #[test]
            fn distance_symmetric_and_non_negative(
                a in any_coord(),
                b in any_coord(),
            ) {
                let ab = a.distance_km(&b);
                let ba = b.distance_km(&a);
                prop_assert!(ab >= 0.0);
                prop_assert!((ab - ba).abs() < 1e-9);
            }

            #[test]
            fn json_roundtrip_preserves_coordinates(a in any_coord()) {
                let json = serde_json::to_string(&a).unwrap();
                let back: super::Coord =
                    serde_json::from_str(&json).unwrap();
                prop_assert!((a.lat() - back.lat()).abs() < 1e-12);
                prop_assert!((a.lng() - back.lng()).abs() < 1e-12);
            }
        }
    }
}
