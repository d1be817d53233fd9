//! The key schema: every key the system writes, in one place.
//!
//! Key shapes are load-bearing: multiple worker processes coordinate purely
//! through these keys, so a drifted format is a split brain. Change a shape
//! here and nowhere else.

use common::ids::{TripId, UserId};

/// Geospatial index of driverId -> (lng, lat).
pub const DRIVERS_GEO: &str = "drivers:geo:locations";
/// Set of online driver ids.
pub const DRIVERS_ONLINE: &str = "drivers:online";
/// Set of online drivers currently accepting offers.
pub const DRIVERS_AVAILABLE: &str = "drivers:available";

/// JSON metadata blob for an online driver.
pub fn driver_metadata(id: &UserId) -> String {
    format!("driver:{id}:metadata")
}

/// Hash {lat, lng, heading, speed, accuracy, timestamp}.
pub fn driver_location(id: &UserId) -> String {
    format!("driver:location:{id}")
}

/// "1" while the driver is online.
pub fn driver_online_flag(id: &UserId) -> String {
    format!("driver:online:{id}")
}

/// JSON array of offers awaiting this driver's answer.
pub fn driver_pending_offers(id: &UserId) -> String {
    format!("driver:pending_offers:{id}")
}

/// The ephemeral trip record.
pub fn trip(id: &TripId) -> String {
    format!("trip:{id}")
}

/// The acceptance lock; holds the winner's nonce.
pub fn trip_lock(id: &TripId) -> String {
    format!("trip:lock:{id}")
}

/// Armed for the duration of one offer wave.
pub fn trip_timeout(id: &TripId) -> String {
    format!("trip:timeout:{id}")
}

/// Set while an acceptance's slow path (database write) is in flight.
pub fn trip_accepting(id: &TripId) -> String {
    format!("trip:accepting:{id}")
}

/// Inhibits timeout-driven wave expansion during an acceptance.
pub fn trip_no_expire(id: &TripId) -> String {
    format!("trip:no_expire:{id}")
}

/// JSON {drivers: [...]} of every driver notified for this trip.
pub fn trip_offers(id: &TripId) -> String {
    format!("trip:offers:{id}")
}

/// Set of drivers who declined this trip.
pub fn trip_declined(id: &TripId) -> String {
    format!("trip:declined:{id}")
}

/// Reverse index: the passenger's one active trip id.
pub fn passenger_active_trip(id: &UserId) -> String {
    format!("passenger:active_trip:{id}")
}

/// Reverse index: the driver's one active trip id.
pub fn driver_active_trip(id: &UserId) -> String {
    format!("driver:active_trip:{id}")
}

/// The user's current socket connection handle.
pub fn user_socket(id: &UserId) -> String {
    format!("user:socket:{id}")
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn key_shapes() {
        let trip_id =
            TripId::from_str("6b5e0d55-9357-4a71-9cf9-2d3f66a0a60e").unwrap();
        let user_id =
            UserId::from_str("8f4e9b7e-0f25-4e0c-97b2-9d8c8f6a4f11").unwrap();

        assert_eq!(
            trip_lock(&trip_id),
            "trip:lock:6b5e0d55-9357-4a71-9cf9-2d3f66a0a60e"
        );
        assert_eq!(
            driver_metadata(&user_id),
            "driver:8f4e9b7e-0f25-4e0c-97b2-9d8c8f6a4f11:metadata"
        );
        assert_eq!(
            driver_location(&user_id),
            "driver:location:8f4e9b7e-0f25-4e0c-97b2-9d8c8f6a4f11"
        );
        assert_eq!(
            passenger_active_trip(&user_id),
            "passenger:active_trip:8f4e9b7e-0f25-4e0c-97b2-9d8c8f6a4f11"
        );
    }
}
