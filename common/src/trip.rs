//! Trip status, payment methods, audit event types, and the ephemeral trip
//! record mirrored in the key-value store.

use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::geo::Coord;
use crate::ids::{TripId, UserId};
use crate::money::Xaf;
use crate::time::TimestampMs;

/// The authoritative trip lifecycle states.
///
/// `Searching` trips live only in the key-value store; from `Matched` onward
/// a durable row exists and the ephemeral record mirrors it. The four
/// terminal states never transition again.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum TripStatus {
    Draft,
    Searching,
    Matched,
    DriverAssigned,
    DriverEnRoute,
    DriverArrived,
    InProgress,
    Completed,
    Canceled,
    NoShow,
    NoDrivers,
}

impl TripStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Searching => "SEARCHING",
            Self::Matched => "MATCHED",
            Self::DriverAssigned => "DRIVER_ASSIGNED",
            Self::DriverEnRoute => "DRIVER_EN_ROUTE",
            Self::DriverArrived => "DRIVER_ARRIVED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
            Self::NoShow => "NO_SHOW",
            Self::NoDrivers => "NO_DRIVERS",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::NoShow | Self::NoDrivers
        )
    }

    /// Chat is permitted only while the trip is matched but unfinished.
    pub const fn allows_chat(self) -> bool {
        matches!(
            self,
            Self::Matched
                | Self::DriverEnRoute
                | Self::DriverArrived
                | Self::InProgress
        )
    }
}

impl Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "SEARCHING" => Ok(Self::Searching),
            "MATCHED" => Ok(Self::Matched),
            "DRIVER_ASSIGNED" => Ok(Self::DriverAssigned),
            "DRIVER_EN_ROUTE" => Ok(Self::DriverEnRoute),
            "DRIVER_ARRIVED" => Ok(Self::DriverArrived),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELED" => Ok(Self::Canceled),
            "NO_SHOW" => Ok(Self::NoShow),
            "NO_DRIVERS" => Ok(Self::NoDrivers),
            _ => Err(anyhow!("unknown trip status: {s}")),
        }
    }
}

/// How the passenger pays: cash, MTN Mobile Money, or Orange Money.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum PaymentMethod {
    Cash,
    Momo,
    Om,
}

impl PaymentMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Momo => "MOMO",
            Self::Om => "OM",
        }
    }
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CASH" => Ok(Self::Cash),
            "MOMO" => Ok(Self::Momo),
            "OM" => Ok(Self::Om),
            _ => Err(anyhow!("unknown payment method: {s}")),
        }
    }
}

/// Who canceled a trip.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum CancelActor {
    Passenger,
    Driver,
    System,
}

impl CancelActor {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passenger => "PASSENGER",
            Self::Driver => "DRIVER",
            Self::System => "SYSTEM",
        }
    }
}

impl Display for CancelActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelActor {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASSENGER" => Ok(Self::Passenger),
            "DRIVER" => Ok(Self::Driver),
            "SYSTEM" => Ok(Self::System),
            _ => Err(anyhow!("unknown cancel actor: {s}")),
        }
    }
}

/// Audit event types appended on every state transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum TripEventType {
    Requested,
    Matched,
    EnRoute,
    Arrived,
    Started,
    Completed,
    Canceled,
    NoShow,
    NoDrivers,
    Settled,
}

impl TripEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "TRIP_REQUESTED",
            Self::Matched => "TRIP_MATCHED",
            Self::EnRoute => "TRIP_EN_ROUTE",
            Self::Arrived => "TRIP_ARRIVED",
            Self::Started => "TRIP_STARTED",
            Self::Completed => "TRIP_COMPLETED",
            Self::Canceled => "TRIP_CANCELED",
            Self::NoShow => "TRIP_NO_SHOW",
            Self::NoDrivers => "TRIP_NO_DRIVERS",
            Self::Settled => "TRIP_SETTLED",
        }
    }
}

impl Display for TripEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripEventType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIP_REQUESTED" => Ok(Self::Requested),
            "TRIP_MATCHED" => Ok(Self::Matched),
            "TRIP_EN_ROUTE" => Ok(Self::EnRoute),
            "TRIP_ARRIVED" => Ok(Self::Arrived),
            "TRIP_STARTED" => Ok(Self::Started),
            "TRIP_COMPLETED" => Ok(Self::Completed),
            "TRIP_CANCELED" => Ok(Self::Canceled),
            "TRIP_NO_SHOW" => Ok(Self::NoShow),
            "TRIP_NO_DRIVERS" => Ok(Self::NoDrivers),
            "TRIP_SETTLED" => Ok(Self::Settled),
            _ => Err(anyhow!("unknown trip event type: {s}")),
        }
    }
}

/// A pickup or dropoff point: a validated coordinate plus the display
/// address the client resolved it to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Place {
    #[serde(flatten)]
    pub coord: Coord,
    pub address: String,
}

/// The ephemeral trip object stored under `trip:<id>` while a trip is in
/// pre-match phases and, once matched, as a mirror of the durable row.
///
/// `radius_km` and `wave` track the offer loop's current search state so a
/// competing worker process can resume expansion where the last one stopped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub id: TripId,
    pub passenger_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<UserId>,
    pub status: TripStatus,
    pub pickup: Place,
    pub dropoff: Place,
    pub distance_m: u32,
    pub duration_s: u32,
    pub payment_method: PaymentMethod,
    pub fare_estimate: Xaf,
    pub requested_at: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<TimestampMs>,
    pub radius_km: f64,
    pub wave: u32,
}

impl TripRecord {
    /// The client-facing view of this record, re-emitted on reconnect.
    pub fn snapshot(&self) -> crate::api::models::TripSnapshot {
        crate::api::models::TripSnapshot {
            trip_id: self.id,
            status: self.status,
            passenger_id: self.passenger_id,
            driver_id: self.driver_id,
            pickup: self.pickup.clone(),
            dropoff: self.dropoff.clone(),
            payment_method: self.payment_method,
            fare_estimate: self.fare_estimate,
            requested_at: self.requested_at,
            matched_at: self.matched_at,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            TripStatus::Draft,
            TripStatus::Searching,
            TripStatus::Matched,
            TripStatus::DriverAssigned,
            TripStatus::DriverEnRoute,
            TripStatus::DriverArrived,
            TripStatus::InProgress,
            TripStatus::Completed,
            TripStatus::Canceled,
            TripStatus::NoShow,
            TripStatus::NoDrivers,
        ] {
            assert_eq!(
                TripStatus::from_str(status.as_str()).unwrap(),
                status
            );
        }
    }

    #[test]
    fn terminal_states_match_spec() {
        use TripStatus::*;
        let terminal = [Completed, Canceled, NoShow, NoDrivers];
        for status in terminal {
            assert!(status.is_terminal());
            assert!(!status.allows_chat());
        }
        assert!(!Searching.is_terminal());
        assert!(Matched.allows_chat());
        assert!(InProgress.allows_chat());
        assert!(!Searching.allows_chat());
    }

    #[test]
    fn trip_record_json_shape() {
        let record = TripRecord {
            id: TripId::generate(),
            passenger_id: UserId::generate(),
            driver_id: None,
            status: TripStatus::Searching,
            pickup: Place {
                coord: Coord::new(4.0511, 9.7679).unwrap(),
                address: "Rue Joffre, Douala".to_string(),
            },
            dropoff: Place {
                coord: Coord::new(4.0601, 9.7700).unwrap(),
                address: "Bonanjo".to_string(),
            },
            distance_m: 1500,
            duration_s: 420,
            payment_method: PaymentMethod::Cash,
            fare_estimate: Xaf::new(2500),
            requested_at: TimestampMs::now(),
            matched_at: None,
            radius_km: 5.0,
            wave: 1,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "SEARCHING");
        assert_eq!(json["payment_method"], "CASH");
        assert_eq!(json["pickup"]["lat"], 4.0511);
        assert!(json.get("driver_id").is_none());

        let back: TripRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
