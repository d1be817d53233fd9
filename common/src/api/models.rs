//! Payload structs for requests, offers, and fan-out events.

use serde::{Deserialize, Serialize};

use crate::geo::Coord;
use crate::ids::{MessageId, TripId, UserId};
use crate::money::Xaf;
use crate::time::TimestampMs;
use crate::trip::{CancelActor, PaymentMethod, Place, TripStatus};
use crate::user::{DriverInfo, PassengerInfo};

/// A passenger's trip request, exactly as submitted over the socket.
/// Distance and duration come from the client's route preview (the external
/// map provider); the dispatch core treats them as opaque trip attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripRequest {
    pub pickup: Place,
    pub dropoff: Place,
    pub distance_m: u32,
    pub duration_s: u32,
    pub payment_method: PaymentMethod,
    pub fare_estimate: Xaf,
}

/// The offer pushed to each candidate driver in a wave.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub trip_id: TripId,
    pub pickup: Place,
    pub dropoff: Place,
    pub distance_m: u32,
    pub duration_s: u32,
    pub payment_method: PaymentMethod,
    pub fare_estimate: Xaf,
    pub passenger: PassengerInfo,
    /// Distance from the driver's last known location to the pickup.
    pub pickup_distance_km: f64,
    pub expires_at: TimestampMs,
}

/// Sent to the passenger when a driver wins the acceptance race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverAssignedPayload {
    pub trip_id: TripId,
    pub driver: DriverInfo,
    /// The driver's location at the moment of the match.
    pub driver_location: Coord,
    pub matched_at: TimestampMs,
}

/// Sent to the winning driver with the full passenger context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchedPayload {
    pub trip_id: TripId,
    pub passenger: PassengerInfo,
    pub pickup: Place,
    pub dropoff: Place,
    pub payment_method: PaymentMethod,
    pub fare_estimate: Xaf,
    pub matched_at: TimestampMs,
}

/// The full trip view re-emitted on reconnect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripSnapshot {
    pub trip_id: TripId,
    pub status: TripStatus,
    pub passenger_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<UserId>,
    pub pickup: Place,
    pub dropoff: Place,
    pub payment_method: PaymentMethod,
    pub fare_estimate: Xaf,
    pub requested_at: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<TimestampMs>,
}

/// A live driver position pushed to the passenger during an active trip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdatePayload {
    pub trip_id: TripId,
    pub driver_id: UserId,
    pub location: Coord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripStartedPayload {
    pub trip_id: TripId,
    pub started_at: TimestampMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripCompletedPayload {
    pub trip_id: TripId,
    pub fare_final: Xaf,
    pub completed_at: TimestampMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripCanceledPayload {
    pub trip_id: TripId,
    pub canceled_by: CancelActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message_id: MessageId,
    pub trip_id: TripId,
    pub from_user_id: UserId,
    pub text: String,
    pub sent_at: TimestampMs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTypingPayload {
    pub trip_id: TripId,
    pub user_id: UserId,
    pub typing: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagesReadPayload {
    pub trip_id: TripId,
    pub reader_id: UserId,
    pub read_at: TimestampMs,
}
