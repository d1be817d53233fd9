//! The canonical bidirectional socket events.
//!
//! Everything a client sends or receives is one [`WireEvent`], serialized as
//! `{"event": "<name>", "data": {...}}`. Variants without a payload omit
//! `data` entirely.

use serde::{Deserialize, Serialize};

use crate::api::models::{
    ChatMessagePayload, ChatMessagesReadPayload, ChatTypingPayload,
    DriverAssignedPayload, LocationUpdatePayload, MatchedPayload,
    OfferPayload, TripCanceledPayload, TripCompletedPayload, TripRequest,
    TripSnapshot, TripStartedPayload,
};
use crate::ids::TripId;
use crate::money::Xaf;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum WireEvent {
    // --- Driver -> server --- //
    #[serde(rename = "driver:online")]
    DriverOnline(DriverOnline),
    #[serde(rename = "driver:offline")]
    DriverOffline,
    #[serde(rename = "driver:location")]
    DriverLocation(DriverLocation),
    #[serde(rename = "trip:accept")]
    TripAccept(TripRef),
    #[serde(rename = "trip:decline")]
    TripDecline(TripRef),
    #[serde(rename = "driver:en_route")]
    DriverEnRoute(TripRef),
    #[serde(rename = "driver:arrived")]
    DriverArrived(TripRef),
    #[serde(rename = "trip:start")]
    TripStart(TripRef),
    #[serde(rename = "trip:complete")]
    TripComplete(TripComplete),
    #[serde(rename = "trip:report_no_show")]
    TripNoShowReport(TripRef),

    // --- Passenger -> server --- //
    #[serde(rename = "trip:request")]
    TripRequest(TripRequest),

    // --- Either direction --- //
    #[serde(rename = "trip:cancel")]
    TripCancel(TripCancel),
    #[serde(rename = "chat:send")]
    ChatSend(ChatSend),
    #[serde(rename = "chat:typing")]
    ChatTyping(ChatTypingPayload),
    #[serde(rename = "chat:mark_read")]
    ChatMarkRead(TripRef),

    // --- Server -> driver --- //
    #[serde(rename = "trip:new_request")]
    TripNewRequest(OfferPayload),
    #[serde(rename = "trip:matched")]
    TripMatched(MatchedPayload),
    #[serde(rename = "trip:request_expired")]
    TripRequestExpired(TripRef),

    // --- Server -> passenger --- //
    #[serde(rename = "trip:state_sync")]
    TripStateSync(TripSnapshot),
    #[serde(rename = "trip:driver_assigned")]
    TripDriverAssigned(DriverAssignedPayload),
    #[serde(rename = "trip:driver_arrived")]
    TripDriverArrived(TripRef),
    #[serde(rename = "driver:location_update")]
    DriverLocationUpdate(LocationUpdatePayload),
    #[serde(rename = "trip:started")]
    TripStarted(TripStartedPayload),
    #[serde(rename = "trip:completed")]
    TripCompleted(TripCompletedPayload),
    #[serde(rename = "trip:canceled")]
    TripCanceled(TripCanceledPayload),
    #[serde(rename = "trip:no_show")]
    TripNoShow(TripRef),
    #[serde(rename = "trip:no_drivers")]
    TripNoDrivers(TripRef),

    // --- Server -> either --- //
    #[serde(rename = "chat:new_message")]
    ChatNewMessage(ChatMessagePayload),
    #[serde(rename = "chat:messages_read")]
    ChatMessagesRead(ChatMessagesReadPayload),
}

impl WireEvent {
    /// The wire name, for logging and replay filtering.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DriverOnline(_) => "driver:online",
            Self::DriverOffline => "driver:offline",
            Self::DriverLocation(_) => "driver:location",
            Self::TripAccept(_) => "trip:accept",
            Self::TripDecline(_) => "trip:decline",
            Self::DriverEnRoute(_) => "driver:en_route",
            Self::DriverArrived(_) => "driver:arrived",
            Self::TripStart(_) => "trip:start",
            Self::TripComplete(_) => "trip:complete",
            Self::TripNoShowReport(_) => "trip:report_no_show",
            Self::TripRequest(_) => "trip:request",
            Self::TripCancel(_) => "trip:cancel",
            Self::ChatSend(_) => "chat:send",
            Self::ChatTyping(_) => "chat:typing",
            Self::ChatMarkRead(_) => "chat:mark_read",
            Self::TripNewRequest(_) => "trip:new_request",
            Self::TripMatched(_) => "trip:matched",
            Self::TripRequestExpired(_) => "trip:request_expired",
            Self::TripStateSync(_) => "trip:state_sync",
            Self::TripDriverAssigned(_) => "trip:driver_assigned",
            Self::TripDriverArrived(_) => "trip:driver_arrived",
            Self::DriverLocationUpdate(_) => "driver:location_update",
            Self::TripStarted(_) => "trip:started",
            Self::TripCompleted(_) => "trip:completed",
            Self::TripCanceled(_) => "trip:canceled",
            Self::TripNoShow(_) => "trip:no_show",
            Self::TripNoDrivers(_) => "trip:no_drivers",
            Self::ChatNewMessage(_) => "chat:new_message",
            Self::ChatMessagesRead(_) => "chat:messages_read",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverOnline {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// The minimal `{trip_id}` payload shared by many events.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRef {
    pub trip_id: TripId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripComplete {
    pub trip_id: TripId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_fare: Option<Xaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripCancel {
    pub trip_id: TripId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSend {
    pub trip_id: TripId,
    pub text: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_envelope_shape() {
        let event = WireEvent::TripAccept(TripRef {
            trip_id: TripId::generate(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "trip:accept");
        assert!(json["data"]["trip_id"].is_string());

        let back: WireEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unit_variant_has_no_data() {
        let json = serde_json::to_value(WireEvent::DriverOffline).unwrap();
        assert_eq!(json["event"], "driver:offline");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn name_matches_serialized_event() {
        let event = WireEvent::TripNoDrivers(TripRef {
            trip_id: TripId::generate(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
    }
}
