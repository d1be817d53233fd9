//! The event fan-out seam.
//!
//! The domain core addresses rooms and emits [`WireEvent`]s; the socket
//! gateway is the production [`EventSink`]. Emission is fire-and-forget by
//! design: delivery problems are the gateway's to log, and must never fail
//! a state transition that already committed.

use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};

use common::api::events::WireEvent;
use common::ids::{TripId, UserId};

/// An addressable destination for one event.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Room {
    /// Any connected session of this user.
    User(UserId),
    /// The user's driver-role room.
    Driver(UserId),
    /// The user's passenger-role room.
    Passenger(UserId),
    /// Everyone following this trip.
    Trip(TripId),
}

impl Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Driver(id) => write!(f, "driver:{id}"),
            Self::Passenger(id) => write!(f, "passenger:{id}"),
            Self::Trip(id) => write!(f, "trip:{id}"),
        }
    }
}

pub trait EventSink: Clone + Send + Sync + 'static {
    fn emit(&self, room: Room, event: WireEvent);
}

/// An [`EventSink`] that records everything, for tests.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<(Room, WireEvent)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Room, WireEvent)> {
        self.events.lock().expect("RecordingSink poisoned").clone()
    }

    pub fn events_for(&self, room: &Room) -> Vec<WireEvent> {
        self.events()
            .into_iter()
            .filter(|(to, _)| to == room)
            .map(|(_, event)| event)
            .collect()
    }

    /// Names of events sent to `room`, in emission order.
    pub fn names_for(&self, room: &Room) -> Vec<&'static str> {
        self.events_for(room)
            .iter()
            .map(WireEvent::name)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("RecordingSink poisoned").clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, room: Room, event: WireEvent) {
        self.events
            .lock()
            .expect("RecordingSink poisoned")
            .push((room, event));
    }
}
