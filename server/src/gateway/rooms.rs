//! The per-process room registry and the gateway's [`EventSink`].
//!
//! Rooms are in-process: each worker delivers to its own sockets, and
//! cross-process addressing rides on the `user:socket:<id>` index plus the
//! fact that domain events are emitted by whichever worker performed the
//! operation. Delivery is fire-and-forget; a full or closed connection
//! just drops the event (the client replays on reconnect).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use common::api::events::WireEvent;
use ride::events::{EventSink, Room};
use tokio::sync::mpsc;
use tracing::trace;

/// A connection handle id, unique within this process.
pub type ConnId = u64;

#[derive(Default)]
struct RoomsInner {
    members: HashMap<Room, HashSet<ConnId>>,
    senders: HashMap<ConnId, mpsc::UnboundedSender<WireEvent>>,
}

#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<Mutex<RoomsInner>>,
    next_id: Arc<AtomicU64>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue and hand back its id.
    pub fn register(
        &self,
        sender: mpsc::UnboundedSender<WireEvent>,
    ) -> ConnId {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().senders.insert(conn_id, sender);
        conn_id
    }

    pub fn join(&self, conn_id: ConnId, room: Room) {
        trace!(%room, conn_id, "join");
        self.lock().members.entry(room).or_default().insert(conn_id);
    }

    /// Remove the connection from every room and drop its queue.
    pub fn disconnect(&self, conn_id: ConnId) {
        let mut inner = self.lock();
        inner.senders.remove(&conn_id);
        inner.members.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    /// Deliver directly to one connection (replay, error replies).
    pub fn send_to(&self, conn_id: ConnId, event: WireEvent) {
        let inner = self.lock();
        if let Some(sender) = inner.senders.get(&conn_id) {
            let _ = sender.send(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoomsInner> {
        self.inner.lock().expect("Rooms lock poisoned")
    }
}

/// The production [`EventSink`]: deliver to every member of the room.
#[derive(Clone)]
pub struct GatewaySink {
    rooms: Rooms,
}

impl GatewaySink {
    pub fn new(rooms: Rooms) -> Self {
        Self { rooms }
    }
}

impl EventSink for GatewaySink {
    fn emit(&self, room: Room, event: WireEvent) {
        let inner = self.rooms.lock();
        let Some(members) = inner.members.get(&room) else {
            trace!(%room, event = event.name(), "emit to empty room");
            return;
        };
        for conn_id in members {
            if let Some(sender) = inner.senders.get(conn_id) {
                // A closed receiver means the connection is tearing down.
                let _ = sender.send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use common::api::events::{TripRef, WireEvent};
    use common::ids::{TripId, UserId};

    use super::*;

    fn event() -> WireEvent {
        WireEvent::TripRequestExpired(TripRef {
            trip_id: TripId::generate(),
        })
    }

    #[tokio::test]
    async fn emit_reaches_every_room_member_once() {
        let rooms = Rooms::new();
        let sink = GatewaySink::new(rooms.clone());
        let user = UserId::generate();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let c1 = rooms.register(tx1);
        let c2 = rooms.register(tx2);
        rooms.join(c1, Room::Driver(user));
        rooms.join(c2, Room::Driver(user));

        sink.emit(Room::Driver(user), event());
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_membership() {
        let rooms = Rooms::new();
        let sink = GatewaySink::new(rooms.clone());
        let user = UserId::generate();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = rooms.register(tx);
        rooms.join(conn, Room::User(user));
        rooms.disconnect(conn);

        sink.emit(Room::User(user), event());
        assert!(rx.try_recv().is_err());
    }
}
