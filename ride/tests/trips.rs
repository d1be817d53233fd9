//! Trip lifecycle scenarios: transitions, authorization, no-show timing,
//! and chat gating.

mod support;

use common::api::error::ErrorKind;
use common::ids::{TripId, UserId};
use common::time::TimestampMs;
use common::trip::{CancelActor, TripStatus};
use ride::events::Room;
use store::db::{Db, DbTx};
use store::keys;
use store::kv::KvStore;
use support::{douala_request, Harness};

/// Run the dispatch flow up to MATCHED and return (passenger, driver,
/// trip id).
async fn matched_trip(h: &Harness) -> (UserId, UserId, TripId) {
    let passenger = h.seed_passenger().await;
    let driver = h.driver_online_nearby().await;
    let record = h
        .dispatcher
        .request_trip(passenger, douala_request())
        .await
        .unwrap();
    h.dispatcher.accept(driver, record.id).await.unwrap();
    h.sink.clear();
    (passenger, driver, record.id)
}

/// Rewrite the arrival stamp so no-show waits can be simulated without a
/// five-minute test.
async fn backdate_arrival(h: &Harness, trip_id: TripId, secs_ago: i64) {
    let mut tx = h.db.begin().await.unwrap();
    let mut row = tx.get_trip_for_update(trip_id).await.unwrap().unwrap();
    row.driver_arrived_at = Some(
        TimestampMs::from_i64(TimestampMs::now().as_i64() - secs_ago * 1000)
            .unwrap(),
    );
    tx.update_trip(&row).await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn full_lifecycle_happy_path() {
    let h = Harness::new();
    let (passenger, driver, trip_id) = matched_trip(&h).await;

    h.trips.driver_en_route(driver, trip_id).await.unwrap();
    h.trips.driver_arrived(driver, trip_id).await.unwrap();
    h.trips.start_trip(driver, trip_id).await.unwrap();
    let outcome = h
        .trips
        .complete_trip(driver, trip_id, None, None)
        .await
        .unwrap();
    assert!(!outcome.already_processed);

    let names = h.sink.names_for(&Room::Passenger(passenger));
    assert_eq!(
        names,
        vec![
            "trip:state_sync",
            "trip:driver_arrived",
            "trip:started",
            "trip:completed",
        ],
    );

    let row = h.db.trip(trip_id).await.unwrap();
    assert_eq!(row.status, TripStatus::Completed);
    assert!(row.driver_en_route_at.is_some());
    assert!(row.driver_arrived_at.is_some());
    assert!(row.trip_started_at.is_some());
    assert!(row.trip_completed_at.is_some());

    // Terminal cleanup: record and indexes gone, driver available again.
    assert!(!h.kv.exists(&keys::trip(&trip_id)).await.unwrap());
    assert!(!h
        .kv
        .exists(&keys::driver_active_trip(&driver))
        .await
        .unwrap());
    assert!(!h
        .kv
        .exists(&keys::passenger_active_trip(&passenger))
        .await
        .unwrap());
    assert!(h.presence.is_available(driver).await.unwrap());

    // Audit trail has every hop.
    let kinds: Vec<String> = h
        .db
        .trip_events_for(trip_id)
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    for expected in [
        "TRIP_MATCHED",
        "TRIP_EN_ROUTE",
        "TRIP_ARRIVED",
        "TRIP_STARTED",
        "TRIP_COMPLETED",
    ] {
        assert!(kinds.iter().any(|k| k == expected), "missing {expected}");
    }
}

#[tokio::test(start_paused = true)]
async fn matched_tolerates_skipping_en_route() {
    let h = Harness::new();
    let (_, driver, trip_id) = matched_trip(&h).await;
    h.trips.driver_arrived(driver, trip_id).await.unwrap();
    assert_eq!(
        h.db.trip(trip_id).await.unwrap().status,
        TripStatus::DriverArrived,
    );
}

#[tokio::test(start_paused = true)]
async fn start_requires_arrival_first() {
    let h = Harness::new();
    let (_, driver, trip_id) = matched_trip(&h).await;
    let err = h.trips.start_trip(driver, trip_id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
}

#[tokio::test(start_paused = true)]
async fn only_the_assigned_driver_may_transition() {
    let h = Harness::new();
    let (passenger, _driver, trip_id) = matched_trip(&h).await;
    let impostor = h.driver_online_at(4.06, 9.77).await;

    let err = h
        .trips
        .driver_en_route(impostor, trip_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Forbidden);
    assert_eq!(err.code_str(), "ACCESS_DENIED");

    // Passenger-issued transitions check the passenger id too.
    let err = h
        .trips
        .cancel_trip(impostor, CancelActor::Passenger, trip_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Forbidden);

    // The real passenger may cancel.
    h.trips
        .cancel_trip(passenger, CancelActor::Passenger, trip_id, None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn passenger_may_cancel_until_the_ride_starts() {
    let h = Harness::new();
    let (passenger, driver, trip_id) = matched_trip(&h).await;
    h.trips.driver_arrived(driver, trip_id).await.unwrap();

    // At the pickup, the passenger can still walk away.
    h.trips
        .cancel_trip(
            passenger,
            CancelActor::Passenger,
            trip_id,
            Some("found another ride".into()),
        )
        .await
        .unwrap();
    let row = h.db.trip(trip_id).await.unwrap();
    assert_eq!(row.status, TripStatus::Canceled);
    assert_eq!(row.canceled_by, Some(CancelActor::Passenger));

    // Both sides hear about it.
    assert!(h
        .sink
        .names_for(&Room::Passenger(passenger))
        .contains(&"trip:canceled"));
    assert!(h
        .sink
        .names_for(&Room::Driver(driver))
        .contains(&"trip:canceled"));
}

#[tokio::test(start_paused = true)]
async fn cancel_window_closes_for_everyone_at_start() {
    let h = Harness::new();
    let (passenger, driver, trip_id) = matched_trip(&h).await;
    h.trips.driver_arrived(driver, trip_id).await.unwrap();
    h.trips.start_trip(driver, trip_id).await.unwrap();

    let err = h
        .trips
        .cancel_trip(driver, CancelActor::Driver, trip_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);

    // An in-progress ride cannot be abandoned by the passenger either;
    // the only way out is completion (which settles the driver's fare).
    let err = h
        .trips
        .cancel_trip(
            passenger,
            CancelActor::Passenger,
            trip_id,
            Some("wrong direction".into()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    assert_eq!(
        h.db.trip(trip_id).await.unwrap().status,
        TripStatus::InProgress,
    );

    let outcome = h
        .trips
        .complete_trip(driver, trip_id, None, None)
        .await
        .unwrap();
    assert!(!outcome.already_processed);
    assert_eq!(h.db.receipts_for_trip(trip_id).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_trips_never_transition_again() {
    let h = Harness::new();
    let (passenger, driver, trip_id) = matched_trip(&h).await;
    h.trips.driver_arrived(driver, trip_id).await.unwrap();
    h.trips.start_trip(driver, trip_id).await.unwrap();
    h.trips
        .complete_trip(driver, trip_id, None, None)
        .await
        .unwrap();

    let err = h
        .trips
        .cancel_trip(passenger, CancelActor::Passenger, trip_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);

    let err = h.trips.start_trip(driver, trip_id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
}

#[tokio::test(start_paused = true)]
async fn no_show_requires_five_minutes_at_the_pickup() {
    let h = Harness::new();
    let (passenger, driver, trip_id) = matched_trip(&h).await;
    h.trips.driver_arrived(driver, trip_id).await.unwrap();

    backdate_arrival(&h, trip_id, 299).await;
    let err = h.trips.report_no_show(driver, trip_id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);

    backdate_arrival(&h, trip_id, 300).await;
    h.trips.report_no_show(driver, trip_id).await.unwrap();

    let row = h.db.trip(trip_id).await.unwrap();
    assert_eq!(row.status, TripStatus::NoShow);
    assert!(h
        .sink
        .names_for(&Room::Passenger(passenger))
        .contains(&"trip:no_show"));
    // No settlement for a no-show.
    assert!(h.db.receipts_for_trip(trip_id).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn chat_round_trip_and_gating() {
    let h = Harness::new();
    let (passenger, driver, trip_id) = matched_trip(&h).await;

    // Messages flow both ways while the trip is live.
    let sent = h
        .chat
        .send(passenger, trip_id, "  J'arrive, costume bleu  ")
        .await
        .unwrap();
    assert_eq!(sent.text, "J'arrive, costume bleu");
    assert!(h
        .sink
        .names_for(&Room::User(driver))
        .contains(&"chat:new_message"));

    h.chat.typing(driver, trip_id, true).await.unwrap();
    assert!(h
        .sink
        .names_for(&Room::User(passenger))
        .contains(&"chat:typing"));

    let marked = h.chat.mark_read(driver, trip_id).await.unwrap();
    assert_eq!(marked, 1);
    assert!(h
        .sink
        .names_for(&Room::User(passenger))
        .contains(&"chat:messages_read"));
    let stored = h.db.chat_messages_for(trip_id).await;
    assert!(stored[0].read_at.is_some());

    // Boundary: exactly 2000 chars fits, 2001 does not.
    let exactly = "x".repeat(2000);
    h.chat.send(driver, trip_id, &exactly).await.unwrap();
    let too_long = "x".repeat(2001);
    let err = h.chat.send(driver, trip_id, &too_long).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    let err = h.chat.send(driver, trip_id, "   ").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    // Outsiders are rejected.
    let outsider = h.seed_driver().await;
    let err = h.chat.send(outsider, trip_id, "hello").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Forbidden);

    // Chat closes once the trip finishes.
    h.trips.driver_arrived(driver, trip_id).await.unwrap();
    h.trips.start_trip(driver, trip_id).await.unwrap();
    h.trips
        .complete_trip(driver, trip_id, None, None)
        .await
        .unwrap();
    let err = h.chat.send(passenger, trip_id, "merci").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
}
