//! One authenticated socket session.
//!
//! Room joins happen before the `user:socket:<id>` index write: inverting
//! that order opens a window in which a fan-out addressed to a
//! just-connected user would miss them. Inbound events are handled one at
//! a time per connection, so a driver cannot double-accept by firing two
//! events down the same socket; cross-connection races are arbitrated
//! solely by the trip lock.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use common::api::error::{ApiError, ApiResult, ErrorResponse};
use common::api::events::WireEvent;
use common::constants;
use common::ids::{TripId, UserId};
use common::trip::{CancelActor, TripStatus};
use common::user::UserRole;
use futures::{SinkExt, StreamExt};
use ride::events::Room;
use store::db::{Db, DbTx};
use store::keys;
use store::kv::{KvStore, KvStoreExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::auth::SessionIdentity;
use crate::context::AppContext;
use crate::gateway::rooms::ConnId;

#[instrument(skip(ctx, socket), fields(user_id = %identity.user_id, role = %identity.role))]
pub async fn handle(
    ctx: Arc<AppContext>,
    socket: WebSocket,
    identity: SessionIdentity,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let conn_id = ctx.rooms.register(event_tx);

    // Rooms first, socket index second.
    ctx.rooms.join(conn_id, Room::User(identity.user_id));
    match identity.role {
        UserRole::Driver =>
            ctx.rooms.join(conn_id, Room::Driver(identity.user_id)),
        _ => ctx.rooms.join(conn_id, Room::Passenger(identity.user_id)),
    }
    if let Err(err) = ctx
        .kv
        .put_string(
            &keys::user_socket(&identity.user_id),
            &conn_id.to_string(),
            Some(constants::SOCKET_INDEX_TTL),
        )
        .await
    {
        warn!("socket index write failed: {err:#}");
    }

    // Reconnect replay is non-critical; clients handle it idempotently.
    if let Err(err) = replay(&ctx, conn_id, identity).await {
        warn!("reconnect replay failed: {err:#}");
    }
    info!(conn_id, "session open");

    loop {
        tokio::select! {
            outbound = event_rx.recv() => {
                let Some(event) = outbound else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("event serialization failed: {err:#}");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        // Await here is what serializes handlers per
                        // connection.
                        if let Err(api_err) =
                            handle_frame(&ctx, conn_id, identity, &raw).await
                        {
                            let frame = serde_json::json!({
                                "event": "error",
                                "data": ErrorResponse::from(api_err),
                            });
                            if ws_tx
                                .send(Message::Text(frame.to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => (), // ping/pong/binary: nothing to do
                    Some(Err(err)) => {
                        debug!("socket error: {err}");
                        break;
                    }
                }
            }
        }
    }

    // A disconnect never cancels a trip; it only tears the session down.
    ctx.rooms.disconnect(conn_id);
    match ctx
        .kv
        .del_if_equals(
            &keys::user_socket(&identity.user_id),
            &conn_id.to_string(),
        )
        .await
    {
        // A newer connection may have already replaced the index.
        Ok(_) => (),
        Err(err) => warn!("socket index cleanup failed: {err:#}"),
    }
    info!(conn_id, "session closed");
}

async fn handle_frame(
    ctx: &AppContext,
    conn_id: ConnId,
    identity: SessionIdentity,
    raw: &str,
) -> ApiResult<()> {
    let event: WireEvent = serde_json::from_str(raw).map_err(|err| {
        ApiError::validation(format!("unparseable event: {err}"))
    })?;
    debug!(event = event.name(), "inbound");
    dispatch_event(ctx, conn_id, identity, event).await
}

async fn dispatch_event(
    ctx: &AppContext,
    conn_id: ConnId,
    identity: SessionIdentity,
    event: WireEvent,
) -> ApiResult<()> {
    let user_id = identity.user_id;
    match event {
        // --- Presence --- //
        WireEvent::DriverOnline(p) => {
            require_role(identity, UserRole::Driver)?;
            ctx.presence
                .go_online(user_id, p.lat, p.lng, p.heading)
                .await
        }
        WireEvent::DriverOffline => {
            require_role(identity, UserRole::Driver)?;
            ctx.presence.go_offline(user_id).await
        }
        WireEvent::DriverLocation(p) => {
            require_role(identity, UserRole::Driver)?;
            ctx.presence.update_location(user_id, p).await
        }

        // --- Dispatch --- //
        WireEvent::TripRequest(request) => {
            require_role(identity, UserRole::Passenger)?;
            let record =
                ctx.dispatcher.request_trip(user_id, request).await?;
            ctx.rooms.join(conn_id, Room::Trip(record.id));
            ctx.rooms.send_to(
                conn_id,
                WireEvent::TripStateSync(record.snapshot()),
            );

            let dispatcher = ctx.dispatcher.clone();
            let trip_id = record.id;
            let _offer_loop = common::task::NamedTask::spawn(
                format!("offer-loop-{trip_id}"),
                async move { dispatcher.run_offer_loop(trip_id).await },
            );
            Ok(())
        }
        WireEvent::TripAccept(r) => {
            require_role(identity, UserRole::Driver)?;
            ctx.dispatcher.accept(user_id, r.trip_id).await?;
            ctx.rooms.join(conn_id, Room::Trip(r.trip_id));
            Ok(())
        }
        WireEvent::TripDecline(r) => {
            require_role(identity, UserRole::Driver)?;
            ctx.dispatcher.decline(user_id, r.trip_id).await
        }

        // --- Trip state machine --- //
        WireEvent::DriverEnRoute(r) => {
            require_role(identity, UserRole::Driver)?;
            ctx.trips.driver_en_route(user_id, r.trip_id).await
        }
        WireEvent::DriverArrived(r) => {
            require_role(identity, UserRole::Driver)?;
            ctx.trips.driver_arrived(user_id, r.trip_id).await
        }
        WireEvent::TripStart(r) => {
            require_role(identity, UserRole::Driver)?;
            ctx.trips.start_trip(user_id, r.trip_id).await
        }
        WireEvent::TripComplete(c) => {
            require_role(identity, UserRole::Driver)?;
            ctx.trips
                .complete_trip(user_id, c.trip_id, c.final_fare, c.notes)
                .await?;
            Ok(())
        }
        WireEvent::TripNoShowReport(r) => {
            require_role(identity, UserRole::Driver)?;
            ctx.trips.report_no_show(user_id, r.trip_id).await
        }
        WireEvent::TripCancel(c) => {
            // A still-searching trip is canceled in the dispatcher; a
            // matched one through the state machine.
            let searching = matches!(
                ctx.trips.record_of(c.trip_id).await,
                Some(record) if record.status == TripStatus::Searching
            );
            if searching && identity.role == UserRole::Passenger {
                ctx.dispatcher
                    .cancel_searching(user_id, c.trip_id, c.reason)
                    .await
            } else {
                let actor = match identity.role {
                    UserRole::Driver => CancelActor::Driver,
                    _ => CancelActor::Passenger,
                };
                ctx.trips
                    .cancel_trip(user_id, actor, c.trip_id, c.reason)
                    .await
            }
        }

        // --- Chat --- //
        WireEvent::ChatSend(c) => {
            ctx.chat.send(user_id, c.trip_id, &c.text).await?;
            Ok(())
        }
        WireEvent::ChatTyping(p) => {
            ctx.chat.typing(user_id, p.trip_id, p.typing).await
        }
        WireEvent::ChatMarkRead(r) => {
            ctx.chat.mark_read(user_id, r.trip_id).await?;
            Ok(())
        }

        // Server-to-client events arriving inbound are client bugs.
        other => Err(ApiError::validation(format!(
            "unexpected event from client: {}",
            other.name(),
        ))),
    }
}

fn require_role(
    identity: SessionIdentity,
    role: UserRole,
) -> ApiResult<()> {
    if identity.role != role {
        return Err(ApiError::forbidden(format!(
            "{} may not send this event",
            identity.role,
        )));
    }
    Ok(())
}

/// Bring a reconnecting client back up to date: pending offers that are
/// still live, and the state of their active trip.
async fn replay(
    ctx: &AppContext,
    conn_id: ConnId,
    identity: SessionIdentity,
) -> anyhow::Result<()> {
    match identity.role {
        UserRole::Driver => replay_driver(ctx, conn_id, identity.user_id).await,
        _ => replay_passenger(ctx, conn_id, identity.user_id).await,
    }
}

async fn replay_driver(
    ctx: &AppContext,
    conn_id: ConnId,
    driver_id: UserId,
) -> anyhow::Result<()> {
    for offer in ctx.dispatcher.pending_offers(driver_id).await? {
        let still_searching = matches!(
            ctx.trips.record_of(offer.trip_id).await,
            Some(record) if record.status == TripStatus::Searching
        );
        if still_searching {
            ctx.rooms.send_to(conn_id, WireEvent::TripNewRequest(offer));
        }
    }

    if let Some(trip_id) = ctx
        .kv
        .get_json::<TripId>(&keys::driver_active_trip(&driver_id))
        .await?
    {
        if let Some(record) = ctx.trips.record_of(trip_id).await {
            ctx.rooms.join(conn_id, Room::Trip(trip_id));
            ctx.rooms
                .send_to(conn_id, WireEvent::TripStateSync(record.snapshot()));
        }
    }
    Ok(())
}

async fn replay_passenger(
    ctx: &AppContext,
    conn_id: ConnId,
    passenger_id: UserId,
) -> anyhow::Result<()> {
    let Some(trip_id) = ctx
        .kv
        .get_json::<TripId>(&keys::passenger_active_trip(&passenger_id))
        .await?
    else {
        return Ok(());
    };
    let Some(record) = ctx.trips.record_of(trip_id).await else {
        return Ok(());
    };
    ctx.rooms.join(conn_id, Room::Trip(trip_id));
    ctx.rooms
        .send_to(conn_id, WireEvent::TripStateSync(record.snapshot()));

    // A matched trip also replays the driver card.
    let Some(driver_id) = record.driver_id else {
        return Ok(());
    };
    let Some(position) = ctx
        .presence
        .get_location(driver_id)
        .await
        .ok()
        .flatten()
    else {
        return Ok(());
    };
    let mut tx = ctx.db.begin().await?;
    let profile = tx.get_driver_profile(driver_id).await?;
    tx.commit().await?;
    if let (Some(profile), Some(matched_at)) = (profile, record.matched_at) {
        ctx.rooms.send_to(
            conn_id,
            WireEvent::TripDriverAssigned(
                common::api::models::DriverAssignedPayload {
                    trip_id,
                    driver: profile.to_driver_info(),
                    driver_location: position.coord,
                    matched_at,
                },
            ),
        );
    }
    Ok(())
}
