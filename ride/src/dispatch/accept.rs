//! The acceptance race.
//!
//! N drivers may answer the same offer within milliseconds, across worker
//! processes. Exactly one may win. The arbiter is a single
//! `SET trip:lock:<id> <nonce> NX EX 10` on the key-value store - never a
//! process-local mutex, which could not coordinate across processes. The
//! nonce makes the release safe: a holder that overran the TTL cannot
//! delete a lock someone else has since acquired.
//!
//! Timeouts and TTLs exist to bound damage, not for correctness; the lock
//! plus the re-read of the trip record decide the winner.

use common::api::error::{codes, ApiError, ApiResult};
use common::api::events::WireEvent;
use common::api::models::{DriverAssignedPayload, MatchedPayload};
use common::constants;
use common::ids::{EventId, TripId, UserId};
use common::time::TimestampMs;
use common::trip::{TripRecord, TripStatus};
use rand::distributions::Alphanumeric;
use rand::Rng;
use store::db::{Db, DbTx};
use store::keys;
use store::kv::{KvOp, KvStore, KvStoreExt};
use store::models::{TripEventRow, TripRow};
use tracing::{info, instrument, warn};

use super::Dispatcher;
use crate::events::{EventSink, Room};
use crate::presence::DriverPosition;

fn lock_nonce() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

impl<K: KvStore, D: Db, S: EventSink> Dispatcher<K, D, S> {
    /// Driver `driver_id` answers `trip:accept`.
    ///
    /// On success the trip is MATCHED in both stores, both parties are
    /// notified, and the other offered drivers are told the request
    /// expired. On a lost race the caller gets a CONFLICT with the
    /// specific code.
    #[instrument(skip(self))]
    pub async fn accept(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<MatchedPayload> {
        let lock_key = keys::trip_lock(&trip_id);
        let nonce = lock_nonce();
        let won = self
            .kv
            .set_nx_ex(&lock_key, &nonce, constants::TRIP_LOCK_TTL)
            .await?;
        if !won {
            return Err(ApiError::conflict(
                codes::TRIP_LOCKED,
                "another driver is accepting this trip",
            ));
        }

        let result = self.accept_locked(driver_id, trip_id).await;

        // Nonce-checked release. Failure is harmless: the TTL caps how
        // long anyone else waits.
        match self.kv.del_if_equals(&lock_key, &nonce).await {
            Ok(true) => (),
            Ok(false) => warn!(%trip_id, "trip lock expired before release"),
            Err(err) => warn!(%trip_id, "trip lock release failed: {err:#}"),
        }
        result
    }

    async fn accept_locked(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<MatchedPayload> {
        // Cancel the wave timeout and mark the slow path as in flight so
        // the offer loop holds off expansion while we hit the database.
        self.kv.del(&keys::trip_timeout(&trip_id)).await?;
        self.kv
            .batch(vec![
                KvOp::Put {
                    key: keys::trip_accepting(&trip_id),
                    value: driver_id.to_string(),
                    ttl: Some(constants::ACCEPTING_MARKER_TTL),
                },
                KvOp::Put {
                    key: keys::trip_no_expire(&trip_id),
                    value: "1".to_string(),
                    ttl: Some(constants::ACCEPTING_MARKER_TTL),
                },
            ])
            .await?;

        let outcome = self.accept_checked(driver_id, trip_id).await;

        // Best-effort marker cleanup; they expire on their own regardless.
        let markers = self
            .kv
            .batch(vec![
                KvOp::Del {
                    key: keys::trip_accepting(&trip_id),
                },
                KvOp::Del {
                    key: keys::trip_no_expire(&trip_id),
                },
            ])
            .await;
        if let Err(err) = markers {
            warn!(%trip_id, "marker cleanup failed: {err:#}");
        }
        outcome
    }

    async fn accept_checked(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<MatchedPayload> {
        // Re-read under the lock: the record must still be searching and
        // unclaimed.
        let trip_key = keys::trip(&trip_id);
        let Some(mut record) =
            self.kv.get_json::<TripRecord>(&trip_key).await?
        else {
            return Err(ApiError::conflict(
                codes::TRIP_NOT_AVAILABLE,
                "trip expired or was canceled",
            ));
        };
        if record.driver_id.is_some() {
            return Err(ApiError::conflict(
                codes::TRIP_ALREADY_ACCEPTED,
                "trip was accepted by another driver",
            ));
        }
        if record.status != TripStatus::Searching {
            return Err(ApiError::conflict(
                codes::TRIP_NOT_AVAILABLE,
                "trip is no longer searching",
            ));
        }

        // The winner must be locatable; a match with an unknown driver
        // position is useless to the passenger.
        let Some(position) = self.presence.get_location(driver_id).await?
        else {
            return Err(ApiError::unavailable(
                codes::DRIVER_LOCATION_MISSING,
                "driver has no known location",
            ));
        };

        let now = TimestampMs::now();
        record.driver_id = Some(driver_id);
        record.status = TripStatus::Matched;
        record.matched_at = Some(now);

        // Durable first: the row and its audit event commit together.
        // The ephemeral mirror follows; if this process dies in between,
        // the record's TTL clears the stale SEARCHING copy.
        let (driver_info, passenger_info) = {
            let mut tx = self.db.begin().await.map_err(ApiError::from)?;
            let driver_profile = tx
                .get_driver_profile(driver_id)
                .await?
                .ok_or_else(|| {
                    anyhow::anyhow!("no driver profile for {driver_id}")
                })?;
            let passenger = tx
                .get_passenger_brief(record.passenger_id)
                .await?
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "no passenger account for {}",
                        record.passenger_id
                    )
                })?;
            tx.insert_trip(&trip_row_at_match(&record, &position, now))
                .await?;
            let audit = TripEventRow {
                id: EventId::generate(),
                trip_id,
                event_type: common::trip::TripEventType::Matched.to_string(),
                performed_by: Some(driver_id),
                metadata: serde_json::json!({
                    "driver_id": driver_id,
                    "wave": record.wave,
                }),
                created_at: now,
            };
            if let Err(err) = tx.insert_trip_event(&audit).await {
                warn!(%trip_id, "audit append failed: {err:#}");
            }
            tx.commit().await?;
            (driver_profile.to_driver_info(), passenger.to_passenger_info())
        };

        // Mirror to the key-value store: record, both reverse indexes, and
        // the winner leaves the available pool.
        self.kv
            .batch(vec![
                KvOp::Put {
                    key: trip_key,
                    value: serde_json::to_string(&record)
                        .map_err(anyhow::Error::from)?,
                    ttl: Some(constants::TRIP_ACTIVE_TTL),
                },
                KvOp::Put {
                    key: keys::driver_active_trip(&driver_id),
                    value: serde_json::to_string(&trip_id)
                        .map_err(anyhow::Error::from)?,
                    ttl: Some(constants::TRIP_ACTIVE_TTL),
                },
                KvOp::Put {
                    key: keys::passenger_active_trip(&record.passenger_id),
                    value: serde_json::to_string(&trip_id)
                        .map_err(anyhow::Error::from)?,
                    ttl: Some(constants::TRIP_ACTIVE_TTL),
                },
                KvOp::SRem {
                    key: keys::DRIVERS_AVAILABLE.to_string(),
                    member: driver_id.to_string(),
                },
            ])
            .await?;

        // Losers learn the request is gone; the winner's own pending offer
        // entry goes with it.
        self.notify_request_expired(trip_id, Some(driver_id)).await;

        let matched = MatchedPayload {
            trip_id,
            passenger: passenger_info,
            pickup: record.pickup.clone(),
            dropoff: record.dropoff.clone(),
            payment_method: record.payment_method,
            fare_estimate: record.fare_estimate,
            matched_at: now,
        };
        self.sink.emit(
            Room::Passenger(record.passenger_id),
            WireEvent::TripDriverAssigned(DriverAssignedPayload {
                trip_id,
                driver: driver_info,
                driver_location: position.coord,
                matched_at: now,
            }),
        );
        self.sink.emit(
            Room::Driver(driver_id),
            WireEvent::TripMatched(matched.clone()),
        );
        info!(%trip_id, %driver_id, "trip matched");
        Ok(matched)
    }

}

fn trip_row_at_match(
    record: &TripRecord,
    position: &DriverPosition,
    now: TimestampMs,
) -> TripRow {
    TripRow {
        id: record.id,
        passenger_id: record.passenger_id,
        driver_id: record.driver_id,
        status: TripStatus::Matched,
        pickup_lat: record.pickup.coord.lat(),
        pickup_lng: record.pickup.coord.lng(),
        pickup_address: record.pickup.address.clone(),
        dropoff_lat: record.dropoff.coord.lat(),
        dropoff_lng: record.dropoff.coord.lng(),
        dropoff_address: record.dropoff.address.clone(),
        route_polyline: None,
        distance_m: record.distance_m as i32,
        duration_s: record.duration_s as i32,
        fare_estimate: record.fare_estimate,
        fare_final: None,
        payment_method: record.payment_method,
        driver_lat_at_match: Some(position.coord.lat()),
        driver_lng_at_match: Some(position.coord.lng()),
        matched_at: Some(now),
        driver_en_route_at: None,
        driver_arrived_at: None,
        trip_started_at: None,
        trip_completed_at: None,
        canceled_at: None,
        cancel_reason: None,
        canceled_by: None,
        notes: None,
        created_at: record.requested_at,
    }
}
