//! The dispatcher: trip request intake and the offer loop.
//!
//! A trip request becomes an ephemeral SEARCHING record, then the offer
//! loop pushes waves of offers to the nearest available drivers, expanding
//! the radius every 30 s until someone accepts, the passenger cancels, or
//! four waves exhaust into NO_DRIVERS.
//!
//! The loop runs as a task in the process that took the request, but every
//! piece of its state (the record's wave and radius, the timeout key, the
//! declined set) lives in the key-value store, so an acceptance arriving on
//! any other worker process stops expansion here.

mod accept;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::api::error::{codes, ApiError, ApiResult};
use common::api::events::{TripRef, WireEvent};
use common::api::models::{OfferPayload, TripCanceledPayload, TripRequest};
use common::constants;
use common::ids::{TripId, UserId};
use common::time::TimestampMs;
use common::trip::{CancelActor, TripRecord, TripStatus};
use common::user::PassengerInfo;
use serde::{Deserialize, Serialize};
use store::db::{Db, DbTx};
use store::keys;
use store::kv::{KvStore, KvStoreExt};
use tracing::{debug, info, instrument, warn};

use crate::config::DispatchConfig;
use crate::events::{EventSink, Room};
use crate::presence::Presence;

/// The `trip:offers:<id>` record: every driver notified for this trip.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct OffersRecord {
    drivers: Vec<UserId>,
}

/// See the module docs.
pub struct Dispatcher<K, D, S> {
    kv: K,
    db: D,
    presence: Presence<K, S>,
    sink: S,
    config: Arc<DispatchConfig>,
}

// Derived Clone would require K: Clone bounds on the struct itself.
impl<K: KvStore, D: Db, S: EventSink> Clone for Dispatcher<K, D, S> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            db: self.db.clone(),
            presence: self.presence.clone(),
            sink: self.sink.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<K: KvStore, D: Db, S: EventSink> Dispatcher<K, D, S> {
    pub fn new(
        kv: K,
        db: D,
        presence: Presence<K, S>,
        sink: S,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            kv,
            db,
            presence,
            sink,
            config,
        }
    }

    /// Accept a passenger's trip request: create the ephemeral SEARCHING
    /// record and its reverse index. The caller is responsible for driving
    /// [`run_offer_loop`](Self::run_offer_loop) afterwards (the gateway
    /// spawns it; tests drive it with a paused clock).
    #[instrument(skip(self, request))]
    pub async fn request_trip(
        &self,
        passenger_id: UserId,
        request: TripRequest,
    ) -> ApiResult<TripRecord> {
        if request.fare_estimate.is_negative() {
            return Err(ApiError::validation(
                "fare estimate must not be negative",
            ));
        }
        if request.distance_m == 0 || request.duration_s == 0 {
            return Err(ApiError::validation(
                "distance and duration must be positive",
            ));
        }

        // One active trip per passenger. A dangling index whose trip record
        // already expired does not count.
        let index_key = keys::passenger_active_trip(&passenger_id);
        if let Some(active) = self.kv.get_json::<TripId>(&index_key).await? {
            if self.kv.exists(&keys::trip(&active)).await? {
                return Err(ApiError::conflict(
                    codes::ACTIVE_TRIP_EXISTS,
                    "passenger already has an active trip",
                ));
            }
        }

        let record = TripRecord {
            id: TripId::generate(),
            passenger_id,
            driver_id: None,
            status: TripStatus::Searching,
            pickup: request.pickup,
            dropoff: request.dropoff,
            distance_m: request.distance_m,
            duration_s: request.duration_s,
            payment_method: request.payment_method,
            fare_estimate: request.fare_estimate,
            requested_at: TimestampMs::now(),
            matched_at: None,
            radius_km: self.config.radius_km,
            wave: 0,
        };
        self.kv
            .put_json(
                &keys::trip(&record.id),
                &record,
                Some(constants::TRIP_SEARCHING_TTL),
            )
            .await?;
        self.kv
            .put_json(
                &index_key,
                &record.id,
                Some(constants::TRIP_ACTIVE_TTL),
            )
            .await?;
        info!(trip_id = %record.id, %passenger_id, "trip request accepted");
        Ok(record)
    }

    /// Drive the offer waves for one trip to their conclusion. Exits as
    /// soon as the trip leaves SEARCHING (accepted or canceled anywhere),
    /// or transitions it to NO_DRIVERS after the final wave.
    pub async fn run_offer_loop(&self, trip_id: TripId) {
        if let Err(err) = self.offer_loop_inner(trip_id).await {
            warn!(%trip_id, "offer loop aborted: {err:#}");
        }
    }

    async fn offer_loop_inner(&self, trip_id: TripId) -> anyhow::Result<()> {
        let trip_key = keys::trip(&trip_id);
        loop {
            let Some(mut record) =
                self.kv.get_json::<TripRecord>(&trip_key).await?
            else {
                return Ok(()); // canceled or expired
            };
            if record.status != TripStatus::Searching {
                return Ok(()); // matched
            }
            if record.wave >= self.config.max_waves {
                // An acceptance may have grabbed the lock after our last
                // status read; its marker keys make that visible.
                if self
                    .kv
                    .exists(&keys::trip_accepting(&trip_id))
                    .await?
                {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                return self.exhaust(record).await;
            }

            // Never write over a record an acceptance is about to flip;
            // its marker goes up before the slow path starts.
            if self.kv.exists(&keys::trip_accepting(&trip_id)).await? {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            record.wave += 1;
            self.kv
                .put_json(
                    &trip_key,
                    &record,
                    Some(constants::TRIP_SEARCHING_TTL),
                )
                .await?;
            let notified = self.send_wave(&record).await?;
            debug!(
                %trip_id,
                wave = record.wave,
                radius_km = record.radius_km,
                notified,
                "offer wave sent"
            );

            self.kv
                .put_string(
                    &keys::trip_timeout(&trip_id),
                    "1",
                    Some(self.config.wave_timeout),
                )
                .await?;
            tokio::time::sleep(self.config.wave_timeout).await;

            // An acceptance's slow path may be in flight; don't expand
            // underneath it.
            while self
                .kv
                .exists(&keys::trip_no_expire(&trip_id))
                .await?
            {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            if self.kv.exists(&keys::trip_accepting(&trip_id)).await? {
                continue;
            }
            let Some(mut record) =
                self.kv.get_json::<TripRecord>(&trip_key).await?
            else {
                return Ok(());
            };
            if record.status != TripStatus::Searching {
                return Ok(());
            }
            record.radius_km = (record.radius_km
                + self.config.radius_step_km)
                .min(self.config.radius_max_km);
            self.kv
                .put_json(
                    &trip_key,
                    &record,
                    Some(constants::TRIP_SEARCHING_TTL),
                )
                .await?;
        }
    }

    /// Push one wave of offers to the nearest candidates. Returns how many
    /// drivers were notified; zero is a legal wave.
    async fn send_wave(&self, record: &TripRecord) -> anyhow::Result<usize> {
        let declined: HashSet<String> = self
            .kv
            .smembers(&keys::trip_declined(&record.id))
            .await?
            .into_iter()
            .collect();
        let candidates = self
            .presence
            .find_nearby(record.pickup.coord, record.radius_km)
            .await
            .map_err(|err| anyhow::anyhow!("candidate query: {err}"))?
            .into_iter()
            .filter(|(id, _)| !declined.contains(&id.to_string()))
            .take(self.config.wave_size)
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok(0);
        }

        let passenger = self.passenger_info(record.passenger_id).await?;
        let expires_at =
            TimestampMs::now().saturating_add(self.config.wave_timeout);

        for (driver_id, pickup_distance_km) in &candidates {
            let offer = OfferPayload {
                trip_id: record.id,
                pickup: record.pickup.clone(),
                dropoff: record.dropoff.clone(),
                distance_m: record.distance_m,
                duration_s: record.duration_s,
                payment_method: record.payment_method,
                fare_estimate: record.fare_estimate,
                passenger: passenger.clone(),
                pickup_distance_km: *pickup_distance_km,
                expires_at,
            };
            self.push_pending_offer(*driver_id, offer.clone()).await?;
            self.sink.emit(
                Room::Driver(*driver_id),
                WireEvent::TripNewRequest(offer),
            );
        }

        let offers_key = keys::trip_offers(&record.id);
        let mut offers = self
            .kv
            .get_json::<OffersRecord>(&offers_key)
            .await?
            .unwrap_or_default();
        for (driver_id, _) in &candidates {
            if !offers.drivers.contains(driver_id) {
                offers.drivers.push(*driver_id);
            }
        }
        self.kv
            .put_json(&offers_key, &offers, Some(constants::TRIP_ACTIVE_TTL))
            .await?;
        Ok(candidates.len())
    }

    /// Four waves came up empty: the search is over.
    async fn exhaust(&self, mut record: TripRecord) -> anyhow::Result<()> {
        info!(trip_id = %record.id, "no drivers after final wave");
        // Flip the record to terminal first, so a racing acceptance that
        // re-reads it replies TRIP_NOT_AVAILABLE instead of matching a
        // search we are tearing down.
        record.status = TripStatus::NoDrivers;
        self.kv
            .put_json(
                &keys::trip(&record.id),
                &record,
                Some(Duration::from_secs(60)),
            )
            .await?;
        self.notify_request_expired(record.id, None).await;
        self.sink.emit(
            Room::Passenger(record.passenger_id),
            WireEvent::TripNoDrivers(TripRef { trip_id: record.id }),
        );
        self.delete_search_keys(&record).await;
        Ok(())
    }

    /// A driver turns an offer down: remember the decline for the rest of
    /// this search and drop the offer from their plate.
    #[instrument(skip(self))]
    pub async fn decline(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<()> {
        self.kv
            .sadd(
                &keys::trip_declined(&trip_id),
                &driver_id.to_string(),
                Some(constants::DECLINED_TTL),
            )
            .await?;
        self.prune_pending_offer(driver_id, trip_id).await;
        Ok(())
    }

    /// Passenger cancellation while still SEARCHING. Post-match
    /// cancellations go through the trip state machine instead.
    #[instrument(skip(self))]
    pub async fn cancel_searching(
        &self,
        caller: UserId,
        trip_id: TripId,
        reason: Option<String>,
    ) -> ApiResult<()> {
        let Some(record) = self
            .kv
            .get_json::<TripRecord>(&keys::trip(&trip_id))
            .await?
        else {
            return Err(ApiError::not_found("no such trip"));
        };
        if record.passenger_id != caller {
            return Err(ApiError::forbidden("not your trip"));
        }
        if record.status != TripStatus::Searching {
            return Err(ApiError::precondition(
                "trip is already matched; cancel it through the trip",
            ));
        }

        self.notify_request_expired(trip_id, None).await;
        self.delete_search_keys(&record).await;
        self.sink.emit(
            Room::Passenger(record.passenger_id),
            WireEvent::TripCanceled(TripCanceledPayload {
                trip_id,
                canceled_by: CancelActor::Passenger,
                reason,
            }),
        );
        info!(%trip_id, "search canceled by passenger");
        Ok(())
    }

    /// Tell every notified driver (except `winner`) the request is gone,
    /// and clear their pending-offer entries. Best-effort.
    async fn notify_request_expired(
        &self,
        trip_id: TripId,
        winner: Option<UserId>,
    ) {
        let offered = match self
            .kv
            .get_json::<OffersRecord>(&keys::trip_offers(&trip_id))
            .await
        {
            Ok(offers) => offers.unwrap_or_default().drivers,
            Err(err) => {
                warn!(%trip_id, "offers lookup failed: {err:#}");
                return;
            }
        };
        for driver_id in offered {
            self.prune_pending_offer(driver_id, trip_id).await;
            if Some(driver_id) == winner {
                continue;
            }
            self.sink.emit(
                Room::Driver(driver_id),
                WireEvent::TripRequestExpired(TripRef { trip_id }),
            );
        }
    }

    /// Remove every key belonging to a finished search. Best-effort: all of
    /// them carry TTLs anyway.
    async fn delete_search_keys(&self, record: &TripRecord) {
        let ops = [
            keys::trip(&record.id),
            keys::trip_timeout(&record.id),
            keys::trip_offers(&record.id),
            keys::trip_declined(&record.id),
            keys::passenger_active_trip(&record.passenger_id),
        ];
        for key in ops {
            if let Err(err) = self.kv.del(&key).await {
                warn!(trip_id = %record.id, "cleanup of {key} failed: {err:#}");
            }
        }
    }

    async fn push_pending_offer(
        &self,
        driver_id: UserId,
        offer: OfferPayload,
    ) -> anyhow::Result<()> {
        let key = keys::driver_pending_offers(&driver_id);
        let mut offers = self
            .kv
            .get_json::<Vec<OfferPayload>>(&key)
            .await?
            .unwrap_or_default();
        offers.retain(|existing| existing.trip_id != offer.trip_id);
        offers.push(offer);
        self.kv
            .put_json(&key, &offers, Some(constants::PENDING_OFFERS_TTL))
            .await
    }

    async fn prune_pending_offer(&self, driver_id: UserId, trip_id: TripId) {
        let key = keys::driver_pending_offers(&driver_id);
        let result = async {
            let mut offers = self
                .kv
                .get_json::<Vec<OfferPayload>>(&key)
                .await?
                .unwrap_or_default();
            offers.retain(|offer| offer.trip_id != trip_id);
            self.kv
                .put_json(&key, &offers, Some(constants::PENDING_OFFERS_TTL))
                .await
        }
        .await;
        if let Err(err) = result {
            warn!(%driver_id, %trip_id, "offer prune failed: {err:#}");
        }
    }

    /// Offers still waiting on this driver, for reconnect replay.
    pub async fn pending_offers(
        &self,
        driver_id: UserId,
    ) -> ApiResult<Vec<OfferPayload>> {
        Ok(self
            .kv
            .get_json::<Vec<OfferPayload>>(&keys::driver_pending_offers(
                &driver_id,
            ))
            .await?
            .unwrap_or_default())
    }

    async fn passenger_info(
        &self,
        passenger_id: UserId,
    ) -> anyhow::Result<PassengerInfo> {
        let mut tx = self.db.begin().await?;
        let brief = tx
            .get_passenger_brief(passenger_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("unknown passenger {passenger_id}")
            })?;
        tx.commit().await?;
        Ok(brief.to_passenger_info())
    }
}
