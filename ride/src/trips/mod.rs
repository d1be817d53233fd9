//! The trip state machine.
//!
//! Every post-match transition follows the same discipline: load the row
//! under a row lock, check the caller and the transition table, persist,
//! then mirror to the key-value store and fan events out. The durable row
//! is authoritative; the ephemeral record is a cache of it, and cache
//! maintenance failures are logged, never surfaced.

pub mod transitions;

use std::sync::Arc;

use common::api::error::{ApiError, ApiResult};
use common::api::events::{TripRef, WireEvent};
use common::api::models::{
    TripCanceledPayload, TripCompletedPayload, TripStartedPayload,
};
use common::constants;
use common::ids::{EventId, TripId, UserId};
use common::money::Xaf;
use common::time::TimestampMs;
use common::trip::{CancelActor, TripEventType, TripRecord, TripStatus};
use store::db::{Db, DbTx};
use store::keys;
use store::kv::{KvOp, KvStore, KvStoreExt};
use store::models::{TripEventRow, TripRow};
use tracing::{info, instrument, warn};

use self::transitions::{is_allowed, Actor};
use crate::config::DispatchConfig;
use crate::earnings::{EarningsEngine, SettlementOutcome};
use crate::events::{EventSink, Room};

/// See the module docs.
pub struct TripManager<K, D, S> {
    kv: K,
    db: D,
    sink: S,
    engine: EarningsEngine,
}

impl<K: KvStore, D: Db, S: EventSink> Clone for TripManager<K, D, S> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            db: self.db.clone(),
            sink: self.sink.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<K: KvStore, D: Db, S: EventSink> TripManager<K, D, S> {
    pub fn new(kv: K, db: D, sink: S, config: Arc<DispatchConfig>) -> Self {
        Self {
            kv,
            db,
            sink,
            engine: EarningsEngine::new(config),
        }
    }

    /// Driver is heading to the pickup.
    #[instrument(skip(self))]
    pub async fn driver_en_route(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<()> {
        let now = TimestampMs::now();
        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let mut row = self
            .load_checked(&mut tx, trip_id, driver_id, Actor::Driver)
            .await?;
        self.check_transition(&row, TripStatus::DriverEnRoute, Actor::Driver)?;
        row.status = TripStatus::DriverEnRoute;
        row.driver_en_route_at = Some(now);
        tx.update_trip(&row).await?;
        self.append_audit(
            &mut tx,
            trip_id,
            TripEventType::EnRoute,
            Some(driver_id),
            serde_json::json!({}),
            now,
        )
        .await;
        tx.commit().await?;

        self.mirror_status(&row).await;
        if let Some(record) = self.record_of(trip_id).await {
            self.sink.emit(
                Room::Passenger(row.passenger_id),
                WireEvent::TripStateSync(record.snapshot()),
            );
        }
        Ok(())
    }

    /// Driver is at the pickup point.
    #[instrument(skip(self))]
    pub async fn driver_arrived(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<()> {
        let now = TimestampMs::now();
        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let mut row = self
            .load_checked(&mut tx, trip_id, driver_id, Actor::Driver)
            .await?;
        self.check_transition(&row, TripStatus::DriverArrived, Actor::Driver)?;
        row.status = TripStatus::DriverArrived;
        row.driver_arrived_at = Some(now);
        tx.update_trip(&row).await?;
        self.append_audit(
            &mut tx,
            trip_id,
            TripEventType::Arrived,
            Some(driver_id),
            serde_json::json!({}),
            now,
        )
        .await;
        tx.commit().await?;

        self.mirror_status(&row).await;
        self.sink.emit(
            Room::Passenger(row.passenger_id),
            WireEvent::TripDriverArrived(TripRef { trip_id }),
        );
        Ok(())
    }

    /// Passenger is aboard; the ride begins.
    #[instrument(skip(self))]
    pub async fn start_trip(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<()> {
        let now = TimestampMs::now();
        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let mut row = self
            .load_checked(&mut tx, trip_id, driver_id, Actor::Driver)
            .await?;
        self.check_transition(&row, TripStatus::InProgress, Actor::Driver)?;
        row.status = TripStatus::InProgress;
        row.trip_started_at = Some(now);
        tx.update_trip(&row).await?;
        self.append_audit(
            &mut tx,
            trip_id,
            TripEventType::Started,
            Some(driver_id),
            serde_json::json!({}),
            now,
        )
        .await;
        tx.commit().await?;

        self.mirror_status(&row).await;
        self.sink.emit(
            Room::Passenger(row.passenger_id),
            WireEvent::TripStarted(TripStartedPayload {
                trip_id,
                started_at: now,
            }),
        );
        Ok(())
    }

    /// Finish the ride and settle earnings, all in one transaction.
    ///
    /// Retrying a completed trip is not an error: the settlement's receipt
    /// check answers `already_processed` and nothing is posted twice.
    #[instrument(skip(self))]
    pub async fn complete_trip(
        &self,
        driver_id: UserId,
        trip_id: TripId,
        final_fare: Option<Xaf>,
        notes: Option<String>,
    ) -> ApiResult<SettlementOutcome> {
        if let Some(fare) = final_fare {
            if fare.is_negative() {
                return Err(ApiError::validation(
                    "final fare must not be negative",
                ));
            }
        }
        let now = TimestampMs::now();
        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let mut row = self
            .load_checked(&mut tx, trip_id, driver_id, Actor::Driver)
            .await?;

        // A retry of an already-completed trip goes straight to the
        // settlement, which is idempotent on the receipt.
        if row.status == TripStatus::Completed {
            let outcome = self.engine.settle(&mut tx, &row, now).await?;
            tx.commit().await?;
            return Ok(outcome);
        }

        self.check_transition(&row, TripStatus::Completed, Actor::Driver)?;
        row.status = TripStatus::Completed;
        row.trip_completed_at = Some(now);
        row.fare_final = Some(final_fare.unwrap_or(row.fare_estimate));
        if notes.is_some() {
            row.notes = notes;
        }
        tx.update_trip(&row).await?;

        let outcome = self.engine.settle(&mut tx, &row, now).await?;

        self.append_audit(
            &mut tx,
            trip_id,
            TripEventType::Completed,
            Some(driver_id),
            serde_json::json!({
                "fare_final": row.fare_final,
                "driver_net": outcome.driver_net,
            }),
            now,
        )
        .await;
        tx.commit().await?;

        self.terminal_cleanup(&row).await;
        self.sink.emit(
            Room::Passenger(row.passenger_id),
            WireEvent::TripCompleted(TripCompletedPayload {
                trip_id,
                fare_final: row.fare_final.unwrap_or(row.fare_estimate),
                completed_at: now,
            }),
        );
        info!(%trip_id, driver_net = %outcome.driver_net, "trip completed");
        Ok(outcome)
    }

    /// Abandon a matched trip. Either party may cancel only before the
    /// ride starts (up through DRIVER_ARRIVED); an in-progress ride can
    /// only complete.
    #[instrument(skip(self))]
    pub async fn cancel_trip(
        &self,
        caller: UserId,
        canceled_by: CancelActor,
        trip_id: TripId,
        reason: Option<String>,
    ) -> ApiResult<()> {
        let actor = match canceled_by {
            CancelActor::Driver => Actor::Driver,
            CancelActor::Passenger => Actor::Passenger,
            CancelActor::System => Actor::System,
        };
        let now = TimestampMs::now();
        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let mut row =
            self.load_checked(&mut tx, trip_id, caller, actor).await?;
        self.check_transition(&row, TripStatus::Canceled, actor)?;
        row.status = TripStatus::Canceled;
        row.canceled_at = Some(now);
        row.canceled_by = Some(canceled_by);
        row.cancel_reason = reason.clone();
        tx.update_trip(&row).await?;
        self.append_audit(
            &mut tx,
            trip_id,
            TripEventType::Canceled,
            Some(caller),
            serde_json::json!({ "by": canceled_by, "reason": &reason }),
            now,
        )
        .await;
        tx.commit().await?;

        self.terminal_cleanup(&row).await;
        let payload = TripCanceledPayload {
            trip_id,
            canceled_by,
            reason,
        };
        self.sink.emit(
            Room::Passenger(row.passenger_id),
            WireEvent::TripCanceled(payload.clone()),
        );
        if let Some(other_driver) = row.driver_id {
            self.sink.emit(
                Room::Driver(other_driver),
                WireEvent::TripCanceled(payload),
            );
        }
        info!(%trip_id, ?canceled_by, "trip canceled");
        Ok(())
    }

    /// The passenger never showed. Only reportable after waiting at the
    /// pickup for five minutes.
    #[instrument(skip(self))]
    pub async fn report_no_show(
        &self,
        driver_id: UserId,
        trip_id: TripId,
    ) -> ApiResult<()> {
        let now = TimestampMs::now();
        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let mut row = self
            .load_checked(&mut tx, trip_id, driver_id, Actor::Driver)
            .await?;
        self.check_transition(&row, TripStatus::NoShow, Actor::Driver)?;
        let arrived_at = row.driver_arrived_at.ok_or_else(|| {
            ApiError::precondition("trip has no arrival time")
        })?;
        let waited = now.saturating_duration_since(arrived_at);
        if waited < constants::NO_SHOW_MIN_WAIT {
            return Err(ApiError::precondition(format!(
                "must wait {}s at the pickup before reporting a no-show \
                 (waited {}s)",
                constants::NO_SHOW_MIN_WAIT.as_secs(),
                waited.as_secs(),
            )));
        }
        row.status = TripStatus::NoShow;
        row.canceled_at = Some(now);
        row.canceled_by = Some(CancelActor::Driver);
        row.cancel_reason = Some("passenger no-show".to_string());
        tx.update_trip(&row).await?;
        self.append_audit(
            &mut tx,
            trip_id,
            TripEventType::NoShow,
            Some(driver_id),
            serde_json::json!({ "waited_secs": waited.as_secs() }),
            now,
        )
        .await;
        tx.commit().await?;

        self.terminal_cleanup(&row).await;
        self.sink.emit(
            Room::Passenger(row.passenger_id),
            WireEvent::TripNoShow(TripRef { trip_id }),
        );
        Ok(())
    }

    /// The ephemeral record, if the trip is still live in the key-value
    /// store. Used for reconnect state sync.
    pub async fn record_of(&self, trip_id: TripId) -> Option<TripRecord> {
        match self
            .kv
            .get_json::<TripRecord>(&keys::trip(&trip_id))
            .await
        {
            Ok(record) => record,
            Err(err) => {
                warn!(%trip_id, "record read failed: {err:#}");
                None
            }
        }
    }

    // --- Internals --- //

    async fn load_checked(
        &self,
        tx: &mut D::Tx,
        trip_id: TripId,
        caller: UserId,
        actor: Actor,
    ) -> ApiResult<TripRow> {
        let row = tx
            .get_trip_for_update(trip_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no such trip"))?;
        let authorized = match actor {
            Actor::Driver => row.driver_id == Some(caller),
            Actor::Passenger => row.passenger_id == caller,
            Actor::System => true,
        };
        if !authorized {
            return Err(ApiError::forbidden("not a participant of this trip"));
        }
        Ok(row)
    }

    fn check_transition(
        &self,
        row: &TripRow,
        to: TripStatus,
        actor: Actor,
    ) -> ApiResult<()> {
        if !is_allowed(row.status, to, actor) {
            return Err(ApiError::precondition(format!(
                "cannot go from {} to {to}",
                row.status,
            )));
        }
        Ok(())
    }

    /// Audit trail is best-effort: a failed append must not void a
    /// transition.
    async fn append_audit(
        &self,
        tx: &mut D::Tx,
        trip_id: TripId,
        event_type: TripEventType,
        performed_by: Option<UserId>,
        metadata: serde_json::Value,
        now: TimestampMs,
    ) {
        let event = TripEventRow {
            id: EventId::generate(),
            trip_id,
            event_type: event_type.to_string(),
            performed_by,
            metadata,
            created_at: now,
        };
        if let Err(err) = tx.insert_trip_event(&event).await {
            warn!(%trip_id, %event_type, "audit append failed: {err:#}");
        }
    }

    /// Refresh the ephemeral mirror after a non-terminal transition.
    async fn mirror_status(&self, row: &TripRow) {
        let key = keys::trip(&row.id);
        let result = async {
            if let Some(mut record) =
                self.kv.get_json::<TripRecord>(&key).await?
            {
                record.status = row.status;
                record.driver_id = row.driver_id;
                record.matched_at = row.matched_at;
                self.kv
                    .put_json(
                        &key,
                        &record,
                        Some(constants::TRIP_ACTIVE_TTL),
                    )
                    .await?;
            }
            anyhow::Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(trip_id = %row.id, "mirror update failed: {err:#}");
        }
    }

    /// A trip reached a terminal state: drop the ephemeral record and the
    /// reverse indexes, and hand the driver back to the available pool.
    /// All best-effort; every key involved carries a TTL.
    async fn terminal_cleanup(&self, row: &TripRow) {
        let mut ops = vec![
            KvOp::Del {
                key: keys::trip(&row.id),
            },
            KvOp::Del {
                key: keys::passenger_active_trip(&row.passenger_id),
            },
        ];
        if let Some(driver_id) = row.driver_id {
            ops.push(KvOp::Del {
                key: keys::driver_active_trip(&driver_id),
            });
        }
        if let Err(err) = self.kv.batch(ops).await {
            warn!(trip_id = %row.id, "terminal cleanup failed: {err:#}");
        }

        // Only online drivers may be available again.
        if let Some(driver_id) = row.driver_id {
            let result = async {
                let online = self
                    .kv
                    .sismember(keys::DRIVERS_ONLINE, &driver_id.to_string())
                    .await?;
                if online {
                    self.kv
                        .sadd(
                            keys::DRIVERS_AVAILABLE,
                            &driver_id.to_string(),
                            None,
                        )
                        .await?;
                }
                anyhow::Ok(())
            }
            .await;
            if let Err(err) = result {
                warn!(%driver_id, "release to available failed: {err:#}");
            }
        }
    }
}
