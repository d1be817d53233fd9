//! The Postgres-backed [`Db`].
//!
//! Plain SQL with explicit column lists, mapped by hand into the row
//! structs. Uniqueness races surface as SQLSTATE 23505 and are translated
//! to [`InsertOutcome::AlreadyExists`] where the schema has a kill switch.

use async_trait::async_trait;
use common::ids::{
    AwardId, MessageId, ProgramId, ReceiptId, RuleId, TripId, UserId,
};
use common::money::{CommissionRate, Xaf};
use common::time::TimestampMs;
use common::user::VehicleInfo;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::str::FromStr;
use uuid::Uuid;

use anyhow::Context;

use super::{Db, DbTx, InsertOutcome};
use crate::models::{
    BonusAwardRow, BonusProgramRow, ChatMessageRow, DriverProfileRow,
    EarningRuleRow, PassengerBrief, PendingSignupRow, RatingRow, ReceiptRow,
    TripEventRow, TripRow, WalletRow, WalletTxnRow,
};

#[derive(Clone)]
pub struct PostgresDb {
    pool: PgPool,
}

impl PostgresDb {
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(dsn)
            .await
            .context("Failed to connect to the relational store")?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Db for PostgresDb {
    type Tx = PgTx;

    async fn begin(&self) -> anyhow::Result<PgTx> {
        let tx = self.pool.begin().await.context("begin failed")?;
        Ok(PgTx { tx })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

// --- Column mapping helpers --- //

fn col_ts(row: &PgRow, col: &str) -> anyhow::Result<TimestampMs> {
    TimestampMs::from_i64(row.try_get::<i64, _>(col)?)
}

fn col_opt_ts(row: &PgRow, col: &str) -> anyhow::Result<Option<TimestampMs>> {
    row.try_get::<Option<i64>, _>(col)?
        .map(TimestampMs::from_i64)
        .transpose()
}

fn col_xaf(row: &PgRow, col: &str) -> anyhow::Result<Xaf> {
    Ok(Xaf::new(row.try_get::<i64, _>(col)?))
}

fn col_opt_xaf(row: &PgRow, col: &str) -> anyhow::Result<Option<Xaf>> {
    Ok(row.try_get::<Option<i64>, _>(col)?.map(Xaf::new))
}

fn col_parsed<T>(row: &PgRow, col: &str) -> anyhow::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    row.try_get::<String, _>(col)?.parse()
}

fn col_opt_parsed<T>(row: &PgRow, col: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr<Err = anyhow::Error>,
{
    row.try_get::<Option<String>, _>(col)?
        .map(|value| value.parse())
        .transpose()
}

const TRIP_COLS: &str = "id, passenger_id, driver_id, status, \
    pickup_lat, pickup_lng, pickup_address, \
    dropoff_lat, dropoff_lng, dropoff_address, route_polyline, \
    distance_m, duration_s, fare_estimate, fare_final, payment_method, \
    driver_lat_at_match, driver_lng_at_match, \
    matched_at, driver_en_route_at, driver_arrived_at, trip_started_at, \
    trip_completed_at, canceled_at, cancel_reason, canceled_by, notes, \
    created_at";

fn map_trip(row: &PgRow) -> anyhow::Result<TripRow> {
    Ok(TripRow {
        id: TripId::from_uuid(row.try_get("id")?),
        passenger_id: UserId::from_uuid(row.try_get("passenger_id")?),
        driver_id: row
            .try_get::<Option<Uuid>, _>("driver_id")?
            .map(UserId::from_uuid),
        status: col_parsed(row, "status")?,
        pickup_lat: row.try_get("pickup_lat")?,
        pickup_lng: row.try_get("pickup_lng")?,
        pickup_address: row.try_get("pickup_address")?,
        dropoff_lat: row.try_get("dropoff_lat")?,
        dropoff_lng: row.try_get("dropoff_lng")?,
        dropoff_address: row.try_get("dropoff_address")?,
        route_polyline: row.try_get("route_polyline")?,
        distance_m: row.try_get("distance_m")?,
        duration_s: row.try_get("duration_s")?,
        fare_estimate: col_xaf(row, "fare_estimate")?,
        fare_final: col_opt_xaf(row, "fare_final")?,
        payment_method: col_parsed(row, "payment_method")?,
        driver_lat_at_match: row.try_get("driver_lat_at_match")?,
        driver_lng_at_match: row.try_get("driver_lng_at_match")?,
        matched_at: col_opt_ts(row, "matched_at")?,
        driver_en_route_at: col_opt_ts(row, "driver_en_route_at")?,
        driver_arrived_at: col_opt_ts(row, "driver_arrived_at")?,
        trip_started_at: col_opt_ts(row, "trip_started_at")?,
        trip_completed_at: col_opt_ts(row, "trip_completed_at")?,
        canceled_at: col_opt_ts(row, "canceled_at")?,
        cancel_reason: row.try_get("cancel_reason")?,
        canceled_by: col_opt_parsed(row, "canceled_by")?,
        notes: row.try_get("notes")?,
        created_at: col_ts(row, "created_at")?,
    })
}

const RECEIPT_COLS: &str = "id, trip_id, driver_id, passenger_id, \
    gross_fare, commission_rate, commission_amount, bonus_total, \
    driver_net, payment_method, commission_rule_id, applied_rules, status, \
    processed_at, created_at";

fn map_receipt(row: &PgRow) -> anyhow::Result<ReceiptRow> {
    Ok(ReceiptRow {
        id: ReceiptId::from_uuid(row.try_get("id")?),
        trip_id: TripId::from_uuid(row.try_get("trip_id")?),
        driver_id: UserId::from_uuid(row.try_get("driver_id")?),
        passenger_id: UserId::from_uuid(row.try_get("passenger_id")?),
        gross_fare: col_xaf(row, "gross_fare")?,
        commission_rate: CommissionRate::new(
            row.try_get::<Decimal, _>("commission_rate")?,
        )?,
        commission_amount: col_xaf(row, "commission_amount")?,
        bonus_total: col_xaf(row, "bonus_total")?,
        driver_net: col_xaf(row, "driver_net")?,
        payment_method: col_parsed(row, "payment_method")?,
        commission_rule_id: row
            .try_get::<Option<Uuid>, _>("commission_rule_id")?
            .map(RuleId::from_uuid),
        applied_rules: row.try_get("applied_rules")?,
        status: col_parsed(row, "status")?,
        processed_at: col_opt_ts(row, "processed_at")?,
        created_at: col_ts(row, "created_at")?,
    })
}

fn map_wallet(row: &PgRow) -> anyhow::Result<WalletRow> {
    Ok(WalletRow {
        driver_id: UserId::from_uuid(row.try_get("driver_id")?),
        balance: col_xaf(row, "balance")?,
        total_earned: col_xaf(row, "total_earned")?,
        total_commission: col_xaf(row, "total_commission")?,
        total_bonuses: col_xaf(row, "total_bonuses")?,
        total_payouts: col_xaf(row, "total_payouts")?,
        last_payout_at: col_opt_ts(row, "last_payout_at")?,
        status: col_parsed(row, "status")?,
    })
}

fn map_rule(row: &PgRow) -> anyhow::Result<EarningRuleRow> {
    Ok(EarningRuleRow {
        id: RuleId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        rule_type: col_parsed(row, "rule_type")?,
        priority: row.try_get("priority")?,
        rate: row.try_get("rate")?,
        amount: col_opt_xaf(row, "amount")?,
        condition: serde_json::from_value(
            row.try_get::<serde_json::Value, _>("condition")?,
        )?,
        applies_to: col_parsed(row, "applies_to")?,
        valid_from: col_opt_ts(row, "valid_from")?,
        valid_until: col_opt_ts(row, "valid_until")?,
        is_active: row.try_get("is_active")?,
    })
}

fn map_program(row: &PgRow) -> anyhow::Result<BonusProgramRow> {
    Ok(BonusProgramRow {
        id: ProgramId::from_uuid(row.try_get("id")?),
        name: row.try_get("name")?,
        granularity: col_parsed(row, "granularity")?,
        metric: col_parsed(row, "metric")?,
        target_value: row.try_get("target_value")?,
        bonus_amount: col_xaf(row, "bonus_amount")?,
        valid_from: col_opt_ts(row, "valid_from")?,
        valid_until: col_opt_ts(row, "valid_until")?,
        is_active: row.try_get("is_active")?,
    })
}

fn map_award(row: &PgRow) -> anyhow::Result<BonusAwardRow> {
    Ok(BonusAwardRow {
        id: AwardId::from_uuid(row.try_get("id")?),
        driver_id: UserId::from_uuid(row.try_get("driver_id")?),
        program_id: ProgramId::from_uuid(row.try_get("program_id")?),
        period_key: row.try_get("period_key")?,
        amount: col_xaf(row, "amount")?,
        awarded_at: col_ts(row, "awarded_at")?,
    })
}

fn map_chat_message(row: &PgRow) -> anyhow::Result<ChatMessageRow> {
    Ok(ChatMessageRow {
        id: MessageId::from_uuid(row.try_get("id")?),
        trip_id: TripId::from_uuid(row.try_get("trip_id")?),
        from_user_id: UserId::from_uuid(row.try_get("from_user_id")?),
        text: row.try_get("text")?,
        sent_at: col_ts(row, "sent_at")?,
        read_at: col_opt_ts(row, "read_at")?,
    })
}

fn map_driver_profile(row: &PgRow) -> anyhow::Result<DriverProfileRow> {
    Ok(DriverProfileRow {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        vehicle: VehicleInfo {
            vehicle_type: col_parsed(row, "vehicle_type")?,
            plate: row.try_get("vehicle_plate")?,
            make: row.try_get("vehicle_make")?,
            model: row.try_get("vehicle_model")?,
            color: row.try_get("vehicle_color")?,
            year: row.try_get("vehicle_year")?,
            photo_url: row.try_get("vehicle_photo_url")?,
        },
        rating_avg: row.try_get("rating_avg")?,
        rating_count: row.try_get("rating_count")?,
        tier: row.try_get("tier")?,
        city: row.try_get("city")?,
    })
}

#[async_trait]
impl DbTx for PgTx {
    async fn commit(self) -> anyhow::Result<()> {
        self.tx.commit().await.context("commit failed")
    }

    async fn rollback(self) -> anyhow::Result<()> {
        self.tx.rollback().await.context("rollback failed")
    }

    async fn insert_trip(&mut self, trip: &TripRow) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO trips (id, passenger_id, driver_id, status, \
             pickup_lat, pickup_lng, pickup_address, \
             dropoff_lat, dropoff_lng, dropoff_address, route_polyline, \
             distance_m, duration_s, fare_estimate, fare_final, \
             payment_method, driver_lat_at_match, driver_lng_at_match, \
             matched_at, driver_en_route_at, driver_arrived_at, \
             trip_started_at, trip_completed_at, canceled_at, \
             cancel_reason, canceled_by, notes, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, \
             $25, $26, $27, $28)",
        )
        .bind(trip.id.as_uuid())
        .bind(trip.passenger_id.as_uuid())
        .bind(trip.driver_id.map(|id| *id.as_uuid()))
        .bind(trip.status.as_str())
        .bind(trip.pickup_lat)
        .bind(trip.pickup_lng)
        .bind(&trip.pickup_address)
        .bind(trip.dropoff_lat)
        .bind(trip.dropoff_lng)
        .bind(&trip.dropoff_address)
        .bind(&trip.route_polyline)
        .bind(trip.distance_m)
        .bind(trip.duration_s)
        .bind(trip.fare_estimate.as_i64())
        .bind(trip.fare_final.map(Xaf::as_i64))
        .bind(trip.payment_method.as_str())
        .bind(trip.driver_lat_at_match)
        .bind(trip.driver_lng_at_match)
        .bind(trip.matched_at.map(TimestampMs::as_i64))
        .bind(trip.driver_en_route_at.map(TimestampMs::as_i64))
        .bind(trip.driver_arrived_at.map(TimestampMs::as_i64))
        .bind(trip.trip_started_at.map(TimestampMs::as_i64))
        .bind(trip.trip_completed_at.map(TimestampMs::as_i64))
        .bind(trip.canceled_at.map(TimestampMs::as_i64))
        .bind(&trip.cancel_reason)
        .bind(trip.canceled_by.map(|actor| actor.as_str()))
        .bind(&trip.notes)
        .bind(trip.created_at.as_i64())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_trip(
        &mut self,
        id: TripId,
    ) -> anyhow::Result<Option<TripRow>> {
        let query =
            format!("SELECT {TRIP_COLS} FROM trips WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(map_trip).transpose()
    }

    async fn get_trip_for_update(
        &mut self,
        id: TripId,
    ) -> anyhow::Result<Option<TripRow>> {
        let query = format!(
            "SELECT {TRIP_COLS} FROM trips WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(map_trip).transpose()
    }

    async fn update_trip(&mut self, trip: &TripRow) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE trips SET driver_id = $2, status = $3, \
             fare_final = $4, driver_lat_at_match = $5, \
             driver_lng_at_match = $6, matched_at = $7, \
             driver_en_route_at = $8, driver_arrived_at = $9, \
             trip_started_at = $10, trip_completed_at = $11, \
             canceled_at = $12, cancel_reason = $13, canceled_by = $14, \
             notes = $15 \
             WHERE id = $1",
        )
        .bind(trip.id.as_uuid())
        .bind(trip.driver_id.map(|id| *id.as_uuid()))
        .bind(trip.status.as_str())
        .bind(trip.fare_final.map(Xaf::as_i64))
        .bind(trip.driver_lat_at_match)
        .bind(trip.driver_lng_at_match)
        .bind(trip.matched_at.map(TimestampMs::as_i64))
        .bind(trip.driver_en_route_at.map(TimestampMs::as_i64))
        .bind(trip.driver_arrived_at.map(TimestampMs::as_i64))
        .bind(trip.trip_started_at.map(TimestampMs::as_i64))
        .bind(trip.trip_completed_at.map(TimestampMs::as_i64))
        .bind(trip.canceled_at.map(TimestampMs::as_i64))
        .bind(&trip.cancel_reason)
        .bind(trip.canceled_by.map(|actor| actor.as_str()))
        .bind(&trip.notes)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_trip_event(
        &mut self,
        event: &TripEventRow,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO trip_events \
             (id, trip_id, event_type, performed_by, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id.as_uuid())
        .bind(event.trip_id.as_uuid())
        .bind(&event.event_type)
        .bind(event.performed_by.map(|id| *id.as_uuid()))
        .bind(&event.metadata)
        .bind(event.created_at.as_i64())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_receipt(
        &mut self,
        receipt: &ReceiptRow,
    ) -> anyhow::Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO trip_receipts (id, trip_id, driver_id, \
             passenger_id, gross_fare, commission_rate, commission_amount, \
             bonus_total, driver_net, payment_method, commission_rule_id, \
             applied_rules, status, processed_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15)",
        )
        .bind(receipt.id.as_uuid())
        .bind(receipt.trip_id.as_uuid())
        .bind(receipt.driver_id.as_uuid())
        .bind(receipt.passenger_id.as_uuid())
        .bind(receipt.gross_fare.as_i64())
        .bind(receipt.commission_rate.as_decimal())
        .bind(receipt.commission_amount.as_i64())
        .bind(receipt.bonus_total.as_i64())
        .bind(receipt.driver_net.as_i64())
        .bind(receipt.payment_method.as_str())
        .bind(receipt.commission_rule_id.map(|id| *id.as_uuid()))
        .bind(&receipt.applied_rules)
        .bind(receipt.status.as_str())
        .bind(receipt.processed_at.map(TimestampMs::as_i64))
        .bind(receipt.created_at.as_i64())
        .execute(&mut *self.tx)
        .await;
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) =>
                Ok(InsertOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_receipt_by_trip(
        &mut self,
        trip_id: TripId,
    ) -> anyhow::Result<Option<ReceiptRow>> {
        let query = format!(
            "SELECT {RECEIPT_COLS} FROM trip_receipts WHERE trip_id = $1"
        );
        let row = sqlx::query(&query)
            .bind(trip_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(map_receipt).transpose()
    }

    async fn update_receipt(
        &mut self,
        receipt: &ReceiptRow,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE trip_receipts SET gross_fare = $2, \
             commission_rate = $3, commission_amount = $4, \
             bonus_total = $5, driver_net = $6, commission_rule_id = $7, \
             applied_rules = $8, status = $9, processed_at = $10 \
             WHERE id = $1",
        )
        .bind(receipt.id.as_uuid())
        .bind(receipt.gross_fare.as_i64())
        .bind(receipt.commission_rate.as_decimal())
        .bind(receipt.commission_amount.as_i64())
        .bind(receipt.bonus_total.as_i64())
        .bind(receipt.driver_net.as_i64())
        .bind(receipt.commission_rule_id.map(|id| *id.as_uuid()))
        .bind(&receipt.applied_rules)
        .bind(receipt.status.as_str())
        .bind(receipt.processed_at.map(TimestampMs::as_i64))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_or_create_wallet(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<WalletRow> {
        sqlx::query(
            "INSERT INTO driver_wallets (driver_id) VALUES ($1) \
             ON CONFLICT (driver_id) DO NOTHING",
        )
        .bind(driver_id.as_uuid())
        .execute(&mut *self.tx)
        .await?;
        let row = sqlx::query(
            "SELECT driver_id, balance, total_earned, total_commission, \
             total_bonuses, total_payouts, last_payout_at, status \
             FROM driver_wallets WHERE driver_id = $1 FOR UPDATE",
        )
        .bind(driver_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await?;
        map_wallet(&row)
    }

    async fn update_wallet(
        &mut self,
        wallet: &WalletRow,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE driver_wallets SET balance = $2, total_earned = $3, \
             total_commission = $4, total_bonuses = $5, \
             total_payouts = $6, last_payout_at = $7, status = $8 \
             WHERE driver_id = $1",
        )
        .bind(wallet.driver_id.as_uuid())
        .bind(wallet.balance.as_i64())
        .bind(wallet.total_earned.as_i64())
        .bind(wallet.total_commission.as_i64())
        .bind(wallet.total_bonuses.as_i64())
        .bind(wallet.total_payouts.as_i64())
        .bind(wallet.last_payout_at.map(TimestampMs::as_i64))
        .bind(wallet.status.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_wallet_txn(
        &mut self,
        txn: &WalletTxnRow,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO driver_wallet_transactions (id, driver_id, \
             txn_type, amount, balance_after, description, trip_id, \
             receipt_id, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(txn.id.as_uuid())
        .bind(txn.driver_id.as_uuid())
        .bind(txn.txn_type.as_str())
        .bind(txn.amount.as_i64())
        .bind(txn.balance_after.as_i64())
        .bind(&txn.description)
        .bind(txn.trip_id.map(|id| *id.as_uuid()))
        .bind(txn.receipt_id.map(|id| *id.as_uuid()))
        .bind(&txn.metadata)
        .bind(txn.created_at.as_i64())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn load_active_rules(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<EarningRuleRow>> {
        let rows = sqlx::query(
            "SELECT id, name, rule_type, priority, rate, amount, \
             condition, applies_to, valid_from, valid_until, is_active \
             FROM earning_rules \
             WHERE is_active \
             AND (valid_from IS NULL OR valid_from <= $1) \
             AND (valid_until IS NULL OR valid_until >= $1) \
             ORDER BY priority DESC",
        )
        .bind(now.as_i64())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(map_rule).collect()
    }

    async fn load_active_programs(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<BonusProgramRow>> {
        let rows = sqlx::query(
            "SELECT id, name, granularity, metric, target_value, \
             bonus_amount, valid_from, valid_until, is_active \
             FROM bonus_programs \
             WHERE is_active \
             AND (valid_from IS NULL OR valid_from <= $1) \
             AND (valid_until IS NULL OR valid_until >= $1)",
        )
        .bind(now.as_i64())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(map_program).collect()
    }

    async fn get_award(
        &mut self,
        driver_id: UserId,
        program_id: ProgramId,
        period_key: &str,
    ) -> anyhow::Result<Option<BonusAwardRow>> {
        let row = sqlx::query(
            "SELECT id, driver_id, program_id, period_key, amount, \
             awarded_at FROM bonus_awards \
             WHERE driver_id = $1 AND program_id = $2 AND period_key = $3",
        )
        .bind(driver_id.as_uuid())
        .bind(program_id.as_uuid())
        .bind(period_key)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(map_award).transpose()
    }

    async fn insert_award(
        &mut self,
        award: &BonusAwardRow,
    ) -> anyhow::Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO bonus_awards \
             (id, driver_id, program_id, period_key, amount, awarded_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(award.id.as_uuid())
        .bind(award.driver_id.as_uuid())
        .bind(award.program_id.as_uuid())
        .bind(&award.period_key)
        .bind(award.amount.as_i64())
        .bind(award.awarded_at.as_i64())
        .execute(&mut *self.tx)
        .await;
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) =>
                Ok(InsertOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn count_trips_completed_between(
        &mut self,
        driver_id: UserId,
        from: TimestampMs,
        until: TimestampMs,
    ) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trips \
             WHERE driver_id = $1 AND status = 'COMPLETED' \
             AND trip_completed_at BETWEEN $2 AND $3",
        )
        .bind(driver_id.as_uuid())
        .bind(from.as_i64())
        .bind(until.as_i64())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn sum_driver_net_between(
        &mut self,
        driver_id: UserId,
        from: TimestampMs,
        until: TimestampMs,
    ) -> anyhow::Result<Xaf> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(driver_net), 0) FROM trip_receipts \
             WHERE driver_id = $1 AND status = 'SETTLED' \
             AND processed_at BETWEEN $2 AND $3",
        )
        .bind(driver_id.as_uuid())
        .bind(from.as_i64())
        .bind(until.as_i64())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(Xaf::new(sum))
    }

    async fn insert_rating(
        &mut self,
        rating: &RatingRow,
    ) -> anyhow::Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO ratings (id, trip_id, rated_by, rated_user, \
             rating_type, stars, comment, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(rating.id)
        .bind(rating.trip_id.as_uuid())
        .bind(rating.rated_by.as_uuid())
        .bind(rating.rated_user.as_uuid())
        .bind(rating.rating_type.as_str())
        .bind(rating.stars)
        .bind(&rating.comment)
        .bind(rating.created_at.as_i64())
        .execute(&mut *self.tx)
        .await;
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) =>
                Ok(InsertOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn driver_rating_summary(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<(Decimal, i32)> {
        let row = sqlx::query(
            "SELECT COALESCE(ROUND(AVG(stars), 2), 0) AS avg_stars, \
             COUNT(*) AS rating_count FROM ratings \
             WHERE rated_user = $1 AND rating_type = 'PASSENGER_TO_DRIVER'",
        )
        .bind(driver_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await?;
        let avg: Decimal = row.try_get("avg_stars")?;
        let count: i64 = row.try_get("rating_count")?;
        Ok((avg, count as i32))
    }

    async fn update_driver_rating(
        &mut self,
        driver_id: UserId,
        avg: Decimal,
        count: i32,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE driver_profiles SET rating_avg = $2, rating_count = $3 \
             WHERE user_id = $1",
        )
        .bind(driver_id.as_uuid())
        .bind(avg)
        .bind(count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_chat_message(
        &mut self,
        message: &ChatMessageRow,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO chat_messages \
             (id, trip_id, from_user_id, text, sent_at, read_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.id.as_uuid())
        .bind(message.trip_id.as_uuid())
        .bind(message.from_user_id.as_uuid())
        .bind(&message.text)
        .bind(message.sent_at.as_i64())
        .bind(message.read_at.map(TimestampMs::as_i64))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_chat_read(
        &mut self,
        trip_id: TripId,
        reader: UserId,
        read_at: TimestampMs,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE chat_messages SET read_at = $3 \
             WHERE trip_id = $1 AND from_user_id != $2 AND read_at IS NULL",
        )
        .bind(trip_id.as_uuid())
        .bind(reader.as_uuid())
        .bind(read_at.as_i64())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_chat_messages(
        &mut self,
        trip_id: TripId,
    ) -> anyhow::Result<Vec<ChatMessageRow>> {
        let rows = sqlx::query(
            "SELECT id, trip_id, from_user_id, text, sent_at, read_at \
             FROM chat_messages WHERE trip_id = $1 ORDER BY sent_at ASC",
        )
        .bind(trip_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(map_chat_message).collect()
    }

    async fn get_driver_profile(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<Option<DriverProfileRow>> {
        let row = sqlx::query(
            "SELECT dp.user_id, a.full_name AS name, \
             a.phone_e164 AS phone, dp.vehicle_type, dp.vehicle_plate, \
             dp.vehicle_make, dp.vehicle_model, dp.vehicle_color, \
             dp.vehicle_year, dp.vehicle_photo_url, dp.rating_avg, \
             dp.rating_count, dp.tier, dp.city \
             FROM driver_profiles dp \
             JOIN accounts a ON a.id = dp.user_id \
             WHERE dp.user_id = $1",
        )
        .bind(driver_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(map_driver_profile).transpose()
    }

    async fn get_passenger_brief(
        &mut self,
        user_id: UserId,
    ) -> anyhow::Result<Option<PassengerBrief>> {
        let row = sqlx::query(
            "SELECT id, full_name, phone_e164 FROM accounts \
             WHERE id = $1 AND account_type = 'PASSENGER'",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|row| {
            Ok::<_, anyhow::Error>(PassengerBrief {
                id: UserId::from_uuid(row.try_get("id")?),
                name: row.try_get("full_name")?,
                phone: row.try_get("phone_e164")?,
            })
        })
        .transpose()?)
    }

    async fn list_expired_pending_signups(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<PendingSignupRow>> {
        let rows = sqlx::query(
            "SELECT id, email, expires_at, artifact_urls \
             FROM pending_signups WHERE expires_at < $1",
        )
        .bind(now.as_i64())
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PendingSignupRow {
                    id: row.try_get("id")?,
                    email: row.try_get("email")?,
                    expires_at: col_ts(row, "expires_at")?,
                    artifact_urls: row.try_get("artifact_urls")?,
                })
            })
            .collect()
    }

    async fn delete_pending_signup(
        &mut self,
        id: Uuid,
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM pending_signups WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}
