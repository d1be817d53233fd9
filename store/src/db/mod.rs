//! The relational store behind domain-level transaction traits.
//!
//! Components never see SQL; they [`Db::begin`] a transaction, call domain
//! operations on the [`DbTx`], and [`DbTx::commit`]. Everything between
//! `begin` and `commit` is all-or-nothing - the earnings engine leans on
//! this for its exactly-once settlement.
//!
//! Inserts that can lose a uniqueness race ([`DbTx::insert_receipt`],
//! [`DbTx::insert_award`], [`DbTx::insert_rating`]) report
//! [`InsertOutcome::AlreadyExists`] instead of erroring, because for those
//! tables "already there" is an expected answer, not a failure.

use async_trait::async_trait;
use common::ids::{ProgramId, TripId, UserId};
use common::money::Xaf;
use common::time::TimestampMs;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    BonusAwardRow, BonusProgramRow, ChatMessageRow, DriverProfileRow,
    EarningRuleRow, PassengerBrief, PendingSignupRow, RatingRow, ReceiptRow,
    TripEventRow, TripRow, WalletRow, WalletTxnRow,
};

mod memory;
mod postgres;

pub use memory::MemoryDb;
pub use postgres::PostgresDb;

/// The result of an insert into a table with a uniqueness kill switch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[async_trait]
pub trait Db: Clone + Send + Sync + 'static {
    type Tx: DbTx;

    async fn begin(&self) -> anyhow::Result<Self::Tx>;
}

#[async_trait]
pub trait DbTx: Send {
    async fn commit(self) -> anyhow::Result<()>
    where
        Self: Sized;

    async fn rollback(self) -> anyhow::Result<()>
    where
        Self: Sized;

    // --- Trips --- //

    async fn insert_trip(&mut self, trip: &TripRow) -> anyhow::Result<()>;

    async fn get_trip(
        &mut self,
        id: TripId,
    ) -> anyhow::Result<Option<TripRow>>;

    /// `SELECT ... FOR UPDATE`: transitions on the same trip serialize here.
    async fn get_trip_for_update(
        &mut self,
        id: TripId,
    ) -> anyhow::Result<Option<TripRow>>;

    async fn update_trip(&mut self, trip: &TripRow) -> anyhow::Result<()>;

    async fn insert_trip_event(
        &mut self,
        event: &TripEventRow,
    ) -> anyhow::Result<()>;

    // --- Receipts --- //

    async fn insert_receipt(
        &mut self,
        receipt: &ReceiptRow,
    ) -> anyhow::Result<InsertOutcome>;

    async fn get_receipt_by_trip(
        &mut self,
        trip_id: TripId,
    ) -> anyhow::Result<Option<ReceiptRow>>;

    async fn update_receipt(
        &mut self,
        receipt: &ReceiptRow,
    ) -> anyhow::Result<()>;

    // --- Wallets & ledger --- //

    /// Load the driver's wallet row-locked, creating an empty active wallet
    /// on first settlement. Concurrent settlements for the same driver
    /// serialize on this lock.
    async fn get_or_create_wallet(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<WalletRow>;

    async fn update_wallet(
        &mut self,
        wallet: &WalletRow,
    ) -> anyhow::Result<()>;

    async fn insert_wallet_txn(
        &mut self,
        txn: &WalletTxnRow,
    ) -> anyhow::Result<()>;

    // --- Earning rules & bonus programs --- //

    /// Active rules valid at `now`, ordered by priority descending.
    async fn load_active_rules(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<EarningRuleRow>>;

    async fn load_active_programs(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<BonusProgramRow>>;

    async fn get_award(
        &mut self,
        driver_id: UserId,
        program_id: ProgramId,
        period_key: &str,
    ) -> anyhow::Result<Option<BonusAwardRow>>;

    async fn insert_award(
        &mut self,
        award: &BonusAwardRow,
    ) -> anyhow::Result<InsertOutcome>;

    /// COMPLETED trips for this driver with `trip_completed_at` in
    /// `[from, until]`, inclusive.
    async fn count_trips_completed_between(
        &mut self,
        driver_id: UserId,
        from: TimestampMs,
        until: TimestampMs,
    ) -> anyhow::Result<i64>;

    /// Sum of `driver_net` over SETTLED receipts with `processed_at` in
    /// `[from, until]`, inclusive.
    async fn sum_driver_net_between(
        &mut self,
        driver_id: UserId,
        from: TimestampMs,
        until: TimestampMs,
    ) -> anyhow::Result<Xaf>;

    // --- Ratings --- //

    async fn insert_rating(
        &mut self,
        rating: &RatingRow,
    ) -> anyhow::Result<InsertOutcome>;

    /// Average stars and count over PASSENGER_TO_DRIVER ratings.
    async fn driver_rating_summary(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<(Decimal, i32)>;

    async fn update_driver_rating(
        &mut self,
        driver_id: UserId,
        avg: Decimal,
        count: i32,
    ) -> anyhow::Result<()>;

    // --- Chat --- //

    async fn insert_chat_message(
        &mut self,
        message: &ChatMessageRow,
    ) -> anyhow::Result<()>;

    /// Set `read_at` on every unread message of this trip addressed to
    /// `reader` (i.e. not sent by them). Returns how many were marked.
    async fn mark_chat_read(
        &mut self,
        trip_id: TripId,
        reader: UserId,
        read_at: TimestampMs,
    ) -> anyhow::Result<u64>;

    async fn list_chat_messages(
        &mut self,
        trip_id: TripId,
    ) -> anyhow::Result<Vec<ChatMessageRow>>;

    // --- Profiles --- //

    async fn get_driver_profile(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<Option<DriverProfileRow>>;

    async fn get_passenger_brief(
        &mut self,
        user_id: UserId,
    ) -> anyhow::Result<Option<PassengerBrief>>;

    // --- Cleanup --- //

    async fn list_expired_pending_signups(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<PendingSignupRow>>;

    async fn delete_pending_signup(
        &mut self,
        id: Uuid,
    ) -> anyhow::Result<()>;
}
