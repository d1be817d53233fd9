//! An in-memory [`Db`] with transactional semantics.
//!
//! A transaction takes the whole-database lock for its lifetime and works on
//! a staged copy; `commit` swaps the copy in, `rollback` (or drop) discards
//! it. That is stricter serialization than Postgres row locks, but it
//! preserves the two properties the core's tests depend on: transactions
//! are all-or-nothing, and concurrent settlements for one driver serialize.

use async_trait::async_trait;
use common::ids::{ProgramId, TripId, UserId};
use common::money::Xaf;
use common::time::TimestampMs;
use common::trip::TripStatus;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Db, DbTx, InsertOutcome};
use crate::models::{
    BonusAwardRow, BonusProgramRow, ChatMessageRow, DriverProfileRow,
    EarningRuleRow, PassengerBrief, PendingSignupRow, RatingRow, RatingType,
    ReceiptRow, ReceiptStatus, TripEventRow, TripRow, WalletRow,
    WalletTxnRow,
};

#[derive(Clone, Default)]
struct Tables {
    trips: HashMap<TripId, TripRow>,
    trip_events: Vec<TripEventRow>,
    receipts: Vec<ReceiptRow>,
    wallets: HashMap<UserId, WalletRow>,
    wallet_txns: Vec<WalletTxnRow>,
    rules: Vec<EarningRuleRow>,
    programs: Vec<BonusProgramRow>,
    awards: Vec<BonusAwardRow>,
    ratings: Vec<RatingRow>,
    chat_messages: Vec<ChatMessageRow>,
    driver_profiles: HashMap<UserId, DriverProfileRow>,
    passengers: HashMap<UserId, PassengerBrief>,
    pending_signups: Vec<PendingSignupRow>,
}

#[derive(Clone, Default)]
pub struct MemoryDb {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Seeding (reference data normally managed by the back office) --- //

    pub async fn seed_driver(&self, profile: DriverProfileRow) {
        let mut tables = self.tables.lock().await;
        tables.driver_profiles.insert(profile.user_id, profile);
    }

    pub async fn seed_passenger(&self, brief: PassengerBrief) {
        let mut tables = self.tables.lock().await;
        tables.passengers.insert(brief.id, brief);
    }

    pub async fn seed_rule(&self, rule: EarningRuleRow) {
        self.tables.lock().await.rules.push(rule);
    }

    pub async fn seed_program(&self, program: BonusProgramRow) {
        self.tables.lock().await.programs.push(program);
    }

    pub async fn seed_pending_signup(&self, row: PendingSignupRow) {
        self.tables.lock().await.pending_signups.push(row);
    }

    // --- Inspection --- //

    pub async fn trip(&self, id: TripId) -> Option<TripRow> {
        self.tables.lock().await.trips.get(&id).cloned()
    }

    pub async fn trip_count(&self) -> usize {
        self.tables.lock().await.trips.len()
    }

    pub async fn trip_events_for(&self, id: TripId) -> Vec<TripEventRow> {
        self.tables
            .lock()
            .await
            .trip_events
            .iter()
            .filter(|event| event.trip_id == id)
            .cloned()
            .collect()
    }

    pub async fn receipts_for_trip(&self, id: TripId) -> Vec<ReceiptRow> {
        self.tables
            .lock()
            .await
            .receipts
            .iter()
            .filter(|receipt| receipt.trip_id == id)
            .cloned()
            .collect()
    }

    pub async fn wallet(&self, driver_id: UserId) -> Option<WalletRow> {
        self.tables.lock().await.wallets.get(&driver_id).cloned()
    }

    pub async fn ledger_for(&self, driver_id: UserId) -> Vec<WalletTxnRow> {
        self.tables
            .lock()
            .await
            .wallet_txns
            .iter()
            .filter(|txn| txn.driver_id == driver_id)
            .cloned()
            .collect()
    }

    pub async fn awards_for(&self, driver_id: UserId) -> Vec<BonusAwardRow> {
        self.tables
            .lock()
            .await
            .awards
            .iter()
            .filter(|award| award.driver_id == driver_id)
            .cloned()
            .collect()
    }

    pub async fn chat_messages_for(
        &self,
        trip_id: TripId,
    ) -> Vec<ChatMessageRow> {
        self.tables
            .lock()
            .await
            .chat_messages
            .iter()
            .filter(|message| message.trip_id == trip_id)
            .cloned()
            .collect()
    }

    pub async fn pending_signup_count(&self) -> usize {
        self.tables.lock().await.pending_signups.len()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl Db for MemoryDb {
    type Tx = MemoryTx;

    async fn begin(&self) -> anyhow::Result<MemoryTx> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTx { guard, staged })
    }
}

#[async_trait]
impl DbTx for MemoryTx {
    async fn commit(mut self) -> anyhow::Result<()> {
        *self.guard = self.staged;
        Ok(())
    }

    async fn rollback(self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_trip(&mut self, trip: &TripRow) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.staged.trips.contains_key(&trip.id),
            "duplicate trip id {}",
            trip.id,
        );
        self.staged.trips.insert(trip.id, trip.clone());
        Ok(())
    }

    async fn get_trip(
        &mut self,
        id: TripId,
    ) -> anyhow::Result<Option<TripRow>> {
        Ok(self.staged.trips.get(&id).cloned())
    }

    async fn get_trip_for_update(
        &mut self,
        id: TripId,
    ) -> anyhow::Result<Option<TripRow>> {
        // The whole-database lock is already held for this transaction.
        Ok(self.staged.trips.get(&id).cloned())
    }

    async fn update_trip(&mut self, trip: &TripRow) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.staged.trips.contains_key(&trip.id),
            "update of unknown trip {}",
            trip.id,
        );
        self.staged.trips.insert(trip.id, trip.clone());
        Ok(())
    }

    async fn insert_trip_event(
        &mut self,
        event: &TripEventRow,
    ) -> anyhow::Result<()> {
        self.staged.trip_events.push(event.clone());
        Ok(())
    }

    async fn insert_receipt(
        &mut self,
        receipt: &ReceiptRow,
    ) -> anyhow::Result<InsertOutcome> {
        let exists = self
            .staged
            .receipts
            .iter()
            .any(|row| row.trip_id == receipt.trip_id);
        if exists {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.staged.receipts.push(receipt.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_receipt_by_trip(
        &mut self,
        trip_id: TripId,
    ) -> anyhow::Result<Option<ReceiptRow>> {
        Ok(self
            .staged
            .receipts
            .iter()
            .find(|row| row.trip_id == trip_id)
            .cloned())
    }

    async fn update_receipt(
        &mut self,
        receipt: &ReceiptRow,
    ) -> anyhow::Result<()> {
        let slot = self
            .staged
            .receipts
            .iter_mut()
            .find(|row| row.id == receipt.id);
        match slot {
            Some(row) => {
                *row = receipt.clone();
                Ok(())
            }
            None => anyhow::bail!("update of unknown receipt {}", receipt.id),
        }
    }

    async fn get_or_create_wallet(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<WalletRow> {
        Ok(self
            .staged
            .wallets
            .entry(driver_id)
            .or_insert_with(|| WalletRow::empty(driver_id))
            .clone())
    }

    async fn update_wallet(
        &mut self,
        wallet: &WalletRow,
    ) -> anyhow::Result<()> {
        self.staged.wallets.insert(wallet.driver_id, wallet.clone());
        Ok(())
    }

    async fn insert_wallet_txn(
        &mut self,
        txn: &WalletTxnRow,
    ) -> anyhow::Result<()> {
        self.staged.wallet_txns.push(txn.clone());
        Ok(())
    }

    async fn load_active_rules(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<EarningRuleRow>> {
        let mut rules = self
            .staged
            .rules
            .iter()
            .filter(|rule| rule.is_active)
            .filter(|rule| valid_at(rule.valid_from, rule.valid_until, now))
            .cloned()
            .collect::<Vec<_>>();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn load_active_programs(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<BonusProgramRow>> {
        Ok(self
            .staged
            .programs
            .iter()
            .filter(|program| program.is_active)
            .filter(|program| {
                valid_at(program.valid_from, program.valid_until, now)
            })
            .cloned()
            .collect())
    }

    async fn get_award(
        &mut self,
        driver_id: UserId,
        program_id: ProgramId,
        period_key: &str,
    ) -> anyhow::Result<Option<BonusAwardRow>> {
        Ok(self
            .staged
            .awards
            .iter()
            .find(|award| {
                award.driver_id == driver_id
                    && award.program_id == program_id
                    && award.period_key == period_key
            })
            .cloned())
    }

    async fn insert_award(
        &mut self,
        award: &BonusAwardRow,
    ) -> anyhow::Result<InsertOutcome> {
        let exists = self.staged.awards.iter().any(|row| {
            row.driver_id == award.driver_id
                && row.program_id == award.program_id
                && row.period_key == award.period_key
        });
        if exists {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.staged.awards.push(award.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn count_trips_completed_between(
        &mut self,
        driver_id: UserId,
        from: TimestampMs,
        until: TimestampMs,
    ) -> anyhow::Result<i64> {
        Ok(self
            .staged
            .trips
            .values()
            .filter(|trip| trip.driver_id == Some(driver_id))
            .filter(|trip| trip.status == TripStatus::Completed)
            .filter(|trip| {
                trip.trip_completed_at
                    .is_some_and(|at| from <= at && at <= until)
            })
            .count() as i64)
    }

    async fn sum_driver_net_between(
        &mut self,
        driver_id: UserId,
        from: TimestampMs,
        until: TimestampMs,
    ) -> anyhow::Result<Xaf> {
        self.staged
            .receipts
            .iter()
            .filter(|receipt| receipt.driver_id == driver_id)
            .filter(|receipt| receipt.status == ReceiptStatus::Settled)
            .filter(|receipt| {
                receipt
                    .processed_at
                    .is_some_and(|at| from <= at && at <= until)
            })
            .try_fold(Xaf::ZERO, |acc, receipt| {
                acc.checked_add(receipt.driver_net)
            })
    }

    async fn insert_rating(
        &mut self,
        rating: &RatingRow,
    ) -> anyhow::Result<InsertOutcome> {
        let exists = self.staged.ratings.iter().any(|row| {
            row.trip_id == rating.trip_id && row.rated_by == rating.rated_by
        });
        if exists {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.staged.ratings.push(rating.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn driver_rating_summary(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<(Decimal, i32)> {
        let stars = self
            .staged
            .ratings
            .iter()
            .filter(|rating| rating.rated_user == driver_id)
            .filter(|rating| {
                rating.rating_type == RatingType::PassengerToDriver
            })
            .map(|rating| i64::from(rating.stars))
            .collect::<Vec<_>>();
        if stars.is_empty() {
            return Ok((Decimal::ZERO, 0));
        }
        let count = stars.len() as i32;
        let avg = Decimal::from(stars.iter().sum::<i64>())
            / Decimal::from(count);
        Ok((avg.round_dp(2), count))
    }

    async fn update_driver_rating(
        &mut self,
        driver_id: UserId,
        avg: Decimal,
        count: i32,
    ) -> anyhow::Result<()> {
        if let Some(profile) = self.staged.driver_profiles.get_mut(&driver_id)
        {
            profile.rating_avg = avg;
            profile.rating_count = count;
        }
        Ok(())
    }

    async fn insert_chat_message(
        &mut self,
        message: &ChatMessageRow,
    ) -> anyhow::Result<()> {
        self.staged.chat_messages.push(message.clone());
        Ok(())
    }

    async fn mark_chat_read(
        &mut self,
        trip_id: TripId,
        reader: UserId,
        read_at: TimestampMs,
    ) -> anyhow::Result<u64> {
        let mut marked = 0;
        for message in &mut self.staged.chat_messages {
            if message.trip_id == trip_id
                && message.from_user_id != reader
                && message.read_at.is_none()
            {
                message.read_at = Some(read_at);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn list_chat_messages(
        &mut self,
        trip_id: TripId,
    ) -> anyhow::Result<Vec<ChatMessageRow>> {
        Ok(self
            .staged
            .chat_messages
            .iter()
            .filter(|message| message.trip_id == trip_id)
            .cloned()
            .collect())
    }

    async fn get_driver_profile(
        &mut self,
        driver_id: UserId,
    ) -> anyhow::Result<Option<DriverProfileRow>> {
        Ok(self.staged.driver_profiles.get(&driver_id).cloned())
    }

    async fn get_passenger_brief(
        &mut self,
        user_id: UserId,
    ) -> anyhow::Result<Option<PassengerBrief>> {
        Ok(self.staged.passengers.get(&user_id).cloned())
    }

    async fn list_expired_pending_signups(
        &mut self,
        now: TimestampMs,
    ) -> anyhow::Result<Vec<PendingSignupRow>> {
        Ok(self
            .staged
            .pending_signups
            .iter()
            .filter(|row| row.expires_at < now)
            .cloned()
            .collect())
    }

    async fn delete_pending_signup(
        &mut self,
        id: Uuid,
    ) -> anyhow::Result<()> {
        self.staged.pending_signups.retain(|row| row.id != id);
        Ok(())
    }
}

fn valid_at(
    from: Option<TimestampMs>,
    until: Option<TimestampMs>,
    now: TimestampMs,
) -> bool {
    from.is_none_or(|from| from <= now)
        && until.is_none_or(|until| now <= until)
}

#[cfg(test)]
mod test {
    use super::*;

    fn wallet_txn(driver_id: UserId, amount: i64) -> WalletTxnRow {
        WalletTxnRow {
            id: common::ids::TxnId::generate(),
            driver_id,
            txn_type: crate::models::WalletTxnType::Adjustment,
            amount: Xaf::new(amount),
            balance_after: Xaf::new(amount),
            description: "test".to_string(),
            trip_id: None,
            receipt_id: None,
            metadata: None,
            created_at: TimestampMs::now(),
        }
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_no_rows() {
        let db = MemoryDb::new();
        let driver = UserId::generate();

        let mut tx = db.begin().await.unwrap();
        tx.insert_wallet_txn(&wallet_txn(driver, 100)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(db.ledger_for(driver).await.is_empty());

        let mut tx = db.begin().await.unwrap();
        tx.insert_wallet_txn(&wallet_txn(driver, 100)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.ledger_for(driver).await.len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_is_a_rollback() {
        let db = MemoryDb::new();
        let driver = UserId::generate();
        {
            let mut tx = db.begin().await.unwrap();
            tx.insert_wallet_txn(&wallet_txn(driver, 100)).await.unwrap();
            // Dropped without commit.
        }
        assert!(db.ledger_for(driver).await.is_empty());
    }

    #[tokio::test]
    async fn transactions_serialize() {
        let db = MemoryDb::new();
        let driver = UserId::generate();

        // A second begin() must wait for the first transaction to finish.
        let tx1 = db.begin().await.unwrap();
        let db2 = db.clone();
        let pending = tokio::spawn(async move {
            let mut tx2 = db2.begin().await.unwrap();
            let wallet = tx2.get_or_create_wallet(driver).await.unwrap();
            tx2.commit().await.unwrap();
            wallet
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        tx1.commit().await.unwrap();
        pending.await.unwrap();
    }
}
