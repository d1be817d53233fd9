//! The earnings engine: idempotent post-trip settlement.
//!
//! Invoked from the COMPLETED transition, inside the same database
//! transaction that writes `trip_completed_at`. The receipt insert is the
//! idempotency anchor: `UNIQUE (trip_id)` means a duplicate call finds the
//! settled receipt and returns `already_processed` before any ledger row
//! could be written. Everything else - commission, bonuses, wallet, quest
//! awards - only happens on the one call that owns the receipt.

pub mod quests;
pub mod rules;

use std::sync::Arc;

use chrono::Timelike;
use common::api::error::{ApiError, ApiResult};
use common::geo::Coord;
use common::ids::{ReceiptId, TripId, TxnId};
use common::money::{CommissionRate, Xaf};
use common::time::TimestampMs;
use serde::Serialize;
use store::db::{DbTx, InsertOutcome};
use store::models::{
    ReceiptRow, ReceiptStatus, RuleType, TripRow, WalletStatus, WalletTxnRow,
    WalletTxnType,
};
use tracing::{info, instrument, warn};

use self::quests::QuestAward;
use self::rules::{AppliedRule, RuleContext};
use crate::config::DispatchConfig;

/// What one settlement did (or found already done).
#[derive(Clone, Debug, Serialize)]
pub struct SettlementOutcome {
    pub receipt_id: ReceiptId,
    pub trip_id: TripId,
    pub gross_fare: Xaf,
    pub commission_rate: CommissionRate,
    pub commission_amount: Xaf,
    pub bonus_total: Xaf,
    pub driver_net: Xaf,
    pub quest_awards: Vec<QuestAward>,
    pub already_processed: bool,
}

impl SettlementOutcome {
    fn from_settled(receipt: &ReceiptRow) -> Self {
        Self {
            receipt_id: receipt.id,
            trip_id: receipt.trip_id,
            gross_fare: receipt.gross_fare,
            commission_rate: receipt.commission_rate,
            commission_amount: receipt.commission_amount,
            bonus_total: receipt.bonus_total,
            driver_net: receipt.driver_net,
            quest_awards: Vec::new(),
            already_processed: true,
        }
    }
}

/// See the module docs.
#[derive(Clone)]
pub struct EarningsEngine {
    config: Arc<DispatchConfig>,
}

impl EarningsEngine {
    pub fn new(config: Arc<DispatchConfig>) -> Self {
        Self { config }
    }

    /// Settle a completed trip inside the caller's transaction.
    #[instrument(skip(self, tx, trip), fields(trip_id = %trip.id))]
    pub async fn settle<T: DbTx>(
        &self,
        tx: &mut T,
        trip: &TripRow,
        now: TimestampMs,
    ) -> ApiResult<SettlementOutcome> {
        let driver_id = trip.driver_id.ok_or_else(|| {
            ApiError::from(anyhow::anyhow!(
                "settling trip {} without a driver",
                trip.id
            ))
        })?;
        let gross_fare = trip.fare_final.unwrap_or(trip.fare_estimate);

        // Step 1: claim the receipt. Exactly one settlement per trip ever
        // gets past this point with a receipt that is not yet settled.
        let pending = ReceiptRow {
            id: ReceiptId::generate(),
            trip_id: trip.id,
            driver_id,
            passenger_id: trip.passenger_id,
            gross_fare,
            commission_rate: self.config.default_commission,
            commission_amount: Xaf::ZERO,
            bonus_total: Xaf::ZERO,
            driver_net: Xaf::ZERO,
            payment_method: trip.payment_method,
            commission_rule_id: None,
            applied_rules: serde_json::json!([]),
            status: ReceiptStatus::Pending,
            processed_at: None,
            created_at: now,
        };
        let mut receipt = match tx.insert_receipt(&pending).await? {
            InsertOutcome::Inserted => pending,
            InsertOutcome::AlreadyExists => {
                let existing = tx
                    .get_receipt_by_trip(trip.id)
                    .await?
                    .ok_or_else(|| {
                        ApiError::from(anyhow::anyhow!(
                            "receipt unique hit but row missing for {}",
                            trip.id
                        ))
                    })?;
                if existing.status != ReceiptStatus::Pending {
                    info!(trip_id = %trip.id, "settlement already processed");
                    return Ok(SettlementOutcome::from_settled(&existing));
                }
                // A PENDING receipt means a previous attempt died between
                // claiming and settling; finish its work under its id.
                warn!(trip_id = %trip.id, "resuming pending settlement");
                existing
            }
        };

        // The wallet row lock is what serializes two settlements for the
        // same driver completing at the same moment.
        let mut wallet = tx.get_or_create_wallet(driver_id).await?;
        if wallet.status != WalletStatus::Active {
            return Err(ApiError::precondition(format!(
                "driver wallet is {}",
                wallet.status,
            )));
        }

        // Steps 2-3: rule evaluation context and the active rule set.
        let profile = tx.get_driver_profile(driver_id).await?;
        let ctx = RuleContext {
            fare: gross_fare,
            city: profile
                .as_ref()
                .and_then(|p| p.city.clone())
                .or_else(|| Some(self.config.default_city.clone())),
            hour: {
                let local = now.to_offset(self.config.tz_offset);
                local.hour() as u8
            },
            weekday: {
                use chrono::Datelike;
                let local = now.to_offset(self.config.tz_offset);
                local.weekday().number_from_monday() as u8
            },
            distance_m: trip.distance_m.max(0) as u32,
            payment_method: trip.payment_method,
            driver_tier: profile.as_ref().and_then(|p| p.tier.clone()),
            pickup: Coord::new(trip.pickup_lat, trip.pickup_lng)
                .map_err(ApiError::from)?,
        };
        let rule_rows = tx.load_active_rules(now).await?;

        // Steps 4-6: one commission rule (or the default), summed bonuses.
        let mut snapshot = Vec::with_capacity(rule_rows.len());
        let mut commission_rate = self.config.default_commission;
        let mut commission_rule_id = None;
        let mut bonus_total = Xaf::ZERO;

        for rule in &rule_rows {
            use store::models::RuleAppliesTo::*;
            let applies = matches!(rule.applies_to, Ride | All);
            let matched = applies && rules::matches(&rule.condition, &ctx);
            let mut entry = AppliedRule {
                rule_id: rule.id,
                name: rule.name.clone(),
                rule_type: rule.rule_type,
                priority: rule.priority,
                matched,
                selected: false,
                contribution_xaf: None,
            };
            if matched {
                match rule.rule_type {
                    RuleType::CommissionPercent => {
                        // Rules arrive priority-descending; the first
                        // match wins.
                        if commission_rule_id.is_none() {
                            let rate = rule.rate.ok_or_else(|| {
                                ApiError::from(anyhow::anyhow!(
                                    "commission rule {} has no rate",
                                    rule.id
                                ))
                            })?;
                            commission_rate = CommissionRate::new(rate)
                                .map_err(ApiError::from)?;
                            commission_rule_id = Some(rule.id);
                            entry.selected = true;
                        }
                    }
                    RuleType::BonusFlat => {
                        let amount = rule.amount.unwrap_or(Xaf::ZERO);
                        bonus_total = bonus_total.checked_add(amount)?;
                        entry.contribution_xaf = Some(amount.as_i64());
                    }
                    RuleType::BonusMultiplier => {
                        let factor = rule
                            .rate
                            .unwrap_or(rust_decimal::Decimal::ONE);
                        let extra = gross_fare.mul_decimal(
                            factor - rust_decimal::Decimal::ONE,
                        )?;
                        bonus_total = bonus_total.checked_add(extra)?;
                        entry.contribution_xaf = Some(extra.as_i64());
                    }
                    RuleType::Penalty => {
                        let amount = rule.amount.unwrap_or(Xaf::ZERO);
                        bonus_total = bonus_total.checked_sub(amount)?;
                        entry.contribution_xaf = Some(-amount.as_i64());
                    }
                }
            }
            snapshot.push(entry);
        }

        let commission_amount = gross_fare.mul_rate(commission_rate)?;
        let driver_net = gross_fare
            .checked_sub(commission_amount)?
            .checked_add(bonus_total)?;

        // Step 7: the ledger, in order, each entry carrying the balance
        // it produced.
        let post = |txn_type: WalletTxnType,
                        amount: Xaf,
                        description: &str,
                        balance_after: Xaf| {
            WalletTxnRow {
                id: TxnId::generate(),
                driver_id,
                txn_type,
                amount,
                balance_after,
                description: description.to_string(),
                trip_id: Some(trip.id),
                receipt_id: Some(receipt.id),
                metadata: None,
                created_at: now,
            }
        };

        wallet.balance = wallet.balance.checked_add(gross_fare)?;
        tx.insert_wallet_txn(&post(
            WalletTxnType::TripFare,
            gross_fare,
            "Trip fare",
            wallet.balance,
        ))
        .await?;

        wallet.balance = wallet.balance.checked_sub(commission_amount)?;
        tx.insert_wallet_txn(&post(
            WalletTxnType::Commission,
            commission_amount.negated(),
            "Platform commission",
            wallet.balance,
        ))
        .await?;

        if bonus_total.is_positive() {
            wallet.balance = wallet.balance.checked_add(bonus_total)?;
            tx.insert_wallet_txn(&post(
                WalletTxnType::BonusTrip,
                bonus_total,
                "Trip bonuses",
                wallet.balance,
            ))
            .await?;
        } else if bonus_total.is_negative() {
            wallet.balance = wallet.balance.checked_add(bonus_total)?;
            tx.insert_wallet_txn(&post(
                WalletTxnType::Adjustment,
                bonus_total,
                "Earning penalties",
                wallet.balance,
            ))
            .await?;
        }

        // Step 8: wallet totals.
        wallet.total_earned = wallet.total_earned.checked_add(gross_fare)?;
        wallet.total_commission =
            wallet.total_commission.checked_add(commission_amount)?;
        wallet.total_bonuses =
            wallet.total_bonuses.checked_add(bonus_total)?;

        // Step 9: quests, which may append further ledger entries.
        let quest_awards = quests::evaluate(
            tx,
            self.config.tz_offset,
            driver_id,
            trip.id,
            receipt.id,
            now,
            driver_net,
            &mut wallet,
        )
        .await?;

        tx.update_wallet(&wallet).await?;

        // Step 10: the receipt becomes the settled record of all of this.
        receipt.gross_fare = gross_fare;
        receipt.commission_rate = commission_rate;
        receipt.commission_amount = commission_amount;
        receipt.bonus_total = bonus_total;
        receipt.driver_net = driver_net;
        receipt.commission_rule_id = commission_rule_id;
        receipt.applied_rules =
            serde_json::to_value(&snapshot).map_err(anyhow::Error::from)?;
        receipt.status = ReceiptStatus::Settled;
        receipt.processed_at = Some(now);
        tx.update_receipt(&receipt).await?;

        info!(
            trip_id = %trip.id,
            %driver_id,
            gross = %gross_fare,
            commission = %commission_amount,
            bonus = %bonus_total,
            net = %driver_net,
            quests = quest_awards.len(),
            "settlement complete"
        );
        Ok(SettlementOutcome {
            receipt_id: receipt.id,
            trip_id: trip.id,
            gross_fare,
            commission_rate,
            commission_amount,
            bonus_total,
            driver_net,
            quest_awards,
            already_processed: false,
        })
    }
}

#[cfg(test)]
mod test {
    use common::ids::{RuleId, TripId, UserId};
    use common::trip::{PaymentMethod, TripStatus};
    use rust_decimal_macros::dec;
    use store::db::{Db, MemoryDb};
    use store::models::{EarningRuleRow, RuleAppliesTo, RuleCondition};

    use super::*;

    fn completed_trip(driver_id: UserId, fare: i64) -> TripRow {
        let now = TimestampMs::now();
        TripRow {
            id: TripId::generate(),
            passenger_id: UserId::generate(),
            driver_id: Some(driver_id),
            status: TripStatus::Completed,
            pickup_lat: 4.0511,
            pickup_lng: 9.7679,
            pickup_address: "Akwa".to_string(),
            dropoff_lat: 4.0601,
            dropoff_lng: 9.7700,
            dropoff_address: "Bonanjo".to_string(),
            route_polyline: None,
            distance_m: 1500,
            duration_s: 420,
            fare_estimate: Xaf::new(fare),
            fare_final: Some(Xaf::new(fare)),
            payment_method: PaymentMethod::Cash,
            driver_lat_at_match: None,
            driver_lng_at_match: None,
            matched_at: Some(now),
            driver_en_route_at: None,
            driver_arrived_at: None,
            trip_started_at: Some(now),
            trip_completed_at: Some(now),
            canceled_at: None,
            cancel_reason: None,
            canceled_by: None,
            notes: None,
            created_at: now,
        }
    }

    fn rule(
        rule_type: RuleType,
        priority: i32,
        rate: Option<rust_decimal::Decimal>,
        amount: Option<Xaf>,
    ) -> EarningRuleRow {
        EarningRuleRow {
            id: RuleId::generate(),
            name: format!("{rule_type} p{priority}"),
            rule_type,
            priority,
            rate,
            amount,
            condition: RuleCondition::default(),
            applies_to: RuleAppliesTo::All,
            valid_from: None,
            valid_until: None,
            is_active: true,
        }
    }

    async fn settle_once(
        db: &MemoryDb,
        trip: &TripRow,
    ) -> SettlementOutcome {
        let engine = EarningsEngine::new(std::sync::Arc::new(
            crate::config::DispatchConfig::default(),
        ));
        let mut tx = db.begin().await.unwrap();
        tx.insert_trip(trip).await.ok();
        let outcome = engine
            .settle(&mut tx, trip, TimestampMs::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn multiplier_and_penalty_fold_into_bonus_total() {
        let db = MemoryDb::new();
        db.seed_rule(rule(
            RuleType::CommissionPercent,
            10,
            Some(dec!(0.10)),
            None,
        ))
        .await;
        // 1.2x multiplier adds 20% of the fare; the penalty takes 200 off.
        db.seed_rule(rule(
            RuleType::BonusMultiplier,
            5,
            Some(dec!(1.2)),
            None,
        ))
        .await;
        db.seed_rule(rule(RuleType::Penalty, 4, None, Some(Xaf::new(200))))
            .await;
        db.seed_rule(rule(
            RuleType::BonusFlat,
            3,
            None,
            Some(Xaf::new(100)),
        ))
        .await;

        let driver = UserId::generate();
        let trip = completed_trip(driver, 3000);
        let outcome = settle_once(&db, &trip).await;

        // 600 multiplier + 100 flat - 200 penalty.
        assert_eq!(outcome.bonus_total, Xaf::new(500));
        assert_eq!(outcome.commission_amount, Xaf::new(300));
        assert_eq!(outcome.driver_net, Xaf::new(3200));

        let ledger = db.ledger_for(driver).await;
        let bonus = ledger
            .iter()
            .find(|txn| txn.txn_type == WalletTxnType::BonusTrip)
            .expect("bonus entry");
        assert_eq!(bonus.amount, Xaf::new(500));
    }

    #[tokio::test]
    async fn net_penalty_posts_as_adjustment() {
        let db = MemoryDb::new();
        db.seed_rule(rule(RuleType::Penalty, 4, None, Some(Xaf::new(250))))
            .await;
        let driver = UserId::generate();
        let trip = completed_trip(driver, 1000);
        let outcome = settle_once(&db, &trip).await;

        assert_eq!(outcome.bonus_total, Xaf::new(-250));
        // 1000 - 150 default commission - 250 penalty.
        assert_eq!(outcome.driver_net, Xaf::new(600));
        let ledger = db.ledger_for(driver).await;
        assert!(ledger
            .iter()
            .any(|txn| txn.txn_type == WalletTxnType::Adjustment
                && txn.amount == Xaf::new(-250)));
        assert!(!ledger
            .iter()
            .any(|txn| txn.txn_type == WalletTxnType::BonusTrip));
    }

    #[tokio::test]
    async fn pending_receipt_is_resumed_not_duplicated() {
        let db = MemoryDb::new();
        let driver = UserId::generate();
        let trip = completed_trip(driver, 2000);

        // A previous attempt claimed the receipt and died before settling:
        // simulate by inserting the pending receipt it left behind.
        {
            let mut tx = db.begin().await.unwrap();
            tx.insert_trip(&trip).await.unwrap();
            tx.insert_receipt(&ReceiptRow {
                id: ReceiptId::generate(),
                trip_id: trip.id,
                driver_id: driver,
                passenger_id: trip.passenger_id,
                gross_fare: Xaf::new(2000),
                commission_rate:
                    common::money::CommissionRate::DEFAULT,
                commission_amount: Xaf::ZERO,
                bonus_total: Xaf::ZERO,
                driver_net: Xaf::ZERO,
                payment_method: PaymentMethod::Cash,
                commission_rule_id: None,
                applied_rules: serde_json::json!([]),
                status: ReceiptStatus::Pending,
                processed_at: None,
                created_at: TimestampMs::now(),
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let engine = EarningsEngine::new(std::sync::Arc::new(
            crate::config::DispatchConfig::default(),
        ));
        let mut tx = db.begin().await.unwrap();
        let outcome = engine
            .settle(&mut tx, &trip, TimestampMs::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(!outcome.already_processed);
        assert_eq!(db.receipts_for_trip(trip.id).await.len(), 1);
        assert_eq!(
            db.receipts_for_trip(trip.id).await[0].status,
            ReceiptStatus::Settled,
        );
        assert_eq!(db.ledger_for(driver).await.len(), 2);
    }
}
