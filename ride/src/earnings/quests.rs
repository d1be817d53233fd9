//! Bonus-program (quest) evaluation, run as the tail of every settlement.
//!
//! The period key is the idempotency anchor: one award per
//! (driver, program, period key), enforced by the table's UNIQUE
//! constraint even if two settlements race past the existence check.

use chrono::FixedOffset;
use common::api::error::ApiResult;
use common::ids::{AwardId, ReceiptId, TripId, TxnId, UserId};
use common::money::Xaf;
use common::time::{period_key, period_start, TimestampMs};
use serde::Serialize;
use store::db::{DbTx, InsertOutcome};
use store::models::{
    BonusAwardRow, BonusProgramRow, QuestMetric, WalletRow, WalletTxnRow,
    WalletTxnType,
};
use tracing::{debug, info};

/// A quest crossed its threshold during this settlement.
#[derive(Clone, Debug, Serialize)]
pub struct QuestAward {
    pub program_id: common::ids::ProgramId,
    pub program_name: String,
    pub period_key: String,
    pub amount: Xaf,
}

/// Check every active program for this driver and award those whose
/// threshold the just-completed trip crossed. Appends BONUS_QUEST ledger
/// entries and bumps `wallet` in place; the caller persists the wallet.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn evaluate<T: DbTx>(
    tx: &mut T,
    tz_offset: FixedOffset,
    driver_id: UserId,
    trip_id: TripId,
    receipt_id: ReceiptId,
    now: TimestampMs,
    current_trip_net: Xaf,
    wallet: &mut WalletRow,
) -> ApiResult<Vec<QuestAward>> {
    let programs = tx.load_active_programs(now).await?;
    let mut awards = Vec::new();

    for program in programs {
        let key = period_key(program.granularity, now, tz_offset);
        if tx.get_award(driver_id, program.id, &key).await?.is_some() {
            continue;
        }

        let metric =
            measure(tx, &program, driver_id, now, tz_offset, current_trip_net)
                .await?;
        if metric < program.target_value {
            debug!(
                %driver_id,
                program = %program.name,
                metric,
                target = program.target_value,
                "quest below threshold"
            );
            continue;
        }

        let award = BonusAwardRow {
            id: AwardId::generate(),
            driver_id,
            program_id: program.id,
            period_key: key.clone(),
            amount: program.bonus_amount,
            awarded_at: now,
        };
        // A racing settlement may have inserted the same (driver, program,
        // period) a moment ago; the constraint decides.
        if tx.insert_award(&award).await? == InsertOutcome::AlreadyExists {
            continue;
        }

        wallet.balance = wallet.balance.checked_add(program.bonus_amount)?;
        wallet.total_bonuses =
            wallet.total_bonuses.checked_add(program.bonus_amount)?;
        tx.insert_wallet_txn(&WalletTxnRow {
            id: TxnId::generate(),
            driver_id,
            txn_type: WalletTxnType::BonusQuest,
            amount: program.bonus_amount,
            balance_after: wallet.balance,
            description: format!("Quest bonus: {}", program.name),
            trip_id: Some(trip_id),
            receipt_id: Some(receipt_id),
            metadata: Some(serde_json::json!({
                "program_id": program.id,
                "period_key": key,
                "metric": metric,
            })),
            created_at: now,
        })
        .await?;

        info!(
            %driver_id,
            program = %program.name,
            period_key = %key,
            amount = %program.bonus_amount,
            "quest awarded"
        );
        awards.push(QuestAward {
            program_id: program.id,
            program_name: program.name,
            period_key: key,
            amount: program.bonus_amount,
        });
    }
    Ok(awards)
}

/// The driver's progress on a program's metric within the current period,
/// including the trip being settled.
async fn measure<T: DbTx>(
    tx: &mut T,
    program: &BonusProgramRow,
    driver_id: UserId,
    now: TimestampMs,
    tz_offset: FixedOffset,
    current_trip_net: Xaf,
) -> ApiResult<i64> {
    let from = period_start(program.granularity, now, tz_offset);
    match program.metric {
        // The completed transition is already written in this transaction,
        // so the count includes the current trip.
        QuestMetric::TripCount => Ok(tx
            .count_trips_completed_between(driver_id, from, now)
            .await?),
        // The current receipt is not yet SETTLED at this point; add its
        // net explicitly.
        QuestMetric::Earnings => {
            let settled =
                tx.sum_driver_net_between(driver_id, from, now).await?;
            Ok(settled.checked_add(current_trip_net)?.as_i64())
        }
    }
}
