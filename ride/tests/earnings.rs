//! Settlement scenarios: commission, idempotency, quests, and the ledger
//! invariant.

mod support;

use common::ids::{ProgramId, RuleId, TripId, UserId};
use common::money::Xaf;
use common::time::{
    default_tz_offset, period_key, PeriodGranularity, TimestampMs,
};
use common::trip::{PaymentMethod, TripStatus};
use rust_decimal::Decimal;
use store::db::{Db, DbTx};
use store::models::{
    BonusProgramRow, EarningRuleRow, QuestMetric, ReceiptStatus,
    RuleAppliesTo, RuleCondition, RuleType, TripRow, WalletTxnType,
};
use support::{assert_ledger_invariant, douala_request, Harness};

fn commission_rule(rate: &str, priority: i32) -> EarningRuleRow {
    EarningRuleRow {
        id: RuleId::generate(),
        name: format!("commission {rate}"),
        rule_type: RuleType::CommissionPercent,
        priority,
        rate: Some(rate.parse::<Decimal>().unwrap()),
        amount: None,
        condition: RuleCondition::default(),
        applies_to: RuleAppliesTo::Ride,
        valid_from: None,
        valid_until: None,
        is_active: true,
    }
}

fn daily_trips_program(target: i64, bonus: i64) -> BonusProgramRow {
    BonusProgramRow {
        id: ProgramId::generate(),
        name: "Daily grind".to_string(),
        granularity: PeriodGranularity::Daily,
        metric: QuestMetric::TripCount,
        target_value: target,
        bonus_amount: Xaf::new(bonus),
        valid_from: None,
        valid_until: None,
        is_active: true,
    }
}

/// Drive one trip from request to completion and return its id.
async fn completed_trip(
    h: &Harness,
    passenger: UserId,
    driver: UserId,
    final_fare: i64,
) -> TripId {
    let record = h
        .dispatcher
        .request_trip(passenger, douala_request())
        .await
        .unwrap();
    h.dispatcher.accept(driver, record.id).await.unwrap();
    h.trips.driver_arrived(driver, record.id).await.unwrap();
    h.trips.start_trip(driver, record.id).await.unwrap();
    h.trips
        .complete_trip(driver, record.id, Some(Xaf::new(final_fare)), None)
        .await
        .unwrap();
    record.id
}

/// A pre-existing completed trip row, for seeding quest progress without
/// running the whole flow.
async fn seed_completed_trip_row(
    h: &Harness,
    passenger: UserId,
    driver: UserId,
) {
    let now = TimestampMs::now();
    let row = TripRow {
        id: TripId::generate(),
        passenger_id: passenger,
        driver_id: Some(driver),
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
        fare_estimate: Xaf::new(1000),
        fare_final: Some(Xaf::new(1000)),
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
    };
    let mut tx = h.db.begin().await.unwrap();
    tx.insert_trip(&row).await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn complete_and_settle_with_ten_percent_commission() {
    let h = Harness::new();
    h.db.seed_rule(commission_rule("0.10", 10)).await;
    let passenger = h.seed_passenger().await;
    let driver = h.driver_online_nearby().await;

    let record = h
        .dispatcher
        .request_trip(passenger, douala_request())
        .await
        .unwrap();
    h.dispatcher.accept(driver, record.id).await.unwrap();
    h.trips.driver_arrived(driver, record.id).await.unwrap();
    h.trips.start_trip(driver, record.id).await.unwrap();
    let outcome = h
        .trips
        .complete_trip(driver, record.id, Some(Xaf::new(3000)), None)
        .await
        .unwrap();

    assert!(!outcome.already_processed);
    assert_eq!(outcome.gross_fare, Xaf::new(3000));
    assert_eq!(outcome.commission_amount, Xaf::new(300));
    assert_eq!(outcome.bonus_total, Xaf::ZERO);
    assert_eq!(outcome.driver_net, Xaf::new(2700));

    let receipts = h.db.receipts_for_trip(record.id).await;
    assert_eq!(receipts.len(), 1);
    let receipt = &receipts[0];
    assert_eq!(receipt.status, ReceiptStatus::Settled);
    assert_eq!(receipt.gross_fare, Xaf::new(3000));
    assert_eq!(receipt.commission_amount, Xaf::new(300));
    assert_eq!(receipt.driver_net, Xaf::new(2700));
    assert!(receipt.processed_at.is_some());
    assert!(receipt.commission_rule_id.is_some());
    // Every evaluated rule is in the audit snapshot.
    assert_eq!(receipt.applied_rules.as_array().unwrap().len(), 1);

    // The ledger: +3000 fare, -300 commission, nothing else.
    let ledger = h.db.ledger_for(driver).await;
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].txn_type, WalletTxnType::TripFare);
    assert_eq!(ledger[0].amount, Xaf::new(3000));
    assert_eq!(ledger[0].balance_after, Xaf::new(3000));
    assert_eq!(ledger[1].txn_type, WalletTxnType::Commission);
    assert_eq!(ledger[1].amount, Xaf::new(-300));
    assert_eq!(ledger[1].balance_after, Xaf::new(2700));

    let wallet = h.db.wallet(driver).await.unwrap();
    assert_eq!(wallet.balance, Xaf::new(2700));
    assert_eq!(wallet.total_earned, Xaf::new(3000));
    assert_eq!(wallet.total_commission, Xaf::new(300));
    assert_eq!(wallet.total_bonuses, Xaf::ZERO);
    assert_ledger_invariant(&h.db, driver).await;

    // Completing again: alreadyProcessed, and not one row more anywhere.
    let again = h
        .trips
        .complete_trip(driver, record.id, Some(Xaf::new(3000)), None)
        .await
        .unwrap();
    assert!(again.already_processed);
    assert_eq!(again.driver_net, Xaf::new(2700));
    assert_eq!(h.db.ledger_for(driver).await.len(), 2);
    assert_eq!(h.db.receipts_for_trip(record.id).await.len(), 1);
    assert_eq!(h.db.wallet(driver).await.unwrap().balance, Xaf::new(2700));
}

#[tokio::test(start_paused = true)]
async fn default_commission_applies_without_rules() {
    let h = Harness::new();
    let passenger = h.seed_passenger().await;
    let driver = h.driver_online_nearby().await;

    completed_trip(&h, passenger, driver, 2000).await;
    let wallet = h.db.wallet(driver).await.unwrap();
    // 2000 - 15% = 1700.
    assert_eq!(wallet.balance, Xaf::new(1700));
    assert_eq!(wallet.total_commission, Xaf::new(300));
    assert_ledger_invariant(&h.db, driver).await;
}

#[tokio::test(start_paused = true)]
async fn highest_priority_commission_rule_wins() {
    let h = Harness::new();
    h.db.seed_rule(commission_rule("0.20", 1)).await;
    h.db.seed_rule(commission_rule("0.10", 100)).await;
    let passenger = h.seed_passenger().await;
    let driver = h.driver_online_nearby().await;

    completed_trip(&h, passenger, driver, 1000).await;
    let wallet = h.db.wallet(driver).await.unwrap();
    assert_eq!(wallet.total_commission, Xaf::new(100));
}

#[tokio::test(start_paused = true)]
async fn tenth_trip_of_the_day_crosses_the_quest() {
    let h = Harness::new();
    h.db.seed_rule(commission_rule("0.10", 10)).await;
    h.db.seed_program(daily_trips_program(10, 500)).await;
    let passenger = h.seed_passenger().await;
    let driver = h.driver_online_nearby().await;

    for _ in 0..9 {
        seed_completed_trip_row(&h, passenger, driver).await;
    }

    // The 10th trip crosses the threshold.
    let trip_id = completed_trip(&h, passenger, driver, 3000).await;

    let awards = h.db.awards_for(driver).await;
    assert_eq!(awards.len(), 1);
    let expected_key = period_key(
        PeriodGranularity::Daily,
        TimestampMs::now(),
        default_tz_offset(),
    );
    assert_eq!(awards[0].period_key, expected_key);
    assert_eq!(awards[0].amount, Xaf::new(500));

    let ledger = h.db.ledger_for(driver).await;
    let quest_entries: Vec<_> = ledger
        .iter()
        .filter(|txn| txn.txn_type == WalletTxnType::BonusQuest)
        .collect();
    assert_eq!(quest_entries.len(), 1);
    assert_eq!(quest_entries[0].amount, Xaf::new(500));
    assert_eq!(quest_entries[0].trip_id, Some(trip_id));

    // Balance delta from this trip = driver net + quest bonus.
    let wallet = h.db.wallet(driver).await.unwrap();
    assert_eq!(wallet.balance, Xaf::new(2700 + 500));
    assert_ledger_invariant(&h.db, driver).await;

    // An 11th trip the same day does not award again.
    let _ = completed_trip(&h, passenger, driver, 3000).await;
    assert_eq!(h.db.awards_for(driver).await.len(), 1);
    let wallet = h.db.wallet(driver).await.unwrap();
    assert_eq!(wallet.balance, Xaf::new(2700 + 500 + 2700));
    assert_ledger_invariant(&h.db, driver).await;
}

#[tokio::test(start_paused = true)]
async fn ledger_stays_consistent_across_many_trips() {
    let h = Harness::new();
    h.db.seed_rule(commission_rule("0.10", 10)).await;
    let passenger = h.seed_passenger().await;
    let driver = h.driver_online_nearby().await;

    for fare in [1000, 2500, 3000] {
        completed_trip(&h, passenger, driver, fare).await;
        assert_ledger_invariant(&h.db, driver).await;
    }
    let wallet = h.db.wallet(driver).await.unwrap();
    assert_eq!(wallet.total_earned, Xaf::new(6500));
    assert_eq!(wallet.total_commission, Xaf::new(650));
    assert_eq!(wallet.balance, Xaf::new(5850));

    // Ledger entries for each trip are contiguous and ordered.
    let ledger = h.db.ledger_for(driver).await;
    assert_eq!(ledger.len(), 6);
    for pair in ledger.chunks(2) {
        assert_eq!(pair[0].txn_type, WalletTxnType::TripFare);
        assert_eq!(pair[1].txn_type, WalletTxnType::Commission);
        assert_eq!(pair[0].trip_id, pair[1].trip_id);
    }
}

#[tokio::test(start_paused = true)]
async fn ratings_are_unique_per_trip_and_rater() {
    let h = Harness::new();
    let passenger = h.seed_passenger().await;
    let driver = h.driver_online_nearby().await;
    let trip_id = completed_trip(&h, passenger, driver, 2000).await;

    h.ratings
        .submit(passenger, trip_id, 5, Some("nickel".into()))
        .await
        .unwrap();
    let err = h
        .ratings
        .submit(passenger, trip_id, 1, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, common::api::error::ErrorKind::Conflict);

    // The driver rates back; both directions coexist on one trip.
    h.ratings.submit(driver, trip_id, 4, None).await.unwrap();

    // The materialised average refreshed from the rating rows.
    let mut tx = h.db.begin().await.unwrap();
    let profile = tx.get_driver_profile(driver).await.unwrap().unwrap();
    tx.commit().await.unwrap();
    assert_eq!(profile.rating_avg, Decimal::new(500, 2));
    assert_eq!(profile.rating_count, 1);
}
