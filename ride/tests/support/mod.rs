//! Shared harness for the dispatch integration tests: in-memory stores, a
//! recording sink, and seeded Douala fixtures.

#![allow(dead_code)]

use std::sync::Arc;

use common::api::models::TripRequest;
use common::geo::Coord;
use common::ids::UserId;
use common::money::Xaf;
use common::trip::{PaymentMethod, Place};
use common::user::{VehicleInfo, VehicleType};
use ride::chat::ChatService;
use ride::config::DispatchConfig;
use ride::dispatch::Dispatcher;
use ride::events::RecordingSink;
use ride::presence::Presence;
use ride::ratings::RatingService;
use ride::trips::TripManager;
use rust_decimal::Decimal;
use store::db::MemoryDb;
use store::kv::MemoryKv;
use store::models::{DriverProfileRow, PassengerBrief};

pub struct Harness {
    pub kv: MemoryKv,
    pub db: MemoryDb,
    pub sink: RecordingSink,
    pub presence: Presence<MemoryKv, RecordingSink>,
    pub dispatcher: Dispatcher<MemoryKv, MemoryDb, RecordingSink>,
    pub trips: TripManager<MemoryKv, MemoryDb, RecordingSink>,
    pub chat: ChatService<MemoryKv, MemoryDb, RecordingSink>,
    pub ratings: RatingService<MemoryDb>,
    pub config: Arc<DispatchConfig>,
}

impl Harness {
    pub fn new() -> Self {
        let kv = MemoryKv::new();
        let db = MemoryDb::new();
        let sink = RecordingSink::new();
        let config = Arc::new(DispatchConfig::default());
        let presence = Presence::new(kv.clone(), sink.clone());
        let dispatcher = Dispatcher::new(
            kv.clone(),
            db.clone(),
            presence.clone(),
            sink.clone(),
            Arc::clone(&config),
        );
        let trips = TripManager::new(
            kv.clone(),
            db.clone(),
            sink.clone(),
            Arc::clone(&config),
        );
        let chat = ChatService::new(kv.clone(), db.clone(), sink.clone());
        let ratings = RatingService::new(db.clone());
        Self {
            kv,
            db,
            sink,
            presence,
            dispatcher,
            trips,
            chat,
            ratings,
            config,
        }
    }

    pub async fn seed_passenger(&self) -> UserId {
        let id = UserId::generate();
        self.db
            .seed_passenger(PassengerBrief {
                id,
                name: "Marie Ngo".to_string(),
                phone: "+237690000001".to_string(),
            })
            .await;
        id
    }

    pub async fn seed_driver(&self) -> UserId {
        let id = UserId::generate();
        self.db
            .seed_driver(DriverProfileRow {
                user_id: id,
                name: "Jean-Pierre Kamga".to_string(),
                phone: "+237650000001".to_string(),
                vehicle: VehicleInfo {
                    vehicle_type: VehicleType::Economy,
                    plate: format!("LT-{}-AB", &id.to_string()[..4]),
                    make: "Toyota".to_string(),
                    model: "Corolla".to_string(),
                    color: "Blue".to_string(),
                    year: 2018,
                    photo_url: None,
                },
                rating_avg: Decimal::new(480, 2),
                rating_count: 25,
                tier: Some("gold".to_string()),
                city: Some("Douala".to_string()),
            })
            .await;
        id
    }

    /// A driver online right next to the standard pickup (~100 m).
    pub async fn driver_online_nearby(&self) -> UserId {
        let id = self.seed_driver().await;
        self.presence
            .go_online(id, 4.0519, 9.7682, None)
            .await
            .unwrap();
        id
    }

    pub async fn driver_online_at(&self, lat: f64, lng: f64) -> UserId {
        let id = self.seed_driver().await;
        self.presence.go_online(id, lat, lng, None).await.unwrap();
        id
    }
}

/// The standard Akwa -> Bonanjo request from the scenarios.
pub fn douala_request() -> TripRequest {
    TripRequest {
        pickup: Place {
            coord: Coord::new(4.0511, 9.7679).unwrap(),
            address: "Rue Joffre, Akwa".to_string(),
        },
        dropoff: Place {
            coord: Coord::new(4.0601, 9.7700).unwrap(),
            address: "Bonanjo".to_string(),
        },
        distance_m: 1500,
        duration_s: 420,
        payment_method: PaymentMethod::Cash,
        fare_estimate: Xaf::new(2500),
    }
}

/// Let spawned tasks run up to their next timer without advancing the
/// clock.
pub async fn settle_tasks() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Wallet balance must equal the ledger sum at every quiescent moment.
pub async fn assert_ledger_invariant(db: &MemoryDb, driver: UserId) {
    let wallet = db.wallet(driver).await.expect("wallet exists");
    let ledger_sum: Xaf =
        db.ledger_for(driver).await.iter().map(|txn| txn.amount).sum();
    assert_eq!(
        wallet.balance, ledger_sum,
        "wallet balance diverged from ledger sum",
    );
    for txn in db.ledger_for(driver).await {
        assert!(
            txn.amount.as_i64() != 0 || txn.balance_after == wallet.balance,
            "zero-amount ledger entry",
        );
    }
}
