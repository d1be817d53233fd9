//! Row structs for the durable schema (the core subset).
//!
//! Fields mirror the migration DDL column-for-column. Monetary columns are
//! integer XAF; timestamps are epoch millis.

use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::anyhow;
use common::geo::Coord;
use common::ids::{
    AwardId, EventId, MessageId, ProgramId, ReceiptId, RuleId, TripId, TxnId,
    UserId,
};
use common::money::{CommissionRate, Xaf};
use common::time::{PeriodGranularity, TimestampMs};
use common::trip::{CancelActor, PaymentMethod, TripStatus};
use common::user::{DriverInfo, PassengerInfo, VehicleInfo};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use uuid::Uuid;

/// The durable trip row, created at MATCHED.
#[derive(Clone, Debug, PartialEq)]
pub struct TripRow {
    pub id: TripId,
    pub passenger_id: UserId,
    pub driver_id: Option<UserId>,
    pub status: TripStatus,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub pickup_address: String,
    pub dropoff_lat: f64,
    pub dropoff_lng: f64,
    pub dropoff_address: String,
    pub route_polyline: Option<String>,
    pub distance_m: i32,
    pub duration_s: i32,
    pub fare_estimate: Xaf,
    pub fare_final: Option<Xaf>,
    pub payment_method: PaymentMethod,
    pub driver_lat_at_match: Option<f64>,
    pub driver_lng_at_match: Option<f64>,
    pub matched_at: Option<TimestampMs>,
    pub driver_en_route_at: Option<TimestampMs>,
    pub driver_arrived_at: Option<TimestampMs>,
    pub trip_started_at: Option<TimestampMs>,
    pub trip_completed_at: Option<TimestampMs>,
    pub canceled_at: Option<TimestampMs>,
    pub cancel_reason: Option<String>,
    pub canceled_by: Option<CancelActor>,
    pub notes: Option<String>,
    pub created_at: TimestampMs,
}

impl TripRow {
    pub fn pickup_coord(&self) -> anyhow::Result<Coord> {
        Coord::new(self.pickup_lat, self.pickup_lng)
    }
}

/// Append-only audit of one state transition.
#[derive(Clone, Debug, PartialEq)]
pub struct TripEventRow {
    pub id: EventId,
    pub trip_id: TripId,
    pub event_type: String,
    pub performed_by: Option<UserId>,
    pub metadata: serde_json::Value,
    pub created_at: TimestampMs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum ReceiptStatus {
    Pending,
    Settled,
    Refunded,
}

impl ReceiptStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Settled => "SETTLED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SETTLED" => Ok(Self::Settled),
            "REFUNDED" => Ok(Self::Refunded),
            _ => Err(anyhow!("unknown receipt status: {s}")),
        }
    }
}

/// The settlement record. `UNIQUE(trip_id)` is the double-post kill switch:
/// a second settlement attempt for the same trip cannot insert a second row.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiptRow {
    pub id: ReceiptId,
    pub trip_id: TripId,
    pub driver_id: UserId,
    pub passenger_id: UserId,
    pub gross_fare: Xaf,
    pub commission_rate: CommissionRate,
    pub commission_amount: Xaf,
    pub bonus_total: Xaf,
    pub driver_net: Xaf,
    pub payment_method: PaymentMethod,
    pub commission_rule_id: Option<RuleId>,
    /// Every evaluated rule and its outcome, snapshotted for audit.
    pub applied_rules: serde_json::Value,
    pub status: ReceiptStatus,
    pub processed_at: Option<TimestampMs>,
    pub created_at: TimestampMs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum WalletStatus {
    Active,
    Frozen,
    Suspended,
}

impl WalletStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Frozen => "FROZEN",
            Self::Suspended => "SUSPENDED",
        }
    }
}

impl Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "FROZEN" => Ok(Self::Frozen),
            "SUSPENDED" => Ok(Self::Suspended),
            _ => Err(anyhow!("unknown wallet status: {s}")),
        }
    }
}

/// One wallet per driver. `balance` is a materialised sum of the ledger;
/// the ledger is the source of truth.
#[derive(Clone, Debug, PartialEq)]
pub struct WalletRow {
    pub driver_id: UserId,
    pub balance: Xaf,
    pub total_earned: Xaf,
    pub total_commission: Xaf,
    pub total_bonuses: Xaf,
    pub total_payouts: Xaf,
    pub last_payout_at: Option<TimestampMs>,
    pub status: WalletStatus,
}

impl WalletRow {
    /// A fresh, empty, active wallet.
    pub fn empty(driver_id: UserId) -> Self {
        Self {
            driver_id,
            balance: Xaf::ZERO,
            total_earned: Xaf::ZERO,
            total_commission: Xaf::ZERO,
            total_bonuses: Xaf::ZERO,
            total_payouts: Xaf::ZERO,
            last_payout_at: None,
            status: WalletStatus::Active,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum WalletTxnType {
    TripFare,
    Commission,
    BonusTrip,
    BonusQuest,
    Adjustment,
    Refund,
    Payout,
}

impl WalletTxnType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TripFare => "TRIP_FARE",
            Self::Commission => "COMMISSION",
            Self::BonusTrip => "BONUS_TRIP",
            Self::BonusQuest => "BONUS_QUEST",
            Self::Adjustment => "ADJUSTMENT",
            Self::Refund => "REFUND",
            Self::Payout => "PAYOUT",
        }
    }
}

impl Display for WalletTxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletTxnType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIP_FARE" => Ok(Self::TripFare),
            "COMMISSION" => Ok(Self::Commission),
            "BONUS_TRIP" => Ok(Self::BonusTrip),
            "BONUS_QUEST" => Ok(Self::BonusQuest),
            "ADJUSTMENT" => Ok(Self::Adjustment),
            "REFUND" => Ok(Self::Refund),
            "PAYOUT" => Ok(Self::Payout),
            _ => Err(anyhow!("unknown wallet txn type: {s}")),
        }
    }
}

/// One ledger entry. Never updated, never deleted. Credits positive,
/// debits negative.
#[derive(Clone, Debug, PartialEq)]
pub struct WalletTxnRow {
    pub id: TxnId,
    pub driver_id: UserId,
    pub txn_type: WalletTxnType,
    pub amount: Xaf,
    pub balance_after: Xaf,
    pub description: String,
    pub trip_id: Option<TripId>,
    pub receipt_id: Option<ReceiptId>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: TimestampMs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum RuleType {
    CommissionPercent,
    BonusFlat,
    BonusMultiplier,
    Penalty,
}

impl RuleType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommissionPercent => "COMMISSION_PERCENT",
            Self::BonusFlat => "BONUS_FLAT",
            Self::BonusMultiplier => "BONUS_MULTIPLIER",
            Self::Penalty => "PENALTY",
        }
    }
}

impl Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMMISSION_PERCENT" => Ok(Self::CommissionPercent),
            "BONUS_FLAT" => Ok(Self::BonusFlat),
            "BONUS_MULTIPLIER" => Ok(Self::BonusMultiplier),
            "PENALTY" => Ok(Self::Penalty),
            _ => Err(anyhow!("unknown rule type: {s}")),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum RuleAppliesTo {
    Ride,
    Rental,
    All,
}

impl RuleAppliesTo {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ride => "RIDE",
            Self::Rental => "RENTAL",
            Self::All => "ALL",
        }
    }
}

impl Display for RuleAppliesTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleAppliesTo {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RIDE" => Ok(Self::Ride),
            "RENTAL" => Ok(Self::Rental),
            "ALL" => Ok(Self::All),
            _ => Err(anyhow!("unknown applies_to: {s}")),
        }
    }
}

/// A rectangular pickup zone used in rule conditions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneBox {
    pub name: String,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl ZoneBox {
    pub fn contains(&self, coord: &Coord) -> bool {
        (self.min_lat..=self.max_lat).contains(&coord.lat())
            && (self.min_lng..=self.max_lng).contains(&coord.lng())
    }
}

/// The JSON condition attached to an earning rule. Every field is optional;
/// an omitted field matches anything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Inclusive local-hour window; wraps midnight when start > end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour_start: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour_end: Option<u8>,
    /// ISO weekday numbers, Monday = 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_fare: Option<Xaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fare: Option<Xaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_distance_m: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance_m: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_methods: Option<Vec<PaymentMethod>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_tiers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_zone: Option<ZoneBox>,
}

/// A priority-ordered earning rule.
#[derive(Clone, Debug, PartialEq)]
pub struct EarningRuleRow {
    pub id: RuleId,
    pub name: String,
    pub rule_type: RuleType,
    pub priority: i32,
    /// COMMISSION_PERCENT and BONUS_MULTIPLIER rules carry a rate/factor.
    pub rate: Option<Decimal>,
    /// BONUS_FLAT and PENALTY rules carry a flat amount.
    pub amount: Option<Xaf>,
    pub condition: RuleCondition,
    pub applies_to: RuleAppliesTo,
    pub valid_from: Option<TimestampMs>,
    pub valid_until: Option<TimestampMs>,
    pub is_active: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum QuestMetric {
    TripCount,
    Earnings,
}

impl QuestMetric {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TripCount => "TRIP_COUNT",
            Self::Earnings => "EARNINGS",
        }
    }
}

impl Display for QuestMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestMetric {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIP_COUNT" => Ok(Self::TripCount),
            "EARNINGS" => Ok(Self::Earnings),
            _ => Err(anyhow!("unknown quest metric: {s}")),
        }
    }
}

/// A quest definition: reach `target_value` (trips or XAF earned) within a
/// period, once per period key.
#[derive(Clone, Debug, PartialEq)]
pub struct BonusProgramRow {
    pub id: ProgramId,
    pub name: String,
    pub granularity: PeriodGranularity,
    pub metric: QuestMetric,
    pub target_value: i64,
    pub bonus_amount: Xaf,
    pub valid_from: Option<TimestampMs>,
    pub valid_until: Option<TimestampMs>,
    pub is_active: bool,
}

/// One award per (driver, program, period key) - the double-award kill
/// switch is the UNIQUE constraint over exactly those three columns.
#[derive(Clone, Debug, PartialEq)]
pub struct BonusAwardRow {
    pub id: AwardId,
    pub driver_id: UserId,
    pub program_id: ProgramId,
    pub period_key: String,
    pub amount: Xaf,
    pub awarded_at: TimestampMs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum RatingType {
    DriverToPassenger,
    PassengerToDriver,
}

impl RatingType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DriverToPassenger => "DRIVER_TO_PASSENGER",
            Self::PassengerToDriver => "PASSENGER_TO_DRIVER",
        }
    }
}

impl Display for RatingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RatingType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRIVER_TO_PASSENGER" => Ok(Self::DriverToPassenger),
            "PASSENGER_TO_DRIVER" => Ok(Self::PassengerToDriver),
            _ => Err(anyhow!("unknown rating type: {s}")),
        }
    }
}

/// One rating per (trip, rater); stars in [1, 5].
#[derive(Clone, Debug, PartialEq)]
pub struct RatingRow {
    pub id: Uuid,
    pub trip_id: TripId,
    pub rated_by: UserId,
    pub rated_user: UserId,
    pub rating_type: RatingType,
    pub stars: i16,
    pub comment: Option<String>,
    pub created_at: TimestampMs,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessageRow {
    pub id: MessageId,
    pub trip_id: TripId,
    pub from_user_id: UserId,
    pub text: String,
    pub sent_at: TimestampMs,
    pub read_at: Option<TimestampMs>,
}

/// The flattened driver view the dispatcher needs: identity, vehicle,
/// rating, and the attributes rule conditions key on.
#[derive(Clone, Debug, PartialEq)]
pub struct DriverProfileRow {
    pub user_id: UserId,
    pub name: String,
    pub phone: String,
    pub vehicle: VehicleInfo,
    pub rating_avg: Decimal,
    pub rating_count: i32,
    pub tier: Option<String>,
    pub city: Option<String>,
}

impl DriverProfileRow {
    pub fn to_driver_info(&self) -> DriverInfo {
        DriverInfo {
            id: self.user_id,
            name: self.name.clone(),
            phone: self.phone.clone(),
            rating: self.rating_avg,
            rating_count: self.rating_count,
            vehicle: self.vehicle.clone(),
        }
    }
}

/// The passenger identity attached to offers.
#[derive(Clone, Debug, PartialEq)]
pub struct PassengerBrief {
    pub id: UserId,
    pub name: String,
    pub phone: String,
}

impl PassengerBrief {
    pub fn to_passenger_info(&self) -> PassengerInfo {
        PassengerInfo {
            id: self.id,
            name: self.name.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// A staged registration awaiting verification, pruned by the cleanup job
/// once expired.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingSignupRow {
    pub id: Uuid,
    pub email: String,
    pub expires_at: TimestampMs,
    /// Object-store URLs of partially uploaded artifacts to delete.
    pub artifact_urls: Vec<String>,
}
