//! User roles, vehicles, and the profile briefs attached to offer and
//! match payloads.

use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::anyhow;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::ids::UserId;

/// The account type discriminator. One tagged variant per user kind; the
/// per-variant profile data lives in its own table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum UserRole {
    Passenger,
    Driver,
    Partner,
    Admin,
}

impl UserRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passenger => "PASSENGER",
            Self::Driver => "DRIVER",
            Self::Partner => "PARTNER",
            Self::Admin => "ADMIN",
        }
    }
}

impl Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASSENGER" => Ok(Self::Passenger),
            "DRIVER" => Ok(Self::Driver),
            "PARTNER" => Ok(Self::Partner),
            "ADMIN" => Ok(Self::Admin),
            _ => Err(anyhow!("unknown user role: {s}")),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum VehicleType {
    Economy,
    Comfort,
    Luxury,
}

impl VehicleType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Economy => "Economy",
            Self::Comfort => "Comfort",
            Self::Luxury => "Luxury",
        }
    }
}

impl Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Economy" => Ok(Self::Economy),
            "Comfort" => Ok(Self::Comfort),
            "Luxury" => Ok(Self::Luxury),
            _ => Err(anyhow!("unknown vehicle type: {s}")),
        }
    }
}

/// Vehicle details shown to the passenger when a driver is assigned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub vehicle_type: VehicleType,
    pub plate: String,
    pub make: String,
    pub model: String,
    pub color: String,
    pub year: i16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

/// The passenger identity attached to an offer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassengerInfo {
    pub id: UserId,
    pub name: String,
    pub phone: String,
}

/// The driver identity + vehicle attached to a `trip:driver_assigned`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub id: UserId,
    pub name: String,
    pub phone: String,
    /// Average rating in [0.00, 5.00].
    pub rating: Decimal,
    pub rating_count: i32,
    pub vehicle: VehicleInfo,
}
