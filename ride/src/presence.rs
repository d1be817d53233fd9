//! Driver presence and the geospatial index.
//!
//! Online/available membership, last-known locations, and radius queries.
//! Every presence transition is one atomic key-value batch, so a crash
//! between commands can't leave a driver in the geo index without being in
//! the online set (invariant: geo entry exists iff online).

use std::collections::HashSet;
use std::str::FromStr;

use common::api::error::{codes, ApiError, ApiResult};
use common::api::events::{DriverLocation, WireEvent};
use common::api::models::LocationUpdatePayload;
use common::constants;
use common::geo::Coord;
use common::ids::{TripId, UserId};
use common::time::TimestampMs;
use serde::{Deserialize, Serialize};
use store::keys;
use store::kv::{KvOp, KvStore, KvStoreExt};
use tracing::{debug, instrument, warn};

use crate::events::{EventSink, Room};

/// The metadata blob kept alongside an online driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverMetadata {
    pub driver_id: UserId,
    pub online_since: TimestampMs,
}

/// A driver's last known position, from the `driver:location:<id>` hash.
#[derive(Clone, Debug, PartialEq)]
pub struct DriverPosition {
    pub coord: Coord,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub updated_at: TimestampMs,
}

impl DriverPosition {
    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("lat".to_string(), self.coord.lat().to_string()),
            ("lng".to_string(), self.coord.lng().to_string()),
            ("timestamp".to_string(), self.updated_at.to_string()),
        ];
        if let Some(heading) = self.heading {
            fields.push(("heading".to_string(), heading.to_string()));
        }
        if let Some(speed) = self.speed {
            fields.push(("speed".to_string(), speed.to_string()));
        }
        if let Some(accuracy) = self.accuracy {
            fields.push(("accuracy".to_string(), accuracy.to_string()));
        }
        fields
    }

    fn from_fields(
        fields: &std::collections::HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let get_f64 = |name: &str| -> anyhow::Result<Option<f64>> {
            fields
                .get(name)
                .map(|raw| f64::from_str(raw))
                .transpose()
                .map_err(Into::into)
        };
        let lat = get_f64("lat")?
            .ok_or_else(|| anyhow::anyhow!("location hash missing lat"))?;
        let lng = get_f64("lng")?
            .ok_or_else(|| anyhow::anyhow!("location hash missing lng"))?;
        let updated_at = fields
            .get("timestamp")
            .ok_or_else(|| anyhow::anyhow!("location hash missing timestamp"))
            .and_then(|raw| TimestampMs::from_i64(raw.parse()?))?;
        Ok(Self {
            coord: Coord::new(lat, lng)?,
            heading: get_f64("heading")?,
            speed: get_f64("speed")?,
            accuracy: get_f64("accuracy")?,
            updated_at,
        })
    }
}

/// See the module docs.
#[derive(Clone)]
pub struct Presence<K, S> {
    kv: K,
    sink: S,
}

impl<K: KvStore, S: EventSink> Presence<K, S> {
    pub fn new(kv: K, sink: S) -> Self {
        Self { kv, sink }
    }

    /// Bring a driver online at a position: geo index + online set +
    /// available set + metadata + location hash, atomically. Idempotent;
    /// a repeated call refreshes the position and TTLs.
    #[instrument(skip(self))]
    pub async fn go_online(
        &self,
        driver_id: UserId,
        lat: f64,
        lng: f64,
        heading: Option<f64>,
    ) -> ApiResult<()> {
        let coord = Coord::new(lat, lng)
            .map_err(|err| ApiError::validation(err.to_string()))?;
        let now = TimestampMs::now();
        let position = DriverPosition {
            coord,
            heading,
            speed: None,
            accuracy: None,
            updated_at: now,
        };
        let metadata = DriverMetadata {
            driver_id,
            online_since: now,
        };
        let member = driver_id.to_string();
        self.kv
            .batch(vec![
                KvOp::GeoAdd {
                    key: keys::DRIVERS_GEO.to_string(),
                    member: member.clone(),
                    coord,
                },
                KvOp::SAdd {
                    key: keys::DRIVERS_ONLINE.to_string(),
                    member: member.clone(),
                    ttl: None,
                },
                KvOp::SAdd {
                    key: keys::DRIVERS_AVAILABLE.to_string(),
                    member,
                    ttl: None,
                },
                KvOp::Put {
                    key: keys::driver_metadata(&driver_id),
                    value: serde_json::to_string(&metadata)
                        .map_err(anyhow::Error::from)?,
                    ttl: Some(constants::DRIVER_META_TTL),
                },
                KvOp::HSet {
                    key: keys::driver_location(&driver_id),
                    fields: position.to_fields(),
                    ttl: Some(constants::LOCATION_TTL),
                },
                KvOp::Put {
                    key: keys::driver_online_flag(&driver_id),
                    value: "1".to_string(),
                    ttl: Some(constants::DRIVER_META_TTL),
                },
            ])
            .await?;
        debug!(%driver_id, "driver online");
        Ok(())
    }

    /// Take a driver out of the index entirely. Does not touch the account
    /// or any trip state.
    #[instrument(skip(self))]
    pub async fn go_offline(&self, driver_id: UserId) -> ApiResult<()> {
        let member = driver_id.to_string();
        self.kv
            .batch(vec![
                KvOp::GeoRem {
                    key: keys::DRIVERS_GEO.to_string(),
                    member: member.clone(),
                },
                KvOp::SRem {
                    key: keys::DRIVERS_ONLINE.to_string(),
                    member: member.clone(),
                },
                KvOp::SRem {
                    key: keys::DRIVERS_AVAILABLE.to_string(),
                    member,
                },
                KvOp::Del {
                    key: keys::driver_metadata(&driver_id),
                },
                KvOp::Del {
                    key: keys::driver_location(&driver_id),
                },
                KvOp::Del {
                    key: keys::driver_online_flag(&driver_id),
                },
            ])
            .await?;
        debug!(%driver_id, "driver offline");
        Ok(())
    }

    /// Record a position fix. Only accepted while the driver is online.
    /// If the driver is on an active trip, the fix is forwarded to the
    /// passenger as `driver:location_update`.
    pub async fn update_location(
        &self,
        driver_id: UserId,
        update: DriverLocation,
    ) -> ApiResult<()> {
        if !self.is_online(driver_id).await? {
            return Err(ApiError::unavailable(
                codes::DRIVER_OFFLINE,
                "driver is not online",
            ));
        }
        let coord = Coord::new(update.lat, update.lng)
            .map_err(|err| ApiError::validation(err.to_string()))?;
        let position = DriverPosition {
            coord,
            heading: update.heading,
            speed: update.speed,
            accuracy: update.accuracy,
            updated_at: TimestampMs::now(),
        };
        self.kv
            .batch(vec![
                KvOp::GeoAdd {
                    key: keys::DRIVERS_GEO.to_string(),
                    member: driver_id.to_string(),
                    coord,
                },
                KvOp::HSet {
                    key: keys::driver_location(&driver_id),
                    fields: position.to_fields(),
                    ttl: Some(constants::LOCATION_TTL),
                },
                // A moving driver is not stale: refresh the online flag.
                KvOp::Expire {
                    key: keys::driver_online_flag(&driver_id),
                    ttl: constants::DRIVER_META_TTL,
                },
            ])
            .await?;

        // Non-critical: forward to the passenger of the active trip.
        if let Err(err) = self.forward_to_passenger(driver_id, &position).await
        {
            warn!(%driver_id, "location forward failed: {err:#}");
        }
        Ok(())
    }

    async fn forward_to_passenger(
        &self,
        driver_id: UserId,
        position: &DriverPosition,
    ) -> anyhow::Result<()> {
        let Some(trip_id) = self
            .kv
            .get_json::<TripId>(&keys::driver_active_trip(&driver_id))
            .await?
        else {
            return Ok(());
        };
        let Some(record) = self
            .kv
            .get_json::<common::trip::TripRecord>(&keys::trip(&trip_id))
            .await?
        else {
            return Ok(());
        };
        self.sink.emit(
            Room::Passenger(record.passenger_id),
            WireEvent::DriverLocationUpdate(LocationUpdatePayload {
                trip_id,
                driver_id,
                location: position.coord,
                heading: position.heading,
            }),
        );
        Ok(())
    }

    /// Stop offering trips to this driver; presence itself is unchanged.
    pub async fn mark_unavailable(&self, driver_id: UserId) -> ApiResult<()> {
        self.kv
            .srem(keys::DRIVERS_AVAILABLE, &driver_id.to_string())
            .await?;
        Ok(())
    }

    /// Resume offering trips. The driver must be online (a driver may be
    /// available only while online).
    pub async fn mark_available(&self, driver_id: UserId) -> ApiResult<()> {
        if !self.is_online(driver_id).await? {
            return Err(ApiError::unavailable(
                codes::DRIVER_OFFLINE,
                "driver is not online",
            ));
        }
        self.kv
            .sadd(keys::DRIVERS_AVAILABLE, &driver_id.to_string(), None)
            .await?;
        Ok(())
    }

    pub async fn is_online(&self, driver_id: UserId) -> ApiResult<bool> {
        Ok(self
            .kv
            .sismember(keys::DRIVERS_ONLINE, &driver_id.to_string())
            .await?)
    }

    pub async fn is_available(&self, driver_id: UserId) -> ApiResult<bool> {
        Ok(self
            .kv
            .sismember(keys::DRIVERS_AVAILABLE, &driver_id.to_string())
            .await?)
    }

    pub async fn get_location(
        &self,
        driver_id: UserId,
    ) -> ApiResult<Option<DriverPosition>> {
        let fields =
            self.kv.hget_all(&keys::driver_location(&driver_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(DriverPosition::from_fields(&fields)?))
    }

    /// Available ∩ online drivers within `radius_km`, ascending by
    /// great-circle distance.
    pub async fn find_nearby(
        &self,
        center: Coord,
        radius_km: f64,
    ) -> ApiResult<Vec<(UserId, f64)>> {
        let hits = self
            .kv
            .geo_search(keys::DRIVERS_GEO, center, radius_km)
            .await?;
        let online: HashSet<String> =
            self.kv.smembers(keys::DRIVERS_ONLINE).await?.into_iter().collect();
        let available: HashSet<String> = self
            .kv
            .smembers(keys::DRIVERS_AVAILABLE)
            .await?
            .into_iter()
            .collect();
        let mut nearby = Vec::with_capacity(hits.len());
        for (member, distance_km) in hits {
            if !online.contains(&member) || !available.contains(&member) {
                continue;
            }
            match UserId::from_str(&member) {
                Ok(id) => nearby.push((id, distance_km)),
                Err(_) => {
                    warn!("non-uuid member in geo index: {member}");
                }
            }
        }
        Ok(nearby)
    }

    /// How long ago this driver last confirmed liveness. `None` when the
    /// online flag is still fresh.
    pub(crate) async fn online_flag_missing(
        &self,
        driver_id: UserId,
    ) -> anyhow::Result<bool> {
        Ok(!self
            .kv
            .exists(&keys::driver_online_flag(&driver_id))
            .await?)
    }
}

// Presence is exercised end-to-end (go online, radius queries, stale
// sweeps) in the dispatch integration tests.
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn position_fields_roundtrip() {
        let position = DriverPosition {
            coord: Coord::new(4.0519, 9.7682).unwrap(),
            heading: Some(270.0),
            speed: None,
            accuracy: Some(12.5),
            updated_at: TimestampMs::from_i64(1_700_000_000_000).unwrap(),
        };
        let fields = position.to_fields().into_iter().collect();
        let back = DriverPosition::from_fields(&fields).unwrap();
        assert_eq!(back, position);
    }

    #[test]
    fn position_requires_lat_lng() {
        let fields = [("lat".to_string(), "4.05".to_string())]
            .into_iter()
            .collect();
        assert!(DriverPosition::from_fields(&fields).is_err());
    }
}
