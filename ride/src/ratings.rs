//! Post-trip ratings.
//!
//! One rating per (trip, rater), only after completion, only by the two
//! participants. A passenger's rating feeds the driver's running average.

use common::api::error::{ApiError, ApiResult};
use common::ids::{TripId, UserId};
use common::time::TimestampMs;
use common::trip::TripStatus;
use store::db::{Db, DbTx, InsertOutcome};
use store::models::{RatingRow, RatingType};
use tracing::instrument;
use uuid::Uuid;

pub struct RatingService<D> {
    db: D,
}

impl<D: Db> Clone for RatingService<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl<D: Db> RatingService<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    #[instrument(skip(self, comment))]
    pub async fn submit(
        &self,
        rater: UserId,
        trip_id: TripId,
        stars: i16,
        comment: Option<String>,
    ) -> ApiResult<()> {
        if !(1..=5).contains(&stars) {
            return Err(ApiError::validation("stars must be within 1..=5"));
        }

        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let trip = tx
            .get_trip(trip_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no such trip"))?;
        if trip.status != TripStatus::Completed {
            return Err(ApiError::precondition(
                "only completed trips can be rated",
            ));
        }
        let driver_id = trip.driver_id.ok_or_else(|| {
            ApiError::from(anyhow::anyhow!(
                "completed trip {trip_id} without driver"
            ))
        })?;

        let (rating_type, rated_user) = if rater == trip.passenger_id {
            (RatingType::PassengerToDriver, driver_id)
        } else if rater == driver_id {
            (RatingType::DriverToPassenger, trip.passenger_id)
        } else {
            return Err(ApiError::forbidden("not a participant of this trip"));
        };

        let rating = RatingRow {
            id: Uuid::new_v4(),
            trip_id,
            rated_by: rater,
            rated_user,
            rating_type,
            stars,
            comment,
            created_at: TimestampMs::now(),
        };
        if tx.insert_rating(&rating).await? == InsertOutcome::AlreadyExists {
            return Err(ApiError::conflict(
                "ALREADY_RATED",
                "this trip was already rated by you",
            ));
        }

        // The driver's card shows a materialised average; refresh it from
        // the authoritative rows in the same transaction.
        if rating_type == RatingType::PassengerToDriver {
            let (avg, count) = tx.driver_rating_summary(driver_id).await?;
            tx.update_driver_rating(driver_id, avg, count).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
