//! Timestamps and bonus-program period keys.

use std::fmt::{self, Display};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// Internally a non-negative [`i64`], which eases interoperability with the
/// relational store and with JSON consumers that lack unsigned 64-bit ints.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
)]
pub struct TimestampMs(i64);

impl TimestampMs {
    /// The current [`SystemTime`].
    ///
    /// Panics if the system clock is before January 1st, 1970.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System clock is before the unix epoch")
            .as_millis();
        Self(i64::try_from(millis).expect("It is not yet the year 292278994"))
    }

    pub fn from_i64(millis: i64) -> anyhow::Result<Self> {
        anyhow::ensure!(millis >= 0, "timestamp must be non-negative");
        Ok(Self(millis))
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Saturating `self + duration`.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// The duration elapsed from `earlier` to `self`, or zero if `earlier`
    /// is actually later.
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        let millis = self.0.saturating_sub(earlier.0);
        Duration::from_millis(u64::try_from(millis).unwrap_or(0))
    }

    pub fn to_utc(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .expect("Non-negative i64 millis are always in range")
    }

    /// This timestamp in a fixed UTC offset (the deployment region's zone;
    /// there is no DST in XAF territory).
    pub fn to_offset(self, offset: FixedOffset) -> DateTime<FixedOffset> {
        self.to_utc().with_timezone(&offset)
    }
}

impl Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Self::from_i64(value).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp in millis must be non-negative",
            )
        })
    }
}

/// The granularity of a bonus program's measurement window.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodGranularity {
    Daily,
    Weekly,
    Monthly,
    Lifetime,
}

impl PeriodGranularity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Lifetime => "LIFETIME",
        }
    }
}

impl Display for PeriodGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeriodGranularity {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            "LIFETIME" => Ok(Self::Lifetime),
            _ => Err(anyhow::anyhow!("unknown period granularity: {s}")),
        }
    }
}

/// The string identifier used for bonus-program idempotency.
///
/// `YYYY-MM-DD` (daily), ISO `YYYY-Www` (weekly), `YYYY-MM` (monthly), or the
/// literal `lifetime`. Two settlement attempts in the same period produce the
/// same key, which is what makes `UNIQUE(driver, program, period_key)` an
/// effective double-award kill switch.
pub fn period_key(
    granularity: PeriodGranularity,
    at: TimestampMs,
    offset: FixedOffset,
) -> String {
    let local = at.to_offset(offset);
    match granularity {
        PeriodGranularity::Daily => local.format("%Y-%m-%d").to_string(),
        PeriodGranularity::Weekly => {
            let week = local.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        PeriodGranularity::Monthly => local.format("%Y-%m").to_string(),
        PeriodGranularity::Lifetime => "lifetime".to_string(),
    }
}

/// The start of the period containing `at`, used to bound period metrics.
/// Lifetime periods start at the epoch.
pub fn period_start(
    granularity: PeriodGranularity,
    at: TimestampMs,
    offset: FixedOffset,
) -> TimestampMs {
    let local = at.to_offset(offset);
    let date = match granularity {
        PeriodGranularity::Daily => local.date_naive(),
        PeriodGranularity::Weekly => {
            let days_from_monday =
                local.date_naive().weekday().num_days_from_monday();
            local.date_naive() - chrono::Days::new(u64::from(days_from_monday))
        }
        PeriodGranularity::Monthly =>
            local.date_naive().with_day(1).expect("Day 1 always exists"),
        PeriodGranularity::Lifetime => return TimestampMs(0),
    };
    let start = date
        .and_hms_opt(0, 0, 0)
        .expect("Midnight always exists")
        .and_local_timezone(offset)
        .single()
        .expect("Fixed offsets have no ambiguous local times");
    TimestampMs(start.with_timezone(&Utc).timestamp_millis())
}

/// UTC+1: the single timezone of the XAF currency area.
pub fn default_tz_offset() -> FixedOffset {
    FixedOffset::east_opt(3600).expect("One hour is a valid offset")
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(iso: &str) -> TimestampMs {
        let dt = DateTime::parse_from_rfc3339(iso).unwrap();
        TimestampMs::from_i64(dt.timestamp_millis()).unwrap()
    }

    #[test]
    fn rejects_negative_timestamps() {
        assert!(TimestampMs::from_i64(-1).is_err());
        assert!(serde_json::from_str::<TimestampMs>("-5").is_err());
    }

    #[test]
    fn period_keys() {
        let offset = default_tz_offset();
        // 2026-08-01 10:00 UTC = 11:00 local
        let at = ts("2026-08-01T10:00:00Z");
        assert_eq!(
            period_key(PeriodGranularity::Daily, at, offset),
            "2026-08-01"
        );
        assert_eq!(
            period_key(PeriodGranularity::Monthly, at, offset),
            "2026-08"
        );
        assert_eq!(
            period_key(PeriodGranularity::Weekly, at, offset),
            "2026-W31"
        );
        assert_eq!(
            period_key(PeriodGranularity::Lifetime, at, offset),
            "lifetime"
        );
    }

    #[test]
    fn period_key_respects_local_midnight() {
        let offset = default_tz_offset();
        // 23:30 UTC on July 31st is already August 1st at UTC+1.
        let at = ts("2026-07-31T23:30:00Z");
        assert_eq!(
            period_key(PeriodGranularity::Daily, at, offset),
            "2026-08-01"
        );
    }

    #[test]
    fn period_start_bounds() {
        let offset = default_tz_offset();
        let at = ts("2026-08-01T10:00:00Z");
        let day_start = period_start(PeriodGranularity::Daily, at, offset);
        // Local midnight Aug 1 = 23:00 UTC Jul 31.
        assert_eq!(day_start, ts("2026-07-31T23:00:00Z"));
        assert!(day_start < at);

        let week_start = period_start(PeriodGranularity::Weekly, at, offset);
        // Aug 1 2026 is a Saturday; ISO week starts Monday Jul 27.
        assert_eq!(week_start, ts("2026-07-26T23:00:00Z"));

        assert_eq!(
            period_start(PeriodGranularity::Lifetime, at, offset).as_i64(),
            0
        );
    }
}
