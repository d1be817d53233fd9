//! Dispatch tuning knobs, assembled from the environment by the server.

use std::time::Duration;

use chrono::FixedOffset;
use common::constants;
use common::money::CommissionRate;
use common::time;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Initial candidate search radius.
    pub radius_km: f64,
    /// Radius increase per exhausted wave.
    pub radius_step_km: f64,
    /// Radius hard cap.
    pub radius_max_km: f64,
    /// Offers per wave.
    pub wave_size: usize,
    /// How long one wave waits for an acceptance.
    pub wave_timeout: Duration,
    /// Waves before giving up with NO_DRIVERS.
    pub max_waves: u32,
    /// Fallback when no COMMISSION_PERCENT rule matches.
    pub default_commission: CommissionRate,
    /// Local timezone for rule hour windows and bonus period keys.
    pub tz_offset: FixedOffset,
    /// Rule-context city when the driver profile does not carry one.
    pub default_city: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            radius_km: constants::DEFAULT_DISPATCH_RADIUS_KM,
            radius_step_km: constants::DEFAULT_DISPATCH_RADIUS_STEP_KM,
            radius_max_km: constants::DEFAULT_DISPATCH_RADIUS_MAX_KM,
            wave_size: constants::DEFAULT_WAVE_SIZE,
            wave_timeout: constants::WAVE_TIMEOUT,
            max_waves: constants::MAX_WAVES,
            default_commission: CommissionRate::DEFAULT,
            tz_offset: time::default_tz_offset(),
            default_city: "Douala".to_string(),
        }
    }
}
