//! Application-level constants: TTLs, dispatch tuning, limits.
//!
//! Tunable dispatch parameters (radius, wave size, timeouts) have their
//! defaults here and can be overridden through configuration; the pure TTLs
//! of the key-value schema are fixed.

use std::time::Duration;

// --- Key-value TTLs --- //

/// `trip:<id>` while the trip is SEARCHING.
pub const TRIP_SEARCHING_TTL: Duration = Duration::from_secs(600);
/// `trip:<id>` and the reverse-active-trip indexes once MATCHED.
pub const TRIP_ACTIVE_TTL: Duration = Duration::from_secs(7200);
/// `trip:lock:<id>` - the hard cap on any acceptance critical section.
pub const TRIP_LOCK_TTL: Duration = Duration::from_secs(10);
/// `trip:timeout:<id>` - one offer wave.
pub const WAVE_TIMEOUT: Duration = Duration::from_secs(30);
/// `trip:accepting:<id>` / `trip:no_expire:<id>` - inhibits wave expansion
/// while the acceptance slow path (database write) runs.
pub const ACCEPTING_MARKER_TTL: Duration = Duration::from_secs(120);
/// `trip:declined:<id>`.
pub const DECLINED_TTL: Duration = Duration::from_secs(300);
/// `driver:location:<id>`.
pub const LOCATION_TTL: Duration = Duration::from_secs(300);
/// `driver:<id>:metadata` and `driver:online:<id>`.
pub const DRIVER_META_TTL: Duration = Duration::from_secs(3600);
/// `driver:pending_offers:<id>`.
pub const PENDING_OFFERS_TTL: Duration = Duration::from_secs(3600);
/// `user:socket:<id>`.
pub const SOCKET_INDEX_TTL: Duration = Duration::from_secs(3600);

// --- Dispatch tuning defaults --- //

/// Initial candidate search radius.
pub const DEFAULT_DISPATCH_RADIUS_KM: f64 = 5.0;
/// Radius increase per exhausted wave.
pub const DEFAULT_DISPATCH_RADIUS_STEP_KM: f64 = 3.0;
/// Radius hard cap.
pub const DEFAULT_DISPATCH_RADIUS_MAX_KM: f64 = 15.0;
/// Offers per wave.
pub const DEFAULT_WAVE_SIZE: usize = 5;
/// Waves before giving up with NO_DRIVERS.
pub const MAX_WAVES: u32 = 4;

// --- State machine limits --- //

/// Minimum wait after DRIVER_ARRIVED before a no-show can be reported.
pub const NO_SHOW_MIN_WAIT: Duration = Duration::from_secs(300);
/// A driver whose location is older than this is swept offline.
pub const STALE_PRESENCE_AFTER: Duration = Duration::from_secs(3600);

// --- Cleanup cadence --- //

pub const CLEANUP_SIGNUPS_EVERY: Duration = Duration::from_secs(3600);
pub const CLEANUP_PRESENCE_EVERY: Duration = Duration::from_secs(300);

// --- Chat --- //

/// Maximum chat message length in characters, after trimming.
pub const CHAT_MAX_CHARS: usize = 2000;
