//! The `common` crate contains types and functionality shared between the
//! okada dispatch core, its storage layer, and the socket gateway.

/// API error model, wire events, and structs sent across the wire.
pub mod api;
/// Exponential backoff.
pub mod backoff;
/// Application-level constants: TTLs, dispatch tuning, limits.
pub mod constants;
/// `DeployEnv` and environment variable helpers.
pub mod env;
/// Validated coordinates and great-circle distance.
pub mod geo;
/// Identifier newtypes.
pub mod ids;
/// Integer XAF amounts and commission rates.
pub mod money;
/// A channel for broadcasting a shutdown signal to all tasks.
pub mod shutdown;
/// Named task spawning with logged join results.
pub mod task;
/// Timestamps and bonus-program period keys.
pub mod time;
/// Trip status, payment methods, and the ephemeral trip record.
pub mod trip;
/// User roles, vehicles, and profile briefs.
pub mod user;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
