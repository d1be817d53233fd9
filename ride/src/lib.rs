//! The dispatch core: presence, matching, the trip state machine, earnings
//! settlement, chat, and scheduled cleanup.
//!
//! Everything here is generic over the storage seams
//! ([`store::kv::KvStore`], [`store::db::Db`]) and the event fan-out seam
//! ([`events::EventSink`]); the server wires in Redis, Postgres, and the
//! socket gateway, the tests wire in the in-memory twins and a recording
//! sink.

/// Durable per-trip messaging, typing, read receipts.
pub mod chat;
/// Scheduled pruning of signups, stale presence, and orphaned keys.
pub mod cleanup;
/// Dispatch tuning knobs.
pub mod config;
/// The dispatcher: request intake, offer waves, the acceptance race.
pub mod dispatch;
/// The earnings engine and its rules and quests.
pub mod earnings;
/// Rooms and the event fan-out seam.
pub mod events;
/// The fare-estimate parity function.
pub mod fare;
/// Driver presence and the geospatial index.
pub mod presence;
/// Post-trip ratings.
pub mod ratings;
/// The trip state machine.
pub mod trips;
