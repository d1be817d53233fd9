//! Everything sent across the wire: the error model, the canonical socket
//! events, and their payload structs.

/// `ApiError`, the seven error kinds, and the wire `ErrorResponse`.
pub mod error;
/// The canonical bidirectional socket events.
pub mod events;
/// Payload structs for requests, offers, and fan-out events.
pub mod models;
