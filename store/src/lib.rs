//! Typed clients for the two external stores.
//!
//! - [`kv`]: the key-value / geo store (Redis in production), behind the
//!   [`kv::KvStore`] trait. All dispatch mutual exclusion lives here; there
//!   are no in-process critical sections in the core.
//! - [`db`]: the relational store (Postgres in production), behind the
//!   [`db::Db`] / [`db::DbTx`] traits with domain-level operations.
//!
//! Both come with in-memory implementations used by the core's tests (and
//! usable for local development), which uphold the same atomicity semantics
//! as the real stores: `MemoryKv` batches apply under one lock, `MemoryDb`
//! transactions are all-or-nothing and serialized.

/// The relational store: traits, Postgres implementation, in-memory twin.
pub mod db;
/// The key-value / geo store: trait, Redis implementation, in-memory twin.
pub mod kv;
/// The key schema: every key the system writes, in one place.
pub mod keys;
/// Row structs for the durable schema.
pub mod models;
