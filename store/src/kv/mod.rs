//! The key-value / geo store trait.
//!
//! Everything the dispatch core needs from Redis: strings, sets, hashes, the
//! geospatial index, atomic SET-IF-ABSENT-WITH-TTL, nonce-checked delete,
//! and atomic multi-command batches. All cross-process mutual exclusion in
//! the system reduces to [`KvStore::set_nx_ex`] and
//! [`KvStore::del_if_equals`] on `trip:lock:<id>`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use common::geo::Coord;
use serde::de::DeserializeOwned;
use serde::Serialize;

mod memory;
mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

/// One operation inside an atomic [`KvStore::batch`].
#[derive(Clone, Debug)]
pub enum KvOp {
    Put {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    SAdd {
        key: String,
        member: String,
        ttl: Option<Duration>,
    },
    SRem {
        key: String,
        member: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    },
    GeoAdd {
        key: String,
        member: String,
        coord: Coord,
    },
    GeoRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

#[async_trait]
pub trait KvStore: Clone + Send + Sync + 'static {
    async fn get_string(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn put_string(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    /// `SET key value NX EX ttl`. Returns whether the key was set, i.e.
    /// whether the caller now owns it.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    /// Delete `key` only if its current value equals `expected`. Used for
    /// nonce-checked lock release, so a lock that expired and was
    /// re-acquired by someone else is never released by the old holder.
    async fn del_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> anyhow::Result<bool>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> anyhow::Result<bool>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Remaining TTL, or `None` if the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>>;

    async fn sadd(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()>;

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn sismember(
        &self,
        key: &str,
        member: &str,
    ) -> anyhow::Result<bool>;

    async fn hset_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    async fn hget_all(
        &self,
        key: &str,
    ) -> anyhow::Result<HashMap<String, String>>;

    async fn geo_add(
        &self,
        key: &str,
        member: &str,
        coord: Coord,
    ) -> anyhow::Result<()>;

    async fn geo_rem(&self, key: &str, member: &str) -> anyhow::Result<()>;

    /// Members within `radius_km` of `center`, with their distance in km,
    /// sorted ascending.
    async fn geo_search(
        &self,
        key: &str,
        center: Coord,
        radius_km: f64,
    ) -> anyhow::Result<Vec<(String, f64)>>;

    /// Apply every op atomically (MULTI/EXEC on Redis).
    async fn batch(&self, ops: Vec<KvOp>) -> anyhow::Result<()>;

    /// All keys starting with `prefix`. Cleanup only; not for hot paths.
    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// JSON convenience wrappers over [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_json<T>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get_string(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.put_string(key, &raw, ttl).await
    }
}

impl<K: KvStore> KvStoreExt for K {}
