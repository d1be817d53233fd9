//! An in-memory [`KvStore`] with real TTL semantics.
//!
//! Used by the core's tests and usable for single-process local runs.
//! Expiry uses [`tokio::time::Instant`], so paused-clock tests can advance
//! time and watch keys expire exactly like they would on Redis. Batches
//! apply under one lock, matching MULTI/EXEC atomicity.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use common::geo::Coord;
use tokio::time::Instant;

use super::{KvOp, KvStore};

#[derive(Clone, Debug)]
enum Value {
    String(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
    Geo(HashMap<String, Coord>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Set(_) => "set",
            Self::Hash(_) => "hash",
            Self::Geo(_) => "geo",
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
}

impl Inner {
    /// Drop the entry if its TTL has elapsed, then return it if live.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn put(&mut self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn set_value<F, T>(
        &mut self,
        key: &str,
        ttl: Option<Duration>,
        empty: Value,
        update: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Value) -> anyhow::Result<T>,
    {
        if self.live(key).is_none() {
            self.put(key, empty, None);
        }
        let entry = self
            .entries
            .get_mut(key)
            .expect("Just inserted if missing");
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        update(&mut entry.value)
    }

    fn apply(&mut self, op: KvOp) -> anyhow::Result<()> {
        match op {
            KvOp::Put { key, value, ttl } => {
                self.put(&key, Value::String(value), ttl);
                Ok(())
            }
            KvOp::Del { key } => {
                self.entries.remove(&key);
                Ok(())
            }
            KvOp::SAdd { key, member, ttl } => self.set_value(
                &key,
                ttl,
                Value::Set(HashSet::new()),
                |value| match value {
                    Value::Set(set) => {
                        set.insert(member);
                        Ok(())
                    }
                    other => bail!("SADD on a {} key", other.type_name()),
                },
            ),
            KvOp::SRem { key, member } => {
                if let Some(entry) = self.live(&key) {
                    match &mut entry.value {
                        Value::Set(set) => {
                            set.remove(&member);
                        }
                        other =>
                            bail!("SREM on a {} key", other.type_name()),
                    }
                }
                Ok(())
            }
            KvOp::HSet { key, fields, ttl } => self.set_value(
                &key,
                ttl,
                Value::Hash(HashMap::new()),
                |value| match value {
                    Value::Hash(hash) => {
                        hash.extend(fields);
                        Ok(())
                    }
                    other => bail!("HSET on a {} key", other.type_name()),
                },
            ),
            KvOp::GeoAdd { key, member, coord } => self.set_value(
                &key,
                None,
                Value::Geo(HashMap::new()),
                |value| match value {
                    Value::Geo(geo) => {
                        geo.insert(member, coord);
                        Ok(())
                    }
                    other => bail!("GEOADD on a {} key", other.type_name()),
                },
            ),
            KvOp::GeoRem { key, member } => {
                if let Some(entry) = self.live(&key) {
                    match &mut entry.value {
                        Value::Geo(geo) => {
                            geo.remove(&member);
                        }
                        other =>
                            bail!("ZREM on a {} key", other.type_name()),
                    }
                }
                Ok(())
            }
            KvOp::Expire { key, ttl } => {
                if let Some(entry) = self.live(&key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
                Ok(())
            }
        }
    }
}

/// See the module docs.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("MemoryKv lock poisoned")
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut inner = self.lock();
        match inner.live(key).map(|e| &e.value) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => bail!("GET on a {} key", other.type_name()),
            None => Ok(None),
        }
    }

    async fn put_string(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.lock().put(key, Value::String(value.to_string()), ttl);
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.put(key, Value::String(value.to_string()), Some(ttl));
        Ok(true)
    }

    async fn del_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        let matches = matches!(
            inner.live(key).map(|e| &e.value),
            Some(Value::String(s)) if s == expected
        );
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        let existed = inner.live(key).is_some();
        inner.entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.lock().live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        let mut inner = self.lock();
        let now = Instant::now();
        Ok(inner
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn sadd(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.lock().apply(KvOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
            ttl,
        })
    }

    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.lock().apply(KvOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut inner = self.lock();
        match inner.live(key).map(|e| &e.value) {
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => bail!("SMEMBERS on a {} key", other.type_name()),
            None => Ok(Vec::new()),
        }
    }

    async fn sismember(
        &self,
        key: &str,
        member: &str,
    ) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        match inner.live(key).map(|e| &e.value) {
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(other) => bail!("SISMEMBER on a {} key", other.type_name()),
            None => Ok(false),
        }
    }

    async fn hset_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.lock().apply(KvOp::HSet {
            key: key.to_string(),
            fields,
            ttl,
        })
    }

    async fn hget_all(
        &self,
        key: &str,
    ) -> anyhow::Result<HashMap<String, String>> {
        let mut inner = self.lock();
        match inner.live(key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(other) => bail!("HGETALL on a {} key", other.type_name()),
            None => Ok(HashMap::new()),
        }
    }

    async fn geo_add(
        &self,
        key: &str,
        member: &str,
        coord: Coord,
    ) -> anyhow::Result<()> {
        self.lock().apply(KvOp::GeoAdd {
            key: key.to_string(),
            member: member.to_string(),
            coord,
        })
    }

    async fn geo_rem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.lock().apply(KvOp::GeoRem {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    async fn geo_search(
        &self,
        key: &str,
        center: Coord,
        radius_km: f64,
    ) -> anyhow::Result<Vec<(String, f64)>> {
        let mut inner = self.lock();
        let geo = match inner.live(key).map(|e| &e.value) {
            Some(Value::Geo(geo)) => geo,
            Some(other) => bail!("GEOSEARCH on a {} key", other.type_name()),
            None => return Ok(Vec::new()),
        };
        let mut hits = geo
            .iter()
            .map(|(member, coord)| {
                (member.clone(), center.distance_km(coord))
            })
            .filter(|(_, km)| *km <= radius_km)
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(hits)
    }

    async fn batch(&self, ops: Vec<KvOp>) -> anyhow::Result<()> {
        let mut inner = self.lock();
        for op in ops {
            inner.apply(op)?;
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(inner
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn keys_expire() {
        let kv = MemoryKv::new();
        kv.put_string("k", "v", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(kv.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!kv.exists("k").await.unwrap());
        assert_eq!(kv.get_string("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_ex_wins_once() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_ex("lock", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ex("lock", "b", Duration::from_secs(10))
            .await
            .unwrap());

        // Expires, then the second contender can win.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(kv
            .set_nx_ex("lock", "b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn del_if_equals_checks_nonce() {
        let kv = MemoryKv::new();
        kv.put_string("lock", "nonce-1", None).await.unwrap();
        assert!(!kv.del_if_equals("lock", "nonce-2").await.unwrap());
        assert!(kv.exists("lock").await.unwrap());
        assert!(kv.del_if_equals("lock", "nonce-1").await.unwrap());
        assert!(!kv.exists("lock").await.unwrap());
    }

    #[tokio::test]
    async fn geo_search_sorts_ascending() {
        let kv = MemoryKv::new();
        let center = Coord::new(4.0511, 9.7679).unwrap();
        let near = Coord::new(4.0519, 9.7682).unwrap();
        let far = Coord::new(4.10, 9.80).unwrap();
        kv.geo_add("geo", "far", far).await.unwrap();
        kv.geo_add("geo", "near", near).await.unwrap();

        let hits = kv.geo_search("geo", center, 50.0).await.unwrap();
        assert_eq!(
            hits.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>(),
            vec!["near", "far"],
        );

        let hits = kv.geo_search("geo", center, 1.0).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn geo_add_upserts_member() {
        let kv = MemoryKv::new();
        let a = Coord::new(4.05, 9.76).unwrap();
        let b = Coord::new(4.06, 9.77).unwrap();
        kv.geo_add("geo", "d1", a).await.unwrap();
        kv.geo_add("geo", "d1", b).await.unwrap();
        let hits = kv.geo_search("geo", b, 50.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn sadd_with_ttl_expires_whole_set() {
        let kv = MemoryKv::new();
        kv.sadd("declined", "d1", Some(Duration::from_secs(300)))
            .await
            .unwrap();
        assert!(kv.sismember("declined", "d1").await.unwrap());
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!kv.sismember("declined", "d1").await.unwrap());
    }
}
