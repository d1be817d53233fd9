//! The Redis-backed [`KvStore`].
//!
//! Runs over a [`ConnectionManager`], which multiplexes one connection and
//! reconnects on failure. Batches go through MULTI/EXEC pipelines; the
//! nonce-checked delete runs as a Lua script so the compare and the delete
//! are one atomic server-side step.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use common::geo::Coord;
use redis::aio::ConnectionManager;
use redis::geo::{RadiusOptions, RadiusOrder, Unit};
use redis::{AsyncCommands, Script};

use super::{KvOp, KvStore};

const DEL_IF_EQUALS_LUA: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .context("Invalid key-value store URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to the key-value store")?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Redis EX of 0 is an error; clamp to at least one second.
    ttl.as_secs().max(1)
}

fn push_op(pipe: &mut redis::Pipeline, op: KvOp) {
    match op {
        KvOp::Put { key, value, ttl } => {
            match ttl {
                Some(ttl) => pipe.set_ex(&key, value, ttl_secs(ttl)),
                None => pipe.set(&key, value),
            };
            pipe.ignore();
        }
        KvOp::Del { key } => {
            pipe.del(&key).ignore();
        }
        KvOp::SAdd { key, member, ttl } => {
            pipe.sadd(&key, member).ignore();
            if let Some(ttl) = ttl {
                pipe.expire(&key, ttl_secs(ttl) as i64).ignore();
            }
        }
        KvOp::SRem { key, member } => {
            pipe.srem(&key, member).ignore();
        }
        KvOp::HSet { key, fields, ttl } => {
            pipe.hset_multiple(&key, &fields).ignore();
            if let Some(ttl) = ttl {
                pipe.expire(&key, ttl_secs(ttl) as i64).ignore();
            }
        }
        KvOp::GeoAdd { key, member, coord } => {
            let point = redis::geo::Coord::lon_lat(coord.lng(), coord.lat());
            pipe.geo_add(&key, (point, member)).ignore();
        }
        KvOp::GeoRem { key, member } => {
            // A geo index is a sorted set underneath.
            pipe.zrem(&key, member).ignore();
        }
        KvOp::Expire { key, ttl } => {
            pipe.expire(&key, ttl_secs(ttl) as i64).ignore();
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn put_string(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn.set_ex(key, value, ttl_secs(ttl)).await?,
            None => conn.set(key, value).await?,
        }
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn del_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> anyhow::Result<bool> {
        let deleted: i64 = Script::new(DEL_IF_EQUALS_LUA)
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(deleted == 1)
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        let deleted: i64 = self.conn().del(key).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        let secs: i64 = self.conn().ttl(key).await?;
        // -2 = no key, -1 = no expiry.
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn sadd(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        match ttl {
            Some(_) => {
                self.batch(vec![KvOp::SAdd {
                    key: key.to_string(),
                    member: member.to_string(),
                    ttl,
                }])
                .await
            }
            None => {
                let _: i64 = self.conn().sadd(key, member).await?;
                Ok(())
            }
        }
    }

    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let _: i64 = self.conn().srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn sismember(
        &self,
        key: &str,
        member: &str,
    ) -> anyhow::Result<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    async fn hset_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.batch(vec![KvOp::HSet {
            key: key.to_string(),
            fields,
            ttl,
        }])
        .await
    }

    async fn hget_all(
        &self,
        key: &str,
    ) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn geo_add(
        &self,
        key: &str,
        member: &str,
        coord: Coord,
    ) -> anyhow::Result<()> {
        let point = redis::geo::Coord::lon_lat(coord.lng(), coord.lat());
        let _: i64 = self.conn().geo_add(key, (point, member)).await?;
        Ok(())
    }

    async fn geo_rem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let _: i64 = self.conn().zrem(key, member).await?;
        Ok(())
    }

    async fn geo_search(
        &self,
        key: &str,
        center: Coord,
        radius_km: f64,
    ) -> anyhow::Result<Vec<(String, f64)>> {
        let options = RadiusOptions::default()
            .with_dist()
            .order(RadiusOrder::Asc);
        let results: Vec<redis::geo::RadiusSearchResult> = self
            .conn()
            .geo_radius(
                key,
                center.lng(),
                center.lat(),
                radius_km,
                Unit::Kilometers,
                options,
            )
            .await?;
        Ok(results
            .into_iter()
            .map(|result| {
                let dist = result.dist.unwrap_or_default();
                (result.name, dist)
            })
            .collect())
    }

    async fn batch(&self, ops: Vec<KvOp>) -> anyhow::Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            push_op(&mut pipe, op);
        }
        pipe.query_async::<()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let pattern = format!("{prefix}*");
        let mut conn = self.conn();
        let mut iter = conn.scan_match::<_, String>(&pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}
