//! Scheduled pruning: expired pending signups, stale presence, orphaned
//! dispatch keys.
//!
//! Runs as one shutdown-aware loop. Sweeps are independent and
//! best-effort: a failed sweep logs and waits for the next tick.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use common::constants;
use common::ids::{TripId, UserId};
use common::shutdown::ShutdownChannel;
use common::time::TimestampMs;
use store::db::{Db, DbTx};
use store::keys;
use store::kv::KvStore;
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::presence::Presence;

/// Hook for deleting partially uploaded artifacts (documents, photos)
/// belonging to pruned signups. The object store itself is outside the
/// dispatch core.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    async fn delete(&self, url: &str) -> anyhow::Result<()>;
}

/// Used when no object store is wired up (dev, tests).
pub struct NoopArtifactStore;

#[async_trait]
impl ArtifactStore for NoopArtifactStore {
    async fn delete(&self, _url: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct CleanupService<K, D, S> {
    kv: K,
    db: D,
    presence: Presence<K, S>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl<K: KvStore, D: Db, S: EventSink> Clone for CleanupService<K, D, S> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            db: self.db.clone(),
            presence: self.presence.clone(),
            artifacts: Arc::clone(&self.artifacts),
        }
    }
}

impl<K: KvStore, D: Db, S: EventSink> CleanupService<K, D, S> {
    pub fn new(
        kv: K,
        db: D,
        presence: Presence<K, S>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            kv,
            db,
            presence,
            artifacts,
        }
    }

    /// Run every sweep once, immediately. Used at startup when
    /// `RUN_CLEANUP_ON_STARTUP` is set.
    pub async fn run_all_once(&self) {
        self.sweep_signups().await;
        self.sweep_presence().await;
        self.sweep_orphaned_keys().await;
    }

    /// The scheduler loop: presence and orphan sweeps every five minutes,
    /// the signup sweep every hour. Exits on shutdown.
    pub async fn run_loop(self, shutdown: ShutdownChannel) {
        let mut presence_tick =
            tokio::time::interval(constants::CLEANUP_PRESENCE_EVERY);
        let mut signup_tick =
            tokio::time::interval(constants::CLEANUP_SIGNUPS_EVERY);
        // The immediate first tick of each interval; sweeps at startup are
        // opt-in via run_all_once.
        presence_tick.tick().await;
        signup_tick.tick().await;

        info!("cleanup loop started");
        loop {
            tokio::select! {
                _ = presence_tick.tick() => {
                    self.sweep_presence().await;
                    self.sweep_orphaned_keys().await;
                }
                _ = signup_tick.tick() => {
                    self.sweep_signups().await;
                }
                () = shutdown.recv() => {
                    info!("cleanup loop received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Delete pending signups whose window lapsed, and their uploaded
    /// artifacts.
    pub async fn sweep_signups(&self) {
        if let Err(err) = self.sweep_signups_inner().await {
            warn!("signup sweep failed: {err:#}");
        }
    }

    async fn sweep_signups_inner(&self) -> anyhow::Result<()> {
        let now = TimestampMs::now();
        let mut tx = self.db.begin().await?;
        let expired = tx.list_expired_pending_signups(now).await?;
        if expired.is_empty() {
            tx.rollback().await?;
            return Ok(());
        }
        for signup in &expired {
            for url in &signup.artifact_urls {
                if let Err(err) = self.artifacts.delete(url).await {
                    warn!("artifact delete failed for {url}: {err:#}");
                }
            }
            tx.delete_pending_signup(signup.id).await?;
        }
        tx.commit().await?;
        info!(count = expired.len(), "pruned expired pending signups");
        Ok(())
    }

    /// A driver whose online flag lapsed (no location update within an
    /// hour) is lazily transitioned offline.
    pub async fn sweep_presence(&self) {
        if let Err(err) = self.sweep_presence_inner().await {
            warn!("presence sweep failed: {err:#}");
        }
    }

    async fn sweep_presence_inner(&self) -> anyhow::Result<()> {
        let online = self.kv.smembers(keys::DRIVERS_ONLINE).await?;
        let mut swept = 0usize;
        for member in online {
            let Ok(driver_id) = UserId::from_str(&member) else {
                warn!("non-uuid member in online set: {member}");
                continue;
            };
            if self.presence.online_flag_missing(driver_id).await? {
                debug!(%driver_id, "stale presence, forcing offline");
                if let Err(err) = self.presence.go_offline(driver_id).await {
                    warn!(%driver_id, "forced offline failed: {err}");
                } else {
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            info!(swept, "stale drivers transitioned offline");
        }
        Ok(())
    }

    /// Dispatch keys whose backing trip record is gone are leftovers from
    /// crashed searches; drop them.
    pub async fn sweep_orphaned_keys(&self) {
        if let Err(err) = self.sweep_orphaned_keys_inner().await {
            warn!("orphan sweep failed: {err:#}");
        }
    }

    async fn sweep_orphaned_keys_inner(&self) -> anyhow::Result<()> {
        let mut removed = 0usize;
        for prefix in [
            "trip:lock:",
            "trip:timeout:",
            "trip:accepting:",
            "trip:no_expire:",
            "trip:offers:",
            "trip:declined:",
        ] {
            for key in self.kv.scan_prefix(prefix).await? {
                let Some(id_part) = key.strip_prefix(prefix) else {
                    continue;
                };
                let Ok(trip_id) = TripId::from_str(id_part) else {
                    continue;
                };
                if !self.kv.exists(&keys::trip(&trip_id)).await? {
                    self.kv.del(&key).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "orphaned dispatch keys removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration as StdDuration;

    use common::ids::TripId;
    use store::db::MemoryDb;
    use store::kv::{KvStore, MemoryKv};
    use store::models::PendingSignupRow;

    use super::*;
    use crate::events::RecordingSink;

    fn service(
        kv: MemoryKv,
        db: MemoryDb,
    ) -> CleanupService<MemoryKv, MemoryDb, RecordingSink> {
        let sink = RecordingSink::new();
        let presence = Presence::new(kv.clone(), sink);
        CleanupService::new(kv, db, presence, Arc::new(NoopArtifactStore))
    }

    #[tokio::test]
    async fn prunes_expired_signups_only() {
        let db = MemoryDb::new();
        let now = TimestampMs::now();
        db.seed_pending_signup(PendingSignupRow {
            id: uuid::Uuid::new_v4(),
            email: "old@example.cm".to_string(),
            expires_at: TimestampMs::from_i64(now.as_i64() - 1000).unwrap(),
            artifact_urls: vec!["s3://bucket/cni.jpg".to_string()],
        })
        .await;
        db.seed_pending_signup(PendingSignupRow {
            id: uuid::Uuid::new_v4(),
            email: "fresh@example.cm".to_string(),
            expires_at: now.saturating_add(StdDuration::from_secs(600)),
            artifact_urls: vec![],
        })
        .await;

        let service = service(MemoryKv::new(), db.clone());
        service.sweep_signups().await;
        assert_eq!(db.pending_signup_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_stale_drivers_offline() {
        let kv = MemoryKv::new();
        let service = service(kv.clone(), MemoryDb::new());
        let driver = UserId::generate();
        service
            .presence
            .go_online(driver, 4.05, 9.76, None)
            .await
            .unwrap();

        // Fresh flag: nothing happens.
        service.sweep_presence().await;
        assert!(service.presence.is_online(driver).await.unwrap());

        // The flag expires after an hour without updates.
        tokio::time::advance(constants::DRIVER_META_TTL).await;
        tokio::time::advance(StdDuration::from_secs(1)).await;
        service.sweep_presence().await;
        assert!(!service.presence.is_online(driver).await.unwrap());
        assert!(!service.presence.is_available(driver).await.unwrap());
    }

    #[tokio::test]
    async fn removes_orphaned_lock_keys() {
        let kv = MemoryKv::new();
        let service = service(kv.clone(), MemoryDb::new());
        let orphan = TripId::generate();
        kv.put_string(&keys::trip_lock(&orphan), "nonce", None)
            .await
            .unwrap();
        kv.put_string(&keys::trip_declined(&orphan), "x", None)
            .await
            .unwrap();

        // A live trip's keys stay.
        let live = TripId::generate();
        kv.put_string(&keys::trip(&live), "{}", None).await.unwrap();
        kv.put_string(&keys::trip_lock(&live), "nonce", None)
            .await
            .unwrap();

        service.sweep_orphaned_keys().await;
        assert!(!kv.exists(&keys::trip_lock(&orphan)).await.unwrap());
        assert!(kv.exists(&keys::trip_lock(&live)).await.unwrap());
    }
}
