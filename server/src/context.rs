//! Process-wide dependency assembly.
//!
//! There are no module-level singletons anywhere in the workspace: every
//! component receives its stores and sinks here, once, and `main` owns the
//! result.

use std::sync::Arc;

use anyhow::Context as _;
use ride::chat::ChatService;
use ride::cleanup::{CleanupService, NoopArtifactStore};
use ride::dispatch::Dispatcher;
use ride::presence::Presence;
use ride::ratings::RatingService;
use ride::trips::TripManager;
use store::db::PostgresDb;
use store::kv::RedisKv;
use tracing::{info, warn};

use crate::cli::Config;
use crate::gateway::auth::TokenVerifier;
use crate::gateway::rooms::{GatewaySink, Rooms};

pub type Kv = RedisKv;
pub type Database = PostgresDb;
pub type Sink = GatewaySink;

pub struct AppContext {
    pub config: Config,
    pub kv: Kv,
    pub db: Database,
    pub rooms: Rooms,
    pub sink: Sink,
    pub verifier: TokenVerifier,
    pub presence: Presence<Kv, Sink>,
    pub dispatcher: Dispatcher<Kv, Database, Sink>,
    pub trips: TripManager<Kv, Database, Sink>,
    pub chat: ChatService<Kv, Database, Sink>,
    pub ratings: RatingService<Database>,
    pub cleanup: CleanupService<Kv, Database, Sink>,
}

impl AppContext {
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let kv = connect_kv(&config.kv_url).await?;
        let db = PostgresDb::connect(&config.database_url).await?;
        db.run_migrations().await?;
        info!("stores connected, migrations current");

        let rooms = Rooms::new();
        let sink = GatewaySink::new(rooms.clone());
        let verifier = TokenVerifier::new(&config.token_secret);
        let dispatch_config = Arc::new(config.dispatch.clone());

        let presence = Presence::new(kv.clone(), sink.clone());
        let dispatcher = Dispatcher::new(
            kv.clone(),
            db.clone(),
            presence.clone(),
            sink.clone(),
            Arc::clone(&dispatch_config),
        );
        let trips = TripManager::new(
            kv.clone(),
            db.clone(),
            sink.clone(),
            Arc::clone(&dispatch_config),
        );
        let chat = ChatService::new(kv.clone(), db.clone(), sink.clone());
        let ratings = RatingService::new(db.clone());
        let cleanup = CleanupService::new(
            kv.clone(),
            db.clone(),
            presence.clone(),
            Arc::new(NoopArtifactStore),
        );

        Ok(Arc::new(Self {
            config,
            kv,
            db,
            rooms,
            sink,
            verifier,
            presence,
            dispatcher,
            trips,
            chat,
            ratings,
            cleanup,
        }))
    }
}

/// The key-value store is load-bearing for everything; retry a few times
/// with backoff before giving up on startup.
async fn connect_kv(url: &str) -> anyhow::Result<RedisKv> {
    let mut backoff = common::backoff::iter();
    let mut last_err = None;
    for attempt in 1..=5 {
        match RedisKv::connect(url).await {
            Ok(kv) => return Ok(kv),
            Err(err) => {
                warn!("kv connect attempt {attempt} failed: {err:#}");
                last_err = Some(err);
                let wait = backoff.next().expect("backoff is infinite");
                tokio::time::sleep(wait).await;
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
        .context("could not reach the key-value store")
}
