//! Command-line arguments and environment configuration.

use anyhow::Context;
use argh::FromArgs;
use chrono::FixedOffset;
use common::env::{self, DeployEnv};
use common::money::CommissionRate;
use ride::config::DispatchConfig;
use rust_decimal::Decimal;
use std::time::Duration;

/// The okada dispatch server.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// listen port; overrides the PORT env var
    #[argh(option)]
    pub port: Option<u16>,
}

/// Everything the process needs, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub deploy_env: DeployEnv,
    pub port: u16,
    /// Postgres DSN.
    pub database_url: String,
    /// Redis URL, e.g. `redis://127.0.0.1:6379/0`.
    pub kv_url: String,
    /// HS256 secret for socket bearer tokens.
    pub token_secret: String,
    pub run_cleanup_on_startup: bool,
    pub dispatch: DispatchConfig,
}

impl Config {
    pub fn from_env(args: &Args) -> anyhow::Result<Self> {
        let deploy_env = DeployEnv::from_env()?;
        let port = match args.port {
            Some(port) => port,
            None => env::parsed_or("PORT", 8080u16)?,
        };
        let database_url = env::required("DATABASE_URL")?;
        let kv_url = match env::optional("REDIS_URL")? {
            Some(url) => url,
            None => {
                let host =
                    env::optional("REDIS_HOST")?.unwrap_or_else(|| {
                        "127.0.0.1".to_string()
                    });
                let port = env::parsed_or("REDIS_PORT", 6379u16)?;
                let db = env::parsed_or("REDIS_DB", 0u8)?;
                format!("redis://{host}:{port}/{db}")
            }
        };
        let token_secret = env::required("TOKEN_SECRET")?;
        let run_cleanup_on_startup =
            env::parsed_or("RUN_CLEANUP_ON_STARTUP", false)?;

        let defaults = DispatchConfig::default();
        let default_commission = match env::optional(
            "DEFAULT_COMMISSION_RATE",
        )? {
            Some(raw) => {
                let rate = raw
                    .parse::<Decimal>()
                    .context("DEFAULT_COMMISSION_RATE is not a decimal")?;
                CommissionRate::new(rate)
                    .context("DEFAULT_COMMISSION_RATE out of range")?
            }
            None => defaults.default_commission,
        };
        let tz_offset_hours = env::parsed_or("LOCAL_TZ_OFFSET_HOURS", 1i32)?;
        let tz_offset = FixedOffset::east_opt(tz_offset_hours * 3600)
            .context("LOCAL_TZ_OFFSET_HOURS out of range")?;
        let dispatch = DispatchConfig {
            radius_km: env::parsed_or(
                "DISPATCH_RADIUS_KM",
                defaults.radius_km,
            )?,
            radius_step_km: env::parsed_or(
                "DISPATCH_RADIUS_STEP_KM",
                defaults.radius_step_km,
            )?,
            radius_max_km: env::parsed_or(
                "DISPATCH_RADIUS_MAX_KM",
                defaults.radius_max_km,
            )?,
            wave_size: env::parsed_or(
                "DISPATCH_WAVE_SIZE",
                defaults.wave_size,
            )?,
            wave_timeout: Duration::from_secs(env::parsed_or(
                "DISPATCH_WAVE_TIMEOUT_SECS",
                defaults.wave_timeout.as_secs(),
            )?),
            max_waves: env::parsed_or(
                "DISPATCH_MAX_WAVES",
                defaults.max_waves,
            )?,
            default_commission,
            tz_offset,
            default_city: env::optional("DEFAULT_CITY")?
                .unwrap_or(defaults.default_city),
        };

        Ok(Self {
            deploy_env,
            port,
            database_url,
            kv_url,
            token_secret,
            run_cleanup_on_startup,
            dispatch,
        })
    }
}
