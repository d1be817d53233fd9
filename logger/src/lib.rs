//! Global `tracing` logger configuration for okada services.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Initialize the global `tracing` logger.
///
/// + Prints enabled events and spans to stdout.
/// + Defaults to INFO and above.
/// + `RUST_LOG` adjusts levels and per-module targets using the standard
///   targets-filter syntax.
///
/// Panics if a logger is already initialized; call once from `main`.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Initialize the global logger in tests. Does nothing unless `RUST_LOG` is
/// set, and never panics when multiple test threads race to install it.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Try to initialize the global logger; `Err` if one is already set.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}
