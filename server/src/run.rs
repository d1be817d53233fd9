//! Process startup and orderly shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use common::shutdown::ShutdownChannel;
use common::task::{self, NamedTask};
use tracing::info;

use crate::cli::{Args, Config};
use crate::context::AppContext;
use crate::gateway;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_env(&args)?;
    info!(
        env = config.deploy_env.as_str(),
        port = config.port,
        "starting okada dispatch server"
    );

    let ctx = AppContext::build(config).await?;
    if ctx.config.run_cleanup_on_startup {
        info!("RUN_CLEANUP_ON_STARTUP set, sweeping now");
        ctx.cleanup.run_all_once().await;
    }

    let shutdown = ShutdownChannel::new();
    let mut tasks: Vec<NamedTask<()>> = Vec::new();

    // Scheduled cleanup.
    tasks.push(NamedTask::spawn("cleanup-loop", {
        let cleanup = ctx.cleanup.clone();
        let shutdown = shutdown.clone();
        async move { cleanup.run_loop(shutdown).await }
    }));

    // The gateway itself.
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;
    info!(%addr, "gateway listening");
    tasks.push(NamedTask::spawn("gateway", {
        let router = gateway::router(ctx.clone());
        let shutdown = shutdown.clone();
        async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(
                async move { shutdown.recv().await },
            );
            if let Err(err) = serve.await {
                tracing::error!("gateway server failed: {err:#}");
            }
        }
    }));

    // Ctrl-C turns into the shutdown signal for everyone.
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("ctrl-c handler failed")?;
            info!("interrupt received, shutting down");
            shutdown.send();
        }
        () = shutdown.recv() => (),
    }

    task::join_all_with_timeout(tasks, SHUTDOWN_TIMEOUT).await;
    info!("bye");
    Ok(())
}
