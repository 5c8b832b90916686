use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use buildgate_service::config::Config;
use buildgate_service::metric;

use crate::endpoints;
use crate::service::RequestService;

/// How long in-flight requests may take to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Starts the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("buildgate-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = web_pool
        .block_on(async { RequestService::create(&config) })
        .context("failed to create HTTP service state")?;
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address {:?}", config.bind))?;

    let handle = axum_server::Handle::new();
    web_pool.spawn(shutdown_on_signal(handle.clone()));

    tracing::info!("Starting HTTP server on {}", socket);
    web_pool.block_on(
        axum_server::bind(socket)
            .handle(handle)
            .serve(endpoints::create_app(service).into_make_service()),
    )?;
    tracing::info!("System shutdown complete");

    Ok(())
}

async fn shutdown_on_signal(handle: axum_server::Handle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Shutting down gracefully");
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
        Err(error) => tracing::error!(%error, "failed to listen for shutdown signal"),
    }
}
