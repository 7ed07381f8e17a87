mod audit;
mod bootstrap;
mod health;
mod routes;

use std::time::Duration;

use anyhow::Result;
use eventcrew_core::config::{AppConfig, LoadOptions};
use eventcrew_db::{spawn_sync_loop, SyncSettings};
use tokio::sync::watch;

fn init_logging(config: &AppConfig) {
    use eventcrew_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_handle =
        spawn_sync_loop(app.cache.clone(), SyncSettings::from(&app.config.cache), shutdown_rx);

    let router = routes::router(routes::MessageState { runtime: app.runtime.clone() }).merge(
        health::router(health::HealthState { db_pool: app.db_pool.clone(), cache: app.cache.clone() }),
    );

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "eventcrew-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "eventcrew-server stopping; flushing conversation state"
    );

    // A send error means the loop already exited; the join below still reports it.
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, sync_handle).await {
        Ok(Ok(report)) => tracing::info!(
            event_name = "system.server.final_flush",
            correlation_id = "shutdown",
            flushed = report.flushed,
            failed = report.failed,
            busy = report.busy,
            "final state flush finished"
        ),
        Ok(Err(error)) => tracing::error!(
            event_name = "system.server.final_flush_failed",
            correlation_id = "shutdown",
            error = %error,
            "state sync task ended abnormally"
        ),
        Err(_) => tracing::warn!(
            event_name = "system.server.final_flush_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "final state flush did not finish within the shutdown grace period"
        ),
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
}
