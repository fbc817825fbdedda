mod api;
mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use datapilot_core::config::{AppConfig, LoadOptions};
use datapilot_core::{ApplicationError, ToolProvider};
use tokio::sync::broadcast::error::RecvError;

fn init_logging(config: &AppConfig) {
    use datapilot_core::config::LogFormat::*;
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
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = match bootstrap::bootstrap_with_config(config).await {
        Ok(app) => app,
        Err(error) => {
            let failure = ApplicationError::from(error);
            tracing::error!(
                event_name = "system.bootstrap.failed",
                correlation_id = "bootstrap",
                error = %failure,
                "bootstrap failed"
            );
            return Err(failure.into());
        }
    };
    spawn_progress_log(&app.progress);

    let router = health::router(health::HealthState {
        db_pool: app.db_pool.clone(),
        tools: app.tools.clone(),
    })
    .merge(api::router(app.agent_runtime.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "datapilot-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "datapilot-server stopping"
    );

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.tools.close()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "tool backends did not close within the grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

/// Mirrors turn progress into the debug log; lagging only drops log lines.
fn spawn_progress_log(progress: &datapilot_agent::BroadcastProgressSink) {
    let mut events = progress.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(
                    event_name = "agent.progress",
                    thread_id = %event.thread_id,
                    sequence = event.sequence,
                    progress = ?event.kind,
                    "turn progress"
                ),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(
                    event_name = "agent.progress.lagged",
                    skipped,
                    "progress log fell behind"
                ),
                Err(RecvError::Closed) => break,
            }
        }
    });
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
