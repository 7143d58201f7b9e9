use std::sync::Arc;

use courier_dispatch::api;
use courier_dispatch::config::{Config, DispatchSettings, EnvConfigStore};
use courier_dispatch::engine::queue::run_timeout_worker;
use courier_dispatch::engine::sweeper::run_sweeper;
use courier_dispatch::error::DispatchError;
use courier_dispatch::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let settings = DispatchSettings::load(&EnvConfigStore)?;
    tracing::info!(
        notify_riders_count = settings.notify_riders_count,
        max_retry_attempts = settings.max_retry_attempts,
        assignment_timeout_secs = settings.assignment_timeout.as_secs(),
        "dispatch settings loaded"
    );

    let (app_state, timeout_rx) =
        AppState::new(settings, config.timeout_queue_size, config.event_buffer_size);
    let shared_state = Arc::new(app_state);

    tokio::spawn(run_timeout_worker(shared_state.engine.clone(), timeout_rx));

    if let Err(err) = shared_state.engine.recover_timeout_checks().await {
        tracing::error!(error = %err, "failed to recover timeout checks");
    }

    tokio::spawn(run_sweeper(
        shared_state.engine.clone(),
        config.sweep_interval,
    ));

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| DispatchError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| DispatchError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
