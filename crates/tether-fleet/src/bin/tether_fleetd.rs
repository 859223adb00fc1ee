//! Fleet orchestration daemon.
//!
//! Serves the task API, runs the deadline sweeper, and forwards worker
//! lifecycle calls to the configured platform provider.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tether_core::{init_logging, Error, LogFormat, Result, StaticTokenProvider};
use tether_fleet::http::{serve, AppState};
use tether_fleet::store::MemoryFleetStore;
use tether_fleet::{DeadlineSweeper, FleetConfig, HttpWorkerPlatform, WorkerOrchestrator};

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn resolve_port() -> Result<u16> {
    if let Ok(port) = std::env::var("PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid PORT"));
    }

    if let Ok(port) = std::env::var("TETHER_FLEET_PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid TETHER_FLEET_PORT"));
    }

    Ok(7500)
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("TETHER_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn config_from_env() -> Result<FleetConfig> {
    let callback_base_url = required_env("TETHER_FLEET_CALLBACK_BASE_URL")?;
    let mut config = FleetConfig::new(callback_base_url);

    if let Some(timeout) = optional_env("TETHER_FLEET_DEFAULT_TIMEOUT_SECS") {
        let seconds = timeout
            .parse::<u32>()
            .map_err(|_| Error::configuration("invalid TETHER_FLEET_DEFAULT_TIMEOUT_SECS"))?;
        config = config.with_default_timeout_seconds(seconds);
    }

    if let Some(interval) = optional_env("TETHER_FLEET_SWEEP_INTERVAL_SECS") {
        let seconds = interval
            .parse::<u64>()
            .map_err(|_| Error::configuration("invalid TETHER_FLEET_SWEEP_INTERVAL_SECS"))?;
        config = config.with_sweep_interval(Duration::from_secs(seconds));
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let config = config_from_env()?;
    let platform_url = required_env("TETHER_FLEET_PLATFORM_URL")?;
    let platform_token = required_env("TETHER_FLEET_PLATFORM_TOKEN")?;
    let port = resolve_port()?;

    let sweep_interval = config.sweep_interval;
    let store = Arc::new(MemoryFleetStore::new());
    let platform = Arc::new(HttpWorkerPlatform::new(
        platform_url,
        Arc::new(StaticTokenProvider::new(platform_token)),
    )?);
    let orchestrator = WorkerOrchestrator::new(config, store.clone(), platform)?;
    let sweeper = DeadlineSweeper::new(orchestrator.clone(), store, sweep_interval);

    let shutdown = CancellationToken::new();

    let daemon = sweeper.clone();
    let daemon_shutdown = shutdown.clone();
    let daemon_handle = tokio::spawn(async move { daemon.run(daemon_shutdown).await });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    serve(AppState::new(orchestrator, sweeper), port, shutdown).await?;

    daemon_handle
        .await
        .map_err(|err| Error::internal(format!("sweeper task panicked: {err}")))?;

    Ok(())
}
