//! # Recon Relay
//!
//! Field telemetry agent: adaptive GPS polling, offline map tile caching
//! and store-and-forward record upload, all driven by one job scheduler.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use recon_relay::config::{Config, LoggingConfig};
use recon_relay::runtime::Runtime;

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Main entry point for Recon Relay
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or `config/default.toml`)
///    - Set up logging (stdout, plus daily files when `logging.log_dir` is set)
///    - Start the runtime and its scheduled jobs
///
/// 2. **Running**
///    - Jobs run on their own cadence; smoothed positions are logged at debug level
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C cancels all jobs and waits for in-flight work to finish
///
/// # Errors
///
/// Returns error if the configuration is invalid or the runtime cannot start.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let (config, loaded_from_file) = load_config(&config_path)?;

    let _log_guard = init_logging(&config.logging)?;

    info!("Recon Relay v{} starting...", env!("CARGO_PKG_VERSION"));
    if loaded_from_file {
        info!("Configuration loaded from {}", config_path);
    } else {
        warn!("{} not found, running with built-in defaults", config_path);
    }

    let runtime = Runtime::start(&config)
        .await
        .context("failed to start runtime")?;

    let mut feed = runtime.position_feed();
    let feed_task = tokio::spawn(async move {
        while feed.changed().await.is_ok() {
            let latest = *feed.borrow_and_update();
            if let Some(position) = latest {
                debug!(
                    lat = position.lat,
                    lon = position.lon,
                    speed_kmh = position.speed_kmh,
                    "Position"
                );
            }
        }
    });

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    let mut metrics: Vec<_> = runtime.scheduler().get_metrics().into_iter().collect();
    metrics.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, m) in metrics {
        info!(
            job = %name,
            runs = m.run_count,
            skipped = m.skipped_ticks,
            last_error = m.last_error.as_deref().unwrap_or("-"),
            "Job summary"
        );
    }

    runtime.shutdown().await;
    feed_task.abort();
    Ok(())
}

/// Loads the config file, falling back to defaults when it does not exist.
fn load_config(path: &str) -> Result<(Config, bool)> {
    if !Path::new(path).exists() {
        return Ok((Config::default(), false));
    }
    let config = Config::load(path).with_context(|| format!("invalid configuration in {}", path))?;
    Ok((config, true))
}

/// Installs the global subscriber. The returned guard flushes file output on drop.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid logging level '{}'", logging.level))?,
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    if logging.log_dir.is_empty() {
        registry.init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&logging.log_dir, "recon-relay.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}
