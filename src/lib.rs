pub mod atomic;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod lock;
pub mod models;
pub mod orchestrator;
pub mod schedule;
pub mod tracker;

pub use crate::cache::{CacheMap, StatsCache};
pub use crate::config::TrackerConfig;
pub use crate::db::Database;
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{
    ratio, CacheEntry, CycleReport, CycleState, EntityMeta, MetaUpdate, Period, RefreshRequest, StatLine,
    StatSnapshots,
};
pub use crate::orchestrator::{FetchFuture, FetchedStats, Orchestrator, StatsSource};
pub use crate::tracker::StatTracker;

use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging to a daily-rolled file. `RUST_LOG` overrides `level`.
pub fn init_tracing(log_dir: &Path, level: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "stat-tracker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

/// Loads config, opens the tracker and drives scheduled refreshes until ctrl-c.
pub async fn run(config_path: &Path, source: Arc<dyn StatsSource>) -> AppResult<()> {
    let config = TrackerConfig::load(config_path)?;
    init_tracing(&config.log_dir(), &config.log_level)?;

    let tracker = StatTracker::open(config, source)?;
    let refresh_loop = tracker.start();
    tokio::signal::ctrl_c().await?;
    refresh_loop.abort();
    tracing::info!("stat tracker stopped");
    Ok(())
}
