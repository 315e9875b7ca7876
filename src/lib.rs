pub mod cache;
pub mod classifier;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod outcomes;
pub mod recommender;
pub mod refiner;
pub mod scheduler;
pub mod settings;

pub use crate::config::AppConfig;
pub use crate::engine::{AdvisorCore, Collaborators};
pub use crate::errors::{AppError, AppResult};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub async fn run() -> Result<(), String> {
    let config = AppConfig::from_env();
    init_tracing(&config.log_dir)?;
    config.log_rejected();
    tracing::info!(
        database = %config.database_path.display(),
        sync_interval_secs = config.sync_interval.as_secs(),
        outcome_interval_secs = config.outcome_interval.as_secs(),
        "starting campaign advisor"
    );

    let core = AdvisorCore::new(config, Collaborators::default()).map_err(to_client_error)?;
    core.start_jobs();

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
    }
    core.shutdown();
    tracing::info!("campaign advisor stopped");
    Ok(())
}

fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(to_client_error)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "advisor.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(to_client_error)
}

fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}
