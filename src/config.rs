use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "ADVISOR_";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub sync_interval: Duration,
    pub outcome_interval: Duration,
    pub outcome_batch_size: u32,
    pub sync_date_preset: String,
    pub rejected: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/advisor.sqlite"),
            log_dir: PathBuf::from("data/logs"),
            sync_interval: Duration::from_secs(6 * 3600),
            outcome_interval: Duration::from_secs(12 * 3600),
            outcome_batch_size: 100,
            sync_date_preset: "last_7d".to_string(),
            rejected: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut rejected = Vec::new();
        Self {
            database_path: env_var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            log_dir: env_var("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            sync_interval: Duration::from_secs(env_or("SYNC_INTERVAL_HOURS", 6u64, &mut rejected).max(1) * 3600),
            outcome_interval: Duration::from_secs(env_or("OUTCOME_INTERVAL_HOURS", 12u64, &mut rejected).max(1) * 3600),
            outcome_batch_size: env_or("OUTCOME_BATCH_SIZE", defaults.outcome_batch_size, &mut rejected).max(1),
            sync_date_preset: env_var("SYNC_DATE_PRESET").unwrap_or(defaults.sync_date_preset),
            rejected,
        }
    }

    pub fn log_rejected(&self) {
        for entry in &self.rejected {
            tracing::warn!(entry = %entry, "ignoring unparseable config value");
        }
    }
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or<T: FromStr>(name: &str, default: T, rejected: &mut Vec<String>) -> T {
    let Some(raw) = env_var(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            rejected.push(format!("{}{}={}", ENV_PREFIX, name, raw));
            default
        }
    }
}
