use crate::errors::{AppError, AppResult};
use crate::models::SyncResult;
use once_cell::sync::Lazy;
use regex::Regex;

static DATE_PRESET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(today|yesterday|this_month|last_month|maximum|last_[1-9][0-9]{0,2}d)$").expect("valid regex")
});

pub trait IngestionClient: Send + Sync {
    fn sync(&self, account_id: &str, date_preset: &str) -> anyhow::Result<SyncResult>;
}

#[derive(Debug, Default, Clone)]
pub struct DisabledIngestion;

impl IngestionClient for DisabledIngestion {
    fn sync(&self, account_id: &str, _date_preset: &str) -> anyhow::Result<SyncResult> {
        anyhow::bail!("no ingestion client configured for account {}", account_id)
    }
}

pub fn validate_date_preset(preset: &str) -> AppResult<()> {
    if DATE_PRESET.is_match(preset) {
        Ok(())
    } else {
        Err(AppError::Invalid(format!("unsupported date preset '{}'", preset)))
    }
}
