use crate::cache::{
    make_key, CacheStats, TtlCache, PREFIX_ACCOUNTS, PREFIX_AUDIENCES, PREFIX_BENCHMARKS, PREFIX_METRICS,
    PREFIX_RECOMMENDATIONS, TTL_ACCOUNTS, TTL_AUDIENCES, TTL_RECOMMENDATIONS,
};
use crate::config::AppConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::ingestion::{validate_date_preset, DisabledIngestion, IngestionClient};
use crate::metrics::{MetricsAggregator, DEFAULT_WINDOW_DAYS};
use crate::models::{
    AccountBenchmarks, Account, ActionLog, Audience, GenerateResponse, OutcomeRunReport, Recommendation,
    RecommendedAction, SyncResult, SyncStatus,
};
use crate::outcomes::OutcomeTracker;
use crate::recommender::RecommendationGenerator;
use crate::refiner::{NarrativeRefiner, NoopRefiner};
use crate::scheduler::{JobScheduler, PeriodicJob};
use crate::settings::{EngineSettings, SettingsResolver};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

pub const DEFAULT_RECOMMENDATION_LIMIT: u32 = 100;
pub const MAX_RECOMMENDATION_LIMIT: u32 = 500;

pub const SYNC_JOB: &str = "account-sync";
pub const OUTCOME_JOB: &str = "outcome-backfill";

#[derive(Clone)]
pub struct Collaborators {
    pub ingestion: Arc<dyn IngestionClient>,
    pub refiner: Arc<dyn NarrativeRefiner>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            ingestion: Arc::new(DisabledIngestion),
            refiner: Arc::new(NoopRefiner),
        }
    }
}

pub struct AdvisorCore {
    config: AppConfig,
    db: Arc<Database>,
    cache: Arc<TtlCache>,
    settings: Arc<SettingsResolver>,
    aggregator: Arc<MetricsAggregator>,
    generator: RecommendationGenerator,
    outcomes: OutcomeTracker,
    ingestion: Arc<dyn IngestionClient>,
    scheduler: JobScheduler,
}

impl AdvisorCore {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&config.database_path)?);
        Ok(Self::with_database(
            db,
            config,
            EngineSettings::env_defaults().clone(),
            collaborators,
        ))
    }

    pub fn with_database(
        db: Arc<Database>,
        config: AppConfig,
        defaults: EngineSettings,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let cache = Arc::new(TtlCache::new());
        let settings = Arc::new(SettingsResolver::new(db.clone(), cache.clone(), defaults));
        let aggregator = Arc::new(MetricsAggregator::new(db.clone(), cache.clone()));
        let generator = RecommendationGenerator::new(
            db.clone(),
            cache.clone(),
            aggregator.clone(),
            settings.clone(),
            collaborators.refiner,
        );
        let outcomes = OutcomeTracker::new(db.clone(), aggregator.clone(), config.outcome_batch_size);

        Arc::new(Self {
            config,
            db,
            cache,
            settings,
            aggregator,
            generator,
            outcomes,
            ingestion: collaborators.ingestion,
            scheduler: JobScheduler::new(),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_settings(&self) -> EngineSettings {
        self.settings.current()
    }

    pub fn update_settings(&self, payload: &Value) -> AppResult<EngineSettings> {
        self.settings.update(payload)
    }

    pub fn reset_settings(&self) -> AppResult<EngineSettings> {
        self.settings.reset()
    }

    pub fn list_accounts(&self) -> AppResult<Vec<Account>> {
        let key = format!("{}all", PREFIX_ACCOUNTS);
        if let Some(cached) = self.cache.get::<Vec<Account>>(&key) {
            return Ok(cached);
        }
        let accounts = self.db.list_accounts()?;
        self.cache.set(&key, &accounts, TTL_ACCOUNTS);
        Ok(accounts)
    }

    pub fn get_account(&self, account_id: &str) -> AppResult<Account> {
        let key = make_key(PREFIX_ACCOUNTS, &json!(["account", account_id]));
        if let Some(cached) = self.cache.get::<Account>(&key) {
            return Ok(cached);
        }
        let account = self
            .db
            .get_account(account_id)?
            .ok_or_else(|| AppError::NotFound(format!("account {}", account_id)))?;
        self.cache.set(&key, &account, TTL_ACCOUNTS);
        Ok(account)
    }

    pub fn list_audiences(&self, account_id: &str) -> AppResult<Vec<Audience>> {
        self.get_account(account_id)?;
        let key = make_key(PREFIX_AUDIENCES, &json!(["account", account_id]));
        if let Some(cached) = self.cache.get::<Vec<Audience>>(&key) {
            return Ok(cached);
        }
        let audiences = self.db.list_audiences(account_id)?;
        self.cache.set(&key, &audiences, TTL_AUDIENCES);
        Ok(audiences)
    }

    pub fn get_audience(&self, audience_id: &str) -> AppResult<Audience> {
        let key = make_key(PREFIX_AUDIENCES, &json!(["audience", audience_id]));
        if let Some(cached) = self.cache.get::<Audience>(&key) {
            return Ok(cached);
        }
        let audience = self
            .db
            .get_audience(audience_id)?
            .ok_or_else(|| AppError::NotFound(format!("audience {}", audience_id)))?;
        self.cache.set(&key, &audience, TTL_AUDIENCES);
        Ok(audience)
    }

    pub fn list_recommendations(&self, account_id: &str, limit: Option<u32>) -> AppResult<Vec<Recommendation>> {
        self.get_account(account_id)?;
        let limit = limit
            .unwrap_or(DEFAULT_RECOMMENDATION_LIMIT)
            .clamp(1, MAX_RECOMMENDATION_LIMIT);
        let key = make_key(PREFIX_RECOMMENDATIONS, &json!(["account", account_id, limit]));
        if let Some(cached) = self.cache.get::<Vec<Recommendation>>(&key) {
            return Ok(cached);
        }
        let recommendations = self.db.list_recommendations(account_id, limit)?;
        self.cache.set(&key, &recommendations, TTL_RECOMMENDATIONS);
        Ok(recommendations)
    }

    pub fn account_benchmarks(&self, account_id: &str) -> AppResult<AccountBenchmarks> {
        self.get_account(account_id)?;
        self.aggregator.account_benchmarks(account_id)
    }

    pub fn sync_status(&self, account_id: &str) -> AppResult<SyncStatus> {
        let account = self
            .db
            .get_account(account_id)?
            .ok_or_else(|| AppError::NotFound(format!("account {}", account_id)))?;
        let audiences_with_data = self.db.count_audiences_with_data(account_id, DEFAULT_WINDOW_DAYS)?;
        Ok(SyncStatus {
            account_id: account.id,
            last_synced_at: account.last_synced_at,
            audience_count: self.db.count_audiences(account_id)?,
            snapshot_count: self.db.count_snapshots(account_id)?,
            audiences_with_data,
            can_generate: audiences_with_data > 0,
        })
    }

    pub fn generate_recommendations(&self, account_id: &str) -> AppResult<GenerateResponse> {
        let status = self.sync_status(account_id)?;
        if !status.can_generate {
            return Err(AppError::InsufficientData(format!(
                "account {} has no {}-day snapshots; sync it first",
                account_id, DEFAULT_WINDOW_DAYS
            )));
        }
        let recommendations = self.generator.generate_for_account(account_id)?;
        Ok(GenerateResponse {
            count: recommendations.len(),
            recommendations,
        })
    }

    pub fn record_action(
        &self,
        audience_id: &str,
        action: RecommendedAction,
        magnitude: f64,
    ) -> AppResult<ActionLog> {
        let audience = self.get_audience(audience_id)?;
        let log = self
            .db
            .record_action(&audience.account_id, &audience.id, action, magnitude, Utc::now())?;
        self.cache.invalidate_prefix(PREFIX_RECOMMENDATIONS);
        Ok(log)
    }

    pub fn sync_account(&self, account_id: &str, date_preset: &str) -> AppResult<SyncResult> {
        validate_date_preset(date_preset)?;
        self.get_account(account_id)?;

        let result = self
            .ingestion
            .sync(account_id, date_preset)
            .map_err(|error| AppError::Upstream(error.to_string()))?;
        if let Some(error) = &result.error {
            return Err(AppError::Upstream(error.clone()));
        }

        if result.synced {
            self.db.mark_account_synced(account_id, Utc::now())?;
            self.cache.invalidate_prefixes(&[
                PREFIX_ACCOUNTS,
                PREFIX_AUDIENCES,
                PREFIX_RECOMMENDATIONS,
                PREFIX_BENCHMARKS,
                PREFIX_METRICS,
            ]);
        }
        tracing::info!(
            account_id = %account_id,
            date_preset = %date_preset,
            synced = result.synced,
            audiences = result.audiences,
            snapshots = result.snapshots,
            "account sync finished"
        );
        Ok(result)
    }

    pub fn sync_all_accounts(&self) -> AppResult<(usize, usize)> {
        let accounts = self.db.list_accounts()?;
        let (mut synced, mut failed) = (0, 0);
        for account in accounts {
            match self.sync_account(&account.id, &self.config.sync_date_preset) {
                Ok(_) => synced += 1,
                Err(error) => {
                    failed += 1;
                    tracing::warn!(account_id = %account.id, error = %error, "scheduled account sync failed");
                }
            }
        }
        Ok((synced, failed))
    }

    pub fn update_outcome_metrics(&self) -> AppResult<OutcomeRunReport> {
        self.outcomes.run_once(Utc::now())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    pub fn start_jobs(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.start(PeriodicJob::new(SYNC_JOB, self.config.sync_interval, move || {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            let (synced, failed) = core.sync_all_accounts()?;
            tracing::info!(synced, failed, "scheduled account sync pass finished");
            Ok(())
        }));

        let weak = Arc::downgrade(self);
        self.scheduler.start(
            PeriodicJob::new(OUTCOME_JOB, self.config.outcome_interval, move || {
                if let Some(core) = weak.upgrade() {
                    core.update_outcome_metrics()?;
                }
                Ok(())
            })
            .run_on_start(),
        );
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AudienceType, NewMetricSnapshot};
    use chrono::Duration;
    use std::sync::Mutex;

    struct RecordingIngestion {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl IngestionClient for RecordingIngestion {
        fn sync(&self, account_id: &str, date_preset: &str) -> anyhow::Result<SyncResult> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((account_id.to_string(), date_preset.to_string()));
            if self.fail {
                anyhow::bail!("token expired");
            }
            Ok(SyncResult {
                synced: true,
                audiences: 1,
                snapshots: 1,
                error: None,
            })
        }
    }

    fn core_with(ingestion: Arc<dyn IngestionClient>) -> (tempfile::TempDir, Arc<AdvisorCore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let core = AdvisorCore::with_database(
            db,
            AppConfig::default(),
            EngineSettings::default(),
            Collaborators {
                ingestion,
                ..Collaborators::default()
            },
        );
        (dir, core)
    }

    fn core() -> (tempfile::TempDir, Arc<AdvisorCore>) {
        core_with(Arc::new(DisabledIngestion))
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (_dir, core) = core();
        assert!(matches!(core.get_account("missing"), Err(AppError::NotFound(_))));
        assert!(matches!(core.get_audience("missing"), Err(AppError::NotFound(_))));
        assert!(matches!(core.list_recommendations("missing", None), Err(AppError::NotFound(_))));
        assert!(matches!(core.generate_recommendations("missing"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn generation_requires_snapshots() {
        let (_dir, core) = core();
        let account = core.database().upsert_account("act_1", None).expect("account");
        let status = core.sync_status(&account.id).expect("status");
        assert!(!status.can_generate);
        assert!(matches!(
            core.generate_recommendations(&account.id),
            Err(AppError::InsufficientData(_))
        ));
    }

    #[test]
    fn new_batch_invalidates_cached_listing() {
        let (_dir, core) = core();
        let db = core.database().clone();
        let account = db.upsert_account("act_1", None).expect("account");
        db.upsert_audience("aud", &account.id, "Lookalike 1%", AudienceType::Lookalike, Utc::now() - Duration::days(10))
            .expect("audience");
        db.insert_metric_snapshot(&NewMetricSnapshot {
            audience_id: "aud".to_string(),
            window_days: 7,
            spend: 800.0,
            revenue: 800.0,
            impressions: 10_000,
            clicks: 300,
            purchases: 9,
            observed_at: Utc::now() - Duration::minutes(1),
        })
        .expect("snapshot");

        assert!(core.list_recommendations(&account.id, None).expect("empty").is_empty());
        let response = core.generate_recommendations(&account.id).expect("generate");
        assert_eq!(response.count, 1);
        let listed = core.list_recommendations(&account.id, None).expect("listed");
        assert_eq!(listed.len(), 1);
        assert_eq!(core.list_recommendations(&account.id, Some(0)).expect("clamped").len(), 1);
        assert_eq!(listed[0].audience_name.as_deref(), Some("Lookalike 1%"));
    }

    #[test]
    fn sync_validates_preset_and_stamps_account() {
        let ingestion = Arc::new(RecordingIngestion {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let (_dir, core) = core_with(ingestion.clone());
        let account = core.database().upsert_account("act_1", None).expect("account");
        core.list_accounts().expect("warm cache");

        assert!(matches!(core.sync_account(&account.id, "last_week"), Err(AppError::Invalid(_))));
        assert!(ingestion.calls.lock().expect("calls").is_empty());

        let result = core.sync_account(&account.id, "last_30d").expect("sync");
        assert!(result.synced);
        let accounts = core.list_accounts().expect("accounts");
        assert!(accounts[0].last_synced_at.is_some());
        assert_eq!(core.sync_status(&account.id).expect("status").last_synced_at, accounts[0].last_synced_at);
    }

    #[test]
    fn collaborator_error_is_upstream() {
        let ingestion = Arc::new(RecordingIngestion {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let (_dir, core) = core_with(ingestion);
        let account = core.database().upsert_account("act_1", None).expect("account");
        assert!(matches!(core.sync_account(&account.id, "last_7d"), Err(AppError::Upstream(_))));
        assert_eq!(core.sync_all_accounts().expect("sync all"), (0, 1));
        assert!(core.get_account(&account.id).expect("account").last_synced_at.is_none());
    }
}
