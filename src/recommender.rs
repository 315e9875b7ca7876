use crate::cache::{TtlCache, PREFIX_BENCHMARKS, PREFIX_METRICS, PREFIX_RECOMMENDATIONS};
use crate::classifier::{classify, RuleContext};
use crate::db::{Database, RecommendationWrite};
use crate::errors::{AppError, AppResult};
use crate::metrics::{MetricsAggregator, DEFAULT_WINDOW_DAYS};
use crate::models::{OutcomeMetrics, Recommendation};
use crate::refiner::{merge_rationales, NarrativeRefiner};
use crate::settings::SettingsResolver;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct RecommendationGenerator {
    db: Arc<Database>,
    cache: Arc<TtlCache>,
    aggregator: Arc<MetricsAggregator>,
    settings: Arc<SettingsResolver>,
    refiner: Arc<dyn NarrativeRefiner>,
}

impl RecommendationGenerator {
    pub fn new(
        db: Arc<Database>,
        cache: Arc<TtlCache>,
        aggregator: Arc<MetricsAggregator>,
        settings: Arc<SettingsResolver>,
        refiner: Arc<dyn NarrativeRefiner>,
    ) -> Self {
        Self {
            db,
            cache,
            aggregator,
            settings,
            refiner,
        }
    }

    pub fn generate_for_account(&self, account_id: &str) -> AppResult<Vec<Recommendation>> {
        let audiences = self.db.list_audiences_with_data(account_id, DEFAULT_WINDOW_DAYS)?;
        if audiences.is_empty() {
            return Ok(Vec::new());
        }

        let settings = self.settings.current();
        let benchmarks = match self.aggregator.account_benchmarks(account_id) {
            Ok(benchmarks) => Some(benchmarks),
            Err(error) => {
                tracing::warn!(account_id = %account_id, error = %error, "benchmarks unavailable; scoring without them");
                None
            }
        };

        let now = Utc::now();
        let mut drafts = Vec::with_capacity(audiences.len());
        let mut baselines = HashMap::new();
        for audience in &audiences {
            let Some(metrics) = self.aggregator.aggregate(&audience.id, DEFAULT_WINDOW_DAYS)? else {
                continue;
            };
            let ctx = RuleContext {
                audience_type: audience.audience_type,
                age_days: (now - audience.created_at).num_days().max(0),
                last_scale_at: self.db.last_scale_action_at(&audience.id)?,
                now,
                benchmarks: benchmarks.clone(),
            };
            let classification = classify(&metrics, &settings, &ctx);
            tracing::debug!(
                audience_id = %audience.id,
                label = classification.label.as_str(),
                action = classification.action.as_str(),
                magnitude = classification.magnitude,
                "audience classified"
            );

            baselines.insert(audience.id.clone(), OutcomeMetrics::from(&metrics));
            drafts.push(Recommendation {
                id: Uuid::new_v4().to_string(),
                audience_id: audience.id.clone(),
                generated_at: now,
                label: classification.label,
                action: classification.action,
                magnitude: classification.magnitude,
                rationale: classification.rationale,
                audience_name: Some(audience.name.clone()),
                audience_type: Some(audience.audience_type),
            });
        }

        if drafts.is_empty() {
            return Ok(drafts);
        }

        self.refine(account_id, &mut drafts);

        let writes = drafts
            .iter()
            .map(|rec| RecommendationWrite {
                recommendation: rec.clone(),
                account_id: account_id.to_string(),
                baseline: baselines.remove(&rec.audience_id),
            })
            .collect::<Vec<_>>();
        let persisted = self
            .db
            .insert_recommendation_batch(&writes, settings.scale_cooldown_hours)?;
        self.cache
            .invalidate_prefixes(&[PREFIX_RECOMMENDATIONS, PREFIX_BENCHMARKS, PREFIX_METRICS]);

        tracing::info!(account_id = %account_id, count = persisted.len(), "recommendations generated");
        Ok(persisted)
    }

    fn refine(&self, account_id: &str, drafts: &mut [Recommendation]) {
        match self.refiner.refine(account_id, drafts) {
            Ok(refined) => {
                let unchanged = merge_rationales(drafts, refined);
                if unchanged > 0 {
                    tracing::debug!(account_id = %account_id, unchanged, "refiner left some rationales untouched");
                }
            }
            Err(error) => {
                tracing::warn!(
                    account_id = %account_id,
                    error = %AppError::Augmentation(error.to_string()),
                    "narrative refinement failed; keeping rule rationale"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AudienceType, NewMetricSnapshot, RecommendedAction};
    use crate::refiner::NoopRefiner;
    use crate::settings::EngineSettings;
    use chrono::{DateTime, Duration};

    struct FailingRefiner;

    impl NarrativeRefiner for FailingRefiner {
        fn refine(&self, _account_id: &str, _drafts: &[Recommendation]) -> anyhow::Result<Vec<Recommendation>> {
            anyhow::bail!("model timed out")
        }
    }

    fn setup(refiner: Arc<dyn NarrativeRefiner>) -> (tempfile::TempDir, Arc<Database>, RecommendationGenerator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let cache = Arc::new(TtlCache::new());
        let aggregator = Arc::new(MetricsAggregator::new(db.clone(), cache.clone()));
        let settings = Arc::new(SettingsResolver::new(
            db.clone(),
            cache.clone(),
            EngineSettings {
                winner_threshold: 3.0,
                ..EngineSettings::default()
            },
        ));
        let generator = RecommendationGenerator::new(db.clone(), cache, aggregator, settings, refiner);
        (dir, db, generator)
    }

    fn seed(db: &Database, audience_id: &str, created_at: DateTime<Utc>, spend: f64, revenue: f64) -> String {
        let account = db.upsert_account("act_1", Some("Shop")).expect("account");
        db.upsert_audience(audience_id, &account.id, audience_id, AudienceType::Interest, created_at)
            .expect("audience");
        db.insert_metric_snapshot(&NewMetricSnapshot {
            audience_id: audience_id.to_string(),
            window_days: 7,
            spend,
            revenue,
            impressions: 40_000,
            clicks: 900,
            purchases: 20,
            observed_at: Utc::now() - Duration::minutes(5),
        })
        .expect("snapshot");
        account.id
    }

    #[test]
    fn winner_is_persisted_with_action_log() {
        let (_dir, db, generator) = setup(Arc::new(NoopRefiner));
        let account_id = seed(&db, "aud-win", Utc::now() - Duration::days(20), 500.0, 2250.0);

        let recs = generator.generate_for_account(&account_id).expect("generate");
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].action, RecommendedAction::Scale);

        let listed = db.list_recommendations(&account_id, 10).expect("list");
        assert_eq!(listed.len(), 1);
        let logs = db.list_action_logs("aud-win").expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].recommendation_id.as_deref(), Some(recs[0].id.as_str()));
        assert_eq!(logs[0].baseline_metrics.as_ref().map(|m| m.roas), Some(4.5));
    }

    #[test]
    fn second_run_respects_cooldown() {
        let (_dir, db, generator) = setup(Arc::new(NoopRefiner));
        let account_id = seed(&db, "aud-win", Utc::now() - Duration::days(20), 500.0, 2250.0);

        generator.generate_for_account(&account_id).expect("first");
        let recs = generator.generate_for_account(&account_id).expect("second");
        assert_eq!(recs[0].action, RecommendedAction::Hold);
        assert!(recs[0].rationale.contains("cooldown"));
    }

    #[test]
    fn concurrent_generation_scales_once() {
        let (_dir, db, generator) = setup(Arc::new(NoopRefiner));
        let account_id = seed(&db, "aud-win", Utc::now() - Duration::days(20), 500.0, 2250.0);
        let barrier = std::sync::Barrier::new(2);

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    barrier.wait();
                    generator.generate_for_account(&account_id).expect("generate");
                });
            }
        });

        let scales = db
            .list_action_logs("aud-win")
            .expect("logs")
            .into_iter()
            .filter(|log| log.action == RecommendedAction::Scale)
            .count();
        assert_eq!(scales, 1);
        assert_eq!(db.list_action_logs("aud-win").expect("logs").len(), 2);
    }

    #[test]
    fn refiner_failure_keeps_rule_rationale() {
        let (_dir, db, generator) = setup(Arc::new(FailingRefiner));
        let account_id = seed(&db, "aud-win", Utc::now() - Duration::days(20), 500.0, 2250.0);

        let recs = generator.generate_for_account(&account_id).expect("generate");
        assert_eq!(recs.len(), 1);
        assert!(recs[0].rationale.contains("winner threshold"));
    }

    #[test]
    fn account_without_snapshots_yields_nothing() {
        let (_dir, db, generator) = setup(Arc::new(NoopRefiner));
        let account = db.upsert_account("act_empty", None).expect("account");
        assert!(generator.generate_for_account(&account.id).expect("generate").is_empty());
    }
}
