use crate::db::Database;
use crate::errors::AppResult;
use crate::metrics::{MetricsAggregator, DEFAULT_WINDOW_DAYS};
use crate::models::{OutcomeHorizon, OutcomeMetrics, OutcomeRunReport};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub struct OutcomeTracker {
    db: Arc<Database>,
    aggregator: Arc<MetricsAggregator>,
    batch_size: u32,
}

impl OutcomeTracker {
    pub fn new(db: Arc<Database>, aggregator: Arc<MetricsAggregator>, batch_size: u32) -> Self {
        Self {
            db,
            aggregator,
            batch_size: batch_size.max(1),
        }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> AppResult<OutcomeRunReport> {
        let mut report = OutcomeRunReport::default();
        for horizon in [OutcomeHorizon::ThreeDay, OutcomeHorizon::SevenDay] {
            let written = self.backfill(horizon, now, &mut report)?;
            match horizon {
                OutcomeHorizon::ThreeDay => report.updated_3d = written,
                OutcomeHorizon::SevenDay => report.updated_7d = written,
            }
        }
        tracing::info!(
            updated_3d = report.updated_3d,
            updated_7d = report.updated_7d,
            skipped = report.skipped,
            failed = report.failed,
            "outcome backfill finished"
        );
        Ok(report)
    }

    fn backfill(&self, horizon: OutcomeHorizon, now: DateTime<Utc>, report: &mut OutcomeRunReport) -> AppResult<u64> {
        let cutoff = now - Duration::days(horizon.days());
        let pending = self
            .db
            .pending_outcomes(horizon, cutoff, DEFAULT_WINDOW_DAYS, self.batch_size)?;

        let mut updates: Vec<(String, OutcomeMetrics)> = Vec::with_capacity(pending.len());
        for log in pending {
            match self.aggregator.compute(&log.audience_id, DEFAULT_WINDOW_DAYS, now) {
                Ok(Some(metrics)) => updates.push((log.id, OutcomeMetrics::from(&metrics))),
                Ok(None) => {
                    report.skipped += 1;
                    tracing::debug!(action_log_id = %log.id, audience_id = %log.audience_id, "no metrics for outcome yet");
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(action_log_id = %log.id, error = %error, "outcome metrics failed");
                }
            }
        }

        if updates.is_empty() {
            return Ok(0);
        }
        self.db.apply_outcomes(horizon, &updates, now)
    }
}
