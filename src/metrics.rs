use crate::cache::{make_key, TtlCache, PREFIX_BENCHMARKS, PREFIX_METRICS, TTL_BENCHMARKS, TTL_METRICS};
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{AccountBenchmarks, MetricSnapshot, OutcomeMetrics};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const DEFAULT_WINDOW_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AudienceMetrics {
    pub audience_id: String,
    pub window_days: u32,
    pub observed_at: DateTime<Utc>,
    pub spend: f64,
    pub revenue: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub purchases: u64,
    pub roas: f64,
    pub cpa: Option<f64>,
    pub cvr: f64,
    pub roas_slope: Option<f64>,
    pub spend_slope: Option<f64>,
    pub cpa_std: Option<f64>,
    pub declining_streak: u32,
    pub data_points: usize,
}

impl From<&AudienceMetrics> for OutcomeMetrics {
    fn from(metrics: &AudienceMetrics) -> Self {
        Self {
            roas: metrics.roas,
            cpa: metrics.cpa,
            spend: metrics.spend,
            purchases: metrics.purchases,
        }
    }
}

pub fn summarize(history: &[MetricSnapshot]) -> Option<AudienceMetrics> {
    let latest = history.last()?;
    let origin = history.first()?.observed_at;

    let days = history
        .iter()
        .map(|snapshot| (snapshot.observed_at - origin).num_seconds() as f64 / 86_400.0)
        .collect::<Vec<_>>();
    let roas = history.iter().map(|snapshot| snapshot.roas).collect::<Vec<_>>();
    let spend = history.iter().map(|snapshot| snapshot.spend).collect::<Vec<_>>();
    let cpas = history.iter().filter_map(|snapshot| snapshot.cpa).collect::<Vec<_>>();

    let closes = daily_closes(history);
    let declining_streak = closes
        .windows(2)
        .rev()
        .take_while(|pair| pair[1] < pair[0])
        .count() as u32;

    Some(AudienceMetrics {
        audience_id: latest.audience_id.clone(),
        window_days: latest.window_days,
        observed_at: latest.observed_at,
        spend: latest.spend,
        revenue: latest.revenue,
        impressions: latest.impressions,
        clicks: latest.clicks,
        purchases: latest.purchases,
        roas: latest.roas,
        cpa: latest.cpa,
        cvr: if latest.clicks > 0 {
            latest.purchases as f64 / latest.clicks as f64
        } else {
            0.0
        },
        roas_slope: linear_slope(&days, &roas),
        spend_slope: linear_slope(&days, &spend),
        cpa_std: std_dev(&cpas),
        declining_streak,
        data_points: history.len(),
    })
}

fn daily_closes(history: &[MetricSnapshot]) -> Vec<f64> {
    let mut closes: Vec<(NaiveDate, f64)> = Vec::new();
    for snapshot in history {
        let day = snapshot.observed_at.date_naive();
        match closes.last_mut() {
            Some((last_day, roas)) if *last_day == day => *roas = snapshot.roas,
            _ => closes.push((day, snapshot.roas)),
        }
    }
    closes.into_iter().map(|(_, roas)| roas).collect()
}

pub fn linear_slope(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() < 2 || xs.len() != ys.len() {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (covariance, variance) = xs
        .iter()
        .zip(ys)
        .fold((0.0, 0.0), |(cov, var), (x, y)| {
            (cov + (x - mean_x) * (y - mean_y), var + (x - mean_x).powi(2))
        });
    if variance <= f64::EPSILON {
        return None;
    }
    Some(covariance / variance)
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

pub fn benchmarks_from(account_id: &str, latest: &[MetricSnapshot]) -> AccountBenchmarks {
    let audience_count = latest.len() as u64;
    let total_spend = latest.iter().map(|snapshot| snapshot.spend).sum::<f64>();
    let total_revenue = latest.iter().map(|snapshot| snapshot.revenue).sum::<f64>();
    let total_purchases = latest.iter().map(|snapshot| snapshot.purchases).sum::<u64>();
    let total_clicks = latest.iter().map(|snapshot| snapshot.clicks).sum::<u64>();

    AccountBenchmarks {
        account_id: account_id.to_string(),
        audience_count,
        avg_roas: if total_spend > 0.0 { total_revenue / total_spend } else { 0.0 },
        avg_cpa: if total_purchases > 0 {
            Some(total_spend / total_purchases as f64)
        } else {
            None
        },
        avg_cvr: if total_clicks > 0 {
            total_purchases as f64 / total_clicks as f64
        } else {
            0.0
        },
        avg_spend: if audience_count > 0 {
            total_spend / audience_count as f64
        } else {
            0.0
        },
        total_spend,
    }
}

pub struct MetricsAggregator {
    db: Arc<Database>,
    cache: Arc<TtlCache>,
}

impl MetricsAggregator {
    pub fn new(db: Arc<Database>, cache: Arc<TtlCache>) -> Self {
        Self { db, cache }
    }

    pub fn aggregate(&self, audience_id: &str, window_days: u32) -> AppResult<Option<AudienceMetrics>> {
        let key = make_key(PREFIX_METRICS, &json!(["audience", audience_id, window_days]));
        if let Some(cached) = self.cache.get::<AudienceMetrics>(&key) {
            return Ok(Some(cached));
        }
        let metrics = self.compute(audience_id, window_days, Utc::now())?;
        if let Some(metrics) = &metrics {
            self.cache.set(&key, metrics, TTL_METRICS);
        }
        Ok(metrics)
    }

    pub fn compute(
        &self,
        audience_id: &str,
        window_days: u32,
        as_of: DateTime<Utc>,
    ) -> AppResult<Option<AudienceMetrics>> {
        let since = as_of - Duration::days(i64::from(window_days));
        let mut history = self.db.list_snapshots(audience_id, window_days, since, as_of)?;
        if history.is_empty() {
            history.extend(self.db.latest_snapshot(audience_id, window_days, as_of)?);
        }
        Ok(summarize(&history))
    }

    pub fn account_benchmarks(&self, account_id: &str) -> AppResult<AccountBenchmarks> {
        let key = make_key(PREFIX_BENCHMARKS, &json!(["account", account_id, DEFAULT_WINDOW_DAYS]));
        if let Some(cached) = self.cache.get::<AccountBenchmarks>(&key) {
            return Ok(cached);
        }
        let latest = self.db.latest_snapshots_for_account(account_id, DEFAULT_WINDOW_DAYS)?;
        let benchmarks = benchmarks_from(account_id, &latest);
        self.cache.set(&key, &benchmarks, TTL_BENCHMARKS);
        Ok(benchmarks)
    }
}
