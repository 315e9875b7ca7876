use crate::errors::{AppError, AppResult};
use crate::models::{
    Account, ActionLog, Audience, AudienceType, MetricSnapshot, NewMetricSnapshot, OutcomeHorizon,
    OutcomeMetrics, PerformanceLabel, Recommendation, RecommendedAction,
};
use crate::settings::{decode_overrides, OverrideMap};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_ROW_ID: &str = "global";

#[derive(Debug, Clone)]
pub struct RecommendationWrite {
    pub recommendation: Recommendation,
    pub account_id: String,
    pub baseline: Option<OutcomeMetrics>,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_schema_extensions()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn upsert_account(&self, external_account_id: &str, account_name: Option<&str>) -> AppResult<Account> {
        let now = format_time(Utc::now());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (id, external_account_id, account_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(external_account_id) DO UPDATE SET
               account_name = COALESCE(excluded.account_name, accounts.account_name),
               updated_at = excluded.updated_at",
            params![Uuid::new_v4().to_string(), external_account_id, account_name, now],
        )?;
        conn.query_row(
            "SELECT id, external_account_id, account_name, last_synced_at, created_at, updated_at
             FROM accounts WHERE external_account_id = ?1",
            [external_account_id],
            parse_account_row,
        )
        .map_err(AppError::from)
    }

    pub fn get_account(&self, account_id: &str) -> AppResult<Option<Account>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, external_account_id, account_name, last_synced_at, created_at, updated_at
             FROM accounts WHERE id = ?1",
            [account_id],
            parse_account_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_accounts(&self) -> AppResult<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, external_account_id, account_name, last_synced_at, created_at, updated_at
             FROM accounts ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], parse_account_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_account_synced(&self, account_id: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.conn()?;
        let stamp = format_time(at);
        let changed = conn.execute(
            "UPDATE accounts SET last_synced_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![stamp, account_id],
        )?;
        Ok(changed > 0)
    }

    pub fn upsert_audience(
        &self,
        audience_id: &str,
        account_id: &str,
        name: &str,
        audience_type: AudienceType,
        created_at: DateTime<Utc>,
    ) -> AppResult<Audience> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audiences (id, account_id, name, audience_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![audience_id, account_id, name, audience_type.as_str(), format_time(created_at)],
        )?;
        conn.query_row(
            "SELECT id, account_id, name, audience_type, created_at FROM audiences WHERE id = ?1",
            [audience_id],
            parse_audience_row,
        )
        .map_err(AppError::from)
    }

    pub fn get_audience(&self, audience_id: &str) -> AppResult<Option<Audience>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, account_id, name, audience_type, created_at FROM audiences WHERE id = ?1",
            [audience_id],
            parse_audience_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_audiences(&self, account_id: &str) -> AppResult<Vec<Audience>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, name, audience_type, created_at
             FROM audiences WHERE account_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map([account_id], parse_audience_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_audiences_with_data(&self, account_id: &str, window_days: u32) -> AppResult<Vec<Audience>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.account_id, a.name, a.audience_type, a.created_at
             FROM audiences a
             WHERE a.account_id = ?1
               AND EXISTS (SELECT 1 FROM metric_snapshots s WHERE s.audience_id = a.id AND s.window_days = ?2)
             ORDER BY a.name",
        )?;
        let rows = stmt
            .query_map(params![account_id, window_days], parse_audience_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_metric_snapshot(&self, snapshot: &NewMetricSnapshot) -> AppResult<MetricSnapshot> {
        let id = Uuid::new_v4().to_string();
        let roas = ratio(snapshot.revenue, snapshot.spend).unwrap_or(0.0);
        let cpa = ratio(snapshot.spend, snapshot.purchases as f64);

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metric_snapshots (
               id, audience_id, window_days, spend, revenue, impressions, clicks, purchases, roas, cpa, observed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                snapshot.audience_id,
                snapshot.window_days,
                snapshot.spend,
                snapshot.revenue,
                snapshot.impressions,
                snapshot.clicks,
                snapshot.purchases,
                roas,
                cpa,
                format_time(snapshot.observed_at),
            ],
        )?;

        Ok(MetricSnapshot {
            id,
            audience_id: snapshot.audience_id.clone(),
            window_days: snapshot.window_days,
            spend: snapshot.spend,
            revenue: snapshot.revenue,
            impressions: snapshot.impressions,
            clicks: snapshot.clicks,
            purchases: snapshot.purchases,
            roas,
            cpa,
            observed_at: snapshot.observed_at,
        })
    }

    pub fn list_snapshots(
        &self,
        audience_id: &str,
        window_days: u32,
        since: DateTime<Utc>,
        as_of: DateTime<Utc>,
    ) -> AppResult<Vec<MetricSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM metric_snapshots
             WHERE audience_id = ?1 AND window_days = ?2 AND observed_at > ?3 AND observed_at <= ?4
             ORDER BY observed_at ASC",
            SNAPSHOT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![audience_id, window_days, format_time(since), format_time(as_of)],
                parse_snapshot_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest_snapshot(
        &self,
        audience_id: &str,
        window_days: u32,
        as_of: DateTime<Utc>,
    ) -> AppResult<Option<MetricSnapshot>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM metric_snapshots
                 WHERE audience_id = ?1 AND window_days = ?2 AND observed_at <= ?3
                 ORDER BY observed_at DESC
                 LIMIT 1",
                SNAPSHOT_COLUMNS
            ),
            params![audience_id, window_days, format_time(as_of)],
            parse_snapshot_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn latest_snapshots_for_account(&self, account_id: &str, window_days: u32) -> AppResult<Vec<MetricSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.audience_id, s.window_days, s.spend, s.revenue, s.impressions, s.clicks,
                    s.purchases, s.roas, s.cpa, s.observed_at
             FROM metric_snapshots s
             JOIN audiences a ON a.id = s.audience_id
             WHERE a.account_id = ?1 AND s.window_days = ?2
               AND s.observed_at = (
                 SELECT MAX(inner_s.observed_at) FROM metric_snapshots inner_s
                 WHERE inner_s.audience_id = s.audience_id AND inner_s.window_days = s.window_days
               )
             ORDER BY s.audience_id",
        )?;
        let rows = stmt
            .query_map(params![account_id, window_days], parse_snapshot_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_audiences(&self, account_id: &str) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM audiences WHERE account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn count_snapshots(&self, account_id: &str) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM metric_snapshots s JOIN audiences a ON a.id = s.audience_id
             WHERE a.account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn count_audiences_with_data(&self, account_id: &str, window_days: u32) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT s.audience_id) FROM metric_snapshots s
             JOIN audiences a ON a.id = s.audience_id
             WHERE a.account_id = ?1 AND s.window_days = ?2",
            params![account_id, window_days],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    // A scale inside the cooldown of an already logged scale is written as a hold.
    pub fn insert_recommendation_batch(
        &self,
        batch: &[RecommendationWrite],
        scale_cooldown_hours: u32,
    ) -> AppResult<Vec<Recommendation>> {
        let cooldown = chrono::Duration::hours(i64::from(scale_cooldown_hours));
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut persisted = Vec::with_capacity(batch.len());
        for item in batch {
            let mut rec = item.recommendation.clone();
            if rec.action == RecommendedAction::Scale {
                if let Some(last) = last_scale_at(&tx, &rec.audience_id)? {
                    if rec.generated_at - last < cooldown {
                        tracing::warn!(audience_id = %rec.audience_id, "scale already logged inside cooldown; holding");
                        rec.action = RecommendedAction::Hold;
                        rec.magnitude = 0.0;
                        rec.rationale = format!(
                            "cooldown active: scale logged at {}, cooldown is {}h",
                            format_time(last),
                            scale_cooldown_hours
                        );
                    }
                }
            }

            let generated_at = format_time(rec.generated_at);
            tx.execute(
                "INSERT INTO recommendations (id, audience_id, generated_at, label, action, magnitude, rationale)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rec.id,
                    rec.audience_id,
                    generated_at,
                    rec.label.as_str(),
                    rec.action.as_str(),
                    rec.magnitude,
                    rec.rationale,
                ],
            )?;
            let baseline = item.baseline.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO action_logs (id, account_id, audience_id, recommendation_id, action, magnitude, baseline_metrics, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    item.account_id,
                    rec.audience_id,
                    rec.id,
                    rec.action.as_str(),
                    rec.magnitude,
                    baseline,
                    generated_at,
                ],
            )?;
            persisted.push(rec);
        }
        tx.commit()?;
        Ok(persisted)
    }

    pub fn list_recommendations(&self, account_id: &str, limit: u32) -> AppResult<Vec<Recommendation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.id, r.audience_id, r.generated_at, r.label, r.action, r.magnitude, r.rationale,
                    a.name, a.audience_type
             FROM recommendations r
             JOIN audiences a ON a.id = r.audience_id
             WHERE a.account_id = ?1
             ORDER BY r.generated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit], |row| {
                Ok(Recommendation {
                    id: row.get(0)?,
                    audience_id: row.get(1)?,
                    generated_at: parse_time(&row.get::<_, String>(2)?)?,
                    label: parse_label(&row.get::<_, String>(3)?)?,
                    action: parse_action(&row.get::<_, String>(4)?)?,
                    magnitude: row.get(5)?,
                    rationale: row.get(6)?,
                    audience_name: row.get(7)?,
                    audience_type: Some(AudienceType::parse(&row.get::<_, String>(8)?)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn record_action(
        &self,
        account_id: &str,
        audience_id: &str,
        action: RecommendedAction,
        magnitude: f64,
        created_at: DateTime<Utc>,
    ) -> AppResult<ActionLog> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO action_logs (id, account_id, audience_id, action, magnitude, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, account_id, audience_id, action.as_str(), magnitude, format_time(created_at)],
        )?;
        Ok(ActionLog {
            id,
            account_id: account_id.to_string(),
            audience_id: audience_id.to_string(),
            recommendation_id: None,
            action,
            magnitude,
            baseline_metrics: None,
            created_at,
            outcome_3d_metrics: None,
            outcome_3d_at: None,
            outcome_7d_metrics: None,
            outcome_7d_at: None,
        })
    }

    pub fn get_action_log(&self, id: &str) -> AppResult<Option<ActionLog>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM action_logs WHERE id = ?1", ACTION_LOG_COLUMNS),
            [id],
            parse_action_log_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_action_logs(&self, audience_id: &str) -> AppResult<Vec<ActionLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM action_logs WHERE audience_id = ?1 ORDER BY created_at DESC",
            ACTION_LOG_COLUMNS
        ))?;
        let rows = stmt
            .query_map([audience_id], parse_action_log_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn last_scale_action_at(&self, audience_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        last_scale_at(&conn, audience_id)
    }

    pub fn pending_outcomes(
        &self,
        horizon: OutcomeHorizon,
        cutoff: DateTime<Utc>,
        window_days: u32,
        limit: u32,
    ) -> AppResult<Vec<ActionLog>> {
        let (metrics_column, _) = horizon.columns();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM action_logs l
             WHERE l.created_at <= ?1 AND l.{} IS NULL
               AND EXISTS (
                 SELECT 1 FROM metric_snapshots s
                 WHERE s.audience_id = l.audience_id AND s.window_days = ?2
               )
             ORDER BY l.created_at ASC
             LIMIT ?3",
            ACTION_LOG_COLUMNS_L, metrics_column
        ))?;
        let rows = stmt
            .query_map(params![format_time(cutoff), window_days, limit], parse_action_log_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn apply_outcomes(
        &self,
        horizon: OutcomeHorizon,
        updates: &[(String, OutcomeMetrics)],
        at: DateTime<Utc>,
    ) -> AppResult<u64> {
        let (metrics_column, at_column) = horizon.columns();
        let stamp = format_time(at);
        let sql = format!(
            "UPDATE action_logs SET {metrics} = ?1, {at} = ?2 WHERE id = ?3 AND {metrics} IS NULL",
            metrics = metrics_column,
            at = at_column
        );

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0u64;
        for (log_id, metrics) in updates {
            let encoded = serde_json::to_string(metrics)?;
            written += tx.execute(&sql, params![encoded, stamp, log_id])? as u64;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn load_settings_overrides(&self) -> AppResult<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT overrides_json FROM settings_overrides WHERE id = ?1",
            [SETTINGS_ROW_ID],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn settings_updated_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM settings_overrides WHERE id = ?1",
                [SETTINGS_ROW_ID],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| parse_time(&raw)).transpose().map_err(AppError::from)
    }

    pub fn merge_settings_overrides(&self, update: OverrideMap) -> AppResult<OverrideMap> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT overrides_json FROM settings_overrides WHERE id = ?1",
                [SETTINGS_ROW_ID],
                |row| row.get(0),
            )
            .optional()?;

        let mut current = decode_overrides(raw.as_deref());
        current.extend(update);
        let encoded = serde_json::to_string(&current)?;

        tx.execute(
            "INSERT INTO settings_overrides (id, overrides_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET overrides_json = excluded.overrides_json, updated_at = excluded.updated_at",
            params![SETTINGS_ROW_ID, encoded, format_time(Utc::now())],
        )?;
        tx.commit()?;
        Ok(current)
    }

    pub fn reset_settings_overrides(&self) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE settings_overrides SET overrides_json = '{}', updated_at = ?1 WHERE id = ?2",
            params![format_time(Utc::now()), SETTINGS_ROW_ID],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn write_raw_settings_overrides(&self, raw: &str) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings_overrides (id, overrides_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET overrides_json = excluded.overrides_json",
            params![SETTINGS_ROW_ID, raw, format_time(Utc::now())],
        )?;
        Ok(())
    }

    fn ensure_schema_extensions(&self) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Databases created before sync tracking lack this column.
        if !column_exists(&conn, "accounts", "last_synced_at")? {
            conn.execute("ALTER TABLE accounts ADD COLUMN last_synced_at TEXT", [])?;
            tracing::info!("migration: added accounts.last_synced_at");
        }
        if !column_exists(&conn, "action_logs", "baseline_metrics")? {
            conn.execute("ALTER TABLE action_logs ADD COLUMN baseline_metrics TEXT", [])?;
            tracing::info!("migration: added action_logs.baseline_metrics");
        }
        Ok(())
    }
}

const ACTION_LOG_COLUMNS_L: &str = "l.id, l.account_id, l.audience_id, l.recommendation_id, l.action, l.magnitude,
     l.baseline_metrics, l.created_at, l.outcome_3d_metrics, l.outcome_3d_at, l.outcome_7d_metrics, l.outcome_7d_at";

const SNAPSHOT_COLUMNS: &str =
    "id, audience_id, window_days, spend, revenue, impressions, clicks, purchases, roas, cpa, observed_at";

const ACTION_LOG_COLUMNS: &str = "id, account_id, audience_id, recommendation_id, action, magnitude, baseline_metrics,
     created_at, outcome_3d_metrics, outcome_3d_at, outcome_7d_metrics, outcome_7d_at";

fn last_scale_at(conn: &Connection, audience_id: &str) -> AppResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM action_logs WHERE audience_id = ?1 AND action = 'scale'",
        [audience_id],
        |row| row.get(0),
    )?;
    raw.map(|raw| parse_time(&raw)).transpose().map_err(AppError::from)
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator > 0.0 {
        Some(numerator / denominator)
    } else {
        None
    }
}

fn parse_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        external_account_id: row.get(1)?,
        account_name: row.get(2)?,
        last_synced_at: row
            .get::<_, Option<String>>(3)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        updated_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_audience_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Audience> {
    Ok(Audience {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        audience_type: AudienceType::parse(&row.get::<_, String>(3)?),
        created_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSnapshot> {
    Ok(MetricSnapshot {
        id: row.get(0)?,
        audience_id: row.get(1)?,
        window_days: row.get(2)?,
        spend: row.get(3)?,
        revenue: row.get(4)?,
        impressions: row.get(5)?,
        clicks: row.get(6)?,
        purchases: row.get(7)?,
        roas: row.get(8)?,
        cpa: row.get(9)?,
        observed_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_action_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionLog> {
    Ok(ActionLog {
        id: row.get(0)?,
        account_id: row.get(1)?,
        audience_id: row.get(2)?,
        recommendation_id: row.get(3)?,
        action: parse_action(&row.get::<_, String>(4)?)?,
        magnitude: row.get(5)?,
        baseline_metrics: parse_outcome(row.get::<_, Option<String>>(6)?)?,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
        outcome_3d_metrics: parse_outcome(row.get::<_, Option<String>>(8)?)?,
        outcome_3d_at: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        outcome_7d_metrics: parse_outcome(row.get::<_, Option<String>>(10)?)?,
        outcome_7d_at: row
            .get::<_, Option<String>>(11)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_outcome(raw: Option<String>) -> rusqlite::Result<Option<OutcomeMetrics>> {
    raw.map(|raw| serde_json::from_str::<OutcomeMetrics>(&raw).map_err(|error| conversion_error(error.to_string())))
        .transpose()
}

fn parse_label(raw: &str) -> rusqlite::Result<PerformanceLabel> {
    PerformanceLabel::parse(raw).ok_or_else(|| conversion_error(format!("Unknown label '{}'", raw)))
}

fn parse_action(raw: &str) -> rusqlite::Result<RecommendedAction> {
    RecommendedAction::parse(raw).ok_or_else(|| conversion_error(format!("Unknown action '{}'", raw)))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// Fixed-width UTC so text comparison matches time order.
pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (dir, db)
    }

    fn snapshot(audience_id: &str, spend: f64, revenue: f64, purchases: u64, at: DateTime<Utc>) -> NewMetricSnapshot {
        NewMetricSnapshot {
            audience_id: audience_id.to_string(),
            window_days: 7,
            spend,
            revenue,
            impressions: 10_000,
            clicks: 400,
            purchases,
            observed_at: at,
        }
    }

    #[test]
    fn account_upsert_is_keyed_by_external_id() {
        let (_dir, db) = open();
        let first = db.upsert_account("act_1", Some("Shop")).expect("insert");
        let second = db.upsert_account("act_1", None).expect("update");
        assert_eq!(first.id, second.id);
        assert_eq!(second.account_name.as_deref(), Some("Shop"));
        assert_eq!(db.list_accounts().expect("list").len(), 1);

        let now = Utc::now();
        assert!(db.mark_account_synced(&first.id, now).expect("mark"));
        let loaded = db.get_account(&first.id).expect("get").expect("exists");
        assert!(loaded.last_synced_at.is_some());
        assert!(db.get_account("missing").expect("get").is_none());
    }

    #[test]
    fn snapshots_derive_roas_and_cpa_sentinel() {
        let (_dir, db) = open();
        let account = db.upsert_account("act_1", None).expect("account");
        db.upsert_audience("aud_1", &account.id, "Broad IN", AudienceType::Broad, Utc::now())
            .expect("audience");

        let now = Utc::now();
        let zero = db
            .insert_metric_snapshot(&snapshot("aud_1", 100.0, 0.0, 0, now - Duration::days(1)))
            .expect("zero purchases");
        assert_eq!(zero.cpa, None);
        assert_eq!(zero.roas, 0.0);

        let healthy = db
            .insert_metric_snapshot(&snapshot("aud_1", 500.0, 2250.0, 20, now))
            .expect("healthy");
        assert_eq!(healthy.roas, 4.5);
        assert_eq!(healthy.cpa, Some(25.0));

        let history = db
            .list_snapshots("aud_1", 7, now - Duration::days(7), now)
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].cpa, None, "oldest first");
        assert_eq!(history[1].id, healthy.id);
        assert!(db
            .list_snapshots("aud_1", 7, now - Duration::hours(12), now)
            .expect("bounded")
            .iter()
            .all(|snapshot| snapshot.id == healthy.id));
        assert_eq!(
            db.latest_snapshot("aud_1", 7, now - Duration::hours(1))
                .expect("latest")
                .map(|snapshot| snapshot.id),
            Some(zero.id.clone())
        );

        let latest = db.latest_snapshots_for_account(&account.id, 7).expect("latest");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, healthy.id);
        assert_eq!(db.count_audiences_with_data(&account.id, 7).expect("count"), 1);
        assert_eq!(db.count_audiences_with_data(&account.id, 14).expect("count"), 0);
        assert_eq!(db.count_snapshots(&account.id).expect("count"), 2);
    }

    #[test]
    fn outcome_backfill_never_overwrites() {
        let (_dir, db) = open();
        let account = db.upsert_account("act_1", None).expect("account");
        db.upsert_audience("aud_1", &account.id, "LLA 1%", AudienceType::Lookalike, Utc::now())
            .expect("audience");
        let created = Utc::now() - Duration::days(4);
        let log = db
            .record_action(&account.id, "aud_1", RecommendedAction::Scale, 10.0, created)
            .expect("log");

        let cutoff = Utc::now() - Duration::days(3);
        assert!(db
            .pending_outcomes(OutcomeHorizon::ThreeDay, cutoff, 7, 100)
            .expect("pending without data")
            .is_empty());
        db.insert_metric_snapshot(&snapshot("aud_1", 300.0, 900.0, 12, Utc::now()))
            .expect("snapshot");
        let pending = db
            .pending_outcomes(OutcomeHorizon::ThreeDay, cutoff, 7, 100)
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert!(db
            .pending_outcomes(OutcomeHorizon::SevenDay, Utc::now() - Duration::days(7), 7, 100)
            .expect("pending 7d")
            .is_empty());

        let first = OutcomeMetrics { roas: 3.0, cpa: Some(20.0), spend: 600.0, purchases: 30 };
        let second = OutcomeMetrics { roas: 1.0, cpa: None, spend: 1.0, purchases: 0 };
        let written = db
            .apply_outcomes(OutcomeHorizon::ThreeDay, &[(log.id.clone(), first.clone())], Utc::now())
            .expect("apply");
        assert_eq!(written, 1);
        let written = db
            .apply_outcomes(OutcomeHorizon::ThreeDay, &[(log.id.clone(), second)], Utc::now())
            .expect("apply again");
        assert_eq!(written, 0);

        let loaded = db.get_action_log(&log.id).expect("get").expect("exists");
        assert_eq!(loaded.outcome_3d_metrics, Some(first));
        assert!(loaded.outcome_3d_at.is_some());
        assert!(loaded.outcome_7d_metrics.is_none());
        assert_eq!(db.last_scale_action_at("aud_1").expect("last").map(format_time), Some(format_time(created)));
    }

    #[test]
    fn failed_outcome_batch_rolls_back_every_row() {
        let (_dir, db) = open();
        let account = db.upsert_account("act_1", None).expect("account");
        db.upsert_audience("aud_1", &account.id, "Interest", AudienceType::Interest, Utc::now())
            .expect("audience");
        let created = Utc::now() - Duration::days(4);
        let first = db
            .record_action(&account.id, "aud_1", RecommendedAction::Hold, 0.0, created)
            .expect("first");
        let second = db
            .record_action(&account.id, "aud_1", RecommendedAction::Hold, 0.0, created)
            .expect("second");
        db.conn()
            .expect("conn")
            .execute_batch(&format!(
                "CREATE TRIGGER reject_outcome BEFORE UPDATE OF outcome_3d_metrics ON action_logs
                 WHEN NEW.id = '{}'
                 BEGIN SELECT RAISE(ABORT, 'outcome rejected'); END;",
                second.id
            ))
            .expect("trigger");

        let metrics = OutcomeMetrics { roas: 2.0, cpa: Some(10.0), spend: 200.0, purchases: 20 };
        let err = db
            .apply_outcomes(
                OutcomeHorizon::ThreeDay,
                &[(first.id.clone(), metrics.clone()), (second.id.clone(), metrics)],
                Utc::now(),
            )
            .expect_err("second update aborts");
        assert!(matches!(err, AppError::Persistence(_)));

        for id in [&first.id, &second.id] {
            let log = db.get_action_log(id).expect("get").expect("exists");
            assert!(log.outcome_3d_metrics.is_none());
            assert!(log.outcome_3d_at.is_none());
        }
    }

    #[test]
    fn batch_holds_scale_logged_inside_cooldown() {
        let (_dir, db) = open();
        let account = db.upsert_account("act_1", None).expect("account");
        db.upsert_audience("aud_1", &account.id, "Interest", AudienceType::Interest, Utc::now())
            .expect("audience");
        let now = Utc::now();
        db.record_action(&account.id, "aud_1", RecommendedAction::Scale, 10.0, now - Duration::hours(1))
            .expect("earlier scale");

        let write = RecommendationWrite {
            recommendation: Recommendation {
                id: "rec-1".to_string(),
                audience_id: "aud_1".to_string(),
                generated_at: now,
                label: PerformanceLabel::Winner,
                action: RecommendedAction::Scale,
                magnitude: 15.0,
                rationale: "ROAS above threshold".to_string(),
                audience_name: None,
                audience_type: None,
            },
            account_id: account.id.clone(),
            baseline: None,
        };
        let persisted = db.insert_recommendation_batch(&[write.clone()], 24).expect("insert");
        assert_eq!(persisted[0].action, RecommendedAction::Hold);
        assert_eq!(persisted[0].magnitude, 0.0);
        assert!(persisted[0].rationale.contains("cooldown"));

        let mut later = write;
        later.recommendation.id = "rec-2".to_string();
        later.recommendation.generated_at = now + Duration::hours(2);
        let persisted = db.insert_recommendation_batch(&[later], 2).expect("insert after cooldown");
        assert_eq!(persisted[0].action, RecommendedAction::Scale);
    }

    #[test]
    fn settings_overrides_merge_and_reset() {
        let (_dir, db) = open();
        assert!(db.load_settings_overrides().expect("load").is_none());

        let mut update = OverrideMap::new();
        update.insert("min_spend".to_string(), serde_json::json!(50));
        db.merge_settings_overrides(update).expect("merge");

        db.write_raw_settings_overrides("{broken").expect("corrupt");
        let mut update = OverrideMap::new();
        update.insert("max_scale_pct".to_string(), serde_json::json!(5));
        let merged = db.merge_settings_overrides(update).expect("merge over corrupt");
        assert_eq!(merged.len(), 1, "corrupt blob is treated as empty");

        db.reset_settings_overrides().expect("reset");
        assert_eq!(db.load_settings_overrides().expect("load").as_deref(), Some("{}"));
    }
}
