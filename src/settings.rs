use crate::cache::{TtlCache, PREFIX_SETTINGS, TTL_SETTINGS};
use crate::config::env_var;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub type OverrideMap = Map<String, Value>;

pub const SETTINGS_CACHE_KEY: &str = "settings:current";

pub const SETTINGS_FIELDS: [&str; 21] = [
    "min_spend",
    "min_purchases",
    "min_age_days",
    "winner_threshold",
    "loser_threshold",
    "improving_slope",
    "declining_slope",
    "volatile_cpa_std",
    "roas_weight",
    "spend_weight",
    "cvr_weight",
    "volume_weight",
    "max_scale_pct",
    "scale_cooldown_hours",
    "max_daily_budget_increase",
    "broad_roas_threshold_multiplier",
    "broad_min_days_before_pause",
    "lla_scale_pct_bump",
    "lla_fatigue_spend_multiplier",
    "interest_days_decline_before_pause",
    "custom_max_scale_pct",
];

static ENV_DEFAULTS: Lazy<EngineSettings> = Lazy::new(EngineSettings::from_env);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct EngineSettings {
    pub min_spend: f64,
    pub min_purchases: u32,
    pub min_age_days: u32,
    pub winner_threshold: f64,
    pub loser_threshold: f64,
    pub improving_slope: f64,
    pub declining_slope: f64,
    pub volatile_cpa_std: f64,
    pub roas_weight: f64,
    pub spend_weight: f64,
    pub cvr_weight: f64,
    pub volume_weight: f64,
    pub max_scale_pct: u32,
    pub scale_cooldown_hours: u32,
    pub max_daily_budget_increase: f64,
    pub broad_roas_threshold_multiplier: f64,
    pub broad_min_days_before_pause: u32,
    pub lla_scale_pct_bump: u32,
    pub lla_fatigue_spend_multiplier: f64,
    pub interest_days_decline_before_pause: u32,
    pub custom_max_scale_pct: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_spend: 500.0,
            min_purchases: 5,
            min_age_days: 3,
            winner_threshold: 2.5,
            loser_threshold: 1.0,
            improving_slope: 0.05,
            declining_slope: -0.05,
            volatile_cpa_std: 150.0,
            roas_weight: 0.4,
            spend_weight: 0.2,
            cvr_weight: 0.2,
            volume_weight: 0.2,
            max_scale_pct: 20,
            scale_cooldown_hours: 48,
            max_daily_budget_increase: 30.0,
            broad_roas_threshold_multiplier: 0.8,
            broad_min_days_before_pause: 7,
            lla_scale_pct_bump: 5,
            lla_fatigue_spend_multiplier: 1.5,
            interest_days_decline_before_pause: 3,
            custom_max_scale_pct: 15,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        for field in SETTINGS_FIELDS {
            let Some(raw) = env_var(&field.to_ascii_uppercase()) else {
                continue;
            };
            let parsed = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
            match settings.with_field(field, parsed) {
                Ok(next) => settings = next,
                Err(error) => {
                    tracing::warn!(field = %field, error = %error, "ignoring invalid settings default from environment");
                }
            }
        }
        settings
    }

    pub fn env_defaults() -> &'static EngineSettings {
        &ENV_DEFAULTS
    }

    fn with_field(&self, field: &str, value: Value) -> AppResult<Self> {
        let mut raw = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut raw {
            map.insert(field.to_string(), value);
        }
        serde_json::from_value(raw).map_err(|error| AppError::Invalid(format!("{}: {}", field, error)))
    }
}

pub fn resolve(defaults: &EngineSettings, overrides: &OverrideMap) -> EngineSettings {
    let mut resolved = defaults.clone();
    for field in SETTINGS_FIELDS {
        let Some(value) = overrides.get(field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        match resolved.with_field(field, value.clone()) {
            Ok(next) => resolved = next,
            Err(error) => {
                tracing::warn!(field = %field, error = %error, "skipping override of wrong type");
            }
        }
    }
    resolved
}

// Corrupt or non-object data yields an empty map.
pub fn decode_overrides(raw: Option<&str>) -> OverrideMap {
    let Some(raw) = raw else {
        return OverrideMap::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            tracing::warn!("stored settings overrides are not an object; using defaults");
            OverrideMap::new()
        }
        Err(error) => {
            tracing::warn!(error = %AppError::Decode(error.to_string()), "stored settings overrides are corrupt; using defaults");
            OverrideMap::new()
        }
    }
}

pub fn sanitize_update(defaults: &EngineSettings, payload: &Value) -> AppResult<OverrideMap> {
    let Value::Object(map) = payload else {
        return Err(AppError::Invalid("settings payload must be an object".to_string()));
    };

    let mut accepted = OverrideMap::new();
    for (key, value) in map {
        if value.is_null() {
            continue;
        }
        if !SETTINGS_FIELDS.contains(&key.as_str()) {
            tracing::debug!(field = %key, "ignoring unknown settings field");
            continue;
        }
        defaults.with_field(key, value.clone())?;
        accepted.insert(key.clone(), value.clone());
    }
    Ok(accepted)
}

pub struct SettingsResolver {
    db: Arc<Database>,
    cache: Arc<TtlCache>,
    defaults: EngineSettings,
}

impl SettingsResolver {
    pub fn new(db: Arc<Database>, cache: Arc<TtlCache>, defaults: EngineSettings) -> Self {
        Self { db, cache, defaults }
    }

    pub fn defaults(&self) -> &EngineSettings {
        &self.defaults
    }

    pub fn overrides(&self) -> OverrideMap {
        match self.db.load_settings_overrides() {
            Ok(raw) => decode_overrides(raw.as_deref()),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read settings overrides; using defaults");
                OverrideMap::new()
            }
        }
    }

    pub fn current(&self) -> EngineSettings {
        if let Some(cached) = self.cache.get::<EngineSettings>(SETTINGS_CACHE_KEY) {
            return cached;
        }
        let resolved = resolve(&self.defaults, &self.overrides());
        self.cache.set(SETTINGS_CACHE_KEY, &resolved, TTL_SETTINGS);
        resolved
    }

    pub fn update(&self, payload: &Value) -> AppResult<EngineSettings> {
        let accepted = sanitize_update(&self.defaults, payload)?;
        if accepted.is_empty() {
            return Ok(self.current());
        }

        let fields = accepted.keys().cloned().collect::<Vec<_>>();
        self.db.merge_settings_overrides(accepted)?;
        self.cache.invalidate_prefix(PREFIX_SETTINGS);
        tracing::info!(fields = ?fields, "settings updated");
        Ok(self.current())
    }

    pub fn reset(&self) -> AppResult<EngineSettings> {
        self.db.reset_settings_overrides()?;
        self.cache.invalidate_prefix(PREFIX_SETTINGS);
        tracing::info!("settings reset to defaults");
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn overrides(value: Value) -> OverrideMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn resolve_prefers_present_non_null_overrides() {
        let defaults = EngineSettings::default();
        let resolved = resolve(
            &defaults,
            &overrides(json!({"winner_threshold": 3.0, "max_scale_pct": null, "min_purchases": 12})),
        );

        let defaults_map = serde_json::to_value(&defaults).expect("defaults");
        let resolved_map = serde_json::to_value(&resolved).expect("resolved");
        for field in SETTINGS_FIELDS {
            let expected = match field {
                "winner_threshold" => json!(3.0),
                "min_purchases" => json!(12),
                _ => defaults_map[field].clone(),
            };
            assert_eq!(resolved_map[field], expected, "field {}", field);
        }
    }

    #[test]
    fn resolve_skips_wrongly_typed_overrides() {
        let defaults = EngineSettings::default();
        let resolved = resolve(
            &defaults,
            &overrides(json!({"max_scale_pct": "lots", "loser_threshold": 0.5, "unknown": 1})),
        );
        assert_eq!(resolved.max_scale_pct, defaults.max_scale_pct);
        assert_eq!(resolved.loser_threshold, 0.5);
    }

    #[test]
    fn corrupt_blob_decodes_to_empty_overrides() {
        assert!(decode_overrides(Some("{not json")).is_empty());
        assert!(decode_overrides(Some("[1,2]")).is_empty());
        assert!(decode_overrides(None).is_empty());
        assert_eq!(decode_overrides(Some(r#"{"min_spend": 10}"#)).len(), 1);
    }

    #[test]
    fn sanitize_drops_nulls_and_rejects_bad_types() {
        let defaults = EngineSettings::default();
        let accepted = sanitize_update(&defaults, &json!({"min_spend": 50, "cvr_weight": null, "bogus": 1}))
            .expect("valid payload");
        assert_eq!(accepted.len(), 1);
        assert!(accepted.contains_key("min_spend"));

        let err = sanitize_update(&defaults, &json!({"scale_cooldown_hours": 1.5})).expect_err("float for integer");
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[test]
    fn update_merges_and_reset_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let cache = Arc::new(TtlCache::new());
        let resolver = SettingsResolver::new(db, cache.clone(), EngineSettings::default());

        assert_eq!(resolver.current(), EngineSettings::default());
        assert!(cache.get::<EngineSettings>(SETTINGS_CACHE_KEY).is_some());

        let updated = resolver
            .update(&json!({"winner_threshold": 3.5}))
            .expect("first update");
        assert_eq!(updated.winner_threshold, 3.5);

        let updated = resolver
            .update(&json!({"max_scale_pct": 10, "winner_threshold": null}))
            .expect("second update");
        assert_eq!(updated.winner_threshold, 3.5, "null leaves the prior override in place");
        assert_eq!(updated.max_scale_pct, 10);
        assert_eq!(resolver.overrides().len(), 2);

        let reset = resolver.reset().expect("reset");
        assert_eq!(reset, EngineSettings::default());
        assert!(resolver.overrides().is_empty());
    }

    #[test]
    fn update_without_known_values_leaves_store_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let resolver = SettingsResolver::new(db.clone(), Arc::new(TtlCache::new()), EngineSettings::default());
        resolver.update(&json!({"min_spend": 10.0})).expect("seed override");
        let stored = db.load_settings_overrides().expect("load");
        let stamped = db.settings_updated_at().expect("updated_at");
        assert!(stamped.is_some());

        let view = resolver
            .update(&json!({"winner_threshold": null, "unknown_knob": 1}))
            .expect("no-op update");
        assert_eq!(view, resolver.current());
        assert_eq!(view.min_spend, 10.0);
        assert_eq!(db.load_settings_overrides().expect("load"), stored);
        assert_eq!(db.settings_updated_at().expect("updated_at"), stamped);
    }
}
