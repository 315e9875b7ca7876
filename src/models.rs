use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceType {
    Broad,
    Lookalike,
    Interest,
    Custom,
    Other,
}

impl AudienceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Broad => "broad",
            Self::Lookalike => "lookalike",
            Self::Interest => "interest",
            Self::Custom => "custom",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "broad" => Self::Broad,
            "lookalike" | "lla" => Self::Lookalike,
            "interest" => Self::Interest,
            "custom" => Self::Custom,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceLabel {
    #[serde(rename = "insufficient-data")]
    InsufficientData,
    #[serde(rename = "winner")]
    Winner,
    #[serde(rename = "loser")]
    Loser,
    #[serde(rename = "improving")]
    Improving,
    #[serde(rename = "declining")]
    Declining,
    #[serde(rename = "volatile")]
    Volatile,
    #[serde(rename = "broad-audience-special-case")]
    BroadSpecialCase,
    #[serde(rename = "lookalike-special-case")]
    LookalikeSpecialCase,
    #[serde(rename = "stable")]
    Stable,
}

impl PerformanceLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientData => "insufficient-data",
            Self::Winner => "winner",
            Self::Loser => "loser",
            Self::Improving => "improving",
            Self::Declining => "declining",
            Self::Volatile => "volatile",
            Self::BroadSpecialCase => "broad-audience-special-case",
            Self::LookalikeSpecialCase => "lookalike-special-case",
            Self::Stable => "stable",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insufficient-data" => Some(Self::InsufficientData),
            "winner" => Some(Self::Winner),
            "loser" => Some(Self::Loser),
            "improving" => Some(Self::Improving),
            "declining" => Some(Self::Declining),
            "volatile" => Some(Self::Volatile),
            "broad-audience-special-case" => Some(Self::BroadSpecialCase),
            "lookalike-special-case" => Some(Self::LookalikeSpecialCase),
            "stable" => Some(Self::Stable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Scale,
    Pause,
    Hold,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scale => "scale",
            Self::Pause => "pause",
            Self::Hold => "hold",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scale" => Some(Self::Scale),
            "pause" => Some(Self::Pause),
            "hold" => Some(Self::Hold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Account {
    pub id: String,
    pub external_account_id: String,
    pub account_name: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Audience {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub audience_type: AudienceType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NewMetricSnapshot {
    pub audience_id: String,
    pub window_days: u32,
    pub spend: f64,
    pub revenue: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub purchases: u64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricSnapshot {
    pub id: String,
    pub audience_id: String,
    pub window_days: u32,
    pub spend: f64,
    pub revenue: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub purchases: u64,
    pub roas: f64,
    pub cpa: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Classification {
    pub label: PerformanceLabel,
    pub action: RecommendedAction,
    pub magnitude: f64,
    pub rationale: String,
}

impl Classification {
    pub fn hold(label: PerformanceLabel, rationale: impl Into<String>) -> Self {
        Self {
            label,
            action: RecommendedAction::Hold,
            magnitude: 0.0,
            rationale: rationale.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Recommendation {
    pub id: String,
    pub audience_id: String,
    pub generated_at: DateTime<Utc>,
    pub label: PerformanceLabel,
    pub action: RecommendedAction,
    pub magnitude: f64,
    pub rationale: String,
    pub audience_name: Option<String>,
    pub audience_type: Option<AudienceType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OutcomeMetrics {
    pub roas: f64,
    pub cpa: Option<f64>,
    pub spend: f64,
    pub purchases: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ActionLog {
    pub id: String,
    pub account_id: String,
    pub audience_id: String,
    pub recommendation_id: Option<String>,
    pub action: RecommendedAction,
    pub magnitude: f64,
    pub baseline_metrics: Option<OutcomeMetrics>,
    pub created_at: DateTime<Utc>,
    pub outcome_3d_metrics: Option<OutcomeMetrics>,
    pub outcome_3d_at: Option<DateTime<Utc>>,
    pub outcome_7d_metrics: Option<OutcomeMetrics>,
    pub outcome_7d_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeHorizon {
    ThreeDay,
    SevenDay,
}

impl OutcomeHorizon {
    pub fn days(self) -> i64 {
        match self {
            Self::ThreeDay => 3,
            Self::SevenDay => 7,
        }
    }

    pub(crate) fn columns(self) -> (&'static str, &'static str) {
        match self {
            Self::ThreeDay => ("outcome_3d_metrics", "outcome_3d_at"),
            Self::SevenDay => ("outcome_7d_metrics", "outcome_7d_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AccountBenchmarks {
    pub account_id: String,
    pub audience_count: u64,
    pub avg_roas: f64,
    pub avg_cpa: Option<f64>,
    pub avg_cvr: f64,
    pub avg_spend: f64,
    pub total_spend: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncStatus {
    pub account_id: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub audience_count: u64,
    pub snapshot_count: u64,
    pub audiences_with_data: u64,
    pub can_generate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncResult {
    pub synced: bool,
    pub audiences: u64,
    pub snapshots: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GenerateResponse {
    pub recommendations: Vec<Recommendation>,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OutcomeRunReport {
    pub updated_3d: u64,
    pub updated_7d: u64,
    pub skipped: u64,
    pub failed: u64,
}
