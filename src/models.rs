use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

static ENTITY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]{1,32}$").expect("valid entity id regex"));

pub const MAX_STAT_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Period {
    Session,
    Daily,
    Yesterday,
    Monthly,
}

impl Period {
    pub const ALL: [Period; 4] = [Period::Session, Period::Daily, Period::Yesterday, Period::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Daily => "daily",
            Self::Yesterday => "yesterday",
            Self::Monthly => "monthly",
        }
    }

    /// Column holding this period's baseline in `stat_records`.
    pub fn snapshot_column(self) -> &'static str {
        match self {
            Self::Session => "session_snapshot",
            Self::Daily => "daily_snapshot",
            Self::Yesterday => "yesterday_snapshot",
            Self::Monthly => "monthly_snapshot",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "session" => Some(Self::Session),
            "daily" => Some(Self::Daily),
            "yesterday" => Some(Self::Yesterday),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

/// Stored row: one lifetime value plus the baseline observed at the start of each period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatSnapshots {
    pub lifetime: f64,
    pub session: f64,
    pub daily: f64,
    pub yesterday: f64,
    pub monthly: f64,
}

impl StatSnapshots {
    pub fn fresh(lifetime: f64) -> Self {
        Self {
            lifetime,
            session: lifetime,
            daily: lifetime,
            yesterday: lifetime,
            monthly: lifetime,
        }
    }

    pub fn snapshot(&self, period: Period) -> f64 {
        match period {
            Period::Session => self.session,
            Period::Daily => self.daily,
            Period::Yesterday => self.yesterday,
            Period::Monthly => self.monthly,
        }
    }

    pub fn deltas(&self) -> StatLine {
        StatLine {
            lifetime: self.lifetime,
            session: self.lifetime - self.session,
            daily: self.lifetime - self.daily,
            yesterday: self.lifetime - self.yesterday,
            monthly: self.lifetime - self.monthly,
        }
    }
}

/// Read-side projection: lifetime plus the four period deltas.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatLine {
    pub lifetime: f64,
    pub session: f64,
    pub daily: f64,
    pub yesterday: f64,
    pub monthly: f64,
}

impl StatLine {
    pub fn delta(&self, period: Period) -> f64 {
        match period {
            Period::Session => self.session,
            Period::Daily => self.daily,
            Period::Yesterday => self.yesterday,
            Period::Monthly => self.monthly,
        }
    }
}

pub type StatSheet = BTreeMap<String, StatLine>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    pub entity_id: String,
    pub display_name: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional meta carried alongside an ingest; `None` fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaUpdate {
    pub display_name: Option<String>,
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub stats: StatSheet,
    pub meta: Option<EntityMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub reset_periods: BTreeSet<Period>,
    pub rotate_yesterday: bool,
    pub entity_ids: Vec<String>,
    pub narrow: bool,
}

impl RefreshRequest {
    pub fn lifetime_only(entity_ids: Vec<String>) -> Self {
        Self {
            entity_ids,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleState {
    Idle,
    LockAcquired,
    Rotating,
    Ingesting,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityOutcome {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub state: CycleState,
    pub rotated: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    pub entities: BTreeMap<String, EntityOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.entities.values().filter(|outcome| outcome.success).count()
    }

    pub fn failed(&self) -> usize {
        self.entities.len() - self.succeeded()
    }
}

/// Lowercased identity key for an entity; rejects names no stats source would return.
pub fn normalize_entity_id(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    if !ENTITY_ID_RE.is_match(trimmed) {
        return Err(AppError::InvalidInput(format!("invalid entity id '{}'", raw)));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Ratio for presentation layers: the numerator stands in when the denominator is zero.
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        numerator
    } else {
        numerator / denominator
    }
}
