use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

pub const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenCounts {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, creation: u64, read: u64) -> Self {
        self.cache_creation_tokens = creation;
        self.cache_read_tokens = read;
        self
    }
}

/// One persisted usage record. Costs are frozen at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: String,
    pub instance_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default)]
    pub cache_creation_cost: f64,
    #[serde(default)]
    pub cache_read_cost: f64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default = "default_turns")]
    pub conversation_turns: u32,
    #[serde(default)]
    pub context_window_size: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_turns() -> u32 {
    1
}

impl UsageEntry {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Everything the caller supplies when recording usage.
#[derive(Debug, Clone, Default)]
pub struct TrackRequest {
    pub instance_id: String,
    pub model: String,
    pub tokens: TokenCounts,
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub model_version: Option<String>,
    pub conversation_turns: Option<u32>,
    pub context_window_size: Option<u64>,
    pub user_agent: Option<String>,
    pub metadata: Map<String, Value>,
}

impl TrackRequest {
    pub fn new(instance_id: impl Into<String>, model: impl Into<String>, tokens: TokenCounts) -> Self {
        Self {
            instance_id: instance_id.into(),
            model: model.into(),
            tokens,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl Default for UsageQuery {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            instance_id: None,
            session_id: None,
            model: None,
            offset: 0,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl UsageQuery {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_date: Some(start),
            end_date: Some(end),
            ..Self::default()
        }
    }

    /// Same predicates, pagination replaced with `[0, limit)`.
    pub fn unpaged(&self, limit: usize) -> Self {
        Self {
            offset: 0,
            limit,
            ..self.clone()
        }
    }
}

/// Per-model subtotals. `Default` is the zero state a new model starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub tokens: u64,
    pub cost: f64,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ModelUsage {
    pub fn record(&mut self, entry: &UsageEntry) {
        self.tokens = self.tokens.saturating_add(entry.total_tokens());
        self.cost += entry.total_cost;
        self.requests += 1;
        self.input_tokens = self.input_tokens.saturating_add(entry.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(entry.output_tokens);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAggregation {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub instance_id: Option<String>,

    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_creation_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_tokens: u64,

    pub total_input_cost: f64,
    pub total_output_cost: f64,
    pub total_cache_creation_cost: f64,
    pub total_cache_read_cost: f64,
    pub total_cost: f64,

    pub total_requests: u64,
    pub total_sessions: u64,
    pub unique_instances: u64,

    pub model_usage: BTreeMap<String, ModelUsage>,

    pub avg_tokens_per_request: f64,
    pub avg_cost_per_request: f64,
    pub cache_hit_rate: f64,
}

impl UsageAggregation {
    pub fn empty(
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        instance_id: Option<String>,
    ) -> Self {
        Self {
            period_start,
            period_end,
            instance_id,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cache_creation_tokens: 0,
            total_cache_read_tokens: 0,
            total_tokens: 0,
            total_input_cost: 0.0,
            total_output_cost: 0.0,
            total_cache_creation_cost: 0.0,
            total_cache_read_cost: 0.0,
            total_cost: 0.0,
            total_requests: 0,
            total_sessions: 0,
            unique_instances: 0,
            model_usage: BTreeMap::new(),
            avg_tokens_per_request: 0.0,
            avg_cost_per_request: 0.0,
            cache_hit_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    #[default]
    Stable,
}

impl TrendDirection {
    pub fn as_label(self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,

    pub current_tokens: u64,
    pub current_cost: f64,
    pub current_requests: u64,

    pub token_quota: Option<u64>,
    pub cost_quota: Option<f64>,
    pub request_quota: Option<u64>,

    pub token_usage_percent: f64,
    pub cost_usage_percent: f64,
    pub request_usage_percent: f64,

    pub projected_monthly_cost: f64,
    pub projected_monthly_tokens: u64,

    pub daily_average_cost: f64,
    pub daily_average_tokens: u64,
    pub trend_direction: TrendDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("json") {
            Ok(ExportFormat::Json)
        } else if s.eq_ignore_ascii_case("csv") {
            Ok(ExportFormat::Csv)
        } else {
            Err(AppError::InvalidInput(
                "Unsupported export format. Use json or csv".into(),
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    #[serde(default)]
    pub query: UsageQuery,
    #[serde(default = "default_true")]
    pub include_raw_data: bool,
    #[serde(default = "default_true")]
    pub include_aggregations: bool,
    #[serde(default)]
    pub filename: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ExportRequest {
    pub fn new(format: ExportFormat, query: UsageQuery) -> Self {
        Self {
            format,
            query,
            include_raw_data: true,
            include_aggregations: true,
            filename: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Hour,
    Day,
    Week,
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GroupBy::Hour => "hour",
            GroupBy::Day => "day",
            GroupBy::Week => "week",
        };
        f.write_str(label)
    }
}

impl FromStr for GroupBy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(GroupBy::Hour),
            "day" => Ok(GroupBy::Day),
            "week" => Ok(GroupBy::Week),
            _ => Err(AppError::InvalidInput(
                "Unsupported grouping. Use hour, day, or week.".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketModelUsage {
    pub tokens: u64,
    pub cost: f64,
    pub requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub period: String,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub models: BTreeMap<String, BucketModelUsage>,
}

impl TimelineBucket {
    pub fn new(period: String) -> Self {
        Self {
            period,
            total_tokens: 0,
            total_cost: 0.0,
            requests: 0,
            input_tokens: 0,
            output_tokens: 0,
            cache_tokens: 0,
            models: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub buckets: Vec<TimelineBucket>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub group_by: GroupBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelShare {
    pub tokens: u64,
    pub cost: f64,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_percentage: f64,
    pub token_percentage: f64,
    pub avg_cost_per_request: f64,
    pub avg_tokens_per_request: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBreakdown {
    pub models: BTreeMap<String, ModelShare>,
    pub total_models: usize,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub kept: usize,
    pub removed: usize,
    pub exports_pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOutcome {
    pub path: PathBuf,
    pub entries: usize,
}
