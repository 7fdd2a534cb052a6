use crate::error::AppError;
use crate::pricing::{built_in_pricing, validate_pricing, PricingTable};
use chrono_tz::Tz;
use directories::ProjectDirs;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

pub const SERVICE_NAME: &str = "ccdash";

pub fn normalize_model_name(model: &str) -> String {
    model.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("CCDASH_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("dev", "ccdash", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".ccdash"))
}

/// Paths owned by one tracker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub usage_log: PathBuf,
    pub exports_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl AppPaths {
    pub fn under(home: &Path) -> Self {
        let data = home.join("data");
        Self {
            config_file: home.join("config").join("usage_config.toml"),
            usage_log: data.join("usage_entries.jsonl"),
            exports_dir: data.join("exports"),
            logs_dir: home.join("logs"),
        }
    }

    pub fn resolve() -> Result<Self, AppError> {
        Ok(Self::under(&app_home_dir()?))
    }

    pub fn ensure_dirs(&self) -> Result<(), AppError> {
        for file in [&self.config_file, &self.usage_log] {
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::create_dir_all(&self.exports_dir)?;
        fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BillingPeriod::Daily => "daily",
            BillingPeriod::Weekly => "weekly",
            BillingPeriod::Monthly => "monthly",
        };
        f.write_str(label)
    }
}

impl FromStr for BillingPeriod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(BillingPeriod::Daily),
            "weekly" => Ok(BillingPeriod::Weekly),
            "monthly" => Ok(BillingPeriod::Monthly),
            _ => Err(AppError::InvalidInput(
                "Unsupported billing period. Use daily, weekly, or monthly.".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default)]
    pub token_quota: Option<u64>,
    #[serde(default)]
    pub cost_quota: Option<f64>,
    #[serde(default)]
    pub request_quota: Option<u64>,
    #[serde(default)]
    pub billing_period: BillingPeriod,
    #[serde(default = "default_timezone", deserialize_with = "deserialize_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_cleanup_days")]
    pub auto_cleanup_days: u32,
    #[serde(default = "built_in_pricing")]
    pub pricing: PricingTable,
}

fn default_timezone() -> Tz {
    Tz::UTC
}

/// Unknown zone names in the file warn and fall back to UTC instead of
/// making the whole config unreadable.
fn deserialize_timezone<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(parse_timezone(&raw).unwrap_or_else(|| {
        warn!(timezone = %raw, "unrecognised timezone, using UTC");
        Tz::UTC
    }))
}

fn default_cleanup_days() -> u32 {
    365
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            token_quota: None,
            cost_quota: Some(100.0),
            request_quota: None,
            billing_period: BillingPeriod::Monthly,
            timezone: default_timezone(),
            auto_cleanup_days: default_cleanup_days(),
            pricing: built_in_pricing(),
        }
    }
}

/// IANA zone name (`Europe/Paris`, `America/New_York`) or `UTC`/`GMT`/`Z`
/// in any case.
pub fn parse_timezone(raw: &str) -> Option<Tz> {
    let raw = raw.trim();
    if ["utc", "gmt", "z"].iter().any(|z| raw.eq_ignore_ascii_case(z)) {
        return Some(Tz::UTC);
    }
    raw.parse::<Tz>().ok()
}

/// Tri-state update for an optional quota.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum QuotaUpdate<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T: Copy> QuotaUpdate<T> {
    fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            QuotaUpdate::Keep => current,
            QuotaUpdate::Clear => None,
            QuotaUpdate::Set(v) => Some(v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub token_quota: QuotaUpdate<u64>,
    pub cost_quota: QuotaUpdate<f64>,
    pub request_quota: QuotaUpdate<u64>,
    pub billing_period: Option<BillingPeriod>,
    pub timezone: Option<String>,
    pub auto_cleanup_days: Option<u32>,
    pub pricing: Option<PricingTable>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }

    /// Produces the patched config, or an error without touching `base`.
    pub fn apply(&self, base: &UsageConfig) -> Result<UsageConfig, AppError> {
        let mut next = base.clone();
        next.token_quota = self.token_quota.apply(base.token_quota);
        next.cost_quota = self.cost_quota.apply(base.cost_quota);
        next.request_quota = self.request_quota.apply(base.request_quota);

        if let Some(period) = self.billing_period {
            next.billing_period = period;
        }
        if let Some(raw) = &self.timezone {
            next.timezone = parse_timezone(raw).ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "Unsupported timezone '{raw}'. Use UTC or a zone name like America/Los_Angeles."
                ))
            })?;
        }
        if let Some(days) = self.auto_cleanup_days {
            if days == 0 {
                return Err(AppError::InvalidInput(
                    "auto_cleanup_days must be at least 1.".into(),
                ));
            }
            next.auto_cleanup_days = days;
        }
        if let Some(pricing) = &self.pricing {
            next.pricing = pricing.clone();
        }

        if next.cost_quota.is_some_and(|q| !q.is_finite() || q < 0.0) {
            return Err(AppError::InvalidInput(
                "cost_quota must be a non-negative number.".into(),
            ));
        }
        validate_pricing(&next.pricing)?;
        normalize_config(&mut next);
        Ok(next)
    }
}

fn normalize_config(config: &mut UsageConfig) -> bool {
    let mut changed = false;

    let mut pricing = PricingTable::new();
    for (model, price) in std::mem::take(&mut config.pricing) {
        let normalized = normalize_model_name(&model);
        if normalized != model {
            changed = true;
        }
        pricing.insert(normalized, price);
    }
    config.pricing = pricing;
    changed
}

/// Reads the config file. `Ok(None)` when it does not exist yet.
pub fn read_config(path: &Path) -> Result<Option<UsageConfig>, AppError> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    let mut parsed: UsageConfig = toml::from_str(&raw)?;

    // Persist normalized model keys so the file matches what is used.
    if normalize_config(&mut parsed) {
        write_config(path, &parsed)?;
    }

    Ok(Some(parsed))
}

pub fn write_config(path: &Path, config: &UsageConfig) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}
