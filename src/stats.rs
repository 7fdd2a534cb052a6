use crate::config::UsageConfig;
use crate::models::{TrendDirection, UsageAggregation, UsageStats};
use crate::period::PeriodBounds;
use chrono::{DateTime, Utc};

/// Relative cost change beyond which usage counts as trending.
pub const TREND_THRESHOLD: f64 = 0.10;

/// Projections assume a flat 30-day month whatever the calendar says.
pub const PROJECTION_DAYS: f64 = 30.0;

pub fn classify_trend(current_cost: f64, previous_cost: f64) -> TrendDirection {
    if previous_cost <= 0.0 {
        return TrendDirection::Stable;
    }
    let change = (current_cost - previous_cost) / previous_cost;
    if change > TREND_THRESHOLD {
        TrendDirection::Increasing
    } else if change < -TREND_THRESHOLD {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

/// Share of `quota` consumed, in percent. An unset or zero quota reports 0.
fn percent_of(usage: f64, quota: Option<f64>) -> f64 {
    match quota {
        Some(q) if q > 0.0 => usage / q * 100.0,
        _ => 0.0,
    }
}

pub fn project(
    current: &UsageAggregation,
    previous: &UsageAggregation,
    config: &UsageConfig,
    period: PeriodBounds,
    now: DateTime<Utc>,
) -> UsageStats {
    let days_elapsed = period.days_elapsed(now) as f64;
    let daily_cost = current.total_cost / days_elapsed;
    let daily_tokens = current.total_tokens as f64 / days_elapsed;

    UsageStats {
        current_period_start: period.start,
        current_period_end: period.end,
        current_tokens: current.total_tokens,
        current_cost: current.total_cost,
        current_requests: current.total_requests,
        token_quota: config.token_quota,
        cost_quota: config.cost_quota,
        request_quota: config.request_quota,
        token_usage_percent: percent_of(
            current.total_tokens as f64,
            config.token_quota.map(|q| q as f64),
        ),
        cost_usage_percent: percent_of(current.total_cost, config.cost_quota),
        request_usage_percent: percent_of(
            current.total_requests as f64,
            config.request_quota.map(|q| q as f64),
        ),
        projected_monthly_cost: daily_cost * PROJECTION_DAYS,
        projected_monthly_tokens: (daily_tokens * PROJECTION_DAYS) as u64,
        daily_average_cost: daily_cost,
        daily_average_tokens: daily_tokens as u64,
        trend_direction: classify_trend(current.total_cost, previous.total_cost),
    }
}
