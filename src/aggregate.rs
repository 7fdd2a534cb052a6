use crate::models::{
    GroupBy, ModelBreakdown, ModelShare, Timeline, TimelineBucket, UsageAggregation, UsageEntry,
    UsageQuery,
};
use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashSet};

/// Upper bound on entries folded into one aggregation.
pub const MAX_AGGREGATION_ENTRIES: usize = 10_000;

/// Window used when an empty query has no bounds of its own.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

fn per_request(total: f64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        total / requests as f64
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Folds already-filtered entries into totals, a per-model breakdown and
/// efficiency ratios.
pub fn aggregate(entries: &[UsageEntry], query: &UsageQuery, now: DateTime<Utc>) -> UsageAggregation {
    let (Some(first), Some(last)) = (
        entries.iter().map(|e| e.timestamp).min(),
        entries.iter().map(|e| e.timestamp).max(),
    ) else {
        return UsageAggregation::empty(
            query
                .start_date
                .unwrap_or(now - Duration::days(DEFAULT_LOOKBACK_DAYS)),
            query.end_date.unwrap_or(now),
            query.instance_id.clone(),
        );
    };

    let mut agg = UsageAggregation::empty(
        query.start_date.unwrap_or(first),
        query.end_date.unwrap_or(last),
        query.instance_id.clone(),
    );
    let mut sessions = HashSet::new();
    let mut instances = HashSet::new();
    let mut cache_hits = 0u64;

    for e in entries {
        agg.total_input_tokens = agg.total_input_tokens.saturating_add(e.input_tokens);
        agg.total_output_tokens = agg.total_output_tokens.saturating_add(e.output_tokens);
        agg.total_cache_creation_tokens = agg
            .total_cache_creation_tokens
            .saturating_add(e.cache_creation_tokens);
        agg.total_cache_read_tokens = agg
            .total_cache_read_tokens
            .saturating_add(e.cache_read_tokens);

        agg.total_input_cost += e.input_cost;
        agg.total_output_cost += e.output_cost;
        agg.total_cache_creation_cost += e.cache_creation_cost;
        agg.total_cache_read_cost += e.cache_read_cost;

        agg.model_usage.entry(e.model.clone()).or_default().record(e);

        if e.cache_read_tokens > 0 {
            cache_hits += 1;
        }
        if let Some(session) = e.session_id.as_deref().filter(|s| !s.is_empty()) {
            sessions.insert(session);
        }
        if !e.instance_id.is_empty() {
            instances.insert(e.instance_id.as_str());
        }
    }

    agg.total_requests = entries.len() as u64;
    agg.total_tokens = agg.total_input_tokens.saturating_add(agg.total_output_tokens);
    agg.total_cost = agg.total_input_cost
        + agg.total_output_cost
        + agg.total_cache_creation_cost
        + agg.total_cache_read_cost;
    agg.total_sessions = sessions.len() as u64;
    agg.unique_instances = instances.len() as u64;

    agg.avg_tokens_per_request = per_request(agg.total_tokens as f64, agg.total_requests);
    agg.avg_cost_per_request = per_request(agg.total_cost, agg.total_requests);
    agg.cache_hit_rate = per_request(cache_hits as f64 * 100.0, agg.total_requests);

    agg
}

fn bucket_key(ts: DateTime<Utc>, group_by: GroupBy, tz: Tz) -> String {
    let local = ts.with_timezone(&tz);
    match group_by {
        GroupBy::Hour => local.format("%Y-%m-%dT%H:00:00").to_string(),
        GroupBy::Day => local.format("%Y-%m-%d").to_string(),
        GroupBy::Week => {
            let monday =
                local.date_naive() - Duration::days(i64::from(local.weekday().num_days_from_monday()));
            monday.format("%Y-%m-%d").to_string()
        }
    }
}

/// Buckets entries by calendar hour, day or ISO week (keyed by its Monday),
/// evaluated in `tz`. Buckets come back in ascending key order.
pub fn timeline(
    entries: &[UsageEntry],
    group_by: GroupBy,
    tz: Tz,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Timeline {
    let mut buckets: BTreeMap<String, TimelineBucket> = BTreeMap::new();

    for e in entries {
        let key = bucket_key(e.timestamp, group_by, tz);
        let bucket = buckets
            .entry(key)
            .or_insert_with_key(|k| TimelineBucket::new(k.clone()));

        bucket.total_tokens = bucket.total_tokens.saturating_add(e.total_tokens());
        bucket.total_cost += e.total_cost;
        bucket.requests += 1;
        bucket.input_tokens = bucket.input_tokens.saturating_add(e.input_tokens);
        bucket.output_tokens = bucket.output_tokens.saturating_add(e.output_tokens);
        bucket.cache_tokens = bucket
            .cache_tokens
            .saturating_add(e.cache_creation_tokens.saturating_add(e.cache_read_tokens));

        let model = bucket.models.entry(e.model.clone()).or_default();
        model.tokens = model.tokens.saturating_add(e.total_tokens());
        model.cost += e.total_cost;
        model.requests += 1;
    }

    Timeline {
        buckets: buckets.into_values().collect(),
        start,
        end,
        group_by,
    }
}

/// Per-model shares of an aggregation's cost and tokens.
pub fn model_breakdown(agg: &UsageAggregation) -> ModelBreakdown {
    let models = agg
        .model_usage
        .iter()
        .map(|(model, usage)| {
            let cost_percentage = if agg.total_cost > 0.0 {
                usage.cost / agg.total_cost * 100.0
            } else {
                0.0
            };
            let token_percentage = if agg.total_tokens > 0 {
                usage.tokens as f64 / agg.total_tokens as f64 * 100.0
            } else {
                0.0
            };
            let share = ModelShare {
                tokens: usage.tokens,
                cost: usage.cost,
                requests: usage.requests,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost_percentage: round2(cost_percentage),
                token_percentage: round2(token_percentage),
                avg_cost_per_request: per_request(usage.cost, usage.requests),
                avg_tokens_per_request: per_request(usage.tokens as f64, usage.requests),
            };
            (model.clone(), share)
        })
        .collect::<BTreeMap<_, _>>();

    ModelBreakdown {
        total_models: models.len(),
        models,
        total_cost: agg.total_cost,
        total_tokens: agg.total_tokens,
        start: agg.period_start,
        end: agg.period_end,
    }
}
