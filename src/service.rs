use crate::aggregate::{self, MAX_AGGREGATION_ENTRIES};
use crate::config::{normalize_model_name, AppPaths, ConfigPatch, UsageConfig};
use crate::error::AppError;
use crate::export::{prune_exports, write_export, EXPORT_TTL};
use crate::models::{
    CleanupReport, ExportOutcome, ExportRequest, GroupBy, ModelBreakdown, Timeline, TrackRequest,
    UsageAggregation, UsageEntry, UsageQuery, UsageStats,
};
use crate::period;
use crate::pricing::{calculate_cost, PricingTable};
use crate::query;
use crate::stats;
use crate::storage::Storage;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::info;
use uuid::Uuid;

/// `now` minus `days`, or `InvalidInput` when that falls outside chrono's range.
fn days_before(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, AppError> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| AppError::InvalidInput(format!("{days} days reaches too far back.")))
}

/// Usage tracking service. Construct once and share by reference.
///
/// Appends and cleanup take the log lock exclusively; reads share it.
/// Config mutations run read-modify-write under the config mutex.
pub struct UsageTracker {
    store: Storage,
    exports_dir: PathBuf,
    config: Mutex<UsageConfig>,
    log_lock: RwLock<()>,
}

impl UsageTracker {
    pub fn open(paths: &AppPaths) -> Result<Self, AppError> {
        paths.ensure_dirs()?;
        let store = Storage::open(paths)?;
        let config = store.load_config()?;
        Ok(Self {
            store,
            exports_dir: paths.exports_dir.clone(),
            config: Mutex::new(config),
            log_lock: RwLock::new(()),
        })
    }

    fn lock_config(&self) -> MutexGuard<'_, UsageConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> UsageConfig {
        self.lock_config().clone()
    }

    pub fn pricing(&self) -> PricingTable {
        self.lock_config().pricing.clone()
    }

    pub fn track(&self, request: TrackRequest) -> Result<UsageEntry, AppError> {
        self.track_at(request, Utc::now())
    }

    /// Prices the request with the current table and appends it to the log.
    pub fn track_at(&self, request: TrackRequest, now: DateTime<Utc>) -> Result<UsageEntry, AppError> {
        let instance_id = request.instance_id.trim();
        if instance_id.is_empty() {
            return Err(AppError::InvalidInput("instance_id must not be empty.".into()));
        }
        let model = normalize_model_name(&request.model);
        if model.is_empty() {
            return Err(AppError::InvalidInput("model must not be empty.".into()));
        }

        let cost = {
            let cfg = self.lock_config();
            calculate_cost(&cfg.pricing, &model, &request.tokens)
        };

        let entry = UsageEntry {
            id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            session_id: request.session_id,
            message_id: request.message_id,
            timestamp: now,
            model,
            model_version: request.model_version,
            input_tokens: request.tokens.input_tokens,
            output_tokens: request.tokens.output_tokens,
            cache_creation_tokens: request.tokens.cache_creation_tokens,
            cache_read_tokens: request.tokens.cache_read_tokens,
            input_cost: cost.input_cost,
            output_cost: cost.output_cost,
            cache_creation_cost: cost.cache_creation_cost,
            cache_read_cost: cost.cache_read_cost,
            total_cost: cost.total_cost,
            conversation_turns: request.conversation_turns.unwrap_or(1),
            context_window_size: request.context_window_size,
            user_agent: request.user_agent,
            metadata: request.metadata,
        };

        {
            let _guard = self.log_lock.write().unwrap_or_else(PoisonError::into_inner);
            self.store.append(&entry)?;
        }

        info!(
            instance = %entry.instance_id,
            model = %entry.model,
            tokens = entry.total_tokens(),
            cost = entry.total_cost,
            "tracked usage"
        );
        Ok(entry)
    }

    pub fn query(&self, q: &UsageQuery) -> Result<Vec<UsageEntry>, AppError> {
        let _guard = self.log_lock.read().unwrap_or_else(PoisonError::into_inner);
        query::select(self.store.scan()?, q)
    }

    pub fn aggregate(&self, q: &UsageQuery) -> Result<UsageAggregation, AppError> {
        self.aggregate_at(q, Utc::now())
    }

    /// Aggregates every entry matching `q`, ignoring its pagination.
    pub fn aggregate_at(&self, q: &UsageQuery, now: DateTime<Utc>) -> Result<UsageAggregation, AppError> {
        let entries = self.query(&q.unpaged(MAX_AGGREGATION_ENTRIES))?;
        Ok(aggregate::aggregate(&entries, q, now))
    }

    pub fn current_stats(&self) -> Result<UsageStats, AppError> {
        self.current_stats_at(Utc::now())
    }

    pub fn current_stats_at(&self, now: DateTime<Utc>) -> Result<UsageStats, AppError> {
        let cfg = self.config();
        let window = period::resolve(now, cfg.billing_period, cfg.timezone);

        let current = self.aggregate_at(
            &UsageQuery::between(window.current.start, window.current.end),
            now,
        )?;
        let previous = self.aggregate_at(
            &UsageQuery::between(window.previous.start, window.previous.end),
            now,
        )?;

        Ok(stats::project(&current, &previous, &cfg, window.current, now))
    }

    fn lookback_query(
        days: u32,
        instance_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<UsageQuery, AppError> {
        if days == 0 {
            return Err(AppError::InvalidInput("days must be at least 1.".into()));
        }
        Ok(UsageQuery {
            instance_id,
            ..UsageQuery::between(days_before(now, days)?, now)
        })
    }

    pub fn timeline(
        &self,
        days: u32,
        instance_id: Option<String>,
        group_by: GroupBy,
    ) -> Result<Timeline, AppError> {
        self.timeline_at(days, instance_id, group_by, Utc::now())
    }

    pub fn timeline_at(
        &self,
        days: u32,
        instance_id: Option<String>,
        group_by: GroupBy,
        now: DateTime<Utc>,
    ) -> Result<Timeline, AppError> {
        let q = Self::lookback_query(days, instance_id, now)?;
        let entries = self.query(&q.unpaged(MAX_AGGREGATION_ENTRIES))?;
        let tz = self.config().timezone;
        let (start, end) = (q.start_date.unwrap_or(now), q.end_date.unwrap_or(now));
        Ok(aggregate::timeline(&entries, group_by, tz, start, end))
    }

    pub fn model_breakdown(
        &self,
        days: u32,
        instance_id: Option<String>,
    ) -> Result<ModelBreakdown, AppError> {
        self.model_breakdown_at(days, instance_id, Utc::now())
    }

    pub fn model_breakdown_at(
        &self,
        days: u32,
        instance_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ModelBreakdown, AppError> {
        let q = Self::lookback_query(days, instance_id, now)?;
        let agg = self.aggregate_at(&q, now)?;
        Ok(aggregate::model_breakdown(&agg))
    }

    pub fn export(&self, request: &ExportRequest) -> Result<ExportOutcome, AppError> {
        self.export_at(request, Utc::now())
    }

    pub fn export_at(&self, request: &ExportRequest, now: DateTime<Utc>) -> Result<ExportOutcome, AppError> {
        let entries = self.query(&request.query)?;
        let aggregation = if request.include_aggregations {
            Some(self.aggregate_at(&request.query, now)?)
        } else {
            None
        };

        let path = write_export(
            &self.exports_dir,
            request,
            &entries,
            aggregation.as_ref(),
            now,
        )?;
        Ok(ExportOutcome {
            path,
            entries: entries.len(),
        })
    }

    pub fn cleanup(&self, retention_days: Option<u32>) -> Result<CleanupReport, AppError> {
        self.cleanup_at(retention_days, Utc::now())
    }

    /// Drops entries older than `retention_days` (config default when `None`)
    /// and prunes stale export files.
    pub fn cleanup_at(
        &self,
        retention_days: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, AppError> {
        let days = retention_days.unwrap_or_else(|| self.config().auto_cleanup_days);
        if days == 0 {
            return Err(AppError::InvalidInput(
                "retention must be at least 1 day.".into(),
            ));
        }
        let cutoff = days_before(now, days)?;

        let retained = {
            let _guard = self.log_lock.write().unwrap_or_else(PoisonError::into_inner);
            self.store.retain_since(cutoff)?
        };
        let exports_pruned = prune_exports(&self.exports_dir, EXPORT_TTL, SystemTime::now())?;

        info!(
            kept = retained.kept,
            removed = retained.removed,
            exports_pruned,
            retention_days = days,
            "cleaned up usage data"
        );
        Ok(CleanupReport {
            kept: retained.kept,
            removed: retained.removed,
            exports_pruned,
        })
    }

    /// Applies `patch` to the persisted config inside one critical section.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<UsageConfig, AppError> {
        let mut current = self.lock_config();
        let on_disk = self.store.load_config()?;
        let next = patch.apply(&on_disk)?;
        self.store.save_config(&next)?;
        *current = next.clone();

        info!(
            billing_period = %next.billing_period,
            cost_quota = ?next.cost_quota,
            token_quota = ?next.token_quota,
            request_quota = ?next.request_quota,
            "usage config updated"
        );
        Ok(next)
    }

    /// Replaces the pricing table. Existing entries keep their recorded cost.
    pub fn update_pricing(&self, table: PricingTable) -> Result<PricingTable, AppError> {
        let patch = ConfigPatch {
            pricing: Some(table),
            ..ConfigPatch::default()
        };
        Ok(self.update_config(&patch)?.pricing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BillingPeriod, QuotaUpdate};
    use crate::models::{ExportFormat, TokenCounts, TrendDirection};
    use crate::pricing::ModelPricing;
    use chrono::TimeZone;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn at(m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, m, d, h, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn open(tmp: &TempDir) -> UsageTracker {
        UsageTracker::open(&AppPaths::under(tmp.path())).expect("open tracker")
    }

    fn haiku(instance: &str, input: u64, output: u64) -> TrackRequest {
        TrackRequest::new(instance, "claude-3-haiku", TokenCounts::new(input, output))
    }

    #[test]
    fn track_prices_haiku_usage() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let entry = tracker
            .track_at(haiku("inst-1", 1000, 500), at(2, 15, 12))
            .expect("track");
        assert!((entry.total_cost - 0.001125).abs() < 1e-9);
        assert_eq!(entry.conversation_turns, 1);

        let sum = entry.input_cost + entry.output_cost + entry.cache_creation_cost + entry.cache_read_cost;
        assert!((entry.total_cost - sum).abs() <= 1e-6);
    }

    #[test]
    fn track_rejects_blank_instance() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let err = tracker.track(haiku("  ", 1, 1)).expect_err("blank instance");
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(tracker.query(&UsageQuery::default()).expect("query").is_empty());
    }

    #[test]
    fn track_normalizes_model_and_keeps_unknown_models() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let entry = tracker
            .track(TrackRequest::new("i", " Claude-3-Opus ", TokenCounts::new(1000, 0)))
            .expect("track opus");
        assert_eq!(entry.model, "claude-3-opus");
        assert!((entry.total_cost - 0.015).abs() < 1e-9);

        let unknown = tracker
            .track(TrackRequest::new("i", "mystery-model", TokenCounts::new(1000, 1000)))
            .expect("track unknown");
        assert_eq!(unknown.total_cost, 0.0);
    }

    #[test]
    fn round_trip_returns_all_entries_newest_first() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        for h in 0..10 {
            tracker
                .track_at(haiku("inst-1", 10 * (h + 1) as u64, 0), at(3, 1, h))
                .expect("track");
        }

        let q = UsageQuery {
            limit: 50,
            ..UsageQuery::default()
        };
        let entries = tracker.query(&q).expect("query");
        assert_eq!(entries.len(), 10);
        assert!(entries.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(entries[0].input_tokens, 100);

        let beyond = UsageQuery {
            offset: 1000,
            ..UsageQuery::default()
        };
        assert!(tracker.query(&beyond).expect("query").is_empty());
    }

    #[test]
    fn pricing_change_does_not_rewrite_history() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let before = tracker.track(haiku("i", 1000, 0)).expect("track");

        let mut table = tracker.pricing();
        table.insert(
            "claude-3-haiku".into(),
            ModelPricing {
                input_price_per_1k: 1.0,
                output_price_per_1k: 1.0,
                cache_creation_price_per_1k: 1.0,
                cache_read_price_per_1k: 1.0,
            },
        );
        tracker.update_pricing(table).expect("update pricing");
        let after = tracker.track(haiku("i", 1000, 0)).expect("track");

        assert!((after.total_cost - 1.0).abs() < 1e-9);
        let stored = tracker.query(&UsageQuery::default()).expect("query");
        let old = stored.iter().find(|e| e.id == before.id).expect("old entry");
        assert!((old.total_cost - 0.00025).abs() < 1e-9);
    }

    #[test]
    fn aggregate_ignores_pagination_and_is_repeatable() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        for h in 0..5 {
            tracker
                .track_at(haiku("inst-1", 1000, 500), at(3, 1, h))
                .expect("track");
        }

        let q = UsageQuery {
            limit: 1,
            offset: 3,
            ..UsageQuery::default()
        };
        let first = tracker.aggregate_at(&q, at(3, 2, 0)).expect("aggregate");
        let second = tracker.aggregate_at(&q, at(3, 2, 0)).expect("aggregate");
        assert_eq!(first, second);
        assert_eq!(first.total_requests, 5);
        assert!((first.total_cost - 5.0 * 0.001125).abs() < 1e-9);
    }

    #[test]
    fn current_stats_compares_with_previous_period() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        tracker
            .update_config(&ConfigPatch {
                billing_period: Some(BillingPeriod::Monthly),
                cost_quota: QuotaUpdate::Set(1.0),
                ..ConfigPatch::default()
            })
            .expect("configure");

        // January: one request. February so far: three.
        tracker
            .track_at(haiku("i", 1000, 500), at(1, 20, 0))
            .expect("track jan");
        for d in 1..=3 {
            tracker
                .track_at(haiku("i", 1000, 500), at(2, d, 0))
                .expect("track feb");
        }

        let stats = tracker.current_stats_at(at(2, 15, 12)).expect("stats");
        assert_eq!(stats.current_period_start, at(2, 1, 0));
        assert_eq!(stats.current_requests, 3);
        assert_eq!(stats.current_tokens, 4500);
        assert_eq!(stats.trend_direction, TrendDirection::Increasing);
        assert!((stats.cost_usage_percent - 0.3375).abs() < 1e-9);
        assert!((stats.daily_average_cost - 0.003375 / 15.0).abs() < 1e-12);
        assert_eq!(stats.daily_average_tokens, 300);
        assert_eq!(stats.projected_monthly_tokens, 9000);
    }

    #[test]
    fn current_stats_splits_entries_at_period_boundary() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let last_of_previous = at(2, 1, 0) - Duration::seconds(1);

        tracker
            .track_at(haiku("i", 1000, 0), last_of_previous)
            .expect("track previous");
        tracker
            .track_at(haiku("i", 2000, 0), at(2, 1, 0))
            .expect("track current");

        let stats = tracker.current_stats_at(at(2, 15, 12)).expect("stats");
        assert_eq!(stats.current_period_start, at(2, 1, 0));
        assert_eq!(stats.current_requests, 1);
        assert_eq!(stats.current_tokens, 2000);

        // Previous cost 0.00025, current 0.0005: a 100% rise.
        assert_eq!(stats.trend_direction, TrendDirection::Increasing);

        let previous = tracker
            .aggregate_at(
                &UsageQuery::between(at(1, 1, 0), last_of_previous),
                at(2, 15, 12),
            )
            .expect("aggregate previous");
        assert_eq!(previous.total_requests, 1);
        assert_eq!(previous.total_tokens, 1000);
    }

    #[test]
    fn periods_follow_configured_zone() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        tracker
            .update_config(&ConfigPatch {
                timezone: Some("America/New_York".into()),
                ..ConfigPatch::default()
            })
            .expect("configure");

        // 03:00 UTC on Mar 1 is still Feb 29 in New York.
        tracker
            .track_at(haiku("i", 1000, 0), at(3, 1, 3))
            .expect("track");
        let stats = tracker.current_stats_at(at(3, 15, 12)).expect("stats");
        assert_eq!(stats.current_period_start, at(3, 1, 5));
        assert_eq!(stats.current_requests, 0);
    }

    #[test]
    fn invalid_utf8_line_does_not_break_reads_or_cleanup() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        tracker.track_at(haiku("i", 1000, 0), at(2, 2, 0)).expect("track");
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(AppPaths::under(tmp.path()).usage_log)
                .expect("open log");
            f.write_all(b"\xff\xfe garbage\n").expect("write junk");
        }
        tracker.track_at(haiku("i", 1000, 0), at(2, 3, 0)).expect("track");

        assert_eq!(tracker.query(&UsageQuery::default()).expect("query").len(), 2);
        let agg = tracker
            .aggregate_at(&UsageQuery::default(), at(2, 15, 0))
            .expect("aggregate");
        assert_eq!(agg.total_requests, 2);
        let stats = tracker.current_stats_at(at(2, 15, 0)).expect("stats");
        assert_eq!(stats.current_requests, 2);

        let report = tracker.cleanup_at(Some(30), at(2, 15, 0)).expect("cleanup");
        assert_eq!(report.kept, 2);
        assert_eq!(report.removed, 0);
    }

    #[test]
    fn huge_day_counts_are_rejected_not_panicking() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let now = at(4, 10, 12);

        let err = tracker
            .cleanup_at(Some(u32::MAX), now)
            .expect_err("cleanup too far back");
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(tracker.timeline_at(u32::MAX, None, GroupBy::Day, now).is_err());
        assert!(tracker.model_breakdown_at(u32::MAX, None, now).is_err());

        // A long but representable lookback still works.
        assert!(tracker.cleanup_at(Some(100_000), now).is_ok());
    }

    #[test]
    fn current_stats_on_empty_log() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let stats = tracker.current_stats_at(at(5, 10, 0)).expect("stats");
        assert_eq!(stats.current_requests, 0);
        assert_eq!(stats.cost_usage_percent, 0.0);
        assert_eq!(stats.projected_monthly_cost, 0.0);
        assert_eq!(stats.trend_direction, TrendDirection::Stable);
        assert_eq!(stats.cost_quota, Some(100.0));
    }

    #[test]
    fn concurrent_config_updates_are_not_lost() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);

        std::thread::scope(|s| {
            for i in 0..8u64 {
                let tracker = &tracker;
                s.spawn(move || {
                    let patch = if i % 2 == 0 {
                        ConfigPatch {
                            cost_quota: QuotaUpdate::Set(100.0 * (i + 1) as f64),
                            ..ConfigPatch::default()
                        }
                    } else {
                        ConfigPatch {
                            request_quota: QuotaUpdate::Set(i),
                            ..ConfigPatch::default()
                        }
                    };
                    tracker.update_config(&patch).expect("update config");
                });
            }
        });

        let in_memory = tracker.config();
        let on_disk = Storage::open(&AppPaths::under(tmp.path()))
            .expect("reopen")
            .load_config()
            .expect("load");
        assert_eq!(in_memory, on_disk);
        // Both kinds of patch survived: neither overwrote the other.
        let cost = in_memory.cost_quota.expect("cost quota set");
        assert!([100.0, 300.0, 500.0, 700.0].contains(&cost));
        assert!(matches!(in_memory.request_quota, Some(1 | 3 | 5 | 7)));
    }

    #[test]
    fn two_cost_quota_writers_settle_on_one_value() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        std::thread::scope(|s| {
            for quota in [100.0, 200.0] {
                let tracker = &tracker;
                s.spawn(move || {
                    tracker
                        .update_config(&ConfigPatch {
                            cost_quota: QuotaUpdate::Set(quota),
                            ..ConfigPatch::default()
                        })
                        .expect("update");
                });
            }
        });
        let reopened = open(&tmp);
        assert_eq!(reopened.config().cost_quota, tracker.config().cost_quota);
        assert!(matches!(tracker.config().cost_quota, Some(q) if q == 100.0 || q == 200.0));
    }

    #[test]
    fn concurrent_tracks_all_land() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        std::thread::scope(|s| {
            for t in 0..4 {
                let tracker = &tracker;
                s.spawn(move || {
                    for _ in 0..25 {
                        tracker
                            .track(haiku(&format!("inst-{t}"), 10, 10))
                            .expect("track");
                    }
                });
            }
        });
        let agg = tracker.aggregate(&UsageQuery::default()).expect("aggregate");
        assert_eq!(agg.total_requests, 100);
        assert_eq!(agg.unique_instances, 4);
    }

    #[test]
    fn invalid_patch_leaves_config_untouched() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let before = tracker.config();
        let result = tracker.update_config(&ConfigPatch {
            cost_quota: QuotaUpdate::Set(5.0),
            auto_cleanup_days: Some(0),
            ..ConfigPatch::default()
        });
        assert!(result.is_err());
        assert_eq!(tracker.config(), before);
        assert_eq!(open(&tmp).config(), before);
    }

    #[test]
    fn cleanup_uses_configured_retention() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        tracker
            .update_config(&ConfigPatch {
                auto_cleanup_days: Some(30),
                ..ConfigPatch::default()
            })
            .expect("configure");

        tracker.track_at(haiku("i", 1, 1), at(1, 1, 0)).expect("old");
        tracker.track_at(haiku("i", 1, 1), at(3, 1, 0)).expect("recent");

        let report = tracker.cleanup_at(None, at(3, 10, 0)).expect("cleanup");
        assert_eq!(report.kept, 1);
        assert_eq!(report.removed, 1);

        let left = tracker.query(&UsageQuery::default()).expect("query");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, at(3, 1, 0));

        assert!(tracker.cleanup_at(Some(0), at(3, 10, 0)).is_err());
    }

    #[test]
    fn export_writes_into_exports_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        tracker.track(haiku("i", 1000, 500)).expect("track");

        let outcome = tracker
            .export(&ExportRequest::new(ExportFormat::Csv, UsageQuery::default()))
            .expect("export");
        assert_eq!(outcome.entries, 1);
        assert!(outcome.path.starts_with(AppPaths::under(tmp.path()).exports_dir));
        let raw = fs::read_to_string(&outcome.path).expect("read export");
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn timeline_and_breakdown_cover_lookback_window() {
        let tmp = TempDir::new().expect("tempdir");
        let tracker = open(&tmp);
        let now = at(4, 10, 12);
        tracker.track_at(haiku("a", 100, 100), at(4, 9, 8)).expect("track");
        tracker.track_at(haiku("b", 100, 100), at(4, 10, 8)).expect("track");
        tracker.track_at(haiku("a", 100, 100), at(1, 1, 0)).expect("track old");

        let tl = tracker
            .timeline_at(7, None, GroupBy::Day, now)
            .expect("timeline");
        assert_eq!(tl.buckets.len(), 2);

        let only_a = tracker
            .timeline_at(7, Some("a".into()), GroupBy::Day, now)
            .expect("timeline");
        assert_eq!(only_a.buckets.len(), 1);

        let breakdown = tracker.model_breakdown_at(7, None, now).expect("breakdown");
        assert_eq!(breakdown.total_models, 1);
        assert_eq!(breakdown.models["claude-3-haiku"].requests, 2);
        assert!((breakdown.models["claude-3-haiku"].cost_percentage - 100.0).abs() < 1e-9);

        assert!(tracker.timeline_at(0, None, GroupBy::Day, now).is_err());
    }
}
