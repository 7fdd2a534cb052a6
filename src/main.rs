mod aggregate;
mod config;
mod error;
mod export;
mod models;
mod period;
mod pricing;
mod query;
mod service;
mod stats;
mod storage;
mod ui;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::{AppPaths, BillingPeriod, ConfigPatch, QuotaUpdate};
use error::AppError;
use models::{ExportFormat, ExportRequest, GroupBy, TokenCounts, TrackRequest, UsageQuery};
use pricing::ModelPricing;
use serde::Serialize;
use serde_json::{Map, Value};
use service::UsageTracker;
use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ui::run::run_tui;

const DEFAULT_LOG_FILTER: &str = "ccdash=info";

#[derive(Debug, Parser)]
#[command(name = "ccdash")]
#[command(about = "Token usage, cost and quota tracker for Claude Code instances")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct Filters {
    /// Inclusive lower bound (RFC 3339)
    #[arg(long)]
    since: Option<String>,
    /// Inclusive upper bound (RFC 3339)
    #[arg(long)]
    until: Option<String>,
    #[arg(long)]
    instance: Option<String>,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Track {
        instance: String,
        model: String,
        #[arg(long)]
        input: u64,
        #[arg(long)]
        output: u64,
        #[arg(long, default_value_t = 0)]
        cache_creation: u64,
        #[arg(long, default_value_t = 0)]
        cache_read: u64,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        model_version: Option<String>,
        #[arg(long)]
        turns: Option<u32>,
        #[arg(long)]
        context_window: Option<u64>,
        #[arg(long)]
        user_agent: Option<String>,
        /// JSON object stored with the entry
        #[arg(long)]
        metadata: Option<String>,
    },
    Entries {
        #[command(flatten)]
        filters: Filters,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = models::DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },
    Aggregate {
        #[command(flatten)]
        filters: Filters,
    },
    Stats,
    Timeline {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long)]
        instance: Option<String>,
        #[arg(long, default_value = "day")]
        group_by: String,
    },
    Models {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        instance: Option<String>,
    },
    Export {
        #[arg(long, default_value = "json")]
        format: String,
        #[command(flatten)]
        filters: Filters,
        #[arg(long, default_value_t = models::DEFAULT_QUERY_LIMIT)]
        limit: usize,
        /// File name without extension
        #[arg(long)]
        filename: Option<String>,
        #[arg(long)]
        no_raw: bool,
        #[arg(long)]
        no_aggregations: bool,
    },
    Cleanup {
        /// Retention window; defaults to auto_cleanup_days
        #[arg(long)]
        days: Option<u32>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    Pricing {
        #[command(subcommand)]
        action: PricingAction,
    },
    Tui {
        /// Refresh interval in seconds
        #[arg(long, default_value_t = 5)]
        tick: u64,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Show,
    Set {
        /// A number, or "none" to clear
        #[arg(long)]
        token_quota: Option<String>,
        #[arg(long)]
        cost_quota: Option<String>,
        #[arg(long)]
        request_quota: Option<String>,
        #[arg(long)]
        billing_period: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        auto_cleanup_days: Option<u32>,
    },
}

#[derive(Debug, Subcommand)]
enum PricingAction {
    Show,
    Set {
        model: String,
        #[arg(long)]
        input: f64,
        #[arg(long)]
        output: f64,
        #[arg(long, default_value_t = 0.0)]
        cache_creation: f64,
        #[arg(long, default_value_t = 0.0)]
        cache_read: f64,
    },
}

fn parse_timestamp(flag: &str, raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| {
            AppError::InvalidInput(format!(
                "--{flag} must be an RFC 3339 timestamp, got '{raw}'."
            ))
        })
}

fn parse_quota<T: FromStr>(flag: &str, raw: Option<&str>) -> Result<QuotaUpdate<T>, AppError> {
    match raw.map(str::trim) {
        None => Ok(QuotaUpdate::Keep),
        Some(v) if v.eq_ignore_ascii_case("none") => Ok(QuotaUpdate::Clear),
        Some(v) => v.parse().map(QuotaUpdate::Set).map_err(|_| {
            AppError::InvalidInput(format!("--{flag} must be a number or 'none', got '{v}'."))
        }),
    }
}

fn parse_metadata(raw: Option<&str>) -> Result<Map<String, Value>, AppError> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(AppError::InvalidInput(
                "--metadata must be a JSON object.".into(),
            )),
        },
    }
}

impl Filters {
    fn into_query(self, offset: usize, limit: usize) -> Result<UsageQuery, AppError> {
        Ok(UsageQuery {
            start_date: self
                .since
                .as_deref()
                .map(|s| parse_timestamp("since", s))
                .transpose()?,
            end_date: self
                .until
                .as_deref()
                .map(|s| parse_timestamp("until", s))
                .transpose()?,
            instance_id: self.instance,
            session_id: self.session,
            model: self.model,
            offset,
            limit,
        })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into())
}

/// CLI output goes to stdout, so logs go to stderr.
fn init_cli_logging() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// The dashboard owns the terminal; log to `<logs>/ccdash.log` instead.
fn init_tui_logging(paths: &AppPaths) -> Result<(), AppError> {
    std::fs::create_dir_all(&paths.logs_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.logs_dir.join("ccdash.log"))?;
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    let paths = AppPaths::resolve()?;

    if let Commands::Tui { tick } = cli.command {
        init_tui_logging(&paths)?;
        let tracker = Arc::new(UsageTracker::open(&paths)?);
        return run_tui(tracker, Duration::from_secs(tick.max(1))).await;
    }

    init_cli_logging();
    let tracker = UsageTracker::open(&paths)?;

    match cli.command {
        Commands::Init => {
            println!(
                "Initialized ccdash config at {} and usage log at {}.",
                paths.config_file.display(),
                paths.usage_log.display()
            );
        }
        Commands::Track {
            instance,
            model,
            input,
            output,
            cache_creation,
            cache_read,
            session,
            message,
            model_version,
            turns,
            context_window,
            user_agent,
            metadata,
        } => {
            let request = TrackRequest {
                session_id: session,
                message_id: message,
                model_version,
                conversation_turns: turns,
                context_window_size: context_window,
                user_agent,
                metadata: parse_metadata(metadata.as_deref())?,
                ..TrackRequest::new(
                    instance,
                    model,
                    TokenCounts::new(input, output).with_cache(cache_creation, cache_read),
                )
            };
            print_json(&tracker.track(request)?)?;
        }
        Commands::Entries {
            filters,
            offset,
            limit,
        } => {
            let q = filters.into_query(offset, limit)?;
            print_json(&tracker.query(&q)?)?;
        }
        Commands::Aggregate { filters } => {
            let q = filters.into_query(0, aggregate::MAX_AGGREGATION_ENTRIES)?;
            print_json(&tracker.aggregate(&q)?)?;
        }
        Commands::Stats => print_json(&tracker.current_stats()?)?,
        Commands::Timeline {
            days,
            instance,
            group_by,
        } => {
            let group_by = GroupBy::from_str(&group_by)?;
            print_json(&tracker.timeline(days, instance, group_by)?)?;
        }
        Commands::Models { days, instance } => {
            print_json(&tracker.model_breakdown(days, instance)?)?;
        }
        Commands::Export {
            format,
            filters,
            limit,
            filename,
            no_raw,
            no_aggregations,
        } => {
            let format = ExportFormat::from_str(&format)?;
            let mut request = ExportRequest::new(format, filters.into_query(0, limit)?);
            request.filename = filename;
            request.include_raw_data = !no_raw;
            request.include_aggregations = !no_aggregations;
            let outcome = tracker.export(&request)?;
            println!(
                "Exported {} entries to {}",
                outcome.entries,
                outcome.path.display()
            );
        }
        Commands::Cleanup { days } => print_json(&tracker.cleanup(days)?)?,
        Commands::Config { action } => match action {
            ConfigAction::Show => print_json(&tracker.config())?,
            ConfigAction::Set {
                token_quota,
                cost_quota,
                request_quota,
                billing_period,
                timezone,
                auto_cleanup_days,
            } => {
                let patch = ConfigPatch {
                    token_quota: parse_quota("token-quota", token_quota.as_deref())?,
                    cost_quota: parse_quota("cost-quota", cost_quota.as_deref())?,
                    request_quota: parse_quota("request-quota", request_quota.as_deref())?,
                    billing_period: billing_period
                        .as_deref()
                        .map(BillingPeriod::from_str)
                        .transpose()?,
                    timezone,
                    auto_cleanup_days,
                    pricing: None,
                };
                if patch.is_empty() {
                    return Err(AppError::Config(
                        "Nothing to update. Pass at least one setting.".into(),
                    ));
                }
                print_json(&tracker.update_config(&patch)?)?;
            }
        },
        Commands::Pricing { action } => match action {
            PricingAction::Show => print_json(&tracker.pricing())?,
            PricingAction::Set {
                model,
                input,
                output,
                cache_creation,
                cache_read,
            } => {
                let mut table = tracker.pricing();
                table.insert(
                    config::normalize_model_name(&model),
                    ModelPricing {
                        input_price_per_1k: input,
                        output_price_per_1k: output,
                        cache_creation_price_per_1k: cache_creation,
                        cache_read_price_per_1k: cache_read,
                    },
                );
                print_json(&tracker.update_pricing(table)?)?;
            }
        },
        Commands::Tui { .. } => {}
    }

    Ok(())
}
