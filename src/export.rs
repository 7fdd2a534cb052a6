use crate::error::AppError;
use crate::models::{ExportFormat, ExportRequest, UsageAggregation, UsageEntry};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

pub const DEFAULT_EXPORT_PREFIX: &str = "claude_usage_export";

/// Export files older than this are removed by `prune_exports`.
pub const EXPORT_TTL: Duration = Duration::from_secs(3600);

pub fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => csv_field(s),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => csv_field(&value.to_string()),
    }
}

fn validate_file_stem(stem: &str) -> Result<(), AppError> {
    let as_path = Path::new(stem);
    let plain = as_path.file_name().and_then(|n| n.to_str()) == Some(stem);
    if stem.is_empty() || !plain || stem == ".." {
        return Err(AppError::InvalidInput(format!(
            "Export filename '{stem}' must be a plain file name."
        )));
    }
    Ok(())
}

/// Picks the output path. Caller-supplied names are used verbatim; generated
/// names get a numeric suffix instead of replacing an existing file.
fn target_path(dir: &Path, request: &ExportRequest, now: DateTime<Utc>) -> Result<PathBuf, AppError> {
    let ext = request.format.extension();

    if let Some(stem) = &request.filename {
        validate_file_stem(stem)?;
        return Ok(dir.join(format!("{stem}.{ext}")));
    }

    let stem = format!("{DEFAULT_EXPORT_PREFIX}_{}", now.format("%Y%m%d_%H%M%S"));
    let mut candidate = dir.join(format!("{stem}.{ext}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{n}.{ext}"));
        n += 1;
    }
    Ok(candidate)
}

/// Writes `entries` (and `aggregation`, for JSON) to a new file under `dir`.
pub fn write_export(
    dir: &Path,
    request: &ExportRequest,
    entries: &[UsageEntry],
    aggregation: Option<&UsageAggregation>,
    now: DateTime<Utc>,
) -> Result<PathBuf, AppError> {
    fs::create_dir_all(dir)?;
    let path = target_path(dir, request, now)?;
    let mut out = BufWriter::new(File::create(&path)?);

    match request.format {
        ExportFormat::Json => write_json(&mut out, request, entries, aggregation, now)?,
        ExportFormat::Csv => write_csv(&mut out, entries)?,
    }
    out.flush()?;

    info!(path = %path.display(), entries = entries.len(), "usage export written");
    Ok(path)
}

fn write_json<W: Write>(
    out: &mut W,
    request: &ExportRequest,
    entries: &[UsageEntry],
    aggregation: Option<&UsageAggregation>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let mut doc = json!({
        "export_info": {
            "timestamp": now.to_rfc3339(),
            "query": request.query,
            "total_entries": entries.len(),
        }
    });

    if request.include_raw_data {
        doc["usage_entries"] = serde_json::to_value(entries)?;
    }
    if let Some(agg) = aggregation.filter(|_| request.include_aggregations) {
        doc["aggregation"] = serde_json::to_value(agg)?;
    }

    serde_json::to_writer_pretty(&mut *out, &doc)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// One row per entry, header taken from the first entry's field names.
/// An empty entry set leaves the file empty.
fn write_csv<W: Write>(out: &mut W, entries: &[UsageEntry]) -> Result<(), AppError> {
    let Some(first) = entries.first() else {
        return Ok(());
    };

    let header: Vec<String> = match serde_json::to_value(first)? {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    };
    writeln!(
        out,
        "{}",
        header
            .iter()
            .map(|h| csv_field(h))
            .collect::<Vec<_>>()
            .join(",")
    )?;

    for entry in entries {
        let row = serde_json::to_value(entry)?;
        let cells = header
            .iter()
            .map(|key| row.get(key).map(csv_cell).unwrap_or_default())
            .collect::<Vec<_>>();
        writeln!(out, "{}", cells.join(","))?;
    }
    Ok(())
}

/// Deletes regular files in `dir` last modified more than `max_age` before
/// `now`. Returns how many were removed.
pub fn prune_exports(dir: &Path, max_age: Duration, now: SystemTime) -> Result<usize, AppError> {
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for item in listing {
        let item = item?;
        let meta = item.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let age = now
            .duration_since(meta.modified()?)
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            fs::remove_file(item.path())?;
            debug!(path = %item.path().display(), "removed stale export");
            removed += 1;
        }
    }
    Ok(removed)
}
