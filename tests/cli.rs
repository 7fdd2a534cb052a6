use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn home_path(home: &TempDir) -> &Path {
    home.path()
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_ccdash")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .env("CCDASH_HOME", home_path(home))
        .env_remove("RUST_LOG")
        .output()
        .expect("run ccdash command")
}

fn config_path(home: &TempDir) -> PathBuf {
    home.path().join("config").join("usage_config.toml")
}

fn exports_dir(home: &TempDir) -> PathBuf {
    home.path().join("data").join("exports")
}

fn json_stdout(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid json output")
}

fn track(home: &TempDir, instance: &str, model: &str, input: &str, output: &str) -> Value {
    json_stdout(&run_cmd(
        home,
        &[
            "track", instance, model, "--input", input, "--output", output,
        ],
    ))
}

#[test]
fn init_creates_config_and_data_paths() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(config_path(&home).exists());
    assert!(home.path().join("data").exists());
    assert!(exports_dir(&home).exists());
    assert!(home.path().join("logs").exists());
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("temp home");

    assert!(run_cmd(&home, &["init"]).status.success());
    let first = fs::read_to_string(config_path(&home)).expect("read config after first init");

    assert!(run_cmd(&home, &["init"]).status.success());
    let second = fs::read_to_string(config_path(&home)).expect("read config after second init");

    assert_eq!(first, second);
}

#[test]
fn track_prices_entry_and_entries_lists_it() {
    let home = TempDir::new().expect("temp home");
    let entry = track(&home, "inst-1", "Claude-3-Sonnet", "1000", "500");

    assert_eq!(entry["model"], "claude-3-sonnet");
    assert_eq!(entry["input_cost"], 0.003);
    assert_eq!(entry["output_cost"], 0.0075);
    assert_eq!(entry["total_cost"], 0.0105);

    let listed = json_stdout(&run_cmd(&home, &["entries", "--instance", "inst-1"]));
    let arr = listed.as_array().expect("json array");
    assert_eq!(arr.len(), 1);
    assert_eq!(arr[0]["id"], entry["id"]);

    let other = json_stdout(&run_cmd(&home, &["entries", "--instance", "nobody"]));
    assert_eq!(other.as_array().map(Vec::len), Some(0));
}

#[test]
fn track_rejects_blank_instance() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(
        &home,
        &["track", "  ", "claude-3-haiku", "--input", "1", "--output", "1"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("instance_id must not be empty"));
}

#[test]
fn stats_reflect_tracked_usage() {
    let home = TempDir::new().expect("temp home");
    track(&home, "inst-1", "claude-3-haiku", "1000", "500");
    track(&home, "inst-2", "claude-3-haiku", "1000", "500");

    let stats = json_stdout(&run_cmd(&home, &["stats"]));
    assert_eq!(stats["current_requests"], 2);
    assert_eq!(stats["current_tokens"], 3000);
    assert_eq!(stats["cost_quota"], 100.0);
    assert_eq!(stats["trend_direction"], "stable");
}

#[test]
fn export_csv_writes_header_and_escaped_fields() {
    let home = TempDir::new().expect("temp home");
    json_stdout(&run_cmd(
        &home,
        &[
            "track",
            "team,alpha",
            "claude-3-haiku",
            "--input",
            "10",
            "--output",
            "20",
        ],
    ));

    let output = run_cmd(
        &home,
        &["export", "--format", "csv", "--filename", "usage"],
    );
    assert!(output.status.success());

    let raw = fs::read_to_string(exports_dir(&home).join("usage.csv")).expect("read csv");
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("id,instance_id,"));
    assert!(lines[1].contains(",\"team,alpha\","));
}

#[test]
fn export_json_nests_entries_and_aggregation() {
    let home = TempDir::new().expect("temp home");
    track(&home, "inst-1", "claude-3-opus", "100", "100");

    let output = run_cmd(
        &home,
        &["export", "--format", "json", "--filename", "report"],
    );
    assert!(output.status.success());

    let raw = fs::read_to_string(exports_dir(&home).join("report.json")).expect("read json");
    let parsed: Value = serde_json::from_str(&raw).expect("valid json export");
    assert_eq!(parsed["export_info"]["total_entries"], 1);
    assert_eq!(parsed["usage_entries"][0]["model"], "claude-3-opus");
    assert_eq!(parsed["aggregation"]["total_requests"], 1);
}

#[test]
fn export_rejects_unknown_format() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["export", "--format", "xml"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported export format. Use json or csv"));
}

#[test]
fn config_set_persists_and_validates() {
    let home = TempDir::new().expect("temp home");

    let updated = json_stdout(&run_cmd(
        &home,
        &[
            "config",
            "set",
            "--cost-quota",
            "none",
            "--token-quota",
            "500000",
            "--billing-period",
            "weekly",
        ],
    ));
    assert_eq!(updated["cost_quota"], Value::Null);
    assert_eq!(updated["token_quota"], 500000);
    assert_eq!(updated["billing_period"], "weekly");

    let raw = fs::read_to_string(config_path(&home)).expect("read config");
    assert!(raw.contains("billing_period = \"weekly\""));

    let bad = run_cmd(&home, &["config", "set", "--auto-cleanup-days", "0"]);
    assert!(!bad.status.success());
    let after = fs::read_to_string(config_path(&home)).expect("read config");
    assert_eq!(raw, after);
}

#[test]
fn pricing_set_applies_to_new_entries_only() {
    let home = TempDir::new().expect("temp home");
    let before = track(&home, "inst-1", "claude-3-haiku", "1000", "0");

    let table = json_stdout(&run_cmd(
        &home,
        &[
            "pricing",
            "set",
            "claude-3-haiku",
            "--input",
            "1.0",
            "--output",
            "1.0",
        ],
    ));
    assert_eq!(table["claude-3-haiku"]["input_price_per_1k"], 1.0);

    let after = track(&home, "inst-1", "claude-3-haiku", "1000", "0");
    assert_eq!(after["total_cost"], 1.0);

    let listed = json_stdout(&run_cmd(&home, &["entries"]));
    let old = listed
        .as_array()
        .expect("json array")
        .iter()
        .find(|e| e["id"] == before["id"])
        .expect("old entry present");
    assert_eq!(old["total_cost"], before["total_cost"]);
}

#[test]
fn cleanup_reports_counts() {
    let home = TempDir::new().expect("temp home");
    track(&home, "inst-1", "claude-3-haiku", "10", "10");

    let report = json_stdout(&run_cmd(&home, &["cleanup", "--days", "30"]));
    assert_eq!(report["kept"], 1);
    assert_eq!(report["removed"], 0);
}
