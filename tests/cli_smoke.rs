//! CLI smoke tests against the built `cadence` binary with an isolated config.

mod common;

use std::fs;

use serde_json::Value;

use common::{run_cli_case, run_cli_case_with_stdin, snapshot, write_isolated_config};

fn json_line(stdout: &str) -> Value {
    let line = stdout.lines().last().expect("at least one stdout line");
    serde_json::from_str(line).expect("stdout is a JSON line")
}

#[test]
fn help_command_prints_usage() {
    let result = run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "log: {}",
        result.log_path.display()
    );
    assert!(result.stdout.contains("Usage:"));
    assert!(result.stdout.contains("process"));
    assert!(result.stdout.contains("forecast"));
}

#[test]
fn config_show_emits_json() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_isolated_config(dir.path());
    let cfg = cfg.to_str().unwrap();

    let result = run_cli_case("config_show_emits_json", &["--json", "--config", cfg, "config", "show"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["command"], "config show");
    assert_eq!(payload["config"]["intervals"]["high_secs"], 60);
}

#[test]
fn missing_explicit_config_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let result = run_cli_case(
        "missing_explicit_config_is_a_user_error",
        &["--config", missing.to_str().unwrap(), "config", "show"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("CAD-1002"));
}

#[test]
fn import_process_and_inspect_round() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_isolated_config(dir.path());
    let cfg = cfg.to_str().unwrap();
    let snap_path = dir.path().join("snapshot.json");
    fs::write(&snap_path, serde_json::to_string(&snapshot(15.0)).unwrap()).unwrap();

    let import = run_cli_case(
        "import",
        &["--json", "--config", cfg, "forecast", "import", snap_path.to_str().unwrap()],
    );
    assert!(import.status.success(), "log: {}", import.log_path.display());
    assert_eq!(json_line(&import.stdout)["points"], 2);

    let report = r#"{"deviceId":"ESP32-007","temperature":18.0,"humidity":40,"batteryV":3.8,"recordedAt":"2026-03-01T07:30:00Z"}"#;
    let process = run_cli_case_with_stdin(
        "process",
        &["--json", "--config", cfg, "process", "--report", "-"],
        Some(report),
    );
    assert!(process.status.success(), "log: {}", process.log_path.display());
    let directive = &json_line(&process.stdout)["directive"];
    assert_eq!(directive["nodeId"], "ESP32-007");
    assert_eq!(directive["targetRate"], "LOW");
    assert_eq!(directive["intervalSecs"], 900);
    assert_eq!(directive["mode"], "ACTIVE");

    let state = run_cli_case("state", &["--json", "--config", cfg, "state", "ESP32-007"]);
    assert!(state.status.success(), "log: {}", state.log_path.display());
    let nodes = json_line(&state.stdout)["nodes"].clone();
    assert_eq!(nodes.as_array().map(Vec::len), Some(1));
    assert_eq!(nodes[0]["reason"], "baseline-threshold");

    let history = run_cli_case("history", &["--json", "--config", cfg, "history", "ESP32-007"]);
    assert!(history.status.success(), "log: {}", history.log_path.display());
    let payload = json_line(&history.stdout);
    assert_eq!(payload["measurements"].as_array().map(Vec::len), Some(1));
    assert_eq!(payload["scores"].as_array().map(Vec::len), Some(1));

    let log = fs::read_to_string(dir.path().join("decisions.jsonl")).unwrap();
    let events: Vec<Value> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["event"].as_str()).collect();
    assert_eq!(kinds, ["forecast_imported", "measurement_processed"]);
}

#[test]
fn invalid_report_exits_with_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_isolated_config(dir.path());
    let result = run_cli_case(
        "invalid_report_exits_with_user_error",
        &[
            "--config",
            cfg.to_str().unwrap(),
            "process",
            "--node",
            "bad id!",
            "--temperature",
            "20",
        ],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("CAD-2001"));
}

#[test]
fn unknown_node_state_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_isolated_config(dir.path());
    let result = run_cli_case(
        "unknown_node_state_is_a_user_error",
        &["--config", cfg.to_str().unwrap(), "state", "ghost"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
}
