#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use sensor_cadence::core::config::Config;
use sensor_cadence::forecast::cache::{ForecastCacheReader, ForecastSource, MemoryForecastSource};
use sensor_cadence::forecast::snapshot::{ForecastPoint, ForecastSnapshot};
use sensor_cadence::pipeline::ingest::Measurement;
use sensor_cadence::pipeline::orchestrator::MeasurementProcessor;
use sensor_cadence::store::ControlStateStore;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_cadence") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "cadence.exe" } else { "cadence" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve cadence binary path for integration test"),
    }
}

/// Run the binary, keeping a transcript under the temp dir for post-mortems.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_stdin(case_name, args, None)
}

pub fn run_cli_case_with_stdin(case_name: &str, args: &[&str], stdin: Option<&str>) -> CmdResult {
    use std::io::Write;
    use std::process::Stdio;

    let root = std::env::temp_dir().join("cadence-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut child = Command::new(&bin_path)
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env_remove("CADENCE_OUTPUT_FORMAT")
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("execute cadence command");
    if let Some(input) = stdin {
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(input.as_bytes())
            .expect("write stdin");
    }
    let output = child.wait_with_output().expect("wait for cadence command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Write a config file that keeps every path inside `dir`.
pub fn write_isolated_config(dir: &Path) -> PathBuf {
    let path = dir.join("cadence.toml");
    let body = format!(
        "[logging]\nenabled = true\nfallback_path = {:?}\n\n[paths]\nsqlite_db = {:?}\nforecast_cache = {:?}\njsonl_log = {:?}\n",
        dir.join("fallback.jsonl"),
        dir.join("control.db"),
        dir.join("forecast.json"),
        dir.join("decisions.jsonl"),
    );
    fs::write(&path, body).expect("write isolated config");
    path
}

pub fn at(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid RFC 3339 timestamp")
}

/// Fresh snapshot with an hourly timeline around 2026-03-01 06:00–09:00.
pub fn snapshot(point_c: f64) -> ForecastSnapshot {
    ForecastSnapshot {
        forecast_c: Some(point_c),
        forecast_time: Some(at("2026-03-01T06:00:00Z")),
        fetched_at: Some(Utc::now()),
        provider: "fixture".to_string(),
        full_forecast: vec![
            ForecastPoint::new(at("2026-03-01T06:00:00Z"), 15.0),
            ForecastPoint::new(at("2026-03-01T09:00:00Z"), 21.0),
        ],
    }
}

pub fn measurement(node: &str, observed_c: f64, ts: &str) -> Measurement {
    Measurement {
        node_id: node.to_string(),
        observed_c,
        battery_v: Some(3.9),
        humidity: Some(45.0),
        timestamp: at(ts),
    }
}

pub fn processor_with_source(
    source: Arc<dyn ForecastSource>,
    store: Arc<dyn ControlStateStore>,
    config: &Config,
) -> MeasurementProcessor {
    let reader = ForecastCacheReader::new(source, config.forecast.freshness_policy());
    MeasurementProcessor::new(config, reader, store)
}

pub fn processor(
    snapshot: Option<ForecastSnapshot>,
    store: Arc<dyn ControlStateStore>,
) -> MeasurementProcessor {
    processor_with_source(
        Arc::new(MemoryForecastSource::new(snapshot)),
        store,
        &Config::default(),
    )
}
