//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use colored::{ColoredString, Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use sensor_cadence::control::rate::RateLevel;
use sensor_cadence::control::state::NodeControlState;
use sensor_cadence::core::config::Config;
use sensor_cadence::core::errors::CadenceError;
use sensor_cadence::forecast::cache::{
    FileForecastCache, ForecastCacheReader, ForecastSource,
};
use sensor_cadence::forecast::interpolate::forecast_for;
use sensor_cadence::forecast::snapshot::ForecastSnapshot;
use sensor_cadence::logger::DecisionLog;
use sensor_cadence::logger::jsonl::{EventType, LogEntry, Severity};
use sensor_cadence::pipeline::ingest::{DeviceReport, IngestGateway};
use sensor_cadence::pipeline::orchestrator::MeasurementProcessor;
use sensor_cadence::store::ControlStateStore;
use sensor_cadence::store::sqlite::SqliteControlStore;

/// Adaptive reporting-rate controller for field temperature sensors.
#[derive(Debug, Parser)]
#[command(
    name = "cadence",
    author,
    version,
    about = "Sensor Cadence - adaptive reporting-rate controller",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one device report through the pipeline.
    Process(ProcessArgs),
    /// Show stored control state for one node or all nodes.
    State(StateArgs),
    /// Show recent processed measurements and scores for a node.
    History(HistoryArgs),
    /// Manage the forecast cache file.
    Forecast(ForecastArgs),
    /// View configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
#[command(group(
    ArgGroup::new("input")
        .required(true)
        .args(["report", "node"])
))]
struct ProcessArgs {
    /// JSON device report file (`-` reads stdin).
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Node id (inline report).
    #[arg(long, requires = "temperature")]
    node: Option<String>,
    /// Observed temperature in °C (inline report).
    #[arg(long, allow_hyphen_values = true)]
    temperature: Option<f64>,
    /// Relative humidity in percent (inline report).
    #[arg(long)]
    humidity: Option<f64>,
    /// Battery voltage (inline report).
    #[arg(long)]
    battery: Option<f64>,
    /// Reading time, RFC 3339 (inline report; defaults to now).
    #[arg(long, value_name = "TIMESTAMP")]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Args)]
struct StateArgs {
    /// Node id; omit to list all nodes.
    node: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct HistoryArgs {
    /// Node id.
    node: String,
    /// Maximum rows per table.
    #[arg(long, default_value_t = 20, value_name = "N")]
    limit: u32,
}

#[derive(Debug, Clone, Args)]
struct ForecastArgs {
    #[command(subcommand)]
    command: ForecastCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ForecastCommand {
    /// Merge a provider snapshot (JSON) into the forecast cache.
    Import {
        /// Snapshot file (`-` reads stdin).
        file: PathBuf,
        /// Overwrite the cache instead of merging timelines.
        #[arg(long)]
        replace: bool,
    },
    /// Show the cached snapshot and, optionally, the estimate for a timestamp.
    Show {
        /// Timestamp to estimate, RFC 3339.
        #[arg(long, value_name = "TIMESTAMP")]
        at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Print the config file path.
    Path,
    /// Validate the configuration and print its hash.
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<CadenceError> for CliError {
    fn from(err: CadenceError) -> Self {
        match err {
            CadenceError::InvalidConfig { .. }
            | CadenceError::MissingConfig { .. }
            | CadenceError::ConfigParse { .. }
            | CadenceError::Validation { .. }
            | CadenceError::ForecastData { .. } => Self::User(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Process(args) => run_process(cli, args),
        Command::State(args) => run_state(cli, args),
        Command::History(args) => run_history(cli, args),
        Command::Forecast(args) => run_forecast(cli, args),
        Command::Config(args) => run_config(cli, args),
    }
}

// ──────────────────── wiring ────────────────────

fn open_log(config: &Config) -> Option<Arc<DecisionLog>> {
    config
        .logging
        .enabled
        .then(|| Arc::new(DecisionLog::open(config.jsonl_config())))
}

fn open_store(config: &Config) -> Result<Arc<SqliteControlStore>, CliError> {
    Ok(Arc::new(SqliteControlStore::open(
        &config.paths.sqlite_db,
        config.store.busy_timeout(),
    )?))
}

fn read_input(path: &Path) -> Result<String, CliError> {
    if path == Path::new("-") {
        let mut raw = String::new();
        io::stdin().read_to_string(&mut raw)?;
        return Ok(raw);
    }
    fs::read_to_string(path).map_err(|e| CliError::User(format!("read {}: {e}", path.display())))
}

// ──────────────────── process ────────────────────

fn run_process(cli: &Cli, args: &ProcessArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let report = match (&args.report, &args.node) {
        (Some(path), _) => serde_json::from_str::<DeviceReport>(&read_input(path)?)
            .map_err(|e| CliError::User(format!("invalid device report: {e}")))?,
        (None, Some(node)) => DeviceReport {
            device_id: node.clone(),
            temperature: args.temperature,
            humidity: args.humidity,
            battery_v: args.battery,
            recorded_at: args.at,
        },
        (None, None) => return Err(CliError::User("either --report or --node is required".into())),
    };

    let log = open_log(&config);
    let store = open_store(&config)?;
    let cache: Arc<dyn ForecastSource> =
        Arc::new(FileForecastCache::new(config.paths.forecast_cache.clone()));
    let reader = ForecastCacheReader::new(cache, config.forecast.freshness_policy());
    let mut processor = MeasurementProcessor::new(&config, reader, store);
    let mut gateway_log = None;
    if let Some(log) = &log {
        processor = processor.with_log(Arc::clone(log));
        gateway_log = Some(Arc::clone(log));
    }
    let mut gateway = IngestGateway::new(&config, Arc::new(processor))?;
    if let Some(log) = gateway_log {
        gateway = gateway.with_log(log);
    }

    let directive = gateway.handle(&report)?;

    match output_mode(cli) {
        OutputMode::Human => {
            let rate = directive
                .target_rate
                .map_or_else(|| "none".dimmed(), rate_label);
            println!(
                "{} → {} (next report in {}s)",
                directive.node_id.bold(),
                rate,
                directive.interval_secs
            );
            if let (Some(mode), Some(reason)) = (directive.mode, directive.reason) {
                println!("  mode: {mode}  reason: {reason}");
            }
            if let Some(result) = &directive.result {
                println!("  s_err: {:.4}  m_ewma: {:.4}", result.state.s_err, result.state.m_ewma);
                if let Some(f) = &result.forecast {
                    println!("  forecast: {:.2}°C ({})", f.forecast_c, f.match_quality);
                }
            }
            for warning in &directive.warnings {
                println!("  {} {warning}", "warning:".yellow());
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "process",
                "directive": serde_json::to_value(&directive)?,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── state / history ────────────────────

fn run_state(cli: &Cli, args: &StateArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let store = open_store(&config)?;
    let states = match &args.node {
        Some(node) => {
            let state = store
                .load(node)?
                .ok_or_else(|| CliError::User(format!("no control state for node {node}")))?;
            vec![state]
        }
        None => store.list_states()?,
    };

    match output_mode(cli) {
        OutputMode::Human => {
            if states.is_empty() {
                println!("No nodes recorded yet.");
            }
            for s in &states {
                print_state_human(s);
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "state",
                "nodes": serde_json::to_value(&states)?,
            }))?;
        }
    }
    Ok(())
}

fn print_state_human(s: &NodeControlState) {
    let previous = s
        .previous_rate
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    println!(
        "{:<20} {:<8} prev={:<6} s_err={:.4} m_ewma={:.3} σ={:.3} n={:<3} {} / {}  {}",
        s.node_id.bold(),
        rate_label(s.target_rate),
        previous,
        s.s_err,
        s.m_ewma,
        s.sigma_day,
        s.samples.len(),
        s.mode,
        s.reason,
        s.last_updated_at.to_rfc3339(),
    );
}

fn run_history(cli: &Cli, args: &HistoryArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let store = open_store(&config)?;
    let measurements = store.recent_measurements(&args.node, args.limit)?;
    let scores = store.recent_scores(&args.node, args.limit)?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{} measurements for {}", measurements.len(), args.node.bold());
            for m in &measurements {
                println!(
                    "  {}  observed={:.2} forecast={:.2} |err|={:.2} {} {}",
                    m.measured_at.to_rfc3339(),
                    m.observed_c,
                    m.forecast_c,
                    m.abs_error,
                    m.match_quality,
                    rate_label(m.target_rate),
                );
            }
            println!("{} scores", scores.len());
            for s in &scores {
                println!(
                    "  {}  s_err={:.4} r={:.4} {} ({})",
                    s.recorded_at.to_rfc3339(),
                    s.s_err,
                    s.r,
                    rate_label(s.target_rate),
                    s.reason,
                );
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "history",
                "node": args.node,
                "measurements": serde_json::to_value(&measurements)?,
                "scores": serde_json::to_value(&scores)?,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── forecast ────────────────────

fn run_forecast(cli: &Cli, args: &ForecastArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let cache = FileForecastCache::new(config.paths.forecast_cache.clone());

    match &args.command {
        ForecastCommand::Import { file, replace } => {
            let incoming: ForecastSnapshot = serde_json::from_str(&read_input(file)?)
                .map_err(|e| CliError::User(format!("invalid forecast snapshot: {e}")))?;
            let stored = if *replace {
                cache.store(&incoming)?;
                incoming
            } else {
                cache.merge_and_store(&incoming)?
            };

            if let Some(log) = open_log(&config) {
                let mut entry = LogEntry::new(EventType::ForecastImported, Severity::Info);
                entry.forecast_c = stored.forecast_c;
                entry.details = Some(format!(
                    "provider={} points={} replace={replace}",
                    stored.provider,
                    stored.full_forecast.len()
                ));
                log.record(&entry);
            }

            match output_mode(cli) {
                OutputMode::Human => println!(
                    "Imported forecast into {} ({} timeline points)",
                    cache.path().display(),
                    stored.full_forecast.len()
                ),
                OutputMode::Json => write_json_line(&json!({
                    "command": "forecast import",
                    "path": cache.path().to_string_lossy(),
                    "points": stored.full_forecast.len(),
                    "replaced": replace,
                }))?,
            }
            Ok(())
        }
        ForecastCommand::Show { at } => {
            let policy = config.forecast.freshness_policy();
            let now = Utc::now();
            let snapshot = cache.latest_snapshot()?;
            let freshness = snapshot
                .as_ref()
                .map(|s| policy.classify(s.fetched_at, now));
            let estimate = match (&snapshot, at) {
                (Some(s), Some(at)) => forecast_for(s, *at),
                _ => None,
            };

            match output_mode(cli) {
                OutputMode::Human => match &snapshot {
                    None => println!("No forecast cached at {}", cache.path().display()),
                    Some(s) => {
                        println!("provider:   {}", s.provider);
                        println!(
                            "fetched at: {}",
                            s.fetched_at.map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339())
                        );
                        if let Some(f) = freshness {
                            println!("freshness:  {f}");
                        }
                        println!(
                            "point:      {}",
                            s.forecast_c
                                .map_or_else(|| "none".to_string(), |c| format!("{c:.2}°C"))
                        );
                        println!("timeline:   {} points", s.full_forecast.len());
                        if let Some(e) = estimate {
                            println!("estimate:   {:.2}°C ({})", e.forecast_c, e.match_quality);
                        }
                    }
                },
                OutputMode::Json => write_json_line(&json!({
                    "command": "forecast show",
                    "snapshot": serde_json::to_value(&snapshot)?,
                    "freshness": serde_json::to_value(freshness)?,
                    "estimate": serde_json::to_value(estimate)?,
                }))?,
            }
            Ok(())
        }
    }
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Path => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config path",
                    "path": path.to_string_lossy(),
                    "exists": exists,
                }))?,
            }
            Ok(())
        }
        ConfigCommand::Show => {
            let config = Config::load(cli.config.as_deref())?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config show",
                    "config": serde_json::to_value(&config)?,
                }))?,
            }
            Ok(())
        }
        ConfigCommand::Validate => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                    }))?,
                }
                Ok(())
            }
            Err(e) => {
                if output_mode(cli) == OutputMode::Json {
                    write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "error": e.to_string(),
                    }))?;
                } else {
                    eprintln!("Configuration is INVALID: {e}");
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn rate_label(rate: RateLevel) -> ColoredString {
    match rate {
        RateLevel::High => rate.as_str().red().bold(),
        RateLevel::Medium => rate.as_str().yellow(),
        RateLevel::Low => rate.as_str().green(),
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CADENCE_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
