//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::control::discrepancy::{AnalyzerParams, DEFAULT_ALPHA, DEFAULT_SAMPLE_LIMIT, SIGMA_FLOOR};
use crate::control::rate::{RateLevel, RateThresholds};
use crate::core::errors::{CadenceError, Result};
use crate::forecast::cache::FreshnessPolicy;
use crate::logger::jsonl::JsonlConfig;

/// Full cadence configuration model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub control: ControlConfig,
    pub forecast: ForecastConfig,
    pub store: StoreConfig,
    pub intervals: IntervalConfig,
    pub ingest: IngestConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// Analyzer and rate-controller knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// EWMA smoothing factor for the absolute error.
    pub alpha: f64,
    /// Observation window length.
    pub sample_limit: usize,
    /// Spread used for empty or constant windows, and the normalization lower bound.
    pub sigma_floor: f64,
    /// Lowest rate any decision may produce.
    pub safety_floor: RateLevel,
    pub thresholds: RateThresholds,
}

/// Forecast cache read behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForecastConfig {
    /// A cache read slower than this counts as "no forecast".
    pub read_timeout_ms: u64,
    /// Long-lived threads serving cache reads; a hung read occupies one of them.
    pub reader_threads: usize,
    pub fresh_minutes: u64,
    pub acceptable_minutes: u64,
    pub stale_minutes: u64,
}

/// Persistence tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a write waits on a competing SQLite lock.
    pub busy_timeout_ms: u64,
}

/// Rate level → next-report interval, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntervalConfig {
    pub high_secs: u64,
    pub medium_secs: u64,
    pub low_secs: u64,
    /// Used when no decision could be made.
    pub default_secs: u64,
}

/// Device report validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub node_id_pattern: String,
    /// Readings outside this band are accepted with a warning.
    pub plausible_min_c: f64,
    pub plausible_max_c: f64,
}

/// Decision log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

/// Filesystem paths used by cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
    pub forecast_cache: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            sigma_floor: SIGMA_FLOOR,
            safety_floor: RateLevel::Low,
            thresholds: RateThresholds::default(),
        }
    }
}

impl ControlConfig {
    #[must_use]
    pub fn analyzer_params(&self) -> AnalyzerParams {
        AnalyzerParams {
            alpha: self.alpha,
            sample_limit: self.sample_limit,
            sigma_floor: self.sigma_floor,
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        let policy = FreshnessPolicy::default();
        Self {
            read_timeout_ms: 2_000,
            reader_threads: 2,
            fresh_minutes: policy.fresh_minutes,
            acceptable_minutes: policy.acceptable_minutes,
            stale_minutes: policy.stale_minutes,
        }
    }
}

impl ForecastConfig {
    #[must_use]
    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            fresh_minutes: self.fresh_minutes,
            acceptable_minutes: self.acceptable_minutes,
            stale_minutes: self.stale_minutes,
        }
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            high_secs: 60,
            medium_secs: 300,
            low_secs: 900,
            default_secs: 300,
        }
    }
}

impl IntervalConfig {
    /// Next-report interval for a decision; `None` means no decision was possible.
    #[must_use]
    pub fn interval_for(&self, rate: Option<RateLevel>) -> Duration {
        let secs = match rate {
            Some(RateLevel::High) => self.high_secs,
            Some(RateLevel::Medium) => self.medium_secs,
            Some(RateLevel::Low) => self.low_secs,
            None => self.default_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            node_id_pattern: r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,63}$".to_string(),
            plausible_min_c: -50.0,
            plausible_max_c: 80.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_path: Some(PathBuf::from("/dev/shm/cadence-decisions.jsonl")),
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[CADENCE-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("cadence").join("config.toml");
        let data = home_dir.join(".local").join("share").join("cadence");
        Self {
            config_file: cfg,
            sqlite_db: data.join("control.sqlite3"),
            forecast_cache: data.join("forecast.json"),
            jsonl_log: data.join("decisions.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw =
                fs::read_to_string(&path_buf).map_err(|source| CadenceError::io(&path_buf, source))?;
            toml::from_str::<Self>(&raw)?
        } else if path.is_some() {
            return Err(CadenceError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for log correlation.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes and releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// JSONL writer settings derived from `[logging]` and `[paths]`.
    #[must_use]
    pub fn jsonl_config(&self) -> JsonlConfig {
        JsonlConfig {
            path: self.paths.jsonl_log.clone(),
            fallback_path: self.logging.fallback_path.clone(),
            max_size_bytes: self.logging.max_size_bytes,
            max_rotated_files: self.logging.max_rotated_files,
            fsync_interval_secs: self.logging.fsync_interval_secs,
        }
    }

    /// Compiled node id pattern. Only fails on a config that skipped validation.
    pub fn node_id_regex(&self) -> Result<Regex> {
        Regex::new(&self.ingest.node_id_pattern).map_err(|e| CadenceError::InvalidConfig {
            details: format!("ingest.node_id_pattern: {e}"),
        })
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut f64_slot = |name: &str, slot: &mut f64| -> Result<()> {
            if let Some(raw) = lookup(name) {
                *slot = parse_env(name, &raw)?;
            }
            Ok(())
        };
        // control
        f64_slot("CADENCE_CONTROL_ALPHA", &mut self.control.alpha)?;
        f64_slot("CADENCE_CONTROL_SIGMA_FLOOR", &mut self.control.sigma_floor)?;
        f64_slot(
            "CADENCE_CONTROL_ESCALATE_HIGH",
            &mut self.control.thresholds.escalate_high,
        )?;
        f64_slot(
            "CADENCE_CONTROL_ESCALATE_MEDIUM",
            &mut self.control.thresholds.escalate_medium,
        )?;
        f64_slot(
            "CADENCE_CONTROL_DEMOTE_FROM_HIGH",
            &mut self.control.thresholds.demote_from_high,
        )?;
        f64_slot(
            "CADENCE_CONTROL_DEMOTE_FROM_MEDIUM",
            &mut self.control.thresholds.demote_from_medium,
        )?;
        // ingest
        f64_slot("CADENCE_INGEST_PLAUSIBLE_MIN_C", &mut self.ingest.plausible_min_c)?;
        f64_slot("CADENCE_INGEST_PLAUSIBLE_MAX_C", &mut self.ingest.plausible_max_c)?;

        if let Some(raw) = lookup("CADENCE_CONTROL_SAMPLE_LIMIT") {
            self.control.sample_limit = parse_env("CADENCE_CONTROL_SAMPLE_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("CADENCE_CONTROL_SAFETY_FLOOR") {
            self.control.safety_floor = raw.parse().map_err(|error: CadenceError| {
                CadenceError::ConfigParse {
                    context: "env",
                    details: format!("CADENCE_CONTROL_SAFETY_FLOOR={raw:?}: {error}"),
                }
            })?;
        }
        if let Some(raw) = lookup("CADENCE_FORECAST_READER_THREADS") {
            self.forecast.reader_threads = parse_env("CADENCE_FORECAST_READER_THREADS", &raw)?;
        }
        // forecast / store
        for (name, slot) in [
            ("CADENCE_FORECAST_READ_TIMEOUT_MS", &mut self.forecast.read_timeout_ms),
            ("CADENCE_FORECAST_FRESH_MINUTES", &mut self.forecast.fresh_minutes),
            (
                "CADENCE_FORECAST_ACCEPTABLE_MINUTES",
                &mut self.forecast.acceptable_minutes,
            ),
            ("CADENCE_FORECAST_STALE_MINUTES", &mut self.forecast.stale_minutes),
            ("CADENCE_STORE_BUSY_TIMEOUT_MS", &mut self.store.busy_timeout_ms),
            ("CADENCE_INTERVAL_HIGH_SECS", &mut self.intervals.high_secs),
            ("CADENCE_INTERVAL_MEDIUM_SECS", &mut self.intervals.medium_secs),
            ("CADENCE_INTERVAL_LOW_SECS", &mut self.intervals.low_secs),
            ("CADENCE_INTERVAL_DEFAULT_SECS", &mut self.intervals.default_secs),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = parse_env(name, &raw)?;
            }
        }
        // logging
        if let Some(raw) = lookup("CADENCE_LOGGING_ENABLED") {
            self.logging.enabled = parse_env("CADENCE_LOGGING_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("CADENCE_INGEST_NODE_ID_PATTERN") {
            self.ingest.node_id_pattern = raw;
        }
        // paths
        for (name, slot) in [
            ("CADENCE_SQLITE_DB", &mut self.paths.sqlite_db),
            ("CADENCE_FORECAST_CACHE", &mut self.paths.forecast_cache),
            ("CADENCE_JSONL_LOG", &mut self.paths.jsonl_log),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = PathBuf::from(raw);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let c = &self.control;
        if !(c.alpha > 0.0 && c.alpha <= 1.0) {
            return Err(invalid(format!("control.alpha must be in (0, 1], got {}", c.alpha)));
        }
        if c.sample_limit == 0 {
            return Err(invalid("control.sample_limit must be >= 1".to_string()));
        }
        if !(c.sigma_floor.is_finite() && c.sigma_floor > 0.0) {
            return Err(invalid(format!(
                "control.sigma_floor must be > 0, got {}",
                c.sigma_floor
            )));
        }

        let t = &c.thresholds;
        for (name, val) in [
            ("escalate_high", t.escalate_high),
            ("escalate_medium", t.escalate_medium),
            ("demote_from_high", t.demote_from_high),
            ("demote_from_medium", t.demote_from_medium),
        ] {
            if !(val > 0.0 && val < 1.0) {
                return Err(invalid(format!(
                    "control.thresholds.{name} must be in (0, 1), got {val}"
                )));
            }
        }
        if t.escalate_high >= t.escalate_medium {
            return Err(invalid(
                "control.thresholds.escalate_high must be < escalate_medium".to_string(),
            ));
        }
        if t.escalate_high > t.demote_from_high || t.escalate_medium > t.demote_from_medium {
            return Err(invalid(
                "demotion thresholds must not be below their escalation thresholds".to_string(),
            ));
        }

        let f = &self.forecast;
        if f.read_timeout_ms == 0 {
            return Err(invalid("forecast.read_timeout_ms must be > 0".to_string()));
        }
        if !(1..=64).contains(&f.reader_threads) {
            return Err(invalid(format!(
                "forecast.reader_threads must be in [1, 64], got {}",
                f.reader_threads
            )));
        }
        if !(f.fresh_minutes < f.acceptable_minutes && f.acceptable_minutes < f.stale_minutes) {
            return Err(invalid(
                "forecast freshness minutes must strictly ascend: fresh < acceptable < stale"
                    .to_string(),
            ));
        }

        let i = &self.intervals;
        if [i.high_secs, i.medium_secs, i.low_secs, i.default_secs].contains(&0) {
            return Err(invalid("intervals must all be > 0".to_string()));
        }
        if !(i.high_secs <= i.medium_secs && i.medium_secs <= i.low_secs) {
            return Err(invalid(
                "intervals must satisfy high_secs <= medium_secs <= low_secs".to_string(),
            ));
        }

        if self.ingest.plausible_min_c >= self.ingest.plausible_max_c {
            return Err(invalid(
                "ingest.plausible_min_c must be < ingest.plausible_max_c".to_string(),
            ));
        }
        self.node_id_regex()?;

        if self.logging.max_size_bytes == 0 {
            return Err(invalid("logging.max_size_bytes must be > 0".to_string()));
        }
        Ok(())
    }
}

fn invalid(details: String) -> CadenceError {
    CadenceError::InvalidConfig { details }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| CadenceError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
