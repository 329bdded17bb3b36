//! JSONL decision log: append-only line-delimited JSON, one object per pipeline event.
//!
//! Each line is a self-contained JSON object assembled in memory and written with a single
//! `write_all`, so a tailing consumer never sees interleaved partial lines.
//!
//! Four-level fallback chain:
//! 1. Primary file path
//! 2. Fallback path (e.g. a RAM-backed directory)
//! 3. stderr with `[CADENCE-JSONL]` prefix
//! 4. Silent discard (a decision must never fail because logging failed)

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::control::rate::RateLevel;
use crate::control::state::{ControlMode, ControlReason};
use crate::core::errors::{CadenceError, Result};
use crate::forecast::cache::Freshness;
use crate::forecast::interpolate::MatchQuality;

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Pipeline events recorded in the decision log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MeasurementProcessed,
    ForecastFallback,
    ForecastTimeout,
    ErrorFallback,
    NoDecision,
    ValidationRejected,
    ForecastImported,
}

/// A single JSONL log entry; everything except `ts`, `event`, `severity` is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_rate: Option<RateLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_rate: Option<RateLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ControlReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ControlMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s_err: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abs_error: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_quality: Option<MatchQuality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness: Option<Freshness>,
    /// Wall time spent on the event in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// CAD error code when the event records a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Freeform details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            node_id: None,
            target_rate: None,
            previous_rate: None,
            reason: None,
            mode: None,
            s_err: None,
            r: None,
            abs_error: None,
            observed_c: None,
            forecast_c: None,
            match_quality: None,
            freshness: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    /// Tag the entry with a node id.
    #[must_use]
    pub fn for_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    /// Attach the code and message of a failure.
    #[must_use]
    pub fn with_error(mut self, err: &CadenceError) -> Self {
        self.error_code = Some(err.code().to_string());
        self.error_message = Some(err.to_string());
        self
    }
}

/// Where log lines currently go, in degradation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

impl Sink {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "normal",
            Self::Fallback => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }

    const fn next(self) -> Self {
        match self {
            Self::Primary => Self::Fallback,
            Self::Fallback => Self::Stderr,
            Self::Stderr | Self::Discard => Self::Discard,
        }
    }

    const fn is_file(self) -> bool {
        matches!(self, Self::Primary | Self::Fallback)
    }
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Primary log file path.
    pub path: PathBuf,
    /// Optional fallback path (e.g. on a different filesystem).
    pub fallback_path: Option<PathBuf>,
    /// Maximum file size before rotation (bytes). Default: 10 MiB.
    pub max_size_bytes: u64,
    /// Number of rotated files to keep. Default: 5.
    pub max_rotated_files: u32,
    /// Seconds between forced fsync calls. Default: 10.
    pub fsync_interval_secs: u64,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/cadence/decisions.jsonl"),
            fallback_path: Some(PathBuf::from("/dev/shm/cadence-decisions.jsonl")),
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

struct LogFile {
    out: BufWriter<File>,
    len: u64,
}

/// Append-only JSONL writer with size rotation and a degrading sink.
pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<LogFile>,
    sink: Sink,
    last_sync: SystemTime,
}

impl JsonlWriter {
    /// Open the primary path, degrading to the fallback path or stderr as needed.
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            sink: Sink::Primary,
            last_sync: SystemTime::now(),
        };
        if !writer.attach(Sink::Primary) {
            writer.degrade();
        }
        writer
    }

    /// Serialize `entry` and append it as one line.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => notice(&format!("serialize error: {e}")),
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.out.flush();
        }
    }

    /// Flush and `sync_data` the current file.
    pub fn fsync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.out.flush();
            let _ = file.out.get_ref().sync_data();
        }
        self.last_sync = SystemTime::now();
    }

    /// Current degradation state: `normal`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &'static str {
        self.sink.as_str()
    }

    /// Size of the file currently written, 0 when not writing to a file.
    pub fn bytes_written(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.len)
    }

    /// Move back to the primary path if it has become writable again.
    pub fn try_recover(&mut self) {
        if self.sink != Sink::Primary && self.attach(Sink::Primary) {
            notice(&format!(
                "recovered to primary path: {}",
                self.config.path.display()
            ));
        }
    }

    // ──────────────────────── internals ────────────────────────

    fn path_for(&self, sink: Sink) -> Option<&Path> {
        match sink {
            Sink::Primary => Some(&self.config.path),
            Sink::Fallback => self.config.fallback_path.as_deref(),
            Sink::Stderr | Sink::Discard => None,
        }
    }

    /// Point the writer at `sink`'s file. False when it has no path or cannot be opened.
    fn attach(&mut self, sink: Sink) -> bool {
        let Some(path) = self.path_for(sink) else {
            return false;
        };
        match open_append(path) {
            Ok(file) => {
                self.file = Some(file);
                self.sink = sink;
                true
            }
            Err(_) => false,
        }
    }

    fn degrade(&mut self) {
        let from = self.sink;
        self.file = None;
        let mut next = from.next();
        while next.is_file() && !self.attach(next) {
            next = next.next();
        }
        self.sink = next;
        if from != Sink::Discard {
            match self.path_for(next) {
                Some(path) => notice(&format!(
                    "{} sink failed, writing to {}",
                    from.as_str(),
                    path.display()
                )),
                None => notice(&format!("{} sink failed, now {}", from.as_str(), next.as_str())),
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self
            .file
            .as_ref()
            .is_some_and(|f| f.len + len > self.config.max_size_bytes)
        {
            self.rotate();
        }

        while self.sink.is_file() {
            let written = match self.file.as_mut() {
                Some(file) => file
                    .out
                    .write_all(line.as_bytes())
                    .map(|()| file.len += len)
                    .is_ok(),
                None => false,
            };
            if written {
                self.maybe_fsync();
                return;
            }
            self.degrade();
        }

        if self.sink == Sink::Stderr {
            let _ = write!(io::stderr(), "[CADENCE-JSONL] {line}");
        }
    }

    fn maybe_fsync(&mut self) {
        let interval = Duration::from_secs(self.config.fsync_interval_secs);
        if self.last_sync.elapsed().unwrap_or_default() >= interval {
            self.fsync();
        }
    }

    /// Shift `path.1 … path.N` up by one, move the live file to `.1`, start a new one.
    fn rotate(&mut self) {
        let Some(base) = self.path_for(self.sink).map(Path::to_path_buf) else {
            return;
        };
        if let Some(mut file) = self.file.take() {
            let _ = file.out.flush();
        }

        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        let _ = rename(&base, rotated_name(&base, 1));

        if !self.attach(self.sink) {
            self.degrade();
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

// ──────────────────────── helpers ────────────────────────

fn notice(msg: &str) {
    let _ = writeln!(io::stderr(), "[CADENCE-JSONL] {msg}");
}

fn open_append(path: &Path) -> Result<LogFile> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| CadenceError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| CadenceError::io(path, source))?;
    let len = file.metadata().map_or(0, |m| m.len());
    Ok(LogFile {
        out: BufWriter::with_capacity(16 * 1024, file),
        len,
    })
}

/// `decisions.jsonl` → `decisions.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────────── tests ────────────────────────
