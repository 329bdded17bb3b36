//! SQLite control state store: WAL-mode database holding the per-node state table and the
//! append-only measurement and score logs.
//!
//! Every commit runs in one `BEGIN IMMEDIATE` transaction. A failure anywhere rolls the whole
//! batch back, so a reader never sees a state row without its measurement row. The state row
//! is re-read under the write lock and must still equal `PersistBatch::previous`; another
//! process sharing the file that committed first turns this commit into `StateConflict`.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params};

use crate::control::rate::RateLevel;
use crate::control::state::{ControlReason, NodeControlState};
use crate::core::errors::{CadenceError, Result};
use crate::store::{ControlStateStore, PersistBatch, ProcessedMeasurementRow, ScoreLogRow};

/// Default bound on how long a writer waits for a competing lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Transactional control state store backed by one SQLite connection.
pub struct SqliteControlStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteControlStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| CadenceError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn, busy_timeout)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the connection actually runs in WAL mode.
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }

    /// Number of rows in `processed_measurements`.
    pub fn measurement_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 =
            conn.query_row("SELECT COUNT(*) FROM processed_measurements", [], |row| {
                row.get(0)
            })?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Number of rows in `score_log`.
    pub fn score_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM score_log", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

// ──────────────────── row encoding ────────────────────

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(node_id: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(node_id, format!("timestamp {raw:?}: {e}")))
}

fn parse_enum<T: FromStr<Err = CadenceError>>(node_id: &str, raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| corrupt(node_id, e.to_string()))
}

fn corrupt(node_id: &str, details: String) -> CadenceError {
    CadenceError::CorruptState {
        node_id: node_id.to_string(),
        details,
    }
}

/// Raw `node_control_state` columns before enum/timestamp decoding.
struct StateColumns {
    node_id: String,
    target_rate: String,
    previous_rate: Option<String>,
    m_ewma: f64,
    sigma_day: f64,
    samples: String,
    s_err: f64,
    last_observed_c: f64,
    last_forecast_c: f64,
    last_updated_at: String,
    reason: String,
    mode: String,
}

const STATE_COLUMNS: &str = "node_id, target_rate, previous_rate, m_ewma, sigma_day, samples,
     s_err, last_observed_c, last_forecast_c, last_updated_at, reason, mode";

impl StateColumns {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get(0)?,
            target_rate: row.get(1)?,
            previous_rate: row.get(2)?,
            m_ewma: row.get(3)?,
            sigma_day: row.get(4)?,
            samples: row.get(5)?,
            s_err: row.get(6)?,
            last_observed_c: row.get(7)?,
            last_forecast_c: row.get(8)?,
            last_updated_at: row.get(9)?,
            reason: row.get(10)?,
            mode: row.get(11)?,
        })
    }

    fn decode(self) -> Result<NodeControlState> {
        let id = self.node_id.as_str();
        let samples: Vec<f64> = serde_json::from_str(&self.samples)
            .map_err(|e| corrupt(id, format!("samples: {e}")))?;
        Ok(NodeControlState {
            target_rate: parse_enum(id, &self.target_rate)?,
            previous_rate: self
                .previous_rate
                .as_deref()
                .map(|raw| parse_enum::<RateLevel>(id, raw))
                .transpose()?,
            m_ewma: self.m_ewma,
            sigma_day: self.sigma_day,
            samples,
            s_err: self.s_err,
            last_observed_c: self.last_observed_c,
            last_forecast_c: self.last_forecast_c,
            last_updated_at: parse_ts(id, &self.last_updated_at)?,
            reason: parse_enum(id, &self.reason)?,
            mode: parse_enum(id, &self.mode)?,
            node_id: self.node_id,
        })
    }
}

// ──────────────────── ControlStateStore ────────────────────

impl ControlStateStore for SqliteControlStore {
    fn load(&self, node_id: &str) -> Result<Option<NodeControlState>> {
        let conn = self.conn.lock();
        let columns = conn
            .prepare_cached(&format!(
                "SELECT {STATE_COLUMNS} FROM node_control_state WHERE node_id = ?1"
            ))?
            .query_row(params![node_id], StateColumns::from_row)
            .optional()?;
        drop(conn);
        columns.map(StateColumns::decode).transpose()
    }

    fn commit(&self, batch: &PersistBatch) -> Result<()> {
        let samples = serde_json::to_string(&batch.state.samples)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let node_id = batch.state.node_id.as_str();
        let current = tx
            .prepare_cached(&format!(
                "SELECT {STATE_COLUMNS} FROM node_control_state WHERE node_id = ?1"
            ))?
            .query_row(params![node_id], StateColumns::from_row)
            .optional()?
            .map(StateColumns::decode)
            .transpose()?;
        if current != batch.previous {
            return Err(CadenceError::StateConflict {
                node_id: node_id.to_string(),
            });
        }

        let m = &batch.measurement;
        tx.prepare_cached(
            "INSERT INTO processed_measurements (
                node_id, observed_c, forecast_c, abs_error, battery_v, humidity,
                match_quality, target_rate, mode, measured_at, processed_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        )?
        .execute(params![
            m.node_id,
            m.observed_c,
            m.forecast_c,
            m.abs_error,
            m.battery_v,
            m.humidity,
            m.match_quality.as_str(),
            m.target_rate.as_str(),
            m.mode.as_str(),
            ts(m.measured_at),
            ts(m.processed_at),
        ])?;

        let s = &batch.state;
        tx.prepare_cached(
            "INSERT INTO node_control_state (
                node_id, target_rate, previous_rate, m_ewma, sigma_day, samples,
                s_err, last_observed_c, last_forecast_c, last_updated_at, reason, mode
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
            ON CONFLICT(node_id) DO UPDATE SET
                target_rate = excluded.target_rate,
                previous_rate = excluded.previous_rate,
                m_ewma = excluded.m_ewma,
                sigma_day = excluded.sigma_day,
                samples = excluded.samples,
                s_err = excluded.s_err,
                last_observed_c = excluded.last_observed_c,
                last_forecast_c = excluded.last_forecast_c,
                last_updated_at = excluded.last_updated_at,
                reason = excluded.reason,
                mode = excluded.mode",
        )?
        .execute(params![
            s.node_id,
            s.target_rate.as_str(),
            s.previous_rate.map(RateLevel::as_str),
            s.m_ewma,
            s.sigma_day,
            samples,
            s.s_err,
            s.last_observed_c,
            s.last_forecast_c,
            ts(s.last_updated_at),
            s.reason.as_str(),
            s.mode.as_str(),
        ])?;

        if let Some(score) = &batch.score {
            tx.prepare_cached(
                "INSERT INTO score_log (
                    node_id, s_err, r, m_ewma, sigma_day, abs_error,
                    target_rate, previous_rate, reason, recorded_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?
            .execute(params![
                score.node_id,
                score.s_err,
                score.r,
                score.m_ewma,
                score.sigma_day,
                score.abs_error,
                score.target_rate.as_str(),
                score.previous_rate.map(RateLevel::as_str),
                score.reason.as_str(),
                ts(score.recorded_at),
            ])?;
        }

        tx.commit()?;
        Ok(())
    }

    fn list_states(&self) -> Result<Vec<NodeControlState>> {
        let conn = self.conn.lock();
        let rows = conn
            .prepare_cached(&format!(
                "SELECT {STATE_COLUMNS} FROM node_control_state ORDER BY node_id"
            ))?
            .query_map([], StateColumns::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(conn);
        rows.into_iter().map(StateColumns::decode).collect()
    }

    fn recent_measurements(
        &self,
        node_id: &str,
        limit: u32,
    ) -> Result<Vec<ProcessedMeasurementRow>> {
        type Raw = (
            f64,
            f64,
            f64,
            Option<f64>,
            Option<f64>,
            String,
            String,
            String,
            String,
            String,
        );
        let conn = self.conn.lock();
        let raw: Vec<Raw> = conn
            .prepare_cached(
                "SELECT observed_c, forecast_c, abs_error, battery_v, humidity,
                        match_quality, target_rate, mode, measured_at, processed_at
                 FROM processed_measurements WHERE node_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?
            .query_map(params![node_id, limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(conn);

        raw.into_iter()
            .map(
                |(observed_c, forecast_c, abs_error, battery_v, humidity, mq, rate, mode, at, done)| {
                    Ok(ProcessedMeasurementRow {
                        node_id: node_id.to_string(),
                        observed_c,
                        forecast_c,
                        abs_error,
                        battery_v,
                        humidity,
                        match_quality: parse_enum(node_id, &mq)?,
                        target_rate: parse_enum(node_id, &rate)?,
                        mode: parse_enum(node_id, &mode)?,
                        measured_at: parse_ts(node_id, &at)?,
                        processed_at: parse_ts(node_id, &done)?,
                    })
                },
            )
            .collect()
    }

    fn recent_scores(&self, node_id: &str, limit: u32) -> Result<Vec<ScoreLogRow>> {
        type Raw = (f64, f64, f64, f64, f64, String, Option<String>, String, String);
        let conn = self.conn.lock();
        let raw: Vec<Raw> = conn
            .prepare_cached(
                "SELECT s_err, r, m_ewma, sigma_day, abs_error,
                        target_rate, previous_rate, reason, recorded_at
                 FROM score_log WHERE node_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?
            .query_map(params![node_id, limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(conn);

        raw.into_iter()
            .map(
                |(s_err, r, m_ewma, sigma_day, abs_error, rate, prev, reason, at)| {
                    Ok(ScoreLogRow {
                        node_id: node_id.to_string(),
                        s_err,
                        r,
                        m_ewma,
                        sigma_day,
                        abs_error,
                        target_rate: parse_enum(node_id, &rate)?,
                        previous_rate: prev
                            .as_deref()
                            .map(|p| parse_enum::<RateLevel>(node_id, p))
                            .transpose()?,
                        reason: parse_enum::<ControlReason>(node_id, &reason)?,
                        recorded_at: parse_ts(node_id, &at)?,
                    })
                },
            )
            .collect()
    }
}

// ──────────────────── setup ────────────────────

fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;",
    )?;
    conn.busy_timeout(busy_timeout)?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[CADENCE-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS node_control_state (
            node_id TEXT PRIMARY KEY,
            target_rate TEXT NOT NULL,
            previous_rate TEXT,
            m_ewma REAL NOT NULL,
            sigma_day REAL NOT NULL,
            samples TEXT NOT NULL,
            s_err REAL NOT NULL,
            last_observed_c REAL NOT NULL,
            last_forecast_c REAL NOT NULL,
            last_updated_at TEXT NOT NULL,
            reason TEXT NOT NULL,
            mode TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS processed_measurements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            observed_c REAL NOT NULL,
            forecast_c REAL NOT NULL,
            abs_error REAL NOT NULL,
            battery_v REAL,
            humidity REAL,
            match_quality TEXT NOT NULL,
            target_rate TEXT NOT NULL,
            mode TEXT NOT NULL,
            measured_at TEXT NOT NULL,
            processed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS score_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            s_err REAL NOT NULL,
            r REAL NOT NULL,
            m_ewma REAL NOT NULL,
            sigma_day REAL NOT NULL,
            abs_error REAL NOT NULL,
            target_rate TEXT NOT NULL,
            previous_rate TEXT,
            reason TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_measurements_node ON processed_measurements(node_id, id);
        CREATE INDEX IF NOT EXISTS idx_score_node ON score_log(node_id, id);",
    )?;
    Ok(())
}
