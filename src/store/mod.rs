//! Control state store: durable per-node state plus the append-only measurement and score logs.
//!
//! The orchestrator talks to storage only through [`ControlStateStore`]. A commit writes
//! the processed-measurement row, the control-state upsert, and the optional score-log row
//! as one atomic unit. The commit only lands if the node's stored state still equals the one
//! the decision was computed from.

#![allow(missing_docs)]

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::rate::RateLevel;
use crate::control::state::{ControlMode, ControlReason, NodeControlState};
use crate::core::errors::Result;
use crate::forecast::interpolate::MatchQuality;

/// Append-only record of one processed measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMeasurementRow {
    pub node_id: String,
    pub observed_c: f64,
    pub forecast_c: f64,
    pub abs_error: f64,
    pub battery_v: Option<f64>,
    pub humidity: Option<f64>,
    pub match_quality: MatchQuality,
    pub target_rate: RateLevel,
    pub mode: ControlMode,
    pub measured_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// Append-only record of one scored decision (ACTIVE mode only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreLogRow {
    pub node_id: String,
    pub s_err: f64,
    pub r: f64,
    pub m_ewma: f64,
    pub sigma_day: f64,
    pub abs_error: f64,
    pub target_rate: RateLevel,
    pub previous_rate: Option<RateLevel>,
    pub reason: ControlReason,
    pub recorded_at: DateTime<Utc>,
}

/// Everything one successful decision writes.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistBatch {
    pub measurement: ProcessedMeasurementRow,
    pub state: NodeControlState,
    pub score: Option<ScoreLogRow>,
    /// Stored state the decision was computed from; `None` for a node seen for the first time.
    pub previous: Option<NodeControlState>,
}

/// Keyed, transactional storage for node control state.
pub trait ControlStateStore: Send + Sync {
    /// Current state for `node_id`, `None` for a node never processed.
    fn load(&self, node_id: &str) -> Result<Option<NodeControlState>>;

    /// Apply all writes of `batch` atomically: all of them land, or none do.
    ///
    /// Fails with [`CadenceError::StateConflict`] when the stored state no longer equals
    /// `batch.previous`.
    ///
    /// [`CadenceError::StateConflict`]: crate::core::errors::CadenceError::StateConflict
    fn commit(&self, batch: &PersistBatch) -> Result<()>;

    /// Every stored node state, ordered by node id.
    fn list_states(&self) -> Result<Vec<NodeControlState>>;

    /// Most recent processed measurements for a node, newest first.
    fn recent_measurements(&self, node_id: &str, limit: u32)
    -> Result<Vec<ProcessedMeasurementRow>>;

    /// Most recent score-log rows for a node, newest first.
    fn recent_scores(&self, node_id: &str, limit: u32) -> Result<Vec<ScoreLogRow>>;
}
