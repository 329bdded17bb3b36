//! Per-node control state: the durable memory of the rate control loop.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::rate::RateLevel;
use crate::core::errors::CadenceError;

/// Why the current target rate was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlReason {
    /// Moved to a higher reporting rate.
    Escalate,
    /// Moved to a lower reporting rate.
    DeEscalate,
    /// Rate unchanged.
    Hold,
    /// The configured floor raised the rate.
    SafetyFloor,
    /// First decision for a node, taken from the error bands alone.
    BaselineThreshold,
    /// No forecast was available; previous rate reused.
    ForecastUnavailableFallback,
    /// Processing failed; previous rate reused.
    ErrorFallback,
}

impl ControlReason {
    /// Stable wire/storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Escalate => "escalate",
            Self::DeEscalate => "de-escalate",
            Self::Hold => "hold",
            Self::SafetyFloor => "safety-floor",
            Self::BaselineThreshold => "baseline-threshold",
            Self::ForecastUnavailableFallback => "forecast-unavailable-fallback",
            Self::ErrorFallback => "error-fallback",
        }
    }
}

impl fmt::Display for ControlReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlReason {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escalate" => Ok(Self::Escalate),
            "de-escalate" => Ok(Self::DeEscalate),
            "hold" => Ok(Self::Hold),
            "safety-floor" => Ok(Self::SafetyFloor),
            "baseline-threshold" => Ok(Self::BaselineThreshold),
            "forecast-unavailable-fallback" => Ok(Self::ForecastUnavailableFallback),
            "error-fallback" => Ok(Self::ErrorFallback),
            other => Err(CadenceError::Serialization {
                context: "control_reason",
                details: format!("unknown reason {other:?}"),
            }),
        }
    }
}

/// Which rung of the processing ladder produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    /// Fresh decision from forecast and observation.
    Active,
    /// Forecast missing; previous rate reused, nothing persisted.
    Fallback,
    /// Processing error; previous rate reused, nothing persisted.
    ErrorFallback,
}

impl ControlMode {
    /// Stable wire/storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Fallback => "FALLBACK",
            Self::ErrorFallback => "ERROR_FALLBACK",
        }
    }

    /// Only fresh decisions produce score-log rows.
    #[must_use]
    pub const fn records_score(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "FALLBACK" => Ok(Self::Fallback),
            "ERROR_FALLBACK" => Ok(Self::ErrorFallback),
            other => Err(CadenceError::Serialization {
                context: "control_mode",
                details: format!("unknown mode {other:?}"),
            }),
        }
    }
}

/// Durable per-node control state, one row per node id.
///
/// `samples` never holds more than the configured sample limit; the analyzer trims it
/// on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeControlState {
    pub node_id: String,
    pub target_rate: RateLevel,
    pub previous_rate: Option<RateLevel>,
    pub m_ewma: f64,
    pub sigma_day: f64,
    pub samples: Vec<f64>,
    pub s_err: f64,
    pub last_observed_c: f64,
    pub last_forecast_c: f64,
    pub last_updated_at: DateTime<Utc>,
    pub reason: ControlReason,
    pub mode: ControlMode,
}

impl NodeControlState {
    /// Copy of this state relabelled as a fallback decision that reuses `target_rate`.
    #[must_use]
    pub fn as_fallback(&self, mode: ControlMode, reason: ControlReason) -> Self {
        Self {
            previous_rate: Some(self.target_rate),
            mode,
            reason,
            ..self.clone()
        }
    }
}
