//! Rate controller: three ordered reporting levels with demotion hysteresis and a safety floor.
//!
//! The controller is a pure function of `(s_err, previous_rate, safety_floor, thresholds)`.
//! Escalation is immediate (fast attack); demotion needs a stronger agreement signal
//! than escalation did, so a node that just left HIGH cannot fall straight to LOW.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::control::state::ControlReason;
use crate::core::errors::CadenceError;

/// Reporting-rate level. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateLevel {
    Low,
    Medium,
    High,
}

impl RateLevel {
    /// All levels in ascending order.
    pub const ORDER: [Self; 3] = [Self::Low, Self::Medium, Self::High];

    /// Position in [`RateLevel::ORDER`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for RateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLevel {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(CadenceError::Serialization {
                context: "rate_level",
                details: format!("unknown rate level {other:?}"),
            }),
        }
    }
}

/// Error-score bands for escalation and the stricter bands for demotion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateThresholds {
    /// `s_err` below this selects HIGH.
    pub escalate_high: f64,
    /// `s_err` below this (and not below `escalate_high`) selects MEDIUM.
    pub escalate_medium: f64,
    /// Leaving HIGH requires `s_err` strictly above this.
    pub demote_from_high: f64,
    /// Leaving MEDIUM for LOW requires `s_err` at or above this.
    pub demote_from_medium: f64,
}

impl Default for RateThresholds {
    fn default() -> Self {
        Self {
            escalate_high: 0.45,
            escalate_medium: 0.70,
            demote_from_high: 0.55,
            demote_from_medium: 0.80,
        }
    }
}

/// Output of [`decide_rate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub target_rate: RateLevel,
    pub previous_rate: Option<RateLevel>,
    pub reason: ControlReason,
}

/// Raise `rate` to `floor` if it sits below it.
#[must_use]
pub fn clamp_to_safety_floor(rate: RateLevel, floor: RateLevel) -> RateLevel {
    RateLevel::ORDER[rate.index().max(floor.index())]
}

/// Baseline level from the escalation bands alone.
#[must_use]
pub fn baseline_rate(s_err: f64, thresholds: &RateThresholds) -> RateLevel {
    if s_err < thresholds.escalate_high {
        RateLevel::High
    } else if s_err < thresholds.escalate_medium {
        RateLevel::Medium
    } else {
        RateLevel::Low
    }
}

/// Decide the next reporting level.
///
/// `previous_rate` is `None` for a node's first decision; hysteresis then does not apply
/// and the reason is `baseline-threshold` unless the floor intervened.
#[must_use]
pub fn decide_rate(
    s_err: f64,
    previous_rate: Option<RateLevel>,
    safety_floor: RateLevel,
    thresholds: &RateThresholds,
) -> RateDecision {
    let baseline = baseline_rate(s_err, thresholds);

    let candidate = match previous_rate {
        // Out of HIGH at most one step per decision.
        Some(RateLevel::High) if s_err > thresholds.demote_from_high => {
            baseline.max(RateLevel::Medium)
        }
        Some(RateLevel::Medium) if s_err >= thresholds.demote_from_medium => RateLevel::Low,
        // Inside the MEDIUM hysteresis band a LOW baseline is not enough to demote.
        Some(RateLevel::Medium) if baseline == RateLevel::Low => RateLevel::Medium,
        _ => baseline,
    };

    let target_rate = clamp_to_safety_floor(candidate, safety_floor);
    let floor_applied = target_rate != candidate;

    let reason = match previous_rate {
        Some(previous) if previous == target_rate => ControlReason::Hold,
        _ if floor_applied => ControlReason::SafetyFloor,
        None => ControlReason::BaselineThreshold,
        Some(previous) if target_rate > previous => ControlReason::Escalate,
        Some(_) => ControlReason::DeEscalate,
    };

    RateDecision {
        target_rate,
        previous_rate,
        reason,
    }
}
