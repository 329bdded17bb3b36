//! Forecast timeline interpolation: best-estimate forecast temperature for a timestamp.
//!
//! Priority: exact match (±1 minute) → linear interpolation between bracketing points →
//! nearest neighbour bucketed by distance → the snapshot's single point estimate.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::CadenceError;
use crate::forecast::snapshot::{ForecastPoint, ForecastSnapshot};

/// How closely the estimate is tied to the requested timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchQuality {
    Exact,
    Interpolated,
    Good,
    Acceptable,
    Poor,
    Fallback,
}

impl MatchQuality {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Interpolated => "interpolated",
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
            Self::Fallback => "fallback",
        }
    }

    /// Bucket a nearest-neighbour distance.
    #[must_use]
    pub fn from_distance_minutes(minutes: f64) -> Self {
        if minutes <= 30.0 {
            Self::Exact
        } else if minutes <= 90.0 {
            Self::Good
        } else if minutes <= 180.0 {
            Self::Acceptable
        } else {
            Self::Poor
        }
    }
}

impl fmt::Display for MatchQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchQuality {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "interpolated" => Ok(Self::Interpolated),
            "good" => Ok(Self::Good),
            "acceptable" => Ok(Self::Acceptable),
            "poor" => Ok(Self::Poor),
            "fallback" => Ok(Self::Fallback),
            other => Err(CadenceError::Serialization {
                context: "match_quality",
                details: format!("unknown match quality {other:?}"),
            }),
        }
    }
}

/// Forecast temperature chosen for one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastEstimate {
    pub forecast_c: f64,
    pub match_quality: MatchQuality,
    /// Distance to the point used; 0 for interpolation, `None` when unknown.
    pub time_diff_minutes: Option<f64>,
    pub forecast_time: Option<DateTime<Utc>>,
}

const EXACT_WINDOW_MINUTES: f64 = 1.0;

fn minutes_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a - b).num_milliseconds().abs() as f64 / 60_000.0
}

/// Linear interpolation through `(x1, y1)` and `(x2, y2)`.
///
/// Returns `y1` at `x1` and `y2` at `x2` exactly; between them the result stays inside
/// `[min(y1, y2), max(y1, y2)]`, so it is monotone in `x`.
#[must_use]
pub fn lerp(x1: f64, y1: f64, x2: f64, y2: f64, x: f64) -> f64 {
    if x2 == x1 || x == x1 {
        return y1;
    }
    if x == x2 {
        return y2;
    }
    let t = (x - x1) / (x2 - x1);
    let (lo, hi) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
    (y2 - y1).mul_add(t, y1).clamp(lo, hi)
}

/// Latest point at or before `target` and earliest point at or after it.
fn bracket(
    timeline: &[ForecastPoint],
    target: DateTime<Utc>,
) -> (Option<&ForecastPoint>, Option<&ForecastPoint>) {
    let mut before: Option<&ForecastPoint> = None;
    let mut after: Option<&ForecastPoint> = None;
    for point in timeline {
        if point.timestamp <= target && before.is_none_or(|b| point.timestamp > b.timestamp) {
            before = Some(point);
        }
        if point.timestamp >= target && after.is_none_or(|a| point.timestamp < a.timestamp) {
            after = Some(point);
        }
    }
    (before, after)
}

/// Best forecast temperature for `target`, or `None` when the snapshot has neither a
/// timeline nor a point estimate.
#[must_use]
pub fn forecast_for(snapshot: &ForecastSnapshot, target: DateTime<Utc>) -> Option<ForecastEstimate> {
    let timeline: &[ForecastPoint] = &snapshot.full_forecast;
    let (before, after) = bracket(timeline, target);

    if let Some(b) = before {
        let diff = minutes_between(target, b.timestamp);
        if diff <= EXACT_WINDOW_MINUTES {
            return Some(ForecastEstimate {
                forecast_c: b.temperature_c,
                match_quality: MatchQuality::Exact,
                time_diff_minutes: Some(diff),
                forecast_time: Some(b.timestamp),
            });
        }
    }

    if let (Some(b), Some(a)) = (before, after)
        && b.timestamp < target
        && target < a.timestamp
    {
        let x1 = b.timestamp.timestamp_millis() as f64;
        let x2 = a.timestamp.timestamp_millis() as f64;
        let x = target.timestamp_millis() as f64;
        return Some(ForecastEstimate {
            forecast_c: lerp(x1, b.temperature_c, x2, a.temperature_c, x),
            match_quality: MatchQuality::Interpolated,
            time_diff_minutes: Some(0.0),
            forecast_time: Some(target),
        });
    }

    let nearest = match (before, after) {
        (Some(b), Some(a)) => {
            if minutes_between(target, a.timestamp) < minutes_between(target, b.timestamp) {
                Some(a)
            } else {
                Some(b)
            }
        }
        (Some(p), None) | (None, Some(p)) => Some(p),
        (None, None) => None,
    };
    if let Some(p) = nearest {
        let diff = minutes_between(target, p.timestamp);
        return Some(ForecastEstimate {
            forecast_c: p.temperature_c,
            match_quality: MatchQuality::from_distance_minutes(diff),
            time_diff_minutes: Some(diff),
            forecast_time: Some(p.timestamp),
        });
    }

    snapshot.forecast_c.map(|forecast_c| ForecastEstimate {
        forecast_c,
        match_quality: MatchQuality::Fallback,
        time_diff_minutes: snapshot
            .forecast_time
            .map(|ft| minutes_between(target, ft)),
        forecast_time: snapshot.forecast_time,
    })
}
