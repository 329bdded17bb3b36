//! Forecast snapshot model and the timeline merge policy used by the refresh job.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One point of a provider forecast timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "temperature")]
    pub temperature_c: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl ForecastPoint {
    /// A bare temperature point.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, temperature_c: f64) -> Self {
        Self {
            timestamp,
            temperature_c,
            humidity: None,
            pressure: None,
            wind_speed: None,
            description: None,
            icon: None,
        }
    }
}

/// Most recently stored provider forecast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastSnapshot {
    /// Point estimate for `forecast_time`; a snapshot without one is unusable.
    #[serde(default)]
    pub forecast_c: Option<f64>,
    #[serde(default)]
    pub forecast_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provider: String,
    /// Ordered by timestamp, one point per rounded minute.
    #[serde(default)]
    pub full_forecast: Vec<ForecastPoint>,
}

impl ForecastSnapshot {
    /// Fold a newer fetch into this snapshot.
    ///
    /// Scalar fields come from `incoming`; the timeline is merged with [`merge_timeline`].
    /// `incoming.forecast_c == None` keeps the existing point estimate.
    #[must_use]
    pub fn merged_with(&self, incoming: &Self) -> Self {
        Self {
            forecast_c: incoming.forecast_c.or(self.forecast_c),
            forecast_time: incoming.forecast_time.or(self.forecast_time),
            fetched_at: incoming.fetched_at.or(self.fetched_at),
            provider: if incoming.provider.is_empty() {
                self.provider.clone()
            } else {
                incoming.provider.clone()
            },
            full_forecast: merge_timeline(&self.full_forecast, &incoming.full_forecast),
        }
    }
}

/// Dedup key: Unix time rounded to the nearest whole minute.
#[must_use]
pub fn timeline_key(ts: DateTime<Utc>) -> i64 {
    let millis = ts.timestamp_millis();
    (millis + 30_000).div_euclid(60_000)
}

/// Merge two timelines, sorted by timestamp.
///
/// Points in `incoming` replace points in `existing` at the same rounded minute. Existing
/// points with no counterpart are kept. Within one side, the last point for a minute wins.
#[must_use]
pub fn merge_timeline(existing: &[ForecastPoint], incoming: &[ForecastPoint]) -> Vec<ForecastPoint> {
    let mut by_minute: BTreeMap<i64, ForecastPoint> = BTreeMap::new();
    for point in existing.iter().chain(incoming) {
        by_minute.insert(timeline_key(point.timestamp), point.clone());
    }
    by_minute.into_values().collect()
}
