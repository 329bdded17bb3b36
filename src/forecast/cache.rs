//! Forecast cache: snapshot sources, on-disk JSON cache, and the freshness-classifying reader.

#![allow(missing_docs)]

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::errors::{CadenceError, Result};
use crate::forecast::snapshot::ForecastSnapshot;

/// Age class of a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Acceptable,
    Stale,
    Expired,
    /// Snapshot has no `fetched_at`.
    Missing,
}

impl Freshness {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Acceptable => "acceptable",
            Self::Stale => "stale",
            Self::Expired => "expired",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Age limits in minutes for each freshness class. A limit is inclusive to the second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessPolicy {
    pub fresh_minutes: u64,
    pub acceptable_minutes: u64,
    pub stale_minutes: u64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            fresh_minutes: 60,
            acceptable_minutes: 120,
            stale_minutes: 360,
        }
    }
}

impl FreshnessPolicy {
    /// Classify a snapshot fetched at `fetched_at` as seen at `now`.
    ///
    /// A fetch time in the future (clock skew) counts as age zero.
    #[must_use]
    pub fn classify(&self, fetched_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Freshness {
        let Some(fetched_at) = fetched_at else {
            return Freshness::Missing;
        };
        let age_secs = (now - fetched_at).num_seconds().max(0).unsigned_abs();
        let within = |minutes: u64| age_secs <= minutes.saturating_mul(60);
        if within(self.fresh_minutes) {
            Freshness::Fresh
        } else if within(self.acceptable_minutes) {
            Freshness::Acceptable
        } else if within(self.stale_minutes) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// Where the latest forecast snapshot lives.
pub trait ForecastSource: Send + Sync {
    /// Latest stored snapshot, `None` if nothing was ever stored.
    fn latest_snapshot(&self) -> Result<Option<ForecastSnapshot>>;
}

/// JSON-file snapshot store written by the refresh job (or `cadence forecast import`).
#[derive(Debug, Clone)]
pub struct FileForecastCache {
    path: PathBuf,
}

impl FileForecastCache {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored snapshot using an atomic rename.
    pub fn store(&self, snapshot: &ForecastSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| CadenceError::io(parent, source))?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp_path, data).map_err(|source| CadenceError::io(&tmp_path, source))?;
        fs::rename(&tmp_path, &self.path).map_err(|source| CadenceError::io(&self.path, source))?;
        Ok(())
    }

    /// Merge `incoming` into the stored snapshot (if any) and persist the result.
    pub fn merge_and_store(&self, incoming: &ForecastSnapshot) -> Result<ForecastSnapshot> {
        let merged = match self.latest_snapshot()? {
            Some(existing) => existing.merged_with(incoming),
            None => ForecastSnapshot::default().merged_with(incoming),
        };
        self.store(&merged)?;
        Ok(merged)
    }
}

impl ForecastSource for FileForecastCache {
    fn latest_snapshot(&self) -> Result<Option<ForecastSnapshot>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(CadenceError::io(&self.path, error)),
        };
        let snapshot: ForecastSnapshot =
            serde_json::from_str(&raw).map_err(|error| CadenceError::ForecastData {
                details: format!("{}: {error}", self.path.display()),
            })?;
        Ok(Some(snapshot))
    }
}

/// In-process snapshot slot.
#[derive(Debug, Default)]
pub struct MemoryForecastSource {
    slot: RwLock<Option<ForecastSnapshot>>,
}

impl MemoryForecastSource {
    #[must_use]
    pub fn new(snapshot: Option<ForecastSnapshot>) -> Self {
        Self {
            slot: RwLock::new(snapshot),
        }
    }

    pub fn replace(&self, snapshot: Option<ForecastSnapshot>) {
        *self.slot.write() = snapshot;
    }
}

impl ForecastSource for MemoryForecastSource {
    fn latest_snapshot(&self) -> Result<Option<ForecastSnapshot>> {
        Ok(self.slot.read().clone())
    }
}

/// Snapshot plus its age classification.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedForecast {
    pub snapshot: ForecastSnapshot,
    pub freshness: Freshness,
}

/// Reads the most recent snapshot and classifies its age. Never refreshes.
#[derive(Clone)]
pub struct ForecastCacheReader {
    source: Arc<dyn ForecastSource>,
    policy: FreshnessPolicy,
}

impl ForecastCacheReader {
    #[must_use]
    pub fn new(source: Arc<dyn ForecastSource>, policy: FreshnessPolicy) -> Self {
        Self { source, policy }
    }

    /// Best available snapshot, expired ones included.
    ///
    /// `None` only when nothing is stored or the stored snapshot lacks a point estimate.
    pub fn get_cached_forecast(&self, now: DateTime<Utc>) -> Result<Option<CachedForecast>> {
        let Some(snapshot) = self.source.latest_snapshot()? else {
            return Ok(None);
        };
        if snapshot.forecast_c.is_none() {
            return Ok(None);
        }
        let freshness = self.policy.classify(snapshot.fetched_at, now);
        Ok(Some(CachedForecast {
            snapshot,
            freshness,
        }))
    }
}
