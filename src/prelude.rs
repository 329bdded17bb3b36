//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use sensor_cadence::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{CadenceError, Result};

// Control
pub use crate::control::discrepancy::{AnalyzerParams, DiscrepancyReport, analyze};
pub use crate::control::rate::{RateDecision, RateLevel, RateThresholds, decide_rate};
pub use crate::control::state::{ControlMode, ControlReason, NodeControlState};

// Forecast
pub use crate::forecast::cache::{
    FileForecastCache, ForecastCacheReader, ForecastSource, Freshness, FreshnessPolicy,
};
pub use crate::forecast::interpolate::{ForecastEstimate, MatchQuality, forecast_for};
pub use crate::forecast::snapshot::{ForecastPoint, ForecastSnapshot};

// Pipeline
pub use crate::pipeline::ingest::{DeviceReport, IngestGateway, Measurement, ReportingDirective};
pub use crate::pipeline::orchestrator::{MeasurementProcessor, ProcessingResult};

// Store
pub use crate::store::ControlStateStore;
pub use crate::store::memory::MemoryControlStore;
#[cfg(feature = "sqlite")]
pub use crate::store::sqlite::SqliteControlStore;
