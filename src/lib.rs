#![forbid(unsafe_code)]

//! Sensor Cadence: adaptive reporting-rate control for field temperature sensors.
//!
//! Each device report is compared with a cached weather forecast for the same
//! moment. The discrepancy feeds a per-node EWMA/spread analyzer, and the resulting
//! score picks the next reporting rate:
//! 1. **Forecast cache**: stored provider snapshots and per-timestamp interpolation
//! 2. **Control**: discrepancy scoring and the hysteresis rate controller
//! 3. **Pipeline**: ingest validation and the per-node fallback ladder
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use sensor_cadence::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use sensor_cadence::core::config::Config;
//! use sensor_cadence::control::rate::{RateLevel, decide_rate};
//! ```

pub mod prelude;

pub mod control;
pub mod core;
pub mod forecast;
pub mod logger;
pub mod pipeline;
pub mod store;
