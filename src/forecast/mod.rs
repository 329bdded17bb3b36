//! Forecast side of the pipeline: snapshot model, cache reader, timeline interpolation.

pub mod cache;
pub mod interpolate;
pub mod pool;
pub mod snapshot;
