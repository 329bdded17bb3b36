//! Control loop: discrepancy analysis, rate decisions, per-node control state.

pub mod discrepancy;
pub mod rate;
pub mod state;

#[cfg(test)]
mod test_properties;
