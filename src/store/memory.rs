//! In-memory control state store for embedding and deterministic tests.
//!
//! Supports fault injection so each rung of the orchestrator's fallback ladder can be
//! exercised without a real database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::control::state::NodeControlState;
use crate::core::errors::{CadenceError, Result};
use crate::store::{ControlStateStore, PersistBatch, ProcessedMeasurementRow, ScoreLogRow};

#[derive(Debug, Default)]
struct Tables {
    states: BTreeMap<String, NodeControlState>,
    measurements: Vec<ProcessedMeasurementRow>,
    scores: Vec<ScoreLogRow>,
}

/// `RwLock`-guarded tables; a commit holds the write lock for all three writes.
#[derive(Debug, Default)]
pub struct MemoryControlStore {
    tables: RwLock<Tables>,
    fail_loads: AtomicBool,
    fail_commits: AtomicBool,
    commits: AtomicU64,
}

impl MemoryControlStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `load` fail.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `commit` fail without writing anything.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Seed a node's state directly, bypassing the measurement and score logs.
    pub fn insert_state(&self, state: NodeControlState) {
        self.tables
            .write()
            .states
            .insert(state.node_id.clone(), state);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Total rows in the processed-measurement log.
    pub fn measurement_count(&self) -> usize {
        self.tables.read().measurements.len()
    }

    /// Total rows in the score log.
    pub fn score_count(&self) -> usize {
        self.tables.read().scores.len()
    }
}

fn newest_first<T: Clone>(rows: &[T], matches: impl Fn(&T) -> bool, limit: u32) -> Vec<T> {
    rows.iter()
        .rev()
        .filter(|row| matches(row))
        .take(limit as usize)
        .cloned()
        .collect()
}

impl ControlStateStore for MemoryControlStore {
    fn load(&self, node_id: &str) -> Result<Option<NodeControlState>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(CadenceError::Runtime {
                details: format!("injected load failure for {node_id}"),
            });
        }
        Ok(self.tables.read().states.get(node_id).cloned())
    }

    fn commit(&self, batch: &PersistBatch) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(CadenceError::Sql {
                context: "memory_commit",
                details: "injected commit failure".to_string(),
            });
        }
        let mut tables = self.tables.write();
        if tables.states.get(&batch.state.node_id) != batch.previous.as_ref() {
            return Err(CadenceError::StateConflict {
                node_id: batch.state.node_id.clone(),
            });
        }
        tables.measurements.push(batch.measurement.clone());
        tables
            .states
            .insert(batch.state.node_id.clone(), batch.state.clone());
        if let Some(score) = &batch.score {
            tables.scores.push(score.clone());
        }
        drop(tables);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_states(&self) -> Result<Vec<NodeControlState>> {
        Ok(self.tables.read().states.values().cloned().collect())
    }

    fn recent_measurements(
        &self,
        node_id: &str,
        limit: u32,
    ) -> Result<Vec<ProcessedMeasurementRow>> {
        let tables = self.tables.read();
        Ok(newest_first(
            &tables.measurements,
            |row| row.node_id == node_id,
            limit,
        ))
    }

    fn recent_scores(&self, node_id: &str, limit: u32) -> Result<Vec<ScoreLogRow>> {
        let tables = self.tables.read();
        Ok(newest_first(&tables.scores, |row| row.node_id == node_id, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::rate::RateLevel;
    use crate::control::state::{ControlMode, ControlReason};
    use crate::forecast::interpolate::MatchQuality;
    use chrono::{DateTime, Utc};

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn batch(node: &str, observed: f64, with_score: bool) -> PersistBatch {
        let ts = at("2026-03-01T12:00:00Z");
        PersistBatch {
            measurement: ProcessedMeasurementRow {
                node_id: node.to_string(),
                observed_c: observed,
                forecast_c: 20.0,
                abs_error: (observed - 20.0).abs(),
                battery_v: Some(3.7),
                humidity: None,
                match_quality: MatchQuality::Interpolated,
                target_rate: RateLevel::Medium,
                mode: ControlMode::Active,
                measured_at: ts,
                processed_at: ts,
            },
            state: NodeControlState {
                node_id: node.to_string(),
                target_rate: RateLevel::Medium,
                previous_rate: None,
                m_ewma: 1.0,
                sigma_day: 1.0,
                samples: vec![observed],
                s_err: 0.36,
                last_observed_c: observed,
                last_forecast_c: 20.0,
                last_updated_at: ts,
                reason: ControlReason::BaselineThreshold,
                mode: ControlMode::Active,
            },
            previous: None,
            score: with_score.then(|| ScoreLogRow {
                node_id: node.to_string(),
                s_err: 0.36,
                r: 1.0,
                m_ewma: 1.0,
                sigma_day: 1.0,
                abs_error: 1.0,
                target_rate: RateLevel::Medium,
                previous_rate: None,
                reason: ControlReason::BaselineThreshold,
                recorded_at: ts,
            }),
        }
    }

    #[test]
    fn commit_then_load() {
        let store = MemoryControlStore::new();
        store.commit(&batch("n1", 21.0, true)).unwrap();
        let state = store.load("n1").unwrap().expect("state stored");
        assert!((state.last_observed_c - 21.0).abs() < f64::EPSILON);
        assert_eq!(store.measurement_count(), 1);
        assert_eq!(store.score_count(), 1);
        assert!(store.load("n2").unwrap().is_none());
    }

    #[test]
    fn failed_commit_writes_nothing() {
        let store = MemoryControlStore::new();
        store.set_fail_commits(true);
        assert!(store.commit(&batch("n1", 21.0, true)).is_err());
        assert_eq!(store.measurement_count(), 0);
        assert_eq!(store.score_count(), 0);
        assert!(store.load("n1").unwrap().is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn recent_rows_newest_first_per_node() {
        let store = MemoryControlStore::new();
        let first = batch("n1", 20.0, false);
        store.commit(&first).unwrap();
        store.commit(&batch("n2", 30.0, false)).unwrap();
        let mut third = batch("n1", 22.0, true);
        third.previous = Some(first.state.clone());
        store.commit(&third).unwrap();
        let rows = store.recent_measurements("n1", 10).unwrap();
        let observed: Vec<f64> = rows.iter().map(|r| r.observed_c).collect();
        assert_eq!(observed, vec![22.0, 20.0]);
        assert_eq!(store.recent_scores("n1", 10).unwrap().len(), 1);
        assert_eq!(store.recent_measurements("n1", 1).unwrap().len(), 1);
    }

    #[test]
    fn load_failure_is_injected() {
        let store = MemoryControlStore::new();
        store.set_fail_loads(true);
        assert!(store.load("n1").is_err());
        store.set_fail_loads(false);
        assert!(store.load("n1").unwrap().is_none());
    }

    #[test]
    fn commit_against_changed_state_conflicts() {
        let store = MemoryControlStore::new();
        let first = batch("n1", 20.0, true);
        store.commit(&first).unwrap();

        // Computed as if n1 were new, but n1 already has a state.
        let err = store.commit(&batch("n1", 25.0, true)).unwrap_err();
        assert_eq!(err.code(), "CAD-2103");
        assert_eq!(store.commit_count(), 1);
        assert_eq!(store.measurement_count(), 1);
        assert_eq!(store.score_count(), 1);
        assert_eq!(store.load("n1").unwrap().unwrap(), first.state);

        let mut retried = batch("n1", 25.0, true);
        retried.previous = store.load("n1").unwrap();
        store.commit(&retried).unwrap();
        assert_eq!(store.commit_count(), 2);
    }
}
