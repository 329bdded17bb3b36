//! Measurement processing orchestrator: forecast lookup → analysis → rate decision →
//! atomic persist, with a three-level fallback ladder.
//!
//! Ladder, in order of preference:
//! 1. ACTIVE: fresh decision from forecast and observation, persisted in one transaction.
//! 2. FALLBACK: no forecast (or the read timed out); reuse the stored rate, persist nothing.
//! 3. ERROR_FALLBACK: lookup, analysis, or persistence failed; re-read and reuse the stored
//!    rate, persist nothing.
//!
//! When no rung applies the result is `None` and the caller picks its default interval.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::discrepancy::{AnalyzerParams, PriorStatistics, analyze};
use crate::control::rate::{RateLevel, RateThresholds, decide_rate};
use crate::control::state::{ControlMode, ControlReason, NodeControlState};
use crate::core::config::Config;
use crate::core::errors::{CadenceError, Result};
use crate::forecast::cache::{ForecastCacheReader, Freshness};
use crate::forecast::interpolate::{ForecastEstimate, forecast_for};
use crate::forecast::pool::{ForecastReadPool, PooledRead};
use crate::logger::DecisionLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::pipeline::ingest::Measurement;
use crate::pipeline::node_locks::NodeLocks;
use crate::store::{ControlStateStore, PersistBatch, ProcessedMeasurementRow, ScoreLogRow};

/// Outcome of one processed measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    #[serde(flatten)]
    pub state: NodeControlState,
    /// Present only for ACTIVE results.
    pub abs_error: Option<f64>,
    pub r: Option<f64>,
    pub forecast: Option<ForecastEstimate>,
    pub freshness: Option<Freshness>,
}

impl ProcessingResult {
    fn reused(state: NodeControlState) -> Self {
        Self {
            state,
            abs_error: None,
            r: None,
            forecast: None,
            freshness: None,
        }
    }

    #[must_use]
    pub fn target_rate(&self) -> RateLevel {
        self.state.target_rate
    }

    #[must_use]
    pub fn mode(&self) -> ControlMode {
        self.state.mode
    }
}

enum ForecastLookup {
    Found {
        estimate: ForecastEstimate,
        freshness: Freshness,
    },
    Missing,
    TimedOut,
}

enum Step {
    Decided(ProcessingResult),
    /// No usable forecast; carries the stored state, if any.
    NoForecast {
        previous: Option<NodeControlState>,
        timed_out: bool,
    },
}

/// Runs measurements through the decision pipeline.
pub struct MeasurementProcessor {
    params: AnalyzerParams,
    thresholds: RateThresholds,
    safety_floor: RateLevel,
    read_timeout: Duration,
    forecast: ForecastReadPool,
    store: Arc<dyn ControlStateStore>,
    locks: NodeLocks,
    log: Option<Arc<DecisionLog>>,
}

impl MeasurementProcessor {
    #[must_use]
    pub fn new(
        config: &Config,
        forecast: ForecastCacheReader,
        store: Arc<dyn ControlStateStore>,
    ) -> Self {
        Self {
            params: config.control.analyzer_params(),
            thresholds: config.control.thresholds,
            safety_floor: config.control.safety_floor,
            read_timeout: config.forecast.read_timeout(),
            forecast: ForecastReadPool::new(forecast, config.forecast.reader_threads),
            store,
            locks: NodeLocks::new(),
            log: None,
        }
    }

    /// Record pipeline events to `log`.
    #[must_use]
    pub fn with_log(mut self, log: Arc<DecisionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Process one measurement. Never returns an error: failures fall down the ladder.
    ///
    /// Calls for the same node are serialized; calls for different nodes run in parallel.
    pub fn process_measurement(&self, measurement: &Measurement) -> Option<ProcessingResult> {
        if let Err(err) = measurement.validate() {
            self.record(
                LogEntry::new(EventType::NoDecision, Severity::Warning)
                    .for_node(&measurement.node_id)
                    .with_error(&err),
            );
            return None;
        }
        self.locks
            .with_node(&measurement.node_id, || self.process_locked(measurement))
    }

    fn process_locked(&self, m: &Measurement) -> Option<ProcessingResult> {
        let started = Instant::now();
        match self.try_process(m) {
            Ok(Step::Decided(result)) => {
                self.record_decision(m, &result, started.elapsed());
                Some(result)
            }
            Ok(Step::NoForecast {
                previous,
                timed_out,
            }) => self.forecast_fallback(m, previous, timed_out),
            Err(err) => self.error_fallback(m, &err),
        }
    }

    fn try_process(&self, m: &Measurement) -> Result<Step> {
        let now = Utc::now();
        let lookup = self.lookup_forecast(m.timestamp, now)?;
        let previous = self.store.load(&m.node_id)?;

        let (estimate, freshness) = match lookup {
            ForecastLookup::Found {
                estimate,
                freshness,
            } => (estimate, freshness),
            ForecastLookup::Missing => {
                return Ok(Step::NoForecast {
                    previous,
                    timed_out: false,
                });
            }
            ForecastLookup::TimedOut => {
                return Ok(Step::NoForecast {
                    previous,
                    timed_out: true,
                });
            }
        };

        let prior = previous
            .as_ref()
            .map(|p| PriorStatistics {
                samples: p.samples.clone(),
                m_ewma: Some(p.m_ewma),
            })
            .unwrap_or_default();
        let report = analyze(estimate.forecast_c, m.observed_c, &prior, &self.params);
        if !(report.s_err.is_finite() && report.m_ewma.is_finite()) {
            return Err(CadenceError::Runtime {
                details: format!(
                    "non-finite statistics for {}: s_err={} m_ewma={}",
                    m.node_id, report.s_err, report.m_ewma
                ),
            });
        }
        let decision = decide_rate(
            report.s_err,
            previous.as_ref().map(|p| p.target_rate),
            self.safety_floor,
            &self.thresholds,
        );

        let state = NodeControlState {
            node_id: m.node_id.clone(),
            target_rate: decision.target_rate,
            previous_rate: decision.previous_rate,
            m_ewma: report.m_ewma,
            sigma_day: report.sigma_day,
            samples: report.samples,
            s_err: report.s_err,
            last_observed_c: m.observed_c,
            last_forecast_c: estimate.forecast_c,
            last_updated_at: now,
            reason: decision.reason,
            mode: ControlMode::Active,
        };
        let batch = PersistBatch {
            measurement: ProcessedMeasurementRow {
                node_id: m.node_id.clone(),
                observed_c: m.observed_c,
                forecast_c: estimate.forecast_c,
                abs_error: report.abs_error,
                battery_v: m.battery_v,
                humidity: m.humidity,
                match_quality: estimate.match_quality,
                target_rate: state.target_rate,
                mode: state.mode,
                measured_at: m.timestamp,
                processed_at: now,
            },
            score: state.mode.records_score().then(|| ScoreLogRow {
                node_id: m.node_id.clone(),
                s_err: state.s_err,
                r: report.r,
                m_ewma: state.m_ewma,
                sigma_day: state.sigma_day,
                abs_error: report.abs_error,
                target_rate: state.target_rate,
                previous_rate: state.previous_rate,
                reason: state.reason,
                recorded_at: now,
            }),
            state,
            previous,
        };
        self.store.commit(&batch)?;

        Ok(Step::Decided(ProcessingResult {
            state: batch.state,
            abs_error: Some(report.abs_error),
            r: Some(report.r),
            forecast: Some(estimate),
            freshness: Some(freshness),
        }))
    }

    /// Cache read bounded by `read_timeout`; a late answer counts as no forecast.
    fn lookup_forecast(&self, target: DateTime<Utc>, now: DateTime<Utc>) -> Result<ForecastLookup> {
        let cached = match self.forecast.read(now, self.read_timeout)? {
            PooledRead::Ready(cached) => cached,
            PooledRead::TimedOut => return Ok(ForecastLookup::TimedOut),
        };

        Ok(cached
            .and_then(|c| {
                forecast_for(&c.snapshot, target).map(|estimate| ForecastLookup::Found {
                    estimate,
                    freshness: c.freshness,
                })
            })
            .unwrap_or(ForecastLookup::Missing))
    }

    fn forecast_fallback(
        &self,
        m: &Measurement,
        previous: Option<NodeControlState>,
        timed_out: bool,
    ) -> Option<ProcessingResult> {
        let event = if timed_out {
            EventType::ForecastTimeout
        } else {
            EventType::ForecastFallback
        };
        let Some(previous) = previous else {
            let mut entry = LogEntry::new(EventType::NoDecision, Severity::Warning).for_node(&m.node_id);
            entry.details = Some(format!("{event:?}: no forecast and no stored state"));
            self.record(entry);
            return None;
        };

        let state = previous.as_fallback(
            ControlMode::Fallback,
            ControlReason::ForecastUnavailableFallback,
        );
        let mut entry = LogEntry::new(event, Severity::Warning).for_node(&m.node_id);
        entry.target_rate = Some(state.target_rate);
        entry.reason = Some(state.reason);
        entry.mode = Some(state.mode);
        entry.observed_c = Some(m.observed_c);
        self.record(entry);
        Some(ProcessingResult::reused(state))
    }

    fn error_fallback(&self, m: &Measurement, err: &CadenceError) -> Option<ProcessingResult> {
        match self.store.load(&m.node_id) {
            Ok(Some(previous)) => {
                let state =
                    previous.as_fallback(ControlMode::ErrorFallback, ControlReason::ErrorFallback);
                let mut entry = LogEntry::new(EventType::ErrorFallback, Severity::Warning)
                    .for_node(&m.node_id)
                    .with_error(err);
                entry.target_rate = Some(state.target_rate);
                entry.reason = Some(state.reason);
                entry.mode = Some(state.mode);
                self.record(entry);
                Some(ProcessingResult::reused(state))
            }
            Ok(None) => {
                self.record(
                    LogEntry::new(EventType::NoDecision, Severity::Critical)
                        .for_node(&m.node_id)
                        .with_error(err),
                );
                None
            }
            Err(secondary) => {
                let mut entry = LogEntry::new(EventType::NoDecision, Severity::Critical)
                    .for_node(&m.node_id)
                    .with_error(err);
                entry.details = Some(format!("state re-read failed: {secondary}"));
                self.record(entry);
                None
            }
        }
    }

    fn record_decision(&self, m: &Measurement, result: &ProcessingResult, elapsed: Duration) {
        let s = &result.state;
        let mut entry =
            LogEntry::new(EventType::MeasurementProcessed, Severity::Info).for_node(&m.node_id);
        entry.target_rate = Some(s.target_rate);
        entry.previous_rate = s.previous_rate;
        entry.reason = Some(s.reason);
        entry.mode = Some(s.mode);
        entry.s_err = Some(s.s_err);
        entry.r = result.r;
        entry.abs_error = result.abs_error;
        entry.observed_c = Some(m.observed_c);
        entry.forecast_c = Some(s.last_forecast_c);
        entry.match_quality = result.forecast.map(|f| f.match_quality);
        entry.freshness = result.freshness;
        entry.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self.record(entry);
    }

    fn record(&self, entry: LogEntry) {
        if let Some(log) = &self.log {
            log.record(&entry);
        }
    }
}
