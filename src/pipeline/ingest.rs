//! Ingestion gateway: device report validation and rate → reporting-interval mapping.

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::control::rate::RateLevel;
use crate::control::state::{ControlMode, ControlReason};
use crate::core::config::{Config, IngestConfig, IntervalConfig};
use crate::core::errors::{CadenceError, Result};
use crate::logger::DecisionLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::pipeline::orchestrator::{MeasurementProcessor, ProcessingResult};

/// A validated reading, the orchestrator's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub node_id: String,
    pub observed_c: f64,
    pub battery_v: Option<f64>,
    pub humidity: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Minimal shape check: a node id and a finite temperature.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(CadenceError::validation("nodeId", "missing node id"));
        }
        if !self.observed_c.is_finite() {
            return Err(CadenceError::validation(
                "temperature",
                format!("not a finite number: {}", self.observed_c),
            ));
        }
        Ok(())
    }
}

/// Report as sent by a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    #[serde(alias = "nodeId")]
    pub device_id: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub battery_v: Option<f64>,
    /// Device clock; the receive time is used when absent.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// A measurement that passed validation, plus any soft warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedReport {
    pub measurement: Measurement,
    pub warnings: Vec<String>,
}

/// What the device is told to do next.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingDirective {
    pub node_id: String,
    /// `None` when no decision was possible and the default interval applies.
    pub target_rate: Option<RateLevel>,
    pub interval_secs: u64,
    pub mode: Option<ControlMode>,
    pub reason: Option<ControlReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessingResult>,
}

/// Validates device reports, runs them through the orchestrator, maps the rate.
pub struct IngestGateway {
    rules: IngestConfig,
    node_id: Regex,
    intervals: IntervalConfig,
    processor: Arc<MeasurementProcessor>,
    log: Option<Arc<DecisionLog>>,
}

impl IngestGateway {
    pub fn new(config: &Config, processor: Arc<MeasurementProcessor>) -> Result<Self> {
        Ok(Self {
            rules: config.ingest.clone(),
            node_id: config.node_id_regex()?,
            intervals: config.intervals.clone(),
            processor,
            log: None,
        })
    }

    #[must_use]
    pub fn with_log(mut self, log: Arc<DecisionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Check a report against the ingest rules; `received_at` stands in for a missing
    /// device timestamp.
    pub fn validate(&self, report: &DeviceReport, received_at: DateTime<Utc>) -> Result<ValidatedReport> {
        let node_id = report.device_id.trim();
        if node_id.is_empty() {
            return Err(CadenceError::validation("deviceId", "missing device id"));
        }
        if !self.node_id.is_match(node_id) {
            return Err(CadenceError::validation(
                "deviceId",
                format!("{node_id:?} does not match {}", self.rules.node_id_pattern),
            ));
        }

        let Some(observed_c) = report.temperature else {
            return Err(CadenceError::validation("temperature", "missing temperature"));
        };
        if !observed_c.is_finite() {
            return Err(CadenceError::validation(
                "temperature",
                format!("not a finite number: {observed_c}"),
            ));
        }
        if let Some(h) = report.humidity
            && !(0.0..=100.0).contains(&h)
        {
            return Err(CadenceError::validation(
                "humidity",
                format!("{h} outside [0, 100]"),
            ));
        }
        if let Some(v) = report.battery_v
            && !(v.is_finite() && v >= 0.0)
        {
            return Err(CadenceError::validation(
                "batteryV",
                format!("{v} is not a non-negative voltage"),
            ));
        }

        let mut warnings = Vec::new();
        if !(self.rules.plausible_min_c..=self.rules.plausible_max_c).contains(&observed_c) {
            warnings.push(format!(
                "temperature {observed_c} outside plausible range [{}, {}]",
                self.rules.plausible_min_c, self.rules.plausible_max_c
            ));
        }

        Ok(ValidatedReport {
            measurement: Measurement {
                node_id: node_id.to_string(),
                observed_c,
                battery_v: report.battery_v,
                humidity: report.humidity,
                timestamp: report.recorded_at.unwrap_or(received_at),
            },
            warnings,
        })
    }

    /// Validate, process, and map the decision to a reporting interval.
    ///
    /// Validation failures are returned; everything past validation yields a directive.
    pub fn handle(&self, report: &DeviceReport) -> Result<ReportingDirective> {
        let validated = match self.validate(report, Utc::now()) {
            Ok(v) => v,
            Err(err) => {
                if let Some(log) = &self.log {
                    let mut entry = LogEntry::new(EventType::ValidationRejected, Severity::Warning)
                        .with_error(&err);
                    if !report.device_id.is_empty() {
                        entry.node_id = Some(report.device_id.clone());
                    }
                    log.record(&entry);
                }
                return Err(err);
            }
        };

        let result = self.processor.process_measurement(&validated.measurement);
        let rate = result.as_ref().map(ProcessingResult::target_rate);
        Ok(ReportingDirective {
            node_id: validated.measurement.node_id,
            target_rate: rate,
            interval_secs: self.intervals.interval_for(rate).as_secs(),
            mode: result.as_ref().map(ProcessingResult::mode),
            reason: result.as_ref().map(|r| r.state.reason),
            warnings: validated.warnings,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::cache::{ForecastCacheReader, FreshnessPolicy, MemoryForecastSource};
    use crate::forecast::snapshot::{ForecastPoint, ForecastSnapshot};
    use crate::store::ControlStateStore;
    use crate::store::memory::MemoryControlStore;

    fn gateway(snapshot: Option<ForecastSnapshot>) -> (IngestGateway, Arc<MemoryControlStore>) {
        let config = Config::default();
        let store = Arc::new(MemoryControlStore::new());
        let reader = ForecastCacheReader::new(
            Arc::new(MemoryForecastSource::new(snapshot)),
            FreshnessPolicy::default(),
        );
        let processor = Arc::new(MeasurementProcessor::new(&config, reader, store.clone()));
        (IngestGateway::new(&config, processor).unwrap(), store)
    }

    fn report(id: &str, temp: f64) -> DeviceReport {
        DeviceReport {
            device_id: id.to_string(),
            temperature: Some(temp),
            humidity: Some(40.0),
            battery_v: Some(3.9),
            recorded_at: Some("2026-03-01T07:30:00Z".parse().unwrap()),
        }
    }

    #[test]
    fn wire_names_deserialize() {
        let raw = r#"{"deviceId":"ESP32-001","temperature":21.5,"humidity":40,"batteryV":3.8}"#;
        let r: DeviceReport = serde_json::from_str(raw).unwrap();
        assert_eq!(r.device_id, "ESP32-001");
        assert_eq!(r.battery_v, Some(3.8));
        assert!(r.recorded_at.is_none());
    }

    #[test]
    fn rejects_bad_fields() {
        let (g, _) = gateway(None);
        let now = Utc::now();
        let cases = [
            (report("", 20.0), "deviceId"),
            (report("bad id!", 20.0), "deviceId"),
            (report("n1", f64::INFINITY), "temperature"),
            (
                DeviceReport {
                    humidity: Some(120.0),
                    ..report("n1", 20.0)
                },
                "humidity",
            ),
            (
                DeviceReport {
                    battery_v: Some(-1.0),
                    ..report("n1", 20.0)
                },
                "batteryV",
            ),
            (
                DeviceReport {
                    temperature: None,
                    ..report("n1", 20.0)
                },
                "temperature",
            ),
        ];
        for (r, field) in cases {
            match g.validate(&r, now) {
                Err(CadenceError::Validation { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected validation error on {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn implausible_temperature_warns_but_passes() {
        let (g, _) = gateway(None);
        let v = g.validate(&report("n1", 95.0), Utc::now()).unwrap();
        assert_eq!(v.warnings.len(), 1);
        assert!((v.measurement.observed_c - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_timestamp_uses_receive_time() {
        let (g, _) = gateway(None);
        let received: DateTime<Utc> = "2026-03-02T10:00:00Z".parse().unwrap();
        let r = DeviceReport {
            recorded_at: None,
            ..report("n1", 20.0)
        };
        assert_eq!(g.validate(&r, received).unwrap().measurement.timestamp, received);
    }

    #[test]
    fn no_decision_maps_to_default_interval() {
        let (g, store) = gateway(None);
        let d = g.handle(&report("n1", 20.0)).unwrap();
        assert_eq!(d.target_rate, None);
        assert_eq!(d.interval_secs, 300);
        assert!(d.result.is_none());
        assert!(store.list_states().unwrap().is_empty());
    }

    #[test]
    fn decision_maps_rate_to_interval() {
        let snap = ForecastSnapshot {
            forecast_c: Some(20.0),
            fetched_at: Some(Utc::now()),
            full_forecast: vec![ForecastPoint::new("2026-03-01T07:30:00Z".parse().unwrap(), 20.0)],
            ..ForecastSnapshot::default()
        };
        let (g, _) = gateway(Some(snap));
        // Perfect agreement: s_err = 1 → LOW.
        let d = g.handle(&report("n1", 20.0)).unwrap();
        assert_eq!(d.target_rate, Some(RateLevel::Low));
        assert_eq!(d.interval_secs, 900);
        assert_eq!(d.mode, Some(ControlMode::Active));
    }
}
