//! Discrepancy analyzer: forecast-vs-observation error, EWMA smoothing, normalized score.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};

/// Default smoothing factor for the absolute-error EWMA.
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Default length of the observation window.
pub const DEFAULT_SAMPLE_LIMIT: usize = 48;

/// Spread reported for an empty or constant window. Also the lower bound used
/// when normalizing the EWMA, so `r` stays finite.
pub const SIGMA_FLOOR: f64 = 1.0;

/// Tunables for [`analyze`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerParams {
    pub alpha: f64,
    pub sample_limit: usize,
    pub sigma_floor: f64,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            sigma_floor: SIGMA_FLOOR,
        }
    }
}

/// The statistics the analyzer carries from one measurement to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorStatistics {
    pub samples: Vec<f64>,
    /// `None` on a node's first measurement.
    pub m_ewma: Option<f64>,
}

/// Output of one analysis step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyReport {
    pub abs_error: f64,
    pub samples: Vec<f64>,
    pub sigma_day: f64,
    pub m_ewma: f64,
    pub r: f64,
    pub s_err: f64,
}

/// Append `value` and keep only the most recent `limit` entries, oldest first.
#[must_use]
pub fn update_samples(prev: &[f64], value: f64, limit: usize) -> Vec<f64> {
    let keep_from = (prev.len() + 1).saturating_sub(limit);
    let mut out = Vec::with_capacity(limit.min(prev.len() + 1));
    out.extend(prev.iter().skip(keep_from).copied());
    if limit > 0 {
        out.push(value);
    }
    out
}

/// Population standard deviation, or `floor` for an empty or zero-variance window.
#[must_use]
pub fn compute_sigma_day(samples: &[f64], floor: f64) -> f64 {
    if samples.is_empty() {
        return floor;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let sigma = variance.sqrt();
    if sigma > 0.0 && sigma.is_finite() {
        sigma
    } else {
        floor
    }
}

/// One EWMA step. A missing or NaN prior starts the average at `abs_error`.
#[must_use]
pub fn update_ewma(prev: Option<f64>, abs_error: f64, alpha: f64) -> f64 {
    match prev {
        Some(p) if !p.is_nan() => alpha.mul_add(abs_error, (1.0 - alpha) * p),
        _ => abs_error,
    }
}

/// Compare one forecast with one observation and fold it into the node's statistics.
///
/// `s_err = exp(-r)` lies in `(0, 1]`: 1 when forecast and observations agree, towards 0
/// under large sustained disagreement.
#[must_use]
pub fn analyze(
    forecast_c: f64,
    observed_c: f64,
    prior: &PriorStatistics,
    params: &AnalyzerParams,
) -> DiscrepancyReport {
    let abs_error = (forecast_c - observed_c).abs();
    let samples = update_samples(&prior.samples, observed_c, params.sample_limit);
    let sigma_day = compute_sigma_day(&samples, params.sigma_floor);
    let m_ewma = update_ewma(prior.m_ewma, abs_error, params.alpha);
    let r = m_ewma / sigma_day.max(params.sigma_floor);
    // exp(-r) underflows to 0 for r beyond ~745.
    let s_err = (-r).exp().clamp(f64::MIN_POSITIVE, 1.0);

    DiscrepancyReport {
        abs_error,
        samples,
        sigma_day,
        m_ewma,
        r,
        s_err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn samples_trim_oldest_first() {
        let out = update_samples(&[1.0, 2.0, 3.0], 4.0, 3);
        assert_eq!(out, vec![2.0, 3.0, 4.0]);
        let out = update_samples(&[1.0], 2.0, 48);
        assert_eq!(out, vec![1.0, 2.0]);
    }

    #[test]
    fn samples_shrink_when_limit_lowered() {
        let prev: Vec<f64> = (0..10).map(f64::from).collect();
        let out = update_samples(&prev, 99.0, 4);
        assert_eq!(out, vec![7.0, 8.0, 9.0, 99.0]);
    }

    #[test]
    fn sigma_floor_for_empty_and_constant() {
        assert!(approx(compute_sigma_day(&[], SIGMA_FLOOR), SIGMA_FLOOR));
        assert!(approx(
            compute_sigma_day(&[20.0, 20.0, 20.0], SIGMA_FLOOR),
            SIGMA_FLOOR
        ));
    }

    #[test]
    fn sigma_is_population_std_dev() {
        // mean 5, squared deviations sum to 32, n = 8 → variance 4.
        let s = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(approx(compute_sigma_day(&s, SIGMA_FLOOR), 2.0));
    }

    #[test]
    fn ewma_cold_start_and_step() {
        assert!(approx(update_ewma(None, 0.5, 0.3), 0.5));
        assert!(approx(update_ewma(Some(f64::NAN), 0.7, 0.3), 0.7));
        assert!(approx(update_ewma(Some(1.5), 2.0, 0.3), 0.3 * 2.0 + 0.7 * 1.5));
    }

    #[test]
    fn absolute_error_against_prior_window() {
        let prior = PriorStatistics {
            samples: vec![24.0, 25.0, 26.0],
            m_ewma: Some(1.5),
        };
        let report = analyze(25.0, 27.0, &prior, &AnalyzerParams::default());
        assert!(approx(report.abs_error, 2.0));
        assert_eq!(report.samples, vec![24.0, 25.0, 26.0, 27.0]);
        assert!(approx(report.m_ewma, 1.65));
    }

    #[test]
    fn first_observation_seeds_statistics() {
        let report = analyze(
            25.0,
            25.5,
            &PriorStatistics::default(),
            &AnalyzerParams::default(),
        );
        assert!(approx(report.m_ewma, 0.5));
        assert_eq!(report.samples, vec![25.5]);
        assert!(approx(report.sigma_day, SIGMA_FLOOR));
        assert!(approx(report.r, 0.5));
        assert!(approx(report.s_err, (-0.5f64).exp()));
    }

    #[test]
    fn perfect_agreement_scores_one() {
        let report = analyze(
            18.0,
            18.0,
            &PriorStatistics::default(),
            &AnalyzerParams::default(),
        );
        assert!(approx(report.s_err, 1.0));
    }

    #[test]
    fn huge_error_stays_positive() {
        let report = analyze(
            -40.0,
            1.0e6,
            &PriorStatistics::default(),
            &AnalyzerParams::default(),
        );
        assert!(report.s_err > 0.0);
        assert!(report.s_err <= 1.0);
    }
}
