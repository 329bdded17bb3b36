//! Property tests for the pure control-loop functions.
//!
//! Uses `proptest` to check the analyzer window bounds, the score range, the rate
//! controller's hysteresis and floor guarantees, and interpolation endpoint/monotonicity
//! behaviour over arbitrary inputs.

use proptest::prelude::*;

use crate::control::discrepancy::{AnalyzerParams, PriorStatistics, analyze, update_samples};
use crate::control::rate::{RateLevel, RateThresholds, clamp_to_safety_floor, decide_rate};
use crate::control::state::ControlReason;
use crate::forecast::interpolate::lerp;

fn arb_rate() -> impl Strategy<Value = RateLevel> {
    prop_oneof![
        Just(RateLevel::Low),
        Just(RateLevel::Medium),
        Just(RateLevel::High),
    ]
}

fn arb_temp() -> impl Strategy<Value = f64> {
    -60.0f64..90.0
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The window never exceeds its limit and always ends with the newest value.
    #[test]
    fn window_is_bounded_and_keeps_latest(
        values in prop::collection::vec(arb_temp(), 1..200),
        limit in 1usize..64,
    ) {
        let mut samples: Vec<f64> = Vec::new();
        for v in &values {
            samples = update_samples(&samples, *v, limit);
            prop_assert!(samples.len() <= limit);
            prop_assert_eq!(samples.last().copied(), Some(*v));
        }
        let expected: Vec<f64> = values
            .iter()
            .skip(values.len().saturating_sub(limit))
            .copied()
            .collect();
        prop_assert_eq!(samples, expected);
    }

    /// s_err stays in (0, 1] for any finite forecast/observation history.
    #[test]
    fn s_err_in_unit_interval(
        pairs in prop::collection::vec((arb_temp(), arb_temp()), 1..100),
    ) {
        let params = AnalyzerParams::default();
        let mut prior = PriorStatistics::default();
        for (forecast, observed) in pairs {
            let report = analyze(forecast, observed, &prior, &params);
            prop_assert!(report.s_err > 0.0 && report.s_err <= 1.0, "s_err={}", report.s_err);
            prop_assert!(report.r >= 0.0);
            prop_assert!(report.samples.len() <= params.sample_limit);
            prior = PriorStatistics {
                samples: report.samples,
                m_ewma: Some(report.m_ewma),
            };
        }
    }

    /// Identical inputs, identical outputs; an unchanged rate is always a hold.
    #[test]
    fn decide_rate_is_deterministic(
        s_err in 0.0f64..=1.0,
        previous in prop::option::of(arb_rate()),
        floor in arb_rate(),
    ) {
        let thresholds = RateThresholds::default();
        let a = decide_rate(s_err, previous, floor, &thresholds);
        let b = decide_rate(s_err, previous, floor, &thresholds);
        prop_assert_eq!(a, b);
        if previous == Some(a.target_rate) {
            prop_assert_eq!(a.reason, ControlReason::Hold);
        }
        prop_assert!(a.target_rate >= floor);
    }

    /// The floor clamp never lowers a rate and never returns below the floor.
    #[test]
    fn clamp_respects_floor(rate in arb_rate(), floor in arb_rate()) {
        let out = clamp_to_safety_floor(rate, floor);
        prop_assert!(out.index() >= floor.index());
        prop_assert!(out >= rate);
    }

    /// From HIGH the controller never jumps straight to LOW, and a high-error score keeps HIGH.
    #[test]
    fn high_never_drops_to_low(s_err in 0.0f64..=1.0) {
        let thresholds = RateThresholds::default();
        let d = decide_rate(s_err, Some(RateLevel::High), RateLevel::Low, &thresholds);
        prop_assert!(d.target_rate >= RateLevel::Medium);
        if s_err < thresholds.escalate_high {
            prop_assert_eq!(d.target_rate, RateLevel::High);
        }
        if s_err > thresholds.escalate_medium {
            prop_assert_eq!(d.target_rate, RateLevel::Medium);
        }
    }

    /// From MEDIUM, LOW is reached only at or above the demotion threshold.
    #[test]
    fn medium_demotes_only_past_threshold(s_err in 0.0f64..=1.0) {
        let thresholds = RateThresholds::default();
        let d = decide_rate(s_err, Some(RateLevel::Medium), RateLevel::Low, &thresholds);
        if d.target_rate == RateLevel::Low {
            prop_assert!(s_err >= thresholds.demote_from_medium);
        }
    }

    /// Interpolation hits both endpoints exactly.
    #[test]
    fn lerp_endpoints(
        x1 in -1.0e9f64..1.0e9,
        dx in 1.0f64..1.0e7,
        y1 in arb_temp(),
        y2 in arb_temp(),
    ) {
        let x2 = x1 + dx;
        prop_assert_eq!(lerp(x1, y1, x2, y2, x1).to_bits(), y1.to_bits());
        prop_assert_eq!(lerp(x1, y1, x2, y2, x2).to_bits(), y2.to_bits());
    }

    /// Monotone data gives monotone interpolation across the interval.
    #[test]
    fn lerp_is_monotone(
        x1 in -1.0e6f64..1.0e6,
        dx in 1.0f64..1.0e6,
        y1 in arb_temp(),
        y2 in arb_temp(),
        mut fractions in prop::collection::vec(0.0f64..=1.0, 2..40),
    ) {
        let x2 = x1 + dx;
        fractions.sort_by(f64::total_cmp);
        let ys: Vec<f64> = fractions
            .iter()
            .map(|f| lerp(x1, y1, x2, y2, f.mul_add(dx, x1).min(x2)))
            .collect();
        for w in ys.windows(2) {
            if y2 >= y1 {
                prop_assert!(w[0] <= w[1], "{} > {}", w[0], w[1]);
            } else {
                prop_assert!(w[0] >= w[1], "{} < {}", w[0], w[1]);
            }
        }
    }
}
