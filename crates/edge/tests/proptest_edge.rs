use chrono::{Duration, TimeZone, Utc};
use common::{Direction, Outcome, SourceKey};
use edge::{wilson_interval, EdgeConfig, EdgeThresholds, EdgeValidator, Recommendation, Z_95};
use proptest::prelude::*;

fn to_outcomes(pnls: &[f64]) -> Vec<Outcome> {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    pnls.iter()
        .enumerate()
        .map(|(i, &pnl)| Outcome {
            outcome_id: format!("p-{i}"),
            key: SourceKey::new("SOLUSDT", Direction::Short, "prop"),
            realized_pnl_pct: pnl,
            opened_at: start + Duration::minutes(i as i64 * 10),
            closed_at: start + Duration::minutes(i as i64 * 10 + 5),
            applied_configuration: None,
        })
        .collect()
}

fn arb_pnl() -> impl Strategy<Value = f64> {
    (-10.0..10.0_f64).prop_map(|p| (p * 100.0).round() / 100.0)
}

proptest! {
    /// The Wilson interval always brackets the observed rate inside [0, 1].
    #[test]
    fn wilson_interval_brackets_observed_rate(trials in 0usize..2_000, frac in 0.0..=1.0_f64) {
        let successes = ((trials as f64) * frac).round() as usize;
        let (lower, upper) = wilson_interval(successes, trials, Z_95);
        let observed = if trials == 0 { 0.0 } else { successes as f64 / trials as f64 };
        prop_assert!(0.0 <= lower);
        prop_assert!(lower <= observed);
        prop_assert!(observed <= upper);
        prop_assert!(upper <= 1.0);
    }

    /// Fewer than N_min outcomes never pass the gate, whatever their P&L.
    #[test]
    fn below_min_samples_never_has_edge(
        min_samples in 1usize..80,
        pnls in prop::collection::vec(arb_pnl(), 0..80),
    ) {
        prop_assume!(pnls.len() < min_samples);
        let validator = EdgeValidator::new(
            EdgeConfig { min_samples, ..EdgeConfig::default() },
            EdgeThresholds { min_win_rate: 0.0, max_ci_width: 1.0, min_expected_value: -100.0 },
        );
        let a = validator.assess(&to_outcomes(&pnls));
        prop_assert!(!a.has_edge);
        prop_assert_eq!(a.recommendation, Recommendation::CollectMoreData);
    }

    /// Assessment fields stay inside their documented ranges.
    #[test]
    fn assessment_fields_are_bounded(pnls in prop::collection::vec(arb_pnl(), 0..200)) {
        let a = EdgeValidator::new(EdgeConfig::default(), EdgeThresholds::default())
            .assess(&to_outcomes(&pnls));
        prop_assert!((0.0..=100.0).contains(&a.quality_score));
        prop_assert!((0.0..=1.0).contains(&a.p_value));
        prop_assert!(a.ci_lower <= a.win_rate && a.win_rate <= a.ci_upper);
        prop_assert_eq!(a.has_edge, a.failed_checks.is_empty());
    }
}
