use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use common::Outcome;

use crate::stats::{binomial_p_value, wilson_interval, Z_95};

/// Mode-dependent gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeThresholds {
    /// Minimum observed win rate (e.g. 0.62 = 62%).
    pub min_win_rate: f64,
    /// Maximum half-width of the Wilson interval (e.g. 0.15 = 15 points).
    pub max_ci_width: f64,
    /// Expected value per trade, in percent, must be strictly above this.
    pub min_expected_value: f64,
}

impl Default for EdgeThresholds {
    fn default() -> Self {
        Self {
            min_win_rate: 0.55,
            max_ci_width: 0.15,
            min_expected_value: 0.0,
        }
    }
}

/// Weights of the four quality sub-scores. Normalized by their sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub win_rate: f64,
    pub precision: f64,
    pub significance: f64,
    pub expected_value: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            win_rate: 0.25,
            precision: 0.25,
            significance: 0.25,
            expected_value: 0.25,
        }
    }
}

/// `[edge]` section of the engine config file.
///
/// ```toml
/// [edge]
/// min_samples = 30
/// min_win_rate = 0.55
///
/// [edge.modes.scalp]
/// min_win_rate = 0.62
/// max_ci_width = 0.15
/// min_expected_value = 0.05
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// N_min: below this many outcomes the gate always answers "collect more data".
    pub min_samples: usize,
    /// Win rate under the null hypothesis of no edge.
    pub null_win_rate: f64,
    /// Significance level for the one-sided binomial test.
    pub alpha: f64,
    /// Evaluate only the most recent `window` outcomes when set.
    pub window: Option<usize>,
    pub weights: QualityWeights,
    #[serde(flatten)]
    pub thresholds: EdgeThresholds,
    /// Per trading-mode threshold overrides.
    pub modes: HashMap<String, EdgeThresholds>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            min_samples: 30,
            null_win_rate: 0.5,
            alpha: 0.05,
            window: None,
            weights: QualityWeights::default(),
            thresholds: EdgeThresholds::default(),
            modes: HashMap::new(),
        }
    }
}

impl EdgeConfig {
    /// Thresholds for `mode`, falling back to the section defaults.
    pub fn thresholds_for(&self, mode: Option<&str>) -> EdgeThresholds {
        mode.and_then(|m| self.modes.get(m))
            .cloned()
            .unwrap_or_else(|| self.thresholds.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    CollectMoreData,
    Optimize,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::CollectMoreData => write!(f, "collect_more_data"),
            Recommendation::Optimize => write!(f, "optimize"),
        }
    }
}

/// Individual gate that an assessment can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCheck {
    SampleSize,
    WinRate,
    CiWidth,
    Significance,
    ExpectedValue,
}

/// Snapshot verdict over one window of outcomes. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAssessment {
    pub sample_size: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Half-width of the Wilson interval, compared against `max_ci_width`.
    pub ci_half_width: f64,
    pub p_value: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub expected_value: f64,
    pub has_edge: bool,
    /// Weighted composite in [0, 100].
    pub quality_score: f64,
    pub recommendation: Recommendation,
    pub failed_checks: Vec<EdgeCheck>,
}

/// Decides whether a stream of outcomes shows a statistically defensible edge.
///
/// Pure over its input: the same outcome sequence always yields the same assessment.
#[derive(Debug, Clone)]
pub struct EdgeValidator {
    config: EdgeConfig,
    thresholds: EdgeThresholds,
}

impl EdgeValidator {
    pub fn new(config: EdgeConfig, thresholds: EdgeThresholds) -> Self {
        Self { config, thresholds }
    }

    /// Build a validator using the thresholds of the given trading mode.
    pub fn for_mode(config: EdgeConfig, mode: Option<&str>) -> Self {
        let thresholds = config.thresholds_for(mode);
        Self::new(config, thresholds)
    }

    pub fn thresholds(&self) -> &EdgeThresholds {
        &self.thresholds
    }

    /// Assess `outcomes`, oldest first.
    pub fn assess(&self, outcomes: &[Outcome]) -> EdgeAssessment {
        let window = match self.config.window {
            Some(w) if outcomes.len() > w => &outcomes[outcomes.len() - w..],
            _ => outcomes,
        };

        let n = window.len();
        let wins = window.iter().filter(|o| o.is_win()).count();
        let losses = n - wins;
        let win_rate = if n > 0 { wins as f64 / n as f64 } else { 0.0 };

        let avg_win_pct = if wins > 0 {
            window
                .iter()
                .filter(|o| o.is_win())
                .map(|o| o.realized_pnl_pct)
                .sum::<f64>()
                / wins as f64
        } else {
            0.0
        };
        let avg_loss_pct = if losses > 0 {
            window
                .iter()
                .filter(|o| !o.is_win())
                .map(|o| o.realized_pnl_pct.abs())
                .sum::<f64>()
                / losses as f64
        } else {
            0.0
        };
        let expected_value = win_rate * avg_win_pct - (1.0 - win_rate) * avg_loss_pct;

        let (ci_lower, ci_upper) = wilson_interval(wins, n, Z_95);
        let ci_half_width = (ci_upper - ci_lower) / 2.0;
        let p_value = binomial_p_value(wins, n, self.config.null_win_rate);

        let mut failed_checks = Vec::new();
        if n < self.config.min_samples {
            failed_checks.push(EdgeCheck::SampleSize);
        }
        if win_rate < self.thresholds.min_win_rate {
            failed_checks.push(EdgeCheck::WinRate);
        }
        if ci_half_width > self.thresholds.max_ci_width {
            failed_checks.push(EdgeCheck::CiWidth);
        }
        if p_value >= self.config.alpha {
            failed_checks.push(EdgeCheck::Significance);
        }
        if expected_value <= self.thresholds.min_expected_value {
            failed_checks.push(EdgeCheck::ExpectedValue);
        }

        let has_edge = failed_checks.is_empty();
        let recommendation = if has_edge {
            Recommendation::Optimize
        } else {
            Recommendation::CollectMoreData
        };

        let quality_score = if n == 0 {
            0.0
        } else {
            self.quality_score(win_rate, ci_half_width, p_value, expected_value, avg_loss_pct)
        };

        debug!(
            n,
            wins,
            win_rate,
            p_value,
            expected_value,
            has_edge,
            quality_score,
            "Edge assessed"
        );

        EdgeAssessment {
            sample_size: n,
            wins,
            win_rate,
            ci_lower,
            ci_upper,
            ci_half_width,
            p_value,
            avg_win_pct,
            avg_loss_pct,
            expected_value,
            has_edge,
            quality_score,
            recommendation,
            failed_checks,
        }
    }

    fn quality_score(
        &self,
        win_rate: f64,
        ci_half_width: f64,
        p_value: f64,
        expected_value: f64,
        avg_loss_pct: f64,
    ) -> f64 {
        let null = self.config.null_win_rate;
        let win_rate_score = if null < 1.0 {
            ((win_rate - null) / (1.0 - null)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        // A half-width of 0.5 is the widest any binomial interval can be.
        let precision_score = (1.0 - 2.0 * ci_half_width).clamp(0.0, 1.0);
        let significance_score = if self.config.alpha > 0.0 {
            (1.0 - p_value / self.config.alpha).clamp(0.0, 1.0)
        } else {
            0.0
        };
        // EV in multiples of the average loss; one full R saturates.
        let ev_score = if expected_value <= 0.0 {
            0.0
        } else if avg_loss_pct > 0.0 {
            (expected_value / avg_loss_pct).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let w = &self.config.weights;
        let total = w.win_rate + w.precision + w.significance + w.expected_value;
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = w.win_rate * win_rate_score
            + w.precision * precision_score
            + w.significance * significance_score
            + w.expected_value * ev_score;
        (100.0 * weighted / total).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use common::{Direction, SourceKey};

    fn outcomes(pnls: &[f64]) -> Vec<Outcome> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        pnls.iter()
            .enumerate()
            .map(|(i, &pnl)| Outcome {
                outcome_id: format!("o-{i}"),
                key: SourceKey::new("BTCUSDT", Direction::Long, "tv"),
                realized_pnl_pct: pnl,
                opened_at: start + Duration::hours(i as i64),
                closed_at: start + Duration::hours(i as i64) + Duration::minutes(30),
                applied_configuration: None,
            })
            .collect()
    }

    fn scenario_validator() -> EdgeValidator {
        EdgeValidator::new(
            EdgeConfig {
                min_samples: 30,
                ..EdgeConfig::default()
            },
            EdgeThresholds {
                min_win_rate: 0.62,
                max_ci_width: 0.15,
                min_expected_value: 0.0,
            },
        )
    }

    /// 28 wins of +2% and 12 losses of -1%.
    fn seventy_percent_two_to_one() -> Vec<Outcome> {
        let pnls: Vec<f64> = (0..40).map(|i| if i % 10 < 7 { 2.0 } else { -1.0 }).collect();
        outcomes(&pnls)
    }

    #[test]
    fn seventy_percent_two_to_one_has_edge() {
        let a = scenario_validator().assess(&seventy_percent_two_to_one());
        assert_eq!(a.sample_size, 40);
        assert_eq!(a.wins, 28);
        assert!((a.win_rate - 0.70).abs() < 1e-12);
        assert!((a.expected_value - 1.1).abs() < 1e-9, "EV {}", a.expected_value);
        assert!(a.p_value < 0.01);
        assert!(a.ci_half_width < 0.15, "half-width {}", a.ci_half_width);
        assert!(a.has_edge, "failed: {:?}", a.failed_checks);
        assert_eq!(a.recommendation, Recommendation::Optimize);
        assert!(a.quality_score > 50.0 && a.quality_score <= 100.0);
    }

    #[test]
    fn below_min_samples_collects_more_data() {
        let pnls = vec![2.0; 10];
        let a = scenario_validator().assess(&outcomes(&pnls));
        assert!(!a.has_edge);
        assert_eq!(a.recommendation, Recommendation::CollectMoreData);
        assert!(a.failed_checks.contains(&EdgeCheck::SampleSize));
        assert_eq!(a.recommendation.to_string(), "collect_more_data");
    }

    #[test]
    fn coin_flip_source_fails_significance() {
        let pnls: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let a = scenario_validator().assess(&outcomes(&pnls));
        assert!(!a.has_edge);
        assert!(a.failed_checks.contains(&EdgeCheck::Significance));
        assert!(a.failed_checks.contains(&EdgeCheck::WinRate));
        assert!(a.failed_checks.contains(&EdgeCheck::ExpectedValue));
    }

    #[test]
    fn high_win_rate_with_negative_ev_is_rejected() {
        // 80% winners of +0.5%, 20% losers of -5%.
        let pnls: Vec<f64> = (0..50).map(|i| if i % 5 == 0 { -5.0 } else { 0.5 }).collect();
        let a = scenario_validator().assess(&outcomes(&pnls));
        assert!(a.expected_value < 0.0);
        assert_eq!(a.failed_checks, vec![EdgeCheck::ExpectedValue]);
    }

    #[test]
    fn empty_history_is_well_formed() {
        let a = scenario_validator().assess(&[]);
        assert_eq!(a.sample_size, 0);
        assert_eq!(a.win_rate, 0.0);
        assert_eq!((a.ci_lower, a.ci_upper), (0.0, 1.0));
        assert_eq!(a.quality_score, 0.0);
        assert!(!a.has_edge);
    }

    #[test]
    fn window_limits_to_most_recent_outcomes() {
        // 40 losers followed by the 40-trade winning scenario.
        let mut pnls = vec![-1.0; 40];
        pnls.extend(seventy_percent_two_to_one().iter().map(|o| o.realized_pnl_pct));
        let validator = EdgeValidator::new(
            EdgeConfig {
                window: Some(40),
                ..EdgeConfig::default()
            },
            scenario_validator().thresholds().clone(),
        );
        let a = validator.assess(&outcomes(&pnls));
        assert_eq!(a.sample_size, 40);
        assert!(a.has_edge);
    }

    #[test]
    fn assessment_is_deterministic() {
        let history = seventy_percent_two_to_one();
        let v = scenario_validator();
        assert_eq!(v.assess(&history), v.assess(&history));
    }

    #[test]
    fn mode_overrides_thresholds() {
        let mut config = EdgeConfig::default();
        config.modes.insert(
            "scalp".into(),
            EdgeThresholds {
                min_win_rate: 0.75,
                ..EdgeThresholds::default()
            },
        );
        let strict = EdgeValidator::for_mode(config.clone(), Some("scalp"));
        assert!(!strict.assess(&seventy_percent_two_to_one()).has_edge);

        let fallback = EdgeValidator::for_mode(config, Some("swing"));
        assert_eq!(fallback.thresholds(), &EdgeThresholds::default());
    }
}
