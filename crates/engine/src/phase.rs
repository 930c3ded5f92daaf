//! Baseline → Optimizing → Live, with demotion back out of Live.
//!
//! Pure state transitions over [`SelectionState`]; persistence and event
//! delivery are the worker's job.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use bandit::Arm;
use common::{DemotionReason, EngineEvent, Phase};
use edge::EdgeAssessment;

use crate::config::LifecycleConfig;
use crate::state::SelectionState;

/// A phase change applied to a [`SelectionState`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Advanced { from: Phase, to: Phase, reason: String },
    Demoted { from: Phase, to: Phase, reason: DemotionReason },
}

impl Transition {
    pub fn to(&self) -> Phase {
        match self {
            Transition::Advanced { to, .. } | Transition::Demoted { to, .. } => *to,
        }
    }

    pub fn into_event(self, key: common::SourceKey) -> EngineEvent {
        match self {
            Transition::Advanced { from, to, reason } => EngineEvent::PhaseChanged {
                key,
                from,
                to,
                reason,
            },
            Transition::Demoted { from, to, reason } => EngineEvent::Demoted {
                key,
                from,
                to,
                reason,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseMachine {
    config: LifecycleConfig,
}

impl PhaseMachine {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Store a fresh Baseline assessment; advance to Optimizing on an edge.
    pub fn on_assessment(
        &self,
        state: &mut SelectionState,
        assessment: EdgeAssessment,
    ) -> Option<Transition> {
        if state.phase != Phase::Baseline {
            return None;
        }
        let has_edge = assessment.has_edge;
        let reason = format!(
            "edge found: win rate {:.1}% over {} outcomes, p = {:.4}, quality {:.0}",
            assessment.win_rate * 100.0,
            assessment.sample_size,
            assessment.p_value,
            assessment.quality_score
        );
        state.assessment = Some(assessment);
        if !has_edge {
            return None;
        }
        Some(self.advance(state, Phase::Optimizing, reason))
    }

    /// Install the candidates of a finished run. Advances to Live when at
    /// least one clears the promotion bar. Otherwise a first optimization
    /// stays in Optimizing and is retried later, while a re-optimization
    /// after a demotion hard-demotes to Baseline.
    ///
    /// `episode_end` is the close time of the newest outcome the run saw.
    pub fn on_candidates(
        &self,
        state: &mut SelectionState,
        arms: Vec<Arm>,
        episode_end: Option<DateTime<Utc>>,
    ) -> Option<Transition> {
        if state.phase != Phase::Optimizing {
            return None;
        }
        let floor = self.config.promotion_min_win_rate;
        let best = arms
            .iter()
            .map(|a| a.objectives.win_rate)
            .fold(f64::NEG_INFINITY, f64::max);
        if arms.is_empty() || best < floor {
            info!(
                key = %state.key,
                candidates = arms.len(),
                best_win_rate = best,
                floor,
                reoptimizations = state.reoptimizations,
                "No candidate clears the promotion bar"
            );
            if state.reoptimizations == 0 {
                return None;
            }
            let reason = DemotionReason::NoQualifyingCandidate {
                best_win_rate: if arms.is_empty() { 0.0 } else { best },
                bar: floor,
                candidates: arms.len(),
            };
            return Some(self.demote(state, reason, true, episode_end));
        }

        state.candidates = arms;
        state.live_results.clear();
        state.consecutive_losses = 0;
        let reason = format!(
            "{} candidates, best simulated win rate {:.1}% (bar {:.1}%)",
            state.candidates.len(),
            best * 100.0,
            floor * 100.0
        );
        Some(self.advance(state, Phase::Live, reason))
    }

    /// Fold one live outcome, closed at `closed_at`, into the rolling window
    /// and trip the circuit breaker if performance degraded. Leaving Live
    /// ends the episode, so a degradation demotes at most once.
    pub fn on_live_outcome(
        &self,
        state: &mut SelectionState,
        win: bool,
        closed_at: DateTime<Utc>,
    ) -> Option<Transition> {
        if state.phase != Phase::Live {
            return None;
        }

        state.live_results.push_back(win);
        while state.live_results.len() > self.config.live_window {
            state.live_results.pop_front();
        }
        state.consecutive_losses = if win { 0 } else { state.consecutive_losses + 1 };

        let reason = self.degradation(state)?;
        let hard = state.reoptimizations >= self.config.max_reoptimizations;
        Some(self.demote(state, reason, hard, Some(closed_at)))
    }

    fn degradation(&self, state: &SelectionState) -> Option<DemotionReason> {
        if state.consecutive_losses > self.config.max_consecutive_losses {
            return Some(DemotionReason::ConsecutiveLosses {
                streak: state.consecutive_losses,
                max: self.config.max_consecutive_losses,
            });
        }
        if state.live_results.len() >= self.config.live_window {
            let win_rate = state.live_win_rate().unwrap_or(0.0);
            if win_rate < self.config.live_min_win_rate {
                return Some(DemotionReason::WinRateBelowFloor {
                    win_rate,
                    floor: self.config.live_min_win_rate,
                    window: state.live_results.len(),
                });
            }
        }
        None
    }

    /// Soft demotion goes to Optimizing. Hard demotion goes to Baseline and
    /// starts a new episode: only outcomes closed after `episode_end` count
    /// toward the next assessment.
    fn demote(
        &self,
        state: &mut SelectionState,
        reason: DemotionReason,
        hard: bool,
        episode_end: Option<DateTime<Utc>>,
    ) -> Transition {
        let from = state.phase;
        let to = if hard {
            state.reoptimizations = 0;
            state.assessment = None;
            if episode_end.is_some() {
                state.baseline_since = episode_end;
            }
            Phase::Baseline
        } else {
            state.reoptimizations += 1;
            Phase::Optimizing
        };

        state.phase = to;
        state.candidates.clear();
        state.live_results.clear();
        state.consecutive_losses = 0;
        state.updated_at = Utc::now();

        warn!(key = %state.key, %from, %to, %reason, "Source demoted");
        Transition::Demoted { from, to, reason }
    }

    fn advance(&self, state: &mut SelectionState, to: Phase, reason: String) -> Transition {
        let from = state.phase;
        state.phase = to;
        state.updated_at = Utc::now();
        info!(key = %state.key, %from, %to, %reason, "Phase advanced");
        Transition::Advanced { from, to, reason }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
