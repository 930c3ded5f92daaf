use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bandit::Arm;
use common::{Phase, RunStatus, SourceKey};
use edge::EdgeAssessment;

/// Summary of the most recent optimization run for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub trials: usize,
    pub front_size: usize,
    /// Set when the run produced nothing usable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Everything the engine knows about one signal source.
///
/// Exactly one exists per key. Written only by that key's worker; every write
/// goes through [`crate::SelectionStore::save`] with optimistic versioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionState {
    pub key: SourceKey,
    pub phase: Phase,
    /// Stored version this value was read at. 0 = never stored.
    pub version: u64,
    /// Live candidates with their Thompson posteriors. Empty outside Live.
    pub candidates: Vec<Arm>,
    /// Latest edge assessment, replaced on every Baseline outcome.
    pub assessment: Option<EdgeAssessment>,
    /// Win/loss of the most recent live outcomes, capped at the live window.
    pub live_results: VecDeque<bool>,
    pub consecutive_losses: usize,
    /// Soft demotions since the key last left Baseline.
    pub reoptimizations: u32,
    /// Only outcomes closed after this instant count toward the edge
    /// assessment. Set on hard demotion to the feed's `closed_at` of the
    /// outcome that ended the previous episode.
    pub baseline_since: Option<DateTime<Utc>>,
    pub last_run: Option<RunSummary>,
    pub updated_at: DateTime<Utc>,
}

impl SelectionState {
    pub fn new(key: SourceKey) -> Self {
        Self {
            key,
            phase: Phase::Baseline,
            version: 0,
            candidates: Vec::new(),
            assessment: None,
            live_results: VecDeque::new(),
            consecutive_losses: 0,
            reoptimizations: 0,
            baseline_since: None,
            last_run: None,
            updated_at: Utc::now(),
        }
    }

    /// Win rate over the live window, `None` before the first live outcome.
    pub fn live_win_rate(&self) -> Option<f64> {
        if self.live_results.is_empty() {
            return None;
        }
        let wins = self.live_results.iter().filter(|w| **w).count();
        Some(wins as f64 / self.live_results.len() as f64)
    }
}
