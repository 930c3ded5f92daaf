use serde::{Deserialize, Serialize};

use crate::RiskConfiguration;

/// The three objectives every trial is scored on. All are maximized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveVector {
    /// Fraction of triggered trades that closed positive, in [0, 1].
    pub win_rate: f64,
    /// Average win over average loss.
    pub risk_reward_ratio: f64,
    /// Mean realized P&L per triggered trade, in percent.
    pub expected_value: f64,
}

impl ObjectiveVector {
    pub fn as_array(&self) -> [f64; 3] {
        [self.win_rate, self.risk_reward_ratio, self.expected_value]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TrialState {
    Complete,
    /// Stopped early: its optimistic bound was already dominated.
    Pruned,
    /// Replay could not be computed, or no trade triggered.
    Failed,
}

/// One evaluated point of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: u32,
    /// Position of the configuration in each search-space dimension
    /// (take profit, stop loss, trailing, breakeven).
    pub indices: [usize; 4],
    pub config: RiskConfiguration,
    pub state: TrialState,
    /// Present only for `Complete` trials.
    pub objectives: Option<ObjectiveVector>,
    /// Trades whose replay hit a rule (the objectives' sample size).
    pub triggered_trades: usize,
    /// Reason recorded for `Failed` trials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Trial {
    pub fn is_complete(&self) -> bool {
        self.state == TrialState::Complete && self.objectives.is_some()
    }
}

/// Handle on an optimization run returned when a run is opened or resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub seed: u64,
    /// True when an interrupted run for the same key was picked up again.
    pub resumed: bool,
}
