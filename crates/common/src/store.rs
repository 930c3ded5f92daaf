use async_trait::async_trait;

use crate::{Outcome, PricePath, Result, RunRecord, RunStatus, SourceKey, Trial};

/// Append-only record of closed trade outcomes.
///
/// The engine only reads snapshots and appends; it never rewrites a stored outcome.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Record an outcome. Returns `false` when `outcome_id` was already recorded.
    async fn append_outcome(&self, outcome: &Outcome) -> Result<bool>;

    /// All outcomes for a key, ordered by close time (ties by id).
    async fn outcomes(&self, key: &SourceKey) -> Result<Vec<Outcome>>;
}

/// Read-only replay data from the market-data subsystem.
#[async_trait]
pub trait PricePathFeed: Send + Sync {
    async fn price_path(&self, outcome_id: &str) -> Result<Option<PricePath>>;
}

/// Persisted optimization history keyed by (source key, run id, trial id).
///
/// Only read back to resume an interrupted run.
#[async_trait]
pub trait TrialLog: Send + Sync {
    /// Resume the key's unfinished run if one exists, otherwise start a new
    /// run with `seed`.
    async fn open_run(&self, key: &SourceKey, seed: u64) -> Result<RunRecord>;

    /// Commit one trial. Each call is atomic; re-appending the same trial id is a no-op.
    async fn append_trial(&self, key: &SourceKey, run_id: &str, trial: &Trial) -> Result<()>;

    async fn trials(&self, key: &SourceKey, run_id: &str) -> Result<Vec<Trial>>;

    async fn close_run(&self, key: &SourceKey, run_id: &str, status: RunStatus) -> Result<()>;
}
