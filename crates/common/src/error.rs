use thiserror::Error;

use crate::SourceKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Concurrent update on {key}: expected version {expected_version}")]
    ConcurrentUpdate {
        key: SourceKey,
        expected_version: u64,
    },

    #[error("Degenerate search space: {0}")]
    DegenerateSearchSpace(String),

    #[error("Simulation failed for outcome {outcome_id}: {reason}")]
    SimulationFailure { outcome_id: String, reason: String },

    #[error("Engine is not running")]
    EngineUnavailable,

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
