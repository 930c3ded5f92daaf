//! Statistical edge gate: decides whether a signal source's outcomes justify
//! spending an optimization run on it.

pub mod stats;
pub mod validator;

pub use stats::{binomial_p_value, wilson_interval, Z_95};
pub use validator::{
    EdgeAssessment, EdgeCheck, EdgeConfig, EdgeThresholds, EdgeValidator, QualityWeights,
    Recommendation,
};
