//! Multi-objective risk-parameter search.
//!
//! Baseline trades are replayed under candidate exit rules, the resulting
//! (win rate, risk/reward, expected value) vectors are reduced to a Pareto
//! front, and a handful of diverse front points are handed to the bandit.

pub mod candidates;
pub mod pareto;
pub mod replay;
pub mod sampler;
pub mod space;
pub mod study;

pub use candidates::{select_candidates, Candidate, CandidateRole, MAX_CANDIDATES};
pub use pareto::{dominates, FrontPoint, ParetoFront};
pub use replay::{simulate_trade, ExitReason, ReplayTrade, TradeExit};
pub use sampler::{EvolutionarySampler, ExhaustiveSampler, Sampler};
pub use space::{Point, SearchSpace, SearchSpaceConfig, TrailingVariant};
pub use study::{OptimizationResult, Optimizer, OptimizerConfig, TrialRecorder};
