use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::{Error, ObjectiveVector, Result, RunStatus, Trial, TrialState};

use crate::pareto::{dominates, ParetoFront};
use crate::replay::{simulate_trade, ReplayTally, ReplayTrade};
use crate::sampler::{EvolutionarySampler, ExhaustiveSampler, Sampler};
use crate::space::{Point, SearchSpace, SearchSpaceConfig};

/// `[optimizer]` section of the engine config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Trial budget per run.
    pub trials: usize,
    /// Wall-clock budget per run. The run keeps the front found so far.
    pub timeout_secs: Option<u64>,
    /// Worker threads evaluating trials.
    pub n_jobs: usize,
    /// Trials proposed per round; fixed so results do not depend on `n_jobs`.
    pub batch_size: usize,
    /// Fixed seed; a fresh seed is drawn per run when absent.
    pub seed: Option<u64>,
    /// Uniform random trials before the evolutionary sampler kicks in.
    pub startup_trials: usize,
    pub mutation_rate: f64,
    /// Check the pruning bound every this many replayed trades (0 disables).
    pub prune_check_every: usize,
    /// Most recent outcomes replayed per run.
    pub window: usize,
    pub search_space: SearchSpaceConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            trials: 100,
            timeout_secs: Some(300),
            n_jobs: 4,
            batch_size: 8,
            seed: None,
            startup_trials: 20,
            mutation_rate: 0.2,
            prune_check_every: 10,
            window: 200,
            search_space: SearchSpaceConfig::default(),
        }
    }
}

/// Sink for committed trials. Called once per trial, in trial-id order.
pub trait TrialRecorder {
    fn record(&mut self, trial: &Trial) -> Result<()>;
}

impl TrialRecorder for Vec<Trial> {
    fn record(&mut self, trial: &Trial) -> Result<()> {
        self.push(trial.clone());
        Ok(())
    }
}

/// Result of one run. Cancelled runs carry no front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub status: RunStatus,
    pub trials: Vec<Trial>,
    pub front: ParetoFront,
    /// Trials evaluated in this invocation.
    pub evaluated: usize,
    /// Trials taken over from the persisted history.
    pub resumed: usize,
}

/// Multi-objective search over a discrete risk-parameter grid.
#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
    space: SearchSpace,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        let space = SearchSpace::from_config(&config.search_space)?;
        if config.trials == 0 {
            return Err(Error::Config("optimizer.trials must be at least 1".into()));
        }
        Ok(Self { config, space })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Run with the default sampler: exhaustive when the budget covers the
    /// space, evolutionary otherwise.
    pub fn run(
        &self,
        trades: &[ReplayTrade],
        seed: u64,
        prior: &[Trial],
        recorder: &mut dyn TrialRecorder,
        cancel: &AtomicBool,
    ) -> Result<OptimizationResult> {
        if self.space.size() <= self.config.trials {
            let mut sampler = ExhaustiveSampler::new();
            self.run_with_sampler(&mut sampler, trades, prior, recorder, cancel)
        } else {
            let mut sampler = EvolutionarySampler::new(
                seed,
                self.config.startup_trials,
                self.config.mutation_rate,
            );
            self.run_with_sampler(&mut sampler, trades, prior, recorder, cancel)
        }
    }

    /// Trial loop. `prior` is the persisted history of an interrupted run:
    /// the sampler is replayed forward and any proposal matching a prior trial
    /// reuses its stored result instead of being evaluated again.
    pub fn run_with_sampler(
        &self,
        sampler: &mut dyn Sampler,
        trades: &[ReplayTrade],
        prior: &[Trial],
        recorder: &mut dyn TrialRecorder,
        cancel: &AtomicBool,
    ) -> Result<OptimizationResult> {
        let budget = self.config.trials.min(self.space.size());
        let deadline = self
            .config
            .timeout_secs
            .map(|s| Instant::now() + Duration::from_secs(s));
        let prior_by_id: HashMap<u32, &Trial> = prior.iter().map(|t| (t.trial_id, t)).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_jobs.max(1))
            .build()
            .map_err(|e| Error::Other(format!("failed to build trial worker pool: {e}")))?;

        info!(
            trades = trades.len(),
            budget,
            space = self.space.size(),
            prior = prior.len(),
            "Optimization run starting"
        );

        let mut history: Vec<Trial> = Vec::with_capacity(budget);
        let mut status = RunStatus::Running;
        let mut evaluated = 0usize;
        let mut resumed = 0usize;

        while history.len() < budget {
            if cancel.load(Ordering::Relaxed) {
                status = RunStatus::Cancelled;
                break;
            }

            let mut batch: Vec<(u32, Point)> = Vec::new();
            let mut pending: Vec<Point> = Vec::new();
            while batch.len() < self.config.batch_size.max(1) && history.len() + batch.len() < budget
            {
                let Some(point) = sampler.suggest(&self.space, &history, &pending) else {
                    break;
                };
                pending.push(point);
                batch.push(((history.len() + batch.len()) as u32, point));
            }
            if batch.is_empty() {
                break;
            }

            let front: Vec<ObjectiveVector> =
                ParetoFront::from_trials(&history).objectives().copied().collect();

            let results: Vec<(Trial, bool)> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|&(trial_id, point)| {
                        match prior_by_id.get(&trial_id).filter(|t| t.indices == point) {
                            Some(&stored) => (stored.clone(), true),
                            None => (self.evaluate(trial_id, point, trades, &front), false),
                        }
                    })
                    .collect()
            });

            // A cancelled batch is discarded whole; nothing of it is committed.
            if cancel.load(Ordering::Relaxed) {
                status = RunStatus::Cancelled;
                break;
            }

            for (trial, reused) in results {
                if reused {
                    resumed += 1;
                } else {
                    recorder.record(&trial)?;
                    evaluated += 1;
                }
                debug!(trial_id = trial.trial_id, state = ?trial.state, config = %trial.config, "Trial finished");
                history.push(trial);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) && history.len() < budget {
                warn!(completed = history.len(), budget, "Optimization timed out");
                status = RunStatus::TimedOut;
                break;
            }
        }

        if status == RunStatus::Running {
            status = RunStatus::Completed;
        }

        if status == RunStatus::Cancelled {
            info!(completed = history.len(), "Optimization run cancelled");
            return Ok(OptimizationResult {
                status,
                trials: history,
                front: ParetoFront::default(),
                evaluated,
                resumed,
            });
        }

        let front = ParetoFront::from_trials(&history);
        if front.is_empty() {
            let failed = history.iter().filter(|t| t.state == TrialState::Failed).count();
            return Err(Error::DegenerateSearchSpace(format!(
                "no viable configuration among {} trials ({failed} failed)",
                history.len()
            )));
        }

        info!(
            status = %status,
            trials = history.len(),
            evaluated,
            resumed,
            front = front.len(),
            "Optimization run finished"
        );

        Ok(OptimizationResult {
            status,
            trials: history,
            front,
            evaluated,
            resumed,
        })
    }

    /// Replay every trade under the configuration at `point`.
    fn evaluate(
        &self,
        trial_id: u32,
        point: Point,
        trades: &[ReplayTrade],
        front: &[ObjectiveVector],
    ) -> Trial {
        let config = self.space.config_at(&point);
        let mut tally = ReplayTally::new(config, trades.len());
        let every = self.config.prune_check_every;

        let finish = |state, objectives, triggered, note: Option<String>| Trial {
            trial_id,
            indices: point,
            config,
            state,
            objectives,
            triggered_trades: triggered,
            note,
        };

        for (i, trade) in trades.iter().enumerate() {
            match simulate_trade(trade, &config) {
                Ok(exit) => tally.push(exit),
                Err(e) => return finish(TrialState::Failed, None, tally.triggered(), Some(e.to_string())),
            }

            let replayed = i + 1;
            if every > 0 && replayed % every == 0 && replayed < trades.len() {
                let bound = tally.optimistic_bound();
                if front.iter().any(|p| dominates(p, &bound)) {
                    return finish(TrialState::Pruned, None, tally.triggered(), None);
                }
            }
        }

        match tally.objectives() {
            Some(objectives) => finish(
                TrialState::Complete,
                Some(objectives),
                tally.triggered(),
                None,
            ),
            None => finish(
                TrialState::Failed,
                None,
                tally.triggered(),
                Some("no trade triggered an exit rule".into()),
            ),
        }
    }
}
