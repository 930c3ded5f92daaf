use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use common::{ObjectiveVector, RiskConfiguration};

/// `[bandit]` section of the engine config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Scales how much each observed trade moves the posterior. Above 1.0 the
    /// draws stay closer to the uniform prior (more exploration); below 1.0
    /// they sharpen (more exploitation).
    pub temperature: f64,
    /// Fixed seed for reproducible selection; drawn from entropy when absent.
    pub seed: Option<u64>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            seed: None,
        }
    }
}

/// One live candidate with its Beta posterior over the win probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    /// Trial that produced this configuration.
    pub trial_id: u32,
    pub config: RiskConfiguration,
    /// Objectives measured during optimization.
    pub objectives: ObjectiveVector,
    pub alpha: f64,
    pub beta: f64,
    pub pulls: u64,
}

impl Arm {
    /// Fresh arm with the uniform Beta(1, 1) prior.
    pub fn new(trial_id: u32, config: RiskConfiguration, objectives: ObjectiveVector) -> Self {
        Self {
            trial_id,
            config,
            objectives,
            alpha: 1.0,
            beta: 1.0,
            pulls: 0,
        }
    }

    /// Fold one closed trade into the posterior. Counts only ever grow.
    pub fn record(&mut self, win: bool) {
        if win {
            self.alpha += 1.0;
        } else {
            self.beta += 1.0;
        }
        self.pulls += 1;
    }

    pub fn wins(&self) -> u64 {
        (self.alpha - 1.0).round() as u64
    }

    pub fn losses(&self) -> u64 {
        (self.beta - 1.0).round() as u64
    }

    /// Posterior mean of the win probability.
    pub fn posterior_mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

/// Thompson sampling over independent Beta posteriors.
pub struct ThompsonSelector {
    rng: StdRng,
    temperature: f64,
}

impl ThompsonSelector {
    pub fn new(config: &BanditConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let temperature = if config.temperature.is_finite() && config.temperature > 0.0 {
            config.temperature
        } else {
            1.0
        };
        Self { rng, temperature }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Index of the arm with the highest posterior draw, `None` if there are
    /// no arms. Ties go to the lower index. Arms whose posterior cannot be
    /// sampled are skipped.
    pub fn select(&mut self, arms: &[Arm]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in arms.iter().enumerate() {
            let Some(draw) = self.sample(arm) else {
                warn!(trial_id = arm.trial_id, alpha = arm.alpha, beta = arm.beta, "Invalid posterior; arm skipped");
                continue;
            };
            if best.map_or(true, |(_, b)| draw > b) {
                best = Some((i, draw));
            }
        }
        if let Some((i, draw)) = best {
            debug!(arm = i, draw, trial_id = arms[i].trial_id, "Bandit selected arm");
        }
        best.map(|(i, _)| i)
    }

    /// One draw from the arm's tempered posterior
    /// Beta(1 + wins / T, 1 + losses / T).
    pub fn sample(&mut self, arm: &Arm) -> Option<f64> {
        let a = 1.0 + (arm.alpha - 1.0).max(0.0) / self.temperature;
        let b = 1.0 + (arm.beta - 1.0).max(0.0) / self.temperature;
        let posterior = Beta::new(a, b).ok()?;
        Some(posterior.sample(&mut self.rng))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
