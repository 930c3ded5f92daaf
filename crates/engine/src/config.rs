use std::path::Path;

use serde::{Deserialize, Serialize};

use bandit::BanditConfig;
use common::{Error, Result};
use edge::EdgeConfig;
use optimizer::OptimizerConfig;

/// `[lifecycle]`: promotion bar and live circuit breakers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// A run is promoted to Live only if some candidate reaches this win rate.
    pub promotion_min_win_rate: f64,
    /// K: rolling window of live outcomes checked for degradation.
    pub live_window: usize,
    /// Demote when the win rate over a full window falls below this.
    pub live_min_win_rate: f64,
    /// Demote when the losing streak exceeds this.
    pub max_consecutive_losses: usize,
    /// Soft demotions allowed since leaving Baseline before the next one is hard.
    pub max_reoptimizations: u32,
    /// Keys stuck in Optimizing are retried at this interval.
    pub retry_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            promotion_min_win_rate: 0.55,
            live_window: 20,
            live_min_win_rate: 0.45,
            max_consecutive_losses: 6,
            max_reoptimizations: 1,
            retry_interval_secs: 600,
        }
    }
}

/// Engine config file (TOML).
///
/// Example `config/engine.toml`:
/// ```toml
/// mode = "swing"
///
/// [edge]
/// min_samples = 30
///
/// [optimizer]
/// trials = 100
/// n_jobs = 4
///
/// [lifecycle]
/// live_window = 20
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Selects `[edge.modes.<mode>]` thresholds.
    pub mode: Option<String>,
    pub edge: EdgeConfig,
    pub optimizer: OptimizerConfig,
    pub bandit: BanditConfig,
    pub lifecycle: LifecycleConfig,
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read engine config at '{}': {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("'{}': {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(mode) = &self.mode {
            if !self.edge.modes.contains_key(mode) {
                return Err(Error::Config(format!(
                    "mode '{mode}' has no [edge.modes.{mode}] section"
                )));
            }
        }
        if self.lifecycle.live_window == 0 {
            return Err(Error::Config("lifecycle.live_window must be at least 1".into()));
        }
        // Surfaces search-space errors at startup rather than at the first run.
        optimizer::Optimizer::new(self.optimizer.clone())?;
        Ok(())
    }
}
