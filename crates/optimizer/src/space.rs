use serde::{Deserialize, Serialize};

use common::{Error, Result, RiskConfiguration, TrailingStop};

/// One trailing-stop variant of the search space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingVariant {
    pub activation_pct: f64,
    pub trail_pct: f64,
}

/// `[optimizer.search_space]`: the discrete values explored per dimension.
///
/// "Trailing disabled" and "breakeven disabled" are always part of the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpaceConfig {
    pub take_profit_pct: Vec<f64>,
    pub stop_loss_pct: Vec<f64>,
    pub trailing: Vec<TrailingVariant>,
    pub breakeven_pct: Vec<f64>,
}

impl Default for SearchSpaceConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: vec![1.0, 1.5, 2.0, 2.5, 3.0, 4.0, 5.0, 6.0, 8.0],
            stop_loss_pct: vec![0.5, 0.75, 1.0, 1.25, 1.5, 2.0, 2.5, 3.0, 4.0],
            trailing: vec![
                TrailingVariant { activation_pct: 1.0, trail_pct: 0.5 },
                TrailingVariant { activation_pct: 1.5, trail_pct: 0.75 },
                TrailingVariant { activation_pct: 2.0, trail_pct: 1.0 },
                TrailingVariant { activation_pct: 3.0, trail_pct: 1.5 },
            ],
            breakeven_pct: Vec::new(),
        }
    }
}

/// Point in the search space: one index per dimension
/// (take profit, stop loss, trailing, breakeven).
pub type Point = [usize; 4];

/// Discrete grid of risk configurations.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    take_profit_pct: Vec<f64>,
    stop_loss_pct: Vec<f64>,
    trailing: Vec<TrailingStop>,
    breakeven_pct: Vec<Option<f64>>,
}

impl SearchSpace {
    pub fn from_config(config: &SearchSpaceConfig) -> Result<Self> {
        let positive = |name: &str, values: &[f64]| -> Result<()> {
            if values.is_empty() {
                return Err(Error::Config(format!("search space '{name}' is empty")));
            }
            if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
                return Err(Error::Config(format!(
                    "search space '{name}' contains non-positive value {bad}"
                )));
            }
            Ok(())
        };
        positive("take_profit_pct", &config.take_profit_pct)?;
        positive("stop_loss_pct", &config.stop_loss_pct)?;

        let mut trailing = vec![TrailingStop::disabled()];
        for v in &config.trailing {
            if !(v.activation_pct >= 0.0 && v.trail_pct > 0.0) {
                return Err(Error::Config(format!("invalid trailing variant {v:?}")));
            }
            trailing.push(TrailingStop::new(v.activation_pct, v.trail_pct));
        }

        let mut breakeven_pct = vec![None];
        for &be in &config.breakeven_pct {
            if !(be.is_finite() && be > 0.0) {
                return Err(Error::Config(format!("invalid breakeven_pct {be}")));
            }
            breakeven_pct.push(Some(be));
        }

        Ok(Self {
            take_profit_pct: config.take_profit_pct.clone(),
            stop_loss_pct: config.stop_loss_pct.clone(),
            trailing,
            breakeven_pct,
        })
    }

    /// Number of values per dimension.
    pub fn dims(&self) -> [usize; 4] {
        [
            self.take_profit_pct.len(),
            self.stop_loss_pct.len(),
            self.trailing.len(),
            self.breakeven_pct.len(),
        ]
    }

    /// Total number of distinct configurations.
    pub fn size(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn config_at(&self, point: &Point) -> RiskConfiguration {
        RiskConfiguration {
            take_profit_pct: self.take_profit_pct[point[0]],
            stop_loss_pct: self.stop_loss_pct[point[1]],
            trailing: self.trailing[point[2]],
            breakeven_pct: self.breakeven_pct[point[3]],
        }
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.iter().zip(self.dims()).all(|(&i, d)| i < d)
    }

    /// Point at position `ordinal` of the row-major enumeration.
    pub fn point_at(&self, ordinal: usize) -> Point {
        let dims = self.dims();
        let mut rest = ordinal;
        let mut point = [0; 4];
        for d in (0..4).rev() {
            point[d] = rest % dims[d];
            rest /= dims[d];
        }
        point
    }

    /// Row-major position of `point`; inverse of [`point_at`](Self::point_at).
    pub fn ordinal(&self, point: &Point) -> usize {
        let dims = self.dims();
        point
            .iter()
            .zip(dims)
            .fold(0, |acc, (&i, d)| acc * d + i)
    }
}
