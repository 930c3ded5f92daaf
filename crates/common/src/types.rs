use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Side of the trades a signal source emits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Direction::Long),
            "SHORT" | "SELL" => Ok(Direction::Short),
            other => Err(Error::Other(format!("unknown direction '{other}'"))),
        }
    }
}

/// Identity of one independent signal source: (symbol, direction, source).
///
/// Every piece of per-source state in the engine is keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub symbol: String,
    pub direction: Direction,
    pub source: String,
}

impl SourceKey {
    pub fn new(symbol: impl Into<String>, direction: Direction, source: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            source: source.into(),
        }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.symbol, self.direction, self.source)
    }
}

/// Trailing-stop descriptor. Percentages are in percent units (1.5 = 1.5%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub enabled: bool,
    /// Favorable excursion that arms the trail.
    pub activation_pct: f64,
    /// Distance the stop trails behind the best excursion once armed.
    pub trail_pct: f64,
}

impl TrailingStop {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            activation_pct: 0.0,
            trail_pct: 0.0,
        }
    }

    pub fn new(activation_pct: f64, trail_pct: f64) -> Self {
        Self {
            enabled: true,
            activation_pct,
            trail_pct,
        }
    }
}

impl Default for TrailingStop {
    fn default() -> Self {
        Self::disabled()
    }
}

/// A candidate set of exit parameters. Compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConfiguration {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub trailing: TrailingStop,
    /// Favorable excursion after which the stop moves to the entry price.
    #[serde(default)]
    pub breakeven_pct: Option<f64>,
}

impl RiskConfiguration {
    pub fn fixed(take_profit_pct: f64, stop_loss_pct: f64) -> Self {
        Self {
            take_profit_pct,
            stop_loss_pct,
            trailing: TrailingStop::disabled(),
            breakeven_pct: None,
        }
    }
}

impl std::fmt::Display for RiskConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TP {:.2}% / SL {:.2}%", self.take_profit_pct, self.stop_loss_pct)?;
        if self.trailing.enabled {
            write!(
                f,
                " / trail {:.2}%@{:.2}%",
                self.trailing.trail_pct, self.trailing.activation_pct
            )?;
        }
        if let Some(be) = self.breakeven_pct {
            write!(f, " / BE@{be:.2}%")?;
        }
        Ok(())
    }
}

/// One closed trade as delivered by the outcome feed. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Stable identifier; the engine is idempotent on it.
    pub outcome_id: String,
    #[serde(flatten)]
    pub key: SourceKey,
    pub realized_pnl_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Configuration that managed the trade. `None` during baseline collection.
    #[serde(default)]
    pub applied_configuration: Option<RiskConfiguration>,
}

impl Outcome {
    pub fn is_win(&self) -> bool {
        self.realized_pnl_pct > 0.0
    }
}

/// One bar of the post-entry price path used to replay a trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Price path from entry to the actual exit of one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePath {
    pub outcome_id: String,
    pub entry_price: f64,
    pub bars: Vec<PriceBar>,
}

/// Lifecycle phase of a source key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Baseline,
    Optimizing,
    Live,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Baseline => write!(f, "baseline"),
            Phase::Optimizing => write!(f, "optimizing"),
            Phase::Live => write!(f, "live"),
        }
    }
}

/// Final or current status of one optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::TimedOut => write!(f, "timed_out"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Metric that sent a key back out of Live or Optimizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum DemotionReason {
    WinRateBelowFloor {
        win_rate: f64,
        floor: f64,
        window: usize,
    },
    ConsecutiveLosses {
        streak: usize,
        max: usize,
    },
    /// A re-optimization after a demotion found nothing above the promotion bar.
    NoQualifyingCandidate {
        best_win_rate: f64,
        bar: f64,
        candidates: usize,
    },
}

impl std::fmt::Display for DemotionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DemotionReason::WinRateBelowFloor {
                win_rate,
                floor,
                window,
            } => write!(
                f,
                "win rate {:.1}% over last {window} trades below floor {:.1}%",
                win_rate * 100.0,
                floor * 100.0
            ),
            DemotionReason::ConsecutiveLosses { streak, max } => {
                write!(f, "{streak} consecutive losses (max {max})")
            }
            DemotionReason::NoQualifyingCandidate {
                best_win_rate,
                bar,
                candidates,
            } => write!(
                f,
                "re-optimization found no qualifying candidate: best of {candidates} at {:.1}% below bar {:.1}%",
                best_win_rate * 100.0,
                bar * 100.0
            ),
        }
    }
}

/// Discrete observability events. Consumed by an external alerting subsystem.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PhaseChanged {
        key: SourceKey,
        from: Phase,
        to: Phase,
        reason: String,
    },
    Demoted {
        key: SourceKey,
        from: Phase,
        to: Phase,
        reason: DemotionReason,
    },
    OptimizationCompleted {
        key: SourceKey,
        run_id: String,
        status: RunStatus,
        trials: usize,
        front_size: usize,
        candidates: usize,
    },
    OptimizationFailed {
        key: SourceKey,
        run_id: String,
        reason: String,
    },
}

impl EngineEvent {
    pub fn key(&self) -> &SourceKey {
        match self {
            EngineEvent::PhaseChanged { key, .. }
            | EngineEvent::Demoted { key, .. }
            | EngineEvent::OptimizationCompleted { key, .. }
            | EngineEvent::OptimizationFailed { key, .. } => key,
        }
    }
}
