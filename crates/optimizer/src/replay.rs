//! Replays stored price paths under arbitrary exit rules.
//!
//! Within one bar the stop is checked before the take-profit, so a bar that
//! spans both levels is scored as the worse outcome.

use serde::{Deserialize, Serialize};

use common::{Direction, Error, ObjectiveVector, Outcome, PricePath, Result, RiskConfiguration};

/// Below this the average loss is treated as zero and the nominal stop is
/// used as the risk unit.
const LOSS_EPSILON: f64 = 1e-9;

/// A baseline trade paired with the price path needed to re-simulate it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTrade {
    pub outcome_id: String,
    pub direction: Direction,
    pub path: PricePath,
}

impl ReplayTrade {
    pub fn new(outcome: &Outcome, path: PricePath) -> Self {
        Self {
            outcome_id: outcome.outcome_id.clone(),
            direction: outcome.key.direction,
            path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Breakeven,
    Trailing,
    /// The path ended before any rule triggered.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeExit {
    pub pnl_pct: f64,
    pub reason: ExitReason,
}

/// Replay one trade under `config`.
pub fn simulate_trade(trade: &ReplayTrade, config: &RiskConfiguration) -> Result<TradeExit> {
    let fail = |reason: &str| Error::SimulationFailure {
        outcome_id: trade.outcome_id.clone(),
        reason: reason.to_string(),
    };

    let entry = trade.path.entry_price;
    if !(entry.is_finite() && entry > 0.0) {
        return Err(fail("entry price must be positive"));
    }
    if trade.path.bars.is_empty() {
        return Err(fail("price path has no bars"));
    }

    let pct = |price: f64| (price - entry) / entry * 100.0;
    let mut peak = 0.0_f64;
    let mut last_close = 0.0;

    for bar in &trade.path.bars {
        if !(bar.high.is_finite() && bar.low.is_finite() && bar.close.is_finite()) {
            return Err(fail("non-finite price in path"));
        }
        if bar.high < bar.low {
            return Err(fail("bar high below bar low"));
        }

        let (favorable, adverse, close) = match trade.direction {
            Direction::Long => (pct(bar.high), pct(bar.low), pct(bar.close)),
            Direction::Short => (-pct(bar.low), -pct(bar.high), -pct(bar.close)),
        };

        // Stop level is set from excursions of earlier bars only.
        let mut stop = -config.stop_loss_pct;
        let mut reason = ExitReason::StopLoss;
        if let Some(be) = config.breakeven_pct {
            if peak >= be && stop < 0.0 {
                stop = 0.0;
                reason = ExitReason::Breakeven;
            }
        }
        if config.trailing.enabled && peak >= config.trailing.activation_pct {
            let trail = peak - config.trailing.trail_pct;
            if trail > stop {
                stop = trail;
                reason = ExitReason::Trailing;
            }
        }

        if adverse <= stop {
            return Ok(TradeExit { pnl_pct: stop, reason });
        }
        if favorable >= config.take_profit_pct {
            return Ok(TradeExit {
                pnl_pct: config.take_profit_pct,
                reason: ExitReason::TakeProfit,
            });
        }

        peak = peak.max(favorable);
        last_close = close;
    }

    Ok(TradeExit {
        pnl_pct: last_close,
        reason: ExitReason::Expired,
    })
}

/// Running tally of one trial's replay. Expired trades do not count.
#[derive(Debug, Clone)]
pub(crate) struct ReplayTally {
    config: RiskConfiguration,
    total: usize,
    processed: usize,
    triggered: usize,
    wins: usize,
    sum_pnl: f64,
    sum_win: f64,
    sum_loss: f64,
}

impl ReplayTally {
    pub(crate) fn new(config: RiskConfiguration, total: usize) -> Self {
        Self {
            config,
            total,
            processed: 0,
            triggered: 0,
            wins: 0,
            sum_pnl: 0.0,
            sum_win: 0.0,
            sum_loss: 0.0,
        }
    }

    pub(crate) fn push(&mut self, exit: TradeExit) {
        self.processed += 1;
        if exit.reason == ExitReason::Expired {
            return;
        }
        self.triggered += 1;
        self.sum_pnl += exit.pnl_pct;
        if exit.pnl_pct > 0.0 {
            self.wins += 1;
            self.sum_win += exit.pnl_pct;
        } else {
            self.sum_loss += exit.pnl_pct.abs();
        }
    }

    pub(crate) fn triggered(&self) -> usize {
        self.triggered
    }

    /// Objectives of the replay so far. `None` when no trade triggered.
    pub(crate) fn objectives(&self) -> Option<ObjectiveVector> {
        if self.triggered == 0 {
            return None;
        }
        let n = self.triggered as f64;
        let losses = self.triggered - self.wins;
        let avg_win = if self.wins > 0 {
            self.sum_win / self.wins as f64
        } else {
            0.0
        };
        let avg_loss = if losses > 0 {
            self.sum_loss / losses as f64
        } else {
            0.0
        };
        let risk_reward_ratio = if self.wins == 0 {
            0.0
        } else if avg_loss > LOSS_EPSILON {
            avg_win / avg_loss
        } else {
            avg_win / self.config.stop_loss_pct
        };

        let objectives = ObjectiveVector {
            win_rate: self.wins as f64 / n,
            risk_reward_ratio,
            expected_value: self.sum_pnl / n,
        };
        objectives
            .as_array()
            .iter()
            .all(|v| v.is_finite())
            .then_some(objectives)
    }

    /// Component-wise upper bound on the objectives this trial can still reach.
    ///
    /// No exit pays more than the take-profit, and expired trades drop out of
    /// the denominators, which gives monotonic bounds on win rate and EV. The
    /// risk/reward ratio is only bounded when every exit is a plain TP or SL.
    pub(crate) fn optimistic_bound(&self) -> ObjectiveVector {
        let remaining = self.total - self.processed;
        let c = self.triggered as f64;
        let r = remaining as f64;
        let tp = self.config.take_profit_pct;

        let win_rate = if self.triggered + remaining == 0 {
            0.0
        } else {
            (self.wins as f64 + r) / (c + r)
        };

        let expected_value = if self.triggered == 0 {
            if remaining > 0 {
                tp
            } else {
                0.0
            }
        } else if remaining == 0 {
            self.sum_pnl / c
        } else {
            (self.sum_pnl / c).max((self.sum_pnl + r * tp) / (c + r))
        };

        let fixed_exits = !self.config.trailing.enabled && self.config.breakeven_pct.is_none();
        let risk_reward_ratio = if fixed_exits {
            tp / self.config.stop_loss_pct
        } else {
            f64::INFINITY
        };

        ObjectiveVector {
            win_rate,
            risk_reward_ratio,
            expected_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use common::{PriceBar, TrailingStop};

    /// Build a path from (high, low, close) triples around an entry of 100.
    fn trade(direction: Direction, bars: &[(f64, f64, f64)]) -> ReplayTrade {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        ReplayTrade {
            outcome_id: "t-1".into(),
            direction,
            path: PricePath {
                outcome_id: "t-1".into(),
                entry_price: 100.0,
                bars: bars
                    .iter()
                    .enumerate()
                    .map(|(i, &(high, low, close))| PriceBar {
                        timestamp: start + Duration::minutes(i as i64),
                        high,
                        low,
                        close,
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn long_take_profit_hits() {
        let t = trade(Direction::Long, &[(100.5, 99.8, 100.2), (102.5, 100.1, 102.0)]);
        let exit = simulate_trade(&t, &RiskConfiguration::fixed(2.0, 1.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        assert_eq!(exit.pnl_pct, 2.0);
    }

    #[test]
    fn stop_is_checked_before_take_profit_in_same_bar() {
        let t = trade(Direction::Long, &[(103.0, 98.0, 101.0)]);
        let exit = simulate_trade(&t, &RiskConfiguration::fixed(2.0, 1.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert_eq!(exit.pnl_pct, -1.0);
    }

    #[test]
    fn short_direction_mirrors_excursions() {
        // Price falls 2.5%: a short's take-profit.
        let t = trade(Direction::Short, &[(100.2, 97.5, 98.0)]);
        let exit = simulate_trade(&t, &RiskConfiguration::fixed(2.0, 1.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);

        let t = trade(Direction::Short, &[(101.5, 99.9, 101.0)]);
        let exit = simulate_trade(&t, &RiskConfiguration::fixed(2.0, 1.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
    }

    #[test]
    fn breakeven_moves_stop_to_entry() {
        let config = RiskConfiguration {
            breakeven_pct: Some(1.0),
            ..RiskConfiguration::fixed(3.0, 2.0)
        };
        let t = trade(Direction::Long, &[(101.2, 99.9, 101.0), (100.5, 99.5, 99.6)]);
        let exit = simulate_trade(&t, &config).unwrap();
        assert_eq!(exit.reason, ExitReason::Breakeven);
        assert_eq!(exit.pnl_pct, 0.0);
    }

    #[test]
    fn trailing_stop_locks_in_gain() {
        let config = RiskConfiguration {
            trailing: TrailingStop::new(1.0, 0.5),
            ..RiskConfiguration::fixed(5.0, 2.0)
        };
        let t = trade(
            Direction::Long,
            &[(101.0, 99.9, 100.8), (102.0, 100.9, 101.8), (101.9, 101.2, 101.3)],
        );
        let exit = simulate_trade(&t, &config).unwrap();
        assert_eq!(exit.reason, ExitReason::Trailing);
        assert!((exit.pnl_pct - 1.5).abs() < 1e-9);
    }

    #[test]
    fn untriggered_path_expires_at_last_close() {
        let t = trade(Direction::Long, &[(100.5, 99.5, 100.3), (100.6, 99.7, 100.4)]);
        let exit = simulate_trade(&t, &RiskConfiguration::fixed(2.0, 1.0)).unwrap();
        assert_eq!(exit.reason, ExitReason::Expired);
        assert!((exit.pnl_pct - 0.4).abs() < 1e-9);
    }

    #[test]
    fn malformed_paths_fail() {
        let empty = trade(Direction::Long, &[]);
        assert!(matches!(
            simulate_trade(&empty, &RiskConfiguration::fixed(2.0, 1.0)),
            Err(Error::SimulationFailure { .. })
        ));

        let inverted = trade(Direction::Long, &[(99.0, 101.0, 100.0)]);
        assert!(simulate_trade(&inverted, &RiskConfiguration::fixed(2.0, 1.0)).is_err());
    }

    #[test]
    fn tally_ignores_expired_trades() {
        let mut tally = ReplayTally::new(RiskConfiguration::fixed(2.0, 1.0), 3);
        tally.push(TradeExit { pnl_pct: 2.0, reason: ExitReason::TakeProfit });
        tally.push(TradeExit { pnl_pct: 0.3, reason: ExitReason::Expired });
        tally.push(TradeExit { pnl_pct: -1.0, reason: ExitReason::StopLoss });
        let obj = tally.objectives().unwrap();
        assert_eq!(tally.triggered(), 2);
        assert!((obj.win_rate - 0.5).abs() < 1e-12);
        assert!((obj.risk_reward_ratio - 2.0).abs() < 1e-12);
        assert!((obj.expected_value - 0.5).abs() < 1e-12);
    }

    #[test]
    fn tally_without_triggers_has_no_objectives() {
        let mut tally = ReplayTally::new(RiskConfiguration::fixed(2.0, 1.0), 1);
        tally.push(TradeExit { pnl_pct: 0.1, reason: ExitReason::Expired });
        assert!(tally.objectives().is_none());
    }

    #[test]
    fn optimistic_bound_dominates_final_objectives() {
        let config = RiskConfiguration::fixed(2.0, 1.0);
        let exits = [2.0, -1.0, -1.0, 2.0, -1.0, 2.0];
        let mut tally = ReplayTally::new(config, exits.len());
        let mut bounds = Vec::new();
        for &pnl in &exits {
            let reason = if pnl > 0.0 { ExitReason::TakeProfit } else { ExitReason::StopLoss };
            tally.push(TradeExit { pnl_pct: pnl, reason });
            bounds.push(tally.optimistic_bound());
        }
        let last = tally.objectives().unwrap();
        for b in bounds {
            assert!(b.win_rate >= last.win_rate - 1e-12);
            assert!(b.expected_value >= last.expected_value - 1e-12);
            assert!(b.risk_reward_ratio >= last.risk_reward_ratio - 1e-12);
        }
    }
}
