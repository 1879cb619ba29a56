//! Parameter optimization
//!
//! Grid search over the strategy's entry and exit knobs, each combination run
//! through the simulation engine in parallel with Rayon.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indicatif::ProgressBar;
use itertools::iproduct;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backtest::SimulationEngine;
use crate::config::{Config, StrategyConfig};
use crate::predictor::LevelPredictor;
use crate::{Bar, Symbol};

/// One point of the parameter grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    pub entry_level_count: usize,
    pub trailing_gap_pct: f64,
    pub pm_start_pct_no_dca: f64,
    pub pm_start_pct_with_dca: f64,
}

impl ParamSet {
    pub fn apply(&self, base: &StrategyConfig) -> StrategyConfig {
        base.clone()
            .with_entry_level_count(self.entry_level_count)
            .with_trailing_gap(self.trailing_gap_pct)
            .with_profit_margins(self.pm_start_pct_no_dca, self.pm_start_pct_with_dca)
    }
}

impl fmt::Display for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Levels:{} Gap:{:.2}% PM:{:.2}/{:.2}%",
            self.entry_level_count,
            self.trailing_gap_pct,
            self.pm_start_pct_no_dca,
            self.pm_start_pct_with_dca
        )
    }
}

/// Parameter grid for optimization
#[derive(Debug, Clone)]
pub struct ParamGrid {
    pub entry_level_counts: Vec<usize>,
    pub trailing_gaps: Vec<f64>,
    pub pm_no_dca: Vec<f64>,
    pub pm_with_dca: Vec<f64>,
}

impl ParamGrid {
    pub fn quick() -> Self {
        ParamGrid {
            entry_level_counts: vec![2, 3, 4],
            trailing_gaps: vec![0.5, 1.0],
            pm_no_dca: vec![5.0],
            pm_with_dca: vec![2.5],
        }
    }

    pub fn full() -> Self {
        ParamGrid {
            entry_level_counts: (1..=7).collect(),
            trailing_gaps: vec![0.25, 0.5, 1.0, 1.5],
            pm_no_dca: vec![3.0, 5.0, 7.5],
            pm_with_dca: vec![1.5, 2.5, 3.5],
        }
    }

    pub fn total_combinations(&self) -> usize {
        self.entry_level_counts.len()
            * self.trailing_gaps.len()
            * self.pm_no_dca.len()
            * self.pm_with_dca.len()
    }

    /// Every combination that yields a valid strategy on top of `base`
    pub fn generate(&self, base: &StrategyConfig) -> Vec<(ParamSet, StrategyConfig)> {
        iproduct!(
            &self.entry_level_counts,
            &self.trailing_gaps,
            &self.pm_no_dca,
            &self.pm_with_dca
        )
        .filter_map(|(&levels, &gap, &no_dca, &with_dca)| {
            let params = ParamSet {
                entry_level_count: levels,
                trailing_gap_pct: gap,
                pm_start_pct_no_dca: no_dca,
                pm_start_pct_with_dca: with_dca,
            };
            let strategy = params.apply(base);
            match strategy.validate() {
                Ok(()) => Some((params, strategy)),
                Err(e) => {
                    debug!("Skipping {}: {}", params, e);
                    None
                }
            }
        })
        .collect()
    }
}

/// Aggregated outcome of one parameter set across all symbols
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub params: ParamSet,
    pub symbols: usize,
    pub total_trades: usize,
    /// Winning trades over all trades, in percent
    pub win_rate: f64,
    pub total_pnl: f64,
    /// Mean per-symbol return
    pub total_return_pct: f64,
    /// Worst per-symbol drawdown
    pub max_drawdown_pct: f64,
    /// Mean per-symbol Sharpe
    pub sharpe_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Sharpe,
    Return,
    WinRate,
    Drawdown,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sharpe" => Ok(SortKey::Sharpe),
            "return" => Ok(SortKey::Return),
            "win_rate" => Ok(SortKey::WinRate),
            "drawdown" => Ok(SortKey::Drawdown),
            other => Err(format!(
                "unknown sort key '{}', expected sharpe, return, win_rate or drawdown",
                other
            )),
        }
    }
}

pub struct Optimizer {
    base_config: Config,
    predictor: Arc<dyn LevelPredictor>,
}

impl Optimizer {
    pub fn new(base_config: Config, predictor: Arc<dyn LevelPredictor>) -> Self {
        Optimizer {
            base_config,
            predictor,
        }
    }

    /// Run every valid grid point over `data`. Parameter sets with no
    /// simulatable symbol are dropped.
    pub fn optimize(
        &self,
        data: &BTreeMap<Symbol, Vec<Bar>>,
        grid: &ParamGrid,
        progress: Option<&ProgressBar>,
    ) -> Vec<OptimizationResult> {
        let configs = grid.generate(&self.base_config.strategy);
        info!(
            "Testing {} of {} parameter combinations over {} symbols",
            configs.len(),
            grid.total_combinations(),
            data.len()
        );

        configs
            .par_iter()
            .filter_map(|(params, strategy)| {
                let result = self.evaluate(*params, strategy, data);
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                result
            })
            .collect()
    }

    fn evaluate(
        &self,
        params: ParamSet,
        strategy: &StrategyConfig,
        data: &BTreeMap<Symbol, Vec<Bar>>,
    ) -> Option<OptimizationResult> {
        let engine = SimulationEngine::with_params(
            strategy.clone(),
            self.base_config.trading.initial_capital,
            self.base_config.backtest.warmup_bars,
            Arc::clone(&self.predictor),
        );

        let results: Vec<_> = data
            .iter()
            .filter_map(|(symbol, bars)| match engine.run(symbol, bars) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!("{} skipped for {}: {}", symbol, params, e);
                    None
                }
            })
            .collect();
        if results.is_empty() {
            return None;
        }

        let n = results.len() as f64;
        let total_trades: usize = results.iter().map(|r| r.metrics.total_trades).sum();
        let winning: usize = results.iter().map(|r| r.metrics.winning_trades).sum();

        Some(OptimizationResult {
            params,
            symbols: results.len(),
            total_trades,
            win_rate: if total_trades > 0 {
                winning as f64 / total_trades as f64 * 100.0
            } else {
                0.0
            },
            total_pnl: results.iter().map(|r| r.metrics.total_pnl).sum(),
            total_return_pct: results.iter().map(|r| r.total_return_pct).sum::<f64>() / n,
            max_drawdown_pct: results
                .iter()
                .map(|r| r.metrics.max_drawdown_pct)
                .fold(0.0, f64::max),
            sharpe_ratio: results.iter().map(|r| r.metrics.sharpe_ratio).sum::<f64>() / n,
        })
    }

    /// Best first; drawdown sorts ascending, everything else descending
    pub fn sort_results(results: &mut [OptimizationResult], key: SortKey) {
        results.sort_by(|a, b| {
            let ord = match key {
                SortKey::Sharpe => b.sharpe_ratio.partial_cmp(&a.sharpe_ratio),
                SortKey::Return => b.total_return_pct.partial_cmp(&a.total_return_pct),
                SortKey::WinRate => b.win_rate.partial_cmp(&a.win_rate),
                SortKey::Drawdown => a.max_drawdown_pct.partial_cmp(&b.max_drawdown_pct),
            };
            ord.unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::SupportLevelPredictor;
    use chrono::{Duration, TimeZone, Utc};

    fn result(sharpe: f64, ret: f64, win: f64, dd: f64) -> OptimizationResult {
        OptimizationResult {
            params: ParamSet {
                entry_level_count: 3,
                trailing_gap_pct: 0.5,
                pm_start_pct_no_dca: 5.0,
                pm_start_pct_with_dca: 2.5,
            },
            symbols: 1,
            total_trades: 1,
            win_rate: win,
            total_pnl: 0.0,
            total_return_pct: ret,
            max_drawdown_pct: dd,
            sharpe_ratio: sharpe,
        }
    }

    #[test]
    fn test_grid_skips_invalid_combinations() {
        let grid = ParamGrid {
            entry_level_counts: vec![3, 9],
            trailing_gaps: vec![0.5, 3.0],
            pm_no_dca: vec![5.0],
            pm_with_dca: vec![2.5],
        };
        assert_eq!(grid.total_combinations(), 4);

        // level count 9 is out of range; a 3% gap exceeds the 2.5% activation
        let configs = grid.generate(&StrategyConfig::default());
        assert_eq!(configs.len(), 1);
        let (params, strategy) = &configs[0];
        assert_eq!(params.entry_level_count, 3);
        assert_eq!(strategy.trailing_gap_pct, 0.5);
    }

    #[test]
    fn test_presets_generate_valid_configs() {
        let base = StrategyConfig::default();
        assert_eq!(ParamGrid::quick().generate(&base).len(), 6);
        assert!(!ParamGrid::full().generate(&base).is_empty());
    }

    #[test]
    fn test_sort_keys() {
        let mut results = vec![
            result(0.5, 10.0, 40.0, 20.0),
            result(1.5, 5.0, 60.0, 5.0),
            result(1.0, 20.0, 50.0, 10.0),
        ];

        Optimizer::sort_results(&mut results, SortKey::Sharpe);
        assert_eq!(results[0].sharpe_ratio, 1.5);

        Optimizer::sort_results(&mut results, SortKey::Return);
        assert_eq!(results[0].total_return_pct, 20.0);

        Optimizer::sort_results(&mut results, SortKey::WinRate);
        assert_eq!(results[0].win_rate, 60.0);

        Optimizer::sort_results(&mut results, SortKey::Drawdown);
        assert_eq!(results[0].max_drawdown_pct, 5.0);

        assert!("calmar".parse::<SortKey>().is_err());
        assert_eq!("win_rate".parse::<SortKey>().unwrap(), SortKey::WinRate);
    }

    #[test]
    fn test_optimize_flat_market() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..80)
            .map(|i| Bar::new_unchecked(start + Duration::hours(i), 100.0, 100.0, 100.0, 100.0, 1.0))
            .collect();
        let mut data = BTreeMap::new();
        data.insert(Symbol::new("BTC"), bars);
        // too short for the warmup, so dropped
        data.insert(Symbol::new("ETH"), Vec::new());

        let optimizer = Optimizer::new(Config::default(), Arc::new(SupportLevelPredictor::default()));
        let results = optimizer.optimize(&data, &ParamGrid::quick(), None);

        assert_eq!(results.len(), 6);
        for r in &results {
            assert_eq!(r.symbols, 1);
            assert_eq!(r.total_trades, 0);
            assert_eq!(r.total_return_pct, 0.0);
        }
    }
}
