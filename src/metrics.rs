//! Performance metrics
//!
//! Reduces a trade log and an equity curve into summary statistics.

use itertools::Itertools;
use statrs::statistics::Statistics;

use crate::{EquityPoint, Metrics, Trade};

/// Annualisation factor applied to per-bar Sharpe ratios
pub const ANNUALIZATION_PERIODS: f64 = 252.0;

pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn calculate(trades: &[Trade], equity_curve: &[EquityPoint], initial_capital: f64) -> Metrics {
        let mut metrics = Self::trade_stats(trades);

        metrics.total_return_pct = match equity_curve.last() {
            Some(last) if initial_capital > 0.0 => {
                (last.equity - initial_capital) / initial_capital * 100.0
            }
            _ => 0.0,
        };
        metrics.max_drawdown_pct = Self::max_drawdown_pct(equity_curve);
        metrics.sharpe_ratio = Self::sharpe_ratio(equity_curve);

        metrics
    }

    fn trade_stats(trades: &[Trade]) -> Metrics {
        if trades.is_empty() {
            return Metrics::default();
        }

        let n = trades.len() as f64;
        let (wins, losses): (Vec<&Trade>, Vec<&Trade>) = trades.iter().partition(|t| t.is_win());

        let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
        let gross_profit: f64 = wins.iter().map(|t| t.pnl).sum();
        let gross_loss: f64 = losses.iter().map(|t| t.pnl.abs()).sum();

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if wins.is_empty() {
            0.0
        } else {
            gross_profit / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            gross_loss / losses.len() as f64
        };
        let win_fraction = wins.len() as f64 / n;
        let expectancy = win_fraction * avg_win - (1.0 - win_fraction) * avg_loss;

        let (worst_pnl, best_pnl) = trades
            .iter()
            .map(|t| t.pnl)
            .minmax_by(f64::total_cmp)
            .into_option()
            .unwrap_or_default();
        let (worst_pnl_pct, best_pnl_pct) = trades
            .iter()
            .map(|t| t.pnl_pct)
            .minmax_by(f64::total_cmp)
            .into_option()
            .unwrap_or_default();

        Metrics {
            total_trades: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: win_fraction * 100.0,
            total_pnl,
            avg_pnl: total_pnl / n,
            avg_pnl_pct: trades.iter().map(|t| t.pnl_pct).sum::<f64>() / n,
            best_pnl,
            worst_pnl,
            best_pnl_pct,
            worst_pnl_pct,
            avg_holding_hours: trades.iter().map(|t| t.holding_hours).sum::<f64>() / n,
            avg_dca_per_trade: trades.iter().map(|t| t.dca_count as f64).sum::<f64>() / n,
            total_fees: trades.iter().map(|t| t.fees).sum(),
            profit_factor,
            expectancy,
            ..Metrics::default()
        }
    }

    /// Largest percentage decline from a running peak, seeded with the first point
    pub fn max_drawdown_pct(equity_curve: &[EquityPoint]) -> f64 {
        let mut points = equity_curve.iter().map(|p| p.equity);
        let Some(mut peak) = points.next() else {
            return 0.0;
        };

        let mut max_dd = 0.0_f64;
        for equity in points {
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak * 100.0);
            }
        }
        max_dd
    }

    /// Annualised Sharpe ratio of per-bar equity returns (population std dev).
    /// Zero with fewer than two points or no variance.
    pub fn sharpe_ratio(equity_curve: &[EquityPoint]) -> f64 {
        if equity_curve.len() < 2 {
            return 0.0;
        }

        let returns: Vec<f64> = equity_curve
            .iter()
            .tuple_windows()
            .filter(|(prev, _)| prev.equity > 0.0)
            .map(|(prev, next)| (next.equity - prev.equity) / prev.equity)
            .collect();
        if returns.is_empty() {
            return 0.0;
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().population_std_dev();
        if !(std_dev > 0.0) {
            return 0.0;
        }

        mean / std_dev * ANNUALIZATION_PERIODS.sqrt()
    }
}
