//! Backtesting engine
//!
//! Replays historical bars through the same `PositionStateMachine` the live
//! trader uses, with fills priced by `SimulatedExecution`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, StrategyConfig};
use crate::error::{Result, TradingError};
use crate::execution::{ExecutionAdapter, FillRequest, SimulatedExecution};
use crate::metrics::MetricsCalculator;
use crate::predictor::LevelPredictor;
use crate::state_machine::{Decision, PositionStateMachine};
use crate::{Bar, EquityPoint, ExitReason, FillSide, Metrics, Symbol, Trade};

/// Backtest engine for a single strategy configuration
#[derive(Clone)]
pub struct SimulationEngine {
    strategy: StrategyConfig,
    initial_capital: f64,
    warmup_bars: usize,
    predictor: Arc<dyn LevelPredictor>,
}

impl SimulationEngine {
    pub fn new(config: &Config, predictor: Arc<dyn LevelPredictor>) -> Self {
        Self::with_params(
            config.strategy.clone(),
            config.trading.initial_capital,
            config.backtest.warmup_bars,
            predictor,
        )
    }

    pub fn with_params(
        strategy: StrategyConfig,
        initial_capital: f64,
        warmup_bars: usize,
        predictor: Arc<dyn LevelPredictor>,
    ) -> Self {
        SimulationEngine {
            strategy,
            initial_capital,
            warmup_bars,
            predictor,
        }
    }

    pub fn strategy(&self) -> &StrategyConfig {
        &self.strategy
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn warmup_bars(&self) -> usize {
        self.warmup_bars
    }

    /// Simulate one asset over `bars`, which must be sorted and free of
    /// duplicate timestamps (see `data::normalize_bars`)
    pub fn run(&self, symbol: &Symbol, bars: &[Bar]) -> Result<SimulationResult> {
        if bars.len() < self.warmup_bars {
            return Err(TradingError::InsufficientData {
                available: bars.len(),
                required: self.warmup_bars,
            });
        }

        let mut machine = PositionStateMachine::new(
            symbol.clone(),
            self.strategy.clone(),
            Arc::clone(&self.predictor),
            self.initial_capital,
        )?;
        let execution = SimulatedExecution::from_config(&self.strategy);

        let mut cash = self.initial_capital;
        let mut trades = Vec::new();
        let mut equity_curve = Vec::with_capacity(bars.len() - self.warmup_bars);

        info!(
            "Backtesting {} over {} bars ({} warmup), capital {:.2}",
            symbol,
            bars.len(),
            self.warmup_bars,
            self.initial_capital
        );

        for i in self.warmup_bars..bars.len() {
            let bar = &bars[i];
            let equity = cash + machine.quantity() * bar.close;
            equity_curve.push(EquityPoint {
                timestamp: bar.timestamp,
                equity,
            });

            let recent = &bars[i - self.warmup_bars..i];
            let request = match machine.decide(bar, recent, cash) {
                Decision::Hold => continue,
                Decision::Enter { notional } => {
                    FillRequest::buy(FillSide::Entry, symbol.clone(), notional, bar.close)
                }
                Decision::Dca(signal) => {
                    FillRequest::buy(FillSide::Dca, symbol.clone(), signal.notional, bar.close)
                }
                Decision::Exit => FillRequest::sell(symbol.clone(), machine.quantity(), bar.close),
            };

            let fill = match execution.fill(&request) {
                Ok(fill) => fill,
                Err(e) => {
                    warn!("{} {} fill failed at {}: {}", symbol, request.side, bar.timestamp, e);
                    continue;
                }
            };

            match machine.apply_fill(request.side, &fill, bar) {
                Ok(trade) => {
                    cash += fill.cash_delta(request.side);
                    trades.extend(trade);
                }
                Err(e) => warn!("{} {} fill not applied: {}", symbol, request.side, e),
            }
        }

        if machine.is_open() {
            if let Some(last) = bars.last() {
                debug!("{} closing open position at end of data", symbol);
                let request = FillRequest::sell(symbol.clone(), machine.quantity(), last.close);
                let fill = execution.fill(&request)?;
                let trade = machine.force_close(&fill, last.timestamp, ExitReason::EndOfData)?;
                cash += fill.cash_delta(FillSide::Exit);
                trades.push(trade);
            }
        }

        let metrics = MetricsCalculator::calculate(&trades, &equity_curve, self.initial_capital);
        let total_return_pct = (cash - self.initial_capital) / self.initial_capital * 100.0;

        let start = bars
            .get(self.warmup_bars)
            .or(bars.last())
            .map(|b| b.timestamp);
        let end = bars.last().map(|b| b.timestamp);

        info!(
            "{}: {} trades, return {:.2}%, max drawdown {:.2}%",
            symbol, metrics.total_trades, total_return_pct, metrics.max_drawdown_pct
        );

        Ok(SimulationResult {
            symbol: symbol.clone(),
            start,
            end,
            initial_capital: self.initial_capital,
            final_capital: cash,
            total_return_pct,
            trades,
            equity_curve,
            metrics,
        })
    }

    /// Simulate several assets in parallel, each with its own capital and
    /// state machine
    pub fn run_many(
        &self,
        data: &BTreeMap<Symbol, Vec<Bar>>,
    ) -> BTreeMap<Symbol, Result<SimulationResult>> {
        data.par_iter()
            .map(|(symbol, bars)| (symbol.clone(), self.run(symbol, bars)))
            .collect()
    }
}

/// Outcome of one simulated asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub symbol: Symbol,
    /// First traded bar, after warmup
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_capital: f64,
    pub final_capital: f64,
    /// Final cash (after the end-of-data close) against initial capital
    pub total_return_pct: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: Metrics,
}
