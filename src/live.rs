//! Live trading orchestrator
//!
//! `LiveTrader` polls a `PriceSource`, runs each asset's state machine on the
//! latest quote and routes decisions to an `ExecutionAdapter`. Paper trading
//! is the same loop with `SimulatedExecution` as the adapter.
//!
//! A tick never mutates a position until the adapter reports a fill, and an
//! error on one asset never aborts the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::capital::CapitalPool;
use crate::config::{Config, StrategyConfig};
use crate::data::{PriceSource, Quote};
use crate::execution::{ExecutionAdapter, FillRequest, FillResult};
use crate::journal::Journal;
use crate::kucoin::timeframe_secs;
use crate::predictor::LevelPredictor;
use crate::state_machine::{Decision, PositionStateMachine};
use crate::{Bar, FillSide, Symbol, Trade};

/// Per-asset live state
pub struct AssetTrader {
    machine: PositionStateMachine,
    recent_bars: Vec<Bar>,
    bars_refreshed_at: Option<DateTime<Utc>>,
    /// Fallback when a quote fetch fails
    last_good_quote: Option<Quote>,
}

impl AssetTrader {
    pub fn new(machine: PositionStateMachine) -> Self {
        Self {
            machine,
            recent_bars: Vec::new(),
            bars_refreshed_at: None,
            last_good_quote: None,
        }
    }

    pub fn machine(&self) -> &PositionStateMachine {
        &self.machine
    }

    pub fn recent_bars(&self) -> &[Bar] {
        &self.recent_bars
    }

    pub fn last_good_quote(&self) -> Option<&Quote> {
        self.last_good_quote.as_ref()
    }
}

/// What happened to one asset on one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Skipped,
    Held,
    Filled { side: FillSide, fill: FillResult },
    Closed(Trade),
    FillFailed { side: FillSide, reason: String },
}

pub struct LiveTrader {
    assets: BTreeMap<Symbol, AssetTrader>,
    capital: CapitalPool,
    prices: Arc<dyn PriceSource>,
    execution: Arc<dyn ExecutionAdapter>,
    journal: Option<Journal>,
    timeframe: String,
    bar_span: Duration,
    history_bars: usize,
    stale_quote: Duration,
}

impl LiveTrader {
    pub fn new(
        config: &Config,
        predictor: Arc<dyn LevelPredictor>,
        prices: Arc<dyn PriceSource>,
        execution: Arc<dyn ExecutionAdapter>,
        journal: Option<Journal>,
    ) -> Result<Self> {
        Self::with_capital(
            config,
            predictor,
            prices,
            execution,
            journal,
            CapitalPool::new(config.trading.initial_capital),
        )
    }

    pub fn with_capital(
        config: &Config,
        predictor: Arc<dyn LevelPredictor>,
        prices: Arc<dyn PriceSource>,
        execution: Arc<dyn ExecutionAdapter>,
        journal: Option<Journal>,
        capital: CapitalPool,
    ) -> Result<Self> {
        let strategy: &StrategyConfig = &config.strategy;
        let mut assets = BTreeMap::new();
        for symbol in config.trading.symbols() {
            let machine = PositionStateMachine::new(
                symbol.clone(),
                strategy.clone(),
                Arc::clone(&predictor),
                config.trading.initial_capital,
            )?;
            assets.insert(symbol, AssetTrader::new(machine));
        }

        let bar_secs = timeframe_secs(&config.trading.timeframe).unwrap_or(3_600);

        Ok(Self {
            assets,
            capital,
            prices,
            execution,
            journal,
            timeframe: config.trading.timeframe.clone(),
            bar_span: Duration::seconds(bar_secs),
            history_bars: config.backtest.warmup_bars.max(1),
            stale_quote: Duration::seconds(config.trading.stale_quote_secs),
        })
    }

    pub fn capital(&self) -> &CapitalPool {
        &self.capital
    }

    pub fn asset(&self, symbol: &Symbol) -> Option<&AssetTrader> {
        self.assets.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.assets.keys()
    }

    /// Reload open positions and DCA windows from the journal and take the
    /// cost of restored positions out of the capital pool
    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(journal) = &self.journal else {
            info!("No journal configured, starting fresh");
            return Ok(());
        };

        info!("Recovering state from previous session...");
        for (symbol, asset) in self.assets.iter_mut() {
            let window = journal.load_dca_window(symbol, now)?;
            debug!("{}: {} DCA fills in the current window", symbol, window.fills().len());
            asset.machine.restore_dca_window(window);

            if let Some(open) = journal.load_position(symbol)? {
                let committed = open.position.cost_basis + open.position.fees_paid;
                asset.machine.restore_position(open)?;
                self.capital.try_reserve(committed).or_else(|e| {
                    warn!("{}: restored position exceeds capital: {}", symbol, e);
                    let available = self.capital.available();
                    self.capital.try_reserve(available)
                })?;
            }
        }

        info!(
            "State recovery complete: {} open positions, available capital {:.2}",
            self.assets.values().filter(|a| a.machine.is_open()).count(),
            self.capital.available()
        );
        Ok(())
    }

    /// Run one decision tick over every asset
    pub fn tick(&mut self, now: DateTime<Utc>) -> BTreeMap<Symbol, TickOutcome> {
        let symbols: Vec<Symbol> = self.assets.keys().cloned().collect();
        symbols
            .into_iter()
            .map(|symbol| {
                let outcome = self.tick_asset(&symbol, now);
                (symbol, outcome)
            })
            .collect()
    }

    fn current_quote(&mut self, symbol: &Symbol, now: DateTime<Utc>) -> Option<Quote> {
        let asset = self.assets.get_mut(symbol)?;
        match self.prices.fetch_quote(symbol) {
            Ok(quote) if quote.is_valid() => {
                asset.last_good_quote = Some(quote);
                Some(quote)
            }
            outcome => {
                match outcome {
                    Ok(quote) => warn!("{}: invalid quote {:?}", symbol, quote),
                    Err(e) => warn!("{}: quote fetch failed: {}", symbol, e),
                }
                let cached = asset.last_good_quote?;
                if now - cached.timestamp <= self.stale_quote {
                    debug!("{}: using cached quote from {}", symbol, cached.timestamp);
                    Some(cached)
                } else {
                    warn!("{}: cached quote from {} is stale, skipping", symbol, cached.timestamp);
                    None
                }
            }
        }
    }

    fn refresh_bars(&mut self, symbol: &Symbol, now: DateTime<Utc>) {
        let Some(asset) = self.assets.get_mut(symbol) else {
            return;
        };
        if let Some(at) = asset.bars_refreshed_at {
            if now - at < self.bar_span {
                return;
            }
        }

        let start = now - self.bar_span * (self.history_bars as i32 + 1);
        match self.prices.fetch_bars(symbol, &self.timeframe, start, now) {
            Ok(mut bars) => {
                // the bar still forming at `now` is not history yet
                bars.retain(|b| b.timestamp + self.bar_span <= now);
                let keep_from = bars.len().saturating_sub(self.history_bars);
                asset.recent_bars = bars.split_off(keep_from);
                asset.bars_refreshed_at = Some(now);
            }
            Err(e) => warn!(
                "{}: bar refresh failed, keeping {} cached bars: {}",
                symbol,
                asset.recent_bars.len(),
                e
            ),
        }
    }

    fn tick_asset(&mut self, symbol: &Symbol, now: DateTime<Utc>) -> TickOutcome {
        let Some(quote) = self.current_quote(symbol, now) else {
            return TickOutcome::Skipped;
        };
        self.refresh_bars(symbol, now);

        let Some(asset) = self.assets.get_mut(symbol) else {
            return TickOutcome::Skipped;
        };
        let bar = Bar::from_price(now, quote.last);
        let decision = asset
            .machine
            .decide(&bar, &asset.recent_bars, self.capital.available());

        let (request, reserved) = match decision {
            Decision::Hold => return TickOutcome::Held,
            Decision::Enter { notional } => (
                FillRequest::buy(FillSide::Entry, symbol.clone(), notional, quote.ask),
                notional,
            ),
            Decision::Dca(signal) => (
                FillRequest::buy(FillSide::Dca, symbol.clone(), signal.notional, quote.ask),
                signal.notional,
            ),
            Decision::Exit => (
                FillRequest::sell(symbol.clone(), asset.machine.quantity(), quote.bid),
                0.0,
            ),
        };
        let side = request.side;

        if reserved > 0.0 {
            if let Err(e) = self.capital.try_reserve(reserved) {
                warn!("{} {} skipped: {}", symbol, side, e);
                return TickOutcome::FillFailed {
                    side,
                    reason: e.to_string(),
                };
            }
        }

        let fill = match self.execution.fill(&request) {
            Ok(fill) => fill,
            Err(e) => {
                self.capital.release(reserved);
                warn!("{} {} fill failed: {}", symbol, side, e);
                return TickOutcome::FillFailed {
                    side,
                    reason: e.to_string(),
                };
            }
        };

        // money has moved; the pool follows the fill even if the state machine objects
        if side.is_buy() {
            self.capital.settle(reserved, -fill.cash_delta(side));
        } else {
            self.capital.credit(fill.cash_delta(side));
        }

        let trade = match asset.machine.apply_fill(side, &fill, &bar) {
            Ok(trade) => trade,
            Err(e) => {
                error!("{} {} filled but not applied: {}", symbol, side, e);
                return TickOutcome::FillFailed {
                    side,
                    reason: e.to_string(),
                };
            }
        };

        if let Some(journal) = &self.journal {
            let journaled = match (&trade, asset.machine.open_position()) {
                (Some(trade), _) => journal
                    .record_trade(trade)
                    .and_then(|_| journal.record_exit(symbol, now))
                    .and_then(|_| journal.clear_position(symbol)),
                (None, Some(open)) => {
                    let dca = if side == FillSide::Dca {
                        journal.record_dca_fill(symbol, now, &fill)
                    } else {
                        Ok(())
                    };
                    dca.and_then(|_| journal.save_position(symbol, open))
                }
                (None, None) => Ok(()),
            };
            if let Err(e) = journaled {
                error!("{}: failed to journal {}: {:#}", symbol, side, e);
            }
        }

        match trade {
            Some(trade) => TickOutcome::Closed(trade),
            None => TickOutcome::Filled { side, fill },
        }
    }

    /// Log what is still open; positions stay open across restarts
    pub fn shutdown(&self) {
        for (symbol, asset) in &self.assets {
            if let Some(position) = asset.machine.position() {
                info!(
                    "{} left open: {:.8} @ avg {:.8} ({} DCA)",
                    symbol, position.quantity, position.avg_price, position.dca_count
                );
            }
        }
        info!("Available capital at shutdown: {:.2}", self.capital.available());
    }
}
