//! Per-asset position state machine
//!
//! One `PositionStateMachine` owns the strategy state of one asset. The
//! backtester and the live trader both drive it through [`PositionStateMachine::decide`]
//! and [`PositionStateMachine::apply_fill`], so the trigger logic is shared
//! code rather than two implementations kept in sync.
//!
//! Each tick is evaluated in a fixed order: exit, then DCA, then entry. An
//! asset that qualifies for both exit and DCA on the same bar exits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StrategyConfig;
use crate::error::{Result, TradingError};
use crate::execution::FillResult;
use crate::position::{DcaWindow, Position, TrailingExit};
use crate::predictor::{levels_broken, LevelPredictor};
use crate::{Bar, ExitReason, FillSide, Symbol, Trade};

/// Orders below this notional are skipped, approximating exchange minimums
pub const MIN_ORDER_NOTIONAL: f64 = 10.0;

/// Largest fraction of available capital a fresh entry may use
pub const ENTRY_CAPITAL_FRACTION: f64 = 0.50;

/// Largest fraction of available capital a single DCA may use
pub const DCA_CAPITAL_FRACTION: f64 = 0.25;

/// A position together with its trailing exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub position: Position,
    pub trailing: TrailingExit,
}

impl OpenPosition {
    fn activation_line(&self, config: &StrategyConfig) -> f64 {
        let pm = config.profit_margin_pct(self.position.dca_count);
        self.position.avg_price * (1.0 + pm / 100.0)
    }

    /// Update the peak and trailing line for `bar`; true when the exit fires
    fn evaluate_exit(&mut self, bar: &Bar, config: &StrategyConfig) -> bool {
        self.position.observe_high(bar.high);
        let activation = self.activation_line(config);
        self.trailing.update(
            bar.close,
            self.position.peak_price_since_entry,
            activation,
            config.trailing_gap_pct,
        )
    }

    fn evaluate_dca(
        &self,
        bar: &Bar,
        now: DateTime<Utc>,
        available_capital: f64,
        config: &StrategyConfig,
        window: &DcaWindow,
    ) -> Option<DcaSignal> {
        let recent = window.count_recent(now);
        if recent >= config.max_dca_per_24h {
            debug!(
                "DCA capped: {} fills in the last 24h (max {})",
                recent, config.max_dca_per_24h
            );
            return None;
        }

        let drawdown_pct = self.position.pnl_pct_at(bar.close);
        let stage = self.position.dca_count;
        let trigger_pct = ladder_level(&config.dca_levels, drawdown_pct, stage)?;
        let level_pct = stage_level(&config.dca_levels, stage).unwrap_or(trigger_pct);

        let notional = (self.position.last_fill_notional * config.dca_multiplier)
            .min(available_capital * DCA_CAPITAL_FRACTION);
        if notional < MIN_ORDER_NOTIONAL || notional > available_capital {
            debug!(
                "DCA stage {} at {:.2}% suppressed: size {:.2} (available {:.2})",
                stage, level_pct, notional, available_capital
            );
            return None;
        }

        Some(DcaSignal {
            stage,
            level_pct,
            trigger_pct,
            drawdown_pct,
            notional,
        })
    }
}

/// Strategy state of one asset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PositionState {
    #[default]
    Flat,
    Open(OpenPosition),
}

/// A DCA the strategy wants to place this tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DcaSignal {
    /// Stage index being filled (equals the DCA count before the fill)
    pub stage: usize,
    /// Ladder level of `stage`, in percent
    pub level_pct: f64,
    /// Deepest ladder level the drawdown reached, in percent
    pub trigger_pct: f64,
    pub drawdown_pct: f64,
    pub notional: f64,
}

/// Outcome of evaluating one tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    Hold,
    Enter { notional: f64 },
    Dca(DcaSignal),
    Exit,
}

/// Ladder level that fires at `drawdown_pct` for stage `stage`.
///
/// The deepest level the drawdown has reached fires when its ladder index is
/// at or past the next untriggered stage. Stages beyond the ladder reuse the
/// last (most negative) level.
pub fn ladder_level(levels: &[f64], drawdown_pct: f64, stage: usize) -> Option<f64> {
    let last = *levels.last()?;
    if stage >= levels.len() {
        return (drawdown_pct <= last).then_some(last);
    }

    let (index, level) = levels
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, level)| drawdown_pct <= level)
        .last()?;

    (index >= stage).then_some(level)
}

/// Ladder level belonging to `stage`; stages past the ladder use the last one
pub fn stage_level(levels: &[f64], stage: usize) -> Option<f64> {
    levels.get(stage).or_else(|| levels.last()).copied()
}

pub struct PositionStateMachine {
    symbol: Symbol,
    config: StrategyConfig,
    predictor: Arc<dyn LevelPredictor>,
    /// Capital figure fresh entries are sized from
    allocation_base: f64,
    state: PositionState,
    dca_window: DcaWindow,
}

impl std::fmt::Debug for PositionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStateMachine")
            .field("symbol", &self.symbol)
            .field("allocation_base", &self.allocation_base)
            .field("state", &self.state)
            .field("dca_window", &self.dca_window)
            .finish()
    }
}

impl PositionStateMachine {
    pub fn new(
        symbol: Symbol,
        config: StrategyConfig,
        predictor: Arc<dyn LevelPredictor>,
        allocation_base: f64,
    ) -> Result<Self> {
        config.validate()?;
        if !(allocation_base > 0.0) {
            return Err(TradingError::InvalidConfig(format!(
                "allocation base must be positive, got {}",
                allocation_base
            )));
        }

        Ok(Self {
            symbol,
            config,
            predictor,
            allocation_base,
            state: PositionState::Flat,
            dca_window: DcaWindow::default(),
        })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, PositionState::Open(_))
    }

    pub fn position(&self) -> Option<&Position> {
        match &self.state {
            PositionState::Open(open) => Some(&open.position),
            PositionState::Flat => None,
        }
    }

    pub fn trailing(&self) -> Option<&TrailingExit> {
        match &self.state {
            PositionState::Open(open) => Some(&open.trailing),
            PositionState::Flat => None,
        }
    }

    /// Open quantity, zero when flat
    pub fn quantity(&self) -> f64 {
        self.position().map_or(0.0, |p| p.quantity)
    }

    /// Average cost, zero when flat
    pub fn avg_price(&self) -> f64 {
        self.position().map_or(0.0, |p| p.avg_price)
    }

    pub fn dca_window(&self) -> &DcaWindow {
        &self.dca_window
    }

    pub fn open_position(&self) -> Option<&OpenPosition> {
        match &self.state {
            PositionState::Open(open) => Some(open),
            PositionState::Flat => None,
        }
    }

    /// Reinstate a persisted DCA window, e.g. after a restart
    pub fn restore_dca_window(&mut self, window: DcaWindow) {
        self.dca_window = window;
    }

    /// Reinstate a persisted open position. Rejected unless flat.
    pub fn restore_position(&mut self, open: OpenPosition) -> Result<()> {
        if self.is_open() {
            return Err(TradingError::InvalidState(format!(
                "{}: cannot restore over an open position",
                self.symbol
            )));
        }
        if !open.position.is_open() {
            return Err(TradingError::InvalidState(format!(
                "{}: restored position has no quantity",
                self.symbol
            )));
        }
        info!(
            "{} restored position {:.8} @ avg {:.8} ({} DCA)",
            self.symbol, open.position.quantity, open.position.avg_price, open.position.dca_count
        );
        self.state = PositionState::Open(open);
        Ok(())
    }

    /// True when the predictor's levels say price has dropped far enough to buy.
    /// Always false while a position is open.
    pub fn should_enter(&self, current_bar: &Bar, recent_bars: &[Bar]) -> bool {
        if self.is_open() {
            return false;
        }
        let levels = self.predictor.predict_levels(recent_bars, current_bar.close);
        levels_broken(&levels, current_bar.close) >= self.config.entry_level_count
    }

    /// DCA to place on this tick, if any. None while flat.
    pub fn should_dca(
        &self,
        current_bar: &Bar,
        now: DateTime<Utc>,
        available_capital: f64,
    ) -> Option<DcaSignal> {
        match &self.state {
            PositionState::Open(open) => open.evaluate_dca(
                current_bar,
                now,
                available_capital,
                &self.config,
                &self.dca_window,
            ),
            PositionState::Flat => None,
        }
    }

    /// Advance the trailing exit with `current_bar`; true when it fires.
    ///
    /// Updates the peak even when no exit happens, so it must be called once
    /// per tick. False while flat.
    pub fn should_exit(&mut self, current_bar: &Bar) -> bool {
        match &mut self.state {
            PositionState::Open(open) => open.evaluate_exit(current_bar, &self.config),
            PositionState::Flat => false,
        }
    }

    /// Notional of a fresh entry given `available_capital`, None when it would
    /// fall below the order minimum or exceed what is available
    pub fn entry_notional(&self, available_capital: f64) -> Option<f64> {
        let notional = (self.allocation_base * self.config.start_alloc_pct / 100.0)
            .min(available_capital * ENTRY_CAPITAL_FRACTION);
        if notional < MIN_ORDER_NOTIONAL || notional > available_capital {
            return None;
        }
        Some(notional)
    }

    /// Evaluate one tick: exit, then DCA, then entry.
    ///
    /// `recent_bars` is the history handed to the predictor and must not
    /// include `current_bar`.
    pub fn decide(
        &mut self,
        current_bar: &Bar,
        recent_bars: &[Bar],
        available_capital: f64,
    ) -> Decision {
        if self.should_exit(current_bar) {
            return Decision::Exit;
        }

        if self.is_open() {
            return match self.should_dca(current_bar, current_bar.timestamp, available_capital) {
                Some(signal) => Decision::Dca(signal),
                None => Decision::Hold,
            };
        }

        if self.should_enter(current_bar, recent_bars) {
            match self.entry_notional(available_capital) {
                Some(notional) => return Decision::Enter { notional },
                None => debug!(
                    "{} entry signal suppressed: available capital {:.2}",
                    self.symbol, available_capital
                ),
            }
        }

        Decision::Hold
    }

    /// Apply an executed fill for the tick `bar` was decided on.
    ///
    /// Entry and DCA fills grow the position; an exit fill closes it and
    /// returns the completed trade. An entry seeds the peak with the bar's
    /// high. A fill that does not fit the current state is rejected without
    /// mutating anything.
    pub fn apply_fill(
        &mut self,
        side: FillSide,
        fill: &FillResult,
        bar: &Bar,
    ) -> Result<Option<Trade>> {
        match side {
            FillSide::Exit => self.close(fill, bar.timestamp, ExitReason::TrailingStop).map(Some),
            FillSide::Entry | FillSide::Dca => {
                self.add(side, fill, bar)?;
                Ok(None)
            }
        }
    }

    /// Close the open position regardless of trailing state
    pub fn force_close(
        &mut self,
        fill: &FillResult,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Trade> {
        self.close(fill, timestamp, reason)
    }

    fn add(&mut self, side: FillSide, fill: &FillResult, bar: &Bar) -> Result<()> {
        check_fill(fill)?;
        let timestamp = bar.timestamp;

        match (&mut self.state, side) {
            (PositionState::Flat, FillSide::Entry) => {
                let mut position = Position::default();
                position.add(fill.price, fill.quantity, fill.fee, timestamp);
                position.observe_high(bar.high);
                let activation =
                    position.avg_price * (1.0 + self.config.profit_margin_pct(0) / 100.0);
                info!(
                    "{} ENTRY {:.8} @ {:.8} (notional {:.2}, fee {:.4})",
                    self.symbol,
                    fill.quantity,
                    fill.price,
                    fill.notional(),
                    fill.fee
                );
                self.state = PositionState::Open(OpenPosition {
                    position,
                    trailing: TrailingExit::new(activation),
                });
                Ok(())
            }
            (PositionState::Open(open), FillSide::Dca) => {
                let position = &mut open.position;
                position.add(fill.price, fill.quantity, fill.fee, timestamp);
                position.dca_count += 1;
                position.dca_fill_timestamps.push(timestamp);
                self.dca_window.record_fill(timestamp);
                self.dca_window.prune(timestamp);
                info!(
                    "{} DCA #{} {:.8} @ {:.8} -> avg {:.8}",
                    self.symbol, position.dca_count, fill.quantity, fill.price, position.avg_price
                );
                Ok(())
            }
            (PositionState::Open(_), _) => Err(TradingError::InvalidState(format!(
                "{}: {} fill while a position is open",
                self.symbol, side
            ))),
            (PositionState::Flat, _) => Err(TradingError::InvalidState(format!(
                "{}: {} fill while flat",
                self.symbol, side
            ))),
        }
    }

    fn close(
        &mut self,
        fill: &FillResult,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Trade> {
        check_fill(fill)?;

        let open = match &self.state {
            PositionState::Open(open) => open,
            PositionState::Flat => {
                return Err(TradingError::InvalidState(format!(
                    "{}: exit fill while flat",
                    self.symbol
                )))
            }
        };
        let position = &open.position;

        if (fill.quantity - position.quantity).abs() > position.quantity * 1e-9 {
            warn!(
                "{} exit filled {:.8} of {:.8}; trade records the filled quantity against the full cost basis",
                self.symbol, fill.quantity, position.quantity
            );
        }

        let gross_proceeds = fill.quantity * fill.price;
        let pnl = gross_proceeds - fill.fee - position.cost_basis;
        let pnl_pct = if position.cost_basis > 0.0 {
            pnl / position.cost_basis * 100.0
        } else {
            0.0
        };
        let entry_time = position.entry_time.unwrap_or(timestamp);
        let holding_hours = (timestamp - entry_time).num_milliseconds() as f64 / 3_600_000.0;

        let trade = Trade {
            symbol: self.symbol.clone(),
            entry_time,
            exit_time: timestamp,
            entry_price: position.avg_price,
            exit_price: fill.price,
            quantity: fill.quantity,
            dca_count: position.dca_count,
            cost_basis: position.cost_basis,
            gross_proceeds,
            fees: position.fees_paid + fill.fee,
            pnl,
            pnl_pct,
            holding_hours,
            exit_reason: reason,
        };

        info!(
            "{} EXIT ({:?}) @ {:.8}: pnl {:.2} ({:.2}%), {} DCA, held {:.1}h",
            self.symbol, reason, fill.price, pnl, pnl_pct, trade.dca_count, holding_hours
        );

        self.state = PositionState::Flat;
        self.dca_window.record_exit(timestamp);
        Ok(trade)
    }
}

fn check_fill(fill: &FillResult) -> Result<()> {
    if !(fill.price > 0.0) || !(fill.quantity > 0.0) || !(fill.fee >= 0.0) {
        return Err(TradingError::InvalidState(format!(
            "fill must have positive price and quantity, got {:?}",
            fill
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionAdapter, FillRequest, SimulatedExecution};
    use crate::predictor::PredictedLevels;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    /// Predictor that always reports `count` levels above the current price
    struct FixedBreaks(usize);

    impl LevelPredictor for FixedBreaks {
        fn predict_levels(&self, _recent: &[Bar], price: f64) -> PredictedLevels {
            (0..self.0)
                .map(|i| (format!("level_{}", i), price + 1.0 + i as f64))
                .collect()
        }
    }

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn bar(hours: i64, close: f64) -> Bar {
        Bar::new_unchecked(t(hours), close, close, close, close, 1.0)
    }

    fn machine(config: StrategyConfig, breaks: usize) -> PositionStateMachine {
        PositionStateMachine::new(
            Symbol::new("BTC"),
            config,
            Arc::new(FixedBreaks(breaks)),
            10_000.0,
        )
        .unwrap()
    }

    fn free_config() -> StrategyConfig {
        StrategyConfig::default().with_costs(0.0, 0.0)
    }

    fn execute(m: &mut PositionStateMachine, decision: Decision, b: &Bar) -> Option<Trade> {
        let exec = SimulatedExecution::new(0.0, 0.0);
        let request = match decision {
            Decision::Hold => return None,
            Decision::Enter { notional } => {
                FillRequest::buy(FillSide::Entry, m.symbol().clone(), notional, b.close)
            }
            Decision::Dca(signal) => {
                FillRequest::buy(FillSide::Dca, m.symbol().clone(), signal.notional, b.close)
            }
            Decision::Exit => FillRequest::sell(m.symbol().clone(), m.quantity(), b.close),
        };
        let fill = exec.fill(&request).unwrap();
        m.apply_fill(request.side, &fill, b).unwrap()
    }

    #[test]
    fn test_ladder_level_picks_deepest_untriggered() {
        let ladder = [-2.5, -5.0, -10.0];
        assert_eq!(ladder_level(&ladder, -1.0, 0), None);
        assert_eq!(ladder_level(&ladder, -3.0, 0), Some(-2.5));
        assert_eq!(ladder_level(&ladder, -6.0, 0), Some(-5.0));
        // stage 1 already used; -3% only reaches index 0
        assert_eq!(ladder_level(&ladder, -3.0, 1), None);
        assert_eq!(ladder_level(&ladder, -6.0, 1), Some(-5.0));
        assert_eq!(ladder_level(&ladder, -6.0, 2), None);
    }

    #[test]
    fn test_ladder_level_repeats_last_beyond_ladder() {
        let ladder = [-2.5, -5.0];
        assert_eq!(ladder_level(&ladder, -5.0, 2), Some(-5.0));
        assert_eq!(ladder_level(&ladder, -7.0, 9), Some(-5.0));
        assert_eq!(ladder_level(&ladder, -4.9, 2), None);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = PositionStateMachine::new(
            Symbol::new("BTC"),
            StrategyConfig::default().with_entry_level_count(0),
            Arc::new(FixedBreaks(3)),
            10_000.0,
        );
        assert!(matches!(result, Err(TradingError::InvalidConfig(_))));
    }

    #[test]
    fn test_enter_requires_level_count() {
        let m = machine(free_config(), 2);
        assert!(!m.should_enter(&bar(0, 100.0), &[]));
        let m = machine(free_config(), 3);
        assert!(m.should_enter(&bar(0, 100.0), &[]));
    }

    #[test]
    fn test_entry_sizing_caps() {
        let m = machine(free_config(), 3);
        // 0.5% of 10_000
        assert_eq!(m.entry_notional(10_000.0), Some(50.0));
        // 50% cap of available
        assert_eq!(m.entry_notional(60.0), Some(30.0));
        // below minimum order size
        assert_eq!(m.entry_notional(15.0), None);
    }

    #[test]
    fn test_fill_in_wrong_state_is_rejected() {
        let mut m = machine(free_config(), 3);
        let fill = FillResult {
            price: 100.0,
            quantity: 1.0,
            fee: 0.0,
        };
        assert!(matches!(
            m.apply_fill(FillSide::Dca, &fill, &bar(0, 100.0)),
            Err(TradingError::InvalidState(_))
        ));
        assert!(matches!(
            m.apply_fill(FillSide::Exit, &fill, &bar(0, 100.0)),
            Err(TradingError::InvalidState(_))
        ));
        assert!(!m.is_open());

        m.apply_fill(FillSide::Entry, &fill, &bar(0, 100.0)).unwrap();
        assert!(matches!(
            m.apply_fill(FillSide::Entry, &fill, &bar(1, 100.0)),
            Err(TradingError::InvalidState(_))
        ));
        assert_eq!(m.quantity(), 1.0);
    }

    #[test]
    fn test_drop_and_recover_single_dca() {
        let mut m = machine(
            free_config().with_profit_margins(5.0, 2.5).with_trailing_gap(0.5),
            3,
        );

        let entry_bar = bar(0, 100.0);
        let decision = m.decide(&entry_bar, &[], 10_000.0);
        assert_eq!(decision, Decision::Enter { notional: 50.0 });
        execute(&mut m, decision, &entry_bar);
        assert_relative_eq!(m.avg_price(), 100.0);

        // 6% drop in one bar crosses -2.5 and -5; only the deepest fires
        let drop_bar = Bar::new_unchecked(t(1), 100.0, 100.0, 94.0, 94.0, 1.0);
        let decision = m.decide(&drop_bar, &[], 9_950.0);
        match decision {
            Decision::Dca(signal) => {
                assert_eq!(signal.stage, 0);
                assert_eq!(signal.level_pct, -2.5);
                assert_eq!(signal.trigger_pct, -5.0);
                assert_relative_eq!(signal.notional, 100.0);
            }
            other => panic!("expected DCA, got {:?}", other),
        }
        execute(&mut m, decision, &drop_bar);

        // recover 6%
        let recover_bar = bar(2, 94.0 * 1.06);
        let decision = m.decide(&recover_bar, &[], 9_850.0);
        assert_eq!(decision, Decision::Hold);

        let pos = m.position().unwrap();
        assert_eq!(pos.dca_count, 1);
        assert!(pos.avg_price > 94.0 && pos.avg_price < 100.0);
        assert!(m.is_open());
    }

    #[test]
    fn test_dca_cap_per_24h() {
        let mut m = machine(free_config(), 3);
        let mut price = 100.0;
        let entry = bar(0, price);
        let d = m.decide(&entry, &[], 100_000.0);
        execute(&mut m, d, &entry);

        let mut dca_times = Vec::new();
        for hour in 1..20 {
            price *= 0.9;
            let b = bar(hour, price);
            let d = m.decide(&b, &[], 100_000.0);
            if let Decision::Dca(_) = d {
                dca_times.push(hour);
            }
            execute(&mut m, d, &b);
        }
        assert_eq!(dca_times.len(), 2);
        assert_eq!(m.dca_window().count_recent(t(20)), 2);
    }

    #[test]
    fn test_exit_before_dca_and_single_crossing() {
        let mut m = machine(free_config(), 3);
        let entry = bar(0, 100.0);
        let d = m.decide(&entry, &[], 10_000.0);
        execute(&mut m, d, &entry);

        // arm at 106 (activation 105), line 106 * 0.995 = 105.47
        assert_eq!(m.decide(&bar(1, 106.0), &[], 9_950.0), Decision::Hold);
        assert!(m.trailing().unwrap().armed);

        // falls through the line -> exit
        assert!(m.should_exit(&bar(2, 105.2)));
        // same position, still below the line: no second exit
        assert!(!m.should_exit(&bar(3, 105.1)));
        assert!(!m.should_exit(&bar(4, 105.0)));
    }

    #[test]
    fn test_exit_closes_and_resets() {
        let mut m = machine(free_config(), 3);
        let entry = bar(0, 100.0);
        let d = m.decide(&entry, &[], 10_000.0);
        execute(&mut m, d, &entry);
        let d = m.decide(&bar(1, 110.0), &[], 9_950.0);
        assert_eq!(d, Decision::Hold);

        let exit_bar = bar(2, 109.0);
        let d = m.decide(&exit_bar, &[], 9_950.0);
        assert_eq!(d, Decision::Exit);
        let trade = execute(&mut m, d, &exit_bar).unwrap();

        assert!(!m.is_open());
        assert_eq!(m.quantity(), 0.0);
        assert_eq!(m.avg_price(), 0.0);
        assert!(m.trailing().is_none());
        assert_relative_eq!(trade.pnl, 50.0 * 0.09, epsilon = 1e-9);
        assert_relative_eq!(trade.pnl_pct, 9.0, epsilon = 1e-9);
        assert_relative_eq!(trade.holding_hours, 2.0);
        assert_eq!(trade.exit_reason, ExitReason::TrailingStop);
        assert_eq!(m.dca_window().last_exit(), Some(t(2)));
    }

    #[test]
    fn test_trailing_line_monotonic_once_armed() {
        let mut m = machine(free_config(), 3);
        let entry = bar(0, 100.0);
        let d = m.decide(&entry, &[], 10_000.0);
        execute(&mut m, d, &entry);

        let path = [106.0, 108.0, 107.9, 109.0, 108.6, 110.0, 109.5];
        let mut last_line = 0.0;
        for (i, price) in path.iter().enumerate() {
            m.should_exit(&bar(i as i64 + 1, *price));
            let line = m.trailing().unwrap().line;
            assert!(line >= last_line, "line dropped at tick {}", i);
            last_line = line;
        }
    }

    #[test]
    fn test_trailing_line_holds_through_dca() {
        let mut m = machine(free_config(), 3);
        let entry = bar(0, 100.0);
        let d = m.decide(&entry, &[], 10_000.0);
        execute(&mut m, d, &entry);

        m.should_exit(&bar(1, 100.0));
        let before = m.trailing().unwrap().line;
        assert_relative_eq!(before, 105.0);

        let drop = bar(2, 94.0);
        let d = m.decide(&drop, &[], 9_950.0);
        assert!(matches!(d, Decision::Dca(_)));
        execute(&mut m, d, &drop);
        assert!(m.avg_price() < 97.0);

        m.should_exit(&bar(3, 94.0));
        let after = m.trailing().unwrap().line;
        assert!(after >= before, "line fell from {} to {}", before, after);
        assert_relative_eq!(after, 105.0);
    }

    #[test]
    fn test_entry_bar_high_seeds_peak() {
        let mut m = machine(free_config(), 3);
        let entry = Bar::new_unchecked(t(0), 100.0, 110.0, 100.0, 100.0, 1.0);
        let d = m.decide(&entry, &[], 10_000.0);
        assert_eq!(d, Decision::Enter { notional: 50.0 });
        execute(&mut m, d, &entry);
        assert_eq!(m.position().unwrap().peak_price_since_entry, 110.0);

        // arms at 106 with the line already at 110 * 0.995
        assert_eq!(m.decide(&bar(1, 106.0), &[], 9_950.0), Decision::Hold);
        assert_eq!(m.position().unwrap().peak_price_since_entry, 110.0);
        assert_relative_eq!(m.trailing().unwrap().line, 109.45, epsilon = 1e-9);
        assert_eq!(m.decide(&bar(2, 106.0), &[], 9_950.0), Decision::Exit);
    }

    #[test]
    fn test_short_exit_fill_records_filled_quantity() {
        let mut m = machine(free_config(), 3);
        let entry = FillResult {
            price: 100.0,
            quantity: 1.0,
            fee: 0.0,
        };
        m.apply_fill(FillSide::Entry, &entry, &bar(0, 100.0)).unwrap();

        let partial = FillResult {
            price: 110.0,
            quantity: 0.5,
            fee: 0.0,
        };
        let trade = m
            .apply_fill(FillSide::Exit, &partial, &bar(1, 110.0))
            .unwrap()
            .unwrap();

        assert_eq!(trade.quantity, 0.5);
        assert_relative_eq!(trade.gross_proceeds, 55.0);
        assert_relative_eq!(trade.cost_basis, 100.0);
        assert_relative_eq!(trade.pnl, -45.0);
        assert!(!m.is_open());
    }

    #[test]
    fn test_stage_level_reuses_last() {
        let ladder = [-2.5, -5.0];
        assert_eq!(stage_level(&ladder, 0), Some(-2.5));
        assert_eq!(stage_level(&ladder, 5), Some(-5.0));
        assert_eq!(stage_level(&[], 0), None);
    }
}
