//! Integration tests for the dip-trader system
//!
//! These tests drive the engine end to end: bars in, trades, equity curve and
//! metrics out.

use std::collections::BTreeMap;
use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};

use dip_trader::backtest::SimulationEngine;
use dip_trader::config::StrategyConfig;
use dip_trader::data::{load_multi_symbol, save_csv, csv_filename};
use dip_trader::metrics::MetricsCalculator;
use dip_trader::predictor::{LevelPredictor, PredictedLevels, SupportLevelPredictor};
use dip_trader::report;
use dip_trader::{Bar, EquityPoint, ExitReason, Symbol, TradingError};

// =============================================================================
// Test Utilities
// =============================================================================

/// Three support levels at a fixed price
struct FixedLevels(f64);

impl LevelPredictor for FixedLevels {
    fn predict_levels(&self, _recent: &[Bar], _price: f64) -> PredictedLevels {
        (1..=3).map(|i| (format!("support_{}", i), self.0)).collect()
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Bar::new_unchecked(start() + Duration::hours(i as i64), c, c, c, c, 1.0))
        .collect()
}

/// Choppy series with repeated dips and recoveries
fn wavy_bars(count: usize) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let x = i as f64;
            let close = 100.0 + 8.0 * (x / 9.0).sin() + 3.0 * (x / 2.5).cos();
            let high = close * 1.004;
            let low = close * 0.996;
            Bar::new(start() + Duration::hours(i as i64), close, high, low, close, 10.0).unwrap()
        })
        .collect()
}

fn warmup_then(closes: &[f64]) -> Vec<Bar> {
    let mut all = vec![110.0; 50];
    all.extend_from_slice(closes);
    bars_from_closes(&all)
}

fn free_engine(predictor: Arc<dyn LevelPredictor>) -> SimulationEngine {
    SimulationEngine::with_params(
        StrategyConfig::default().with_costs(0.0, 0.0),
        10_000.0,
        50,
        predictor,
    )
}

// =============================================================================
// Engine scenarios
// =============================================================================

#[test]
fn test_flat_market_never_trades() {
    let bars = bars_from_closes(&[100.0; 60]);
    let engine = SimulationEngine::with_params(
        StrategyConfig::default().with_entry_level_count(3),
        10_000.0,
        50,
        Arc::new(SupportLevelPredictor::default()),
    );
    let result = engine.run(&Symbol::new("BTC"), &bars).unwrap();

    assert!(result.trades.is_empty());
    assert_eq!(result.equity_curve.len(), 10);
    assert_eq!(result.metrics.total_trades, 0);
    assert_eq!(result.total_return_pct, 0.0);
}

#[test]
fn test_insufficient_data_is_fatal() {
    let bars = bars_from_closes(&[100.0; 10]);
    let err = free_engine(Arc::new(FixedLevels(101.0)))
        .run(&Symbol::new("BTC"), &bars)
        .unwrap_err();
    assert!(matches!(err, TradingError::InsufficientData { available: 10, required: 50 }));
}

#[test]
fn test_drop_then_recover_fills_one_dca() {
    // enter at 100, drop 6%, recover 6%
    let bars = warmup_then(&[100.0, 94.0, 94.0 * 1.06]);
    let result = free_engine(Arc::new(FixedLevels(101.0)))
        .run(&Symbol::new("BTC"), &bars)
        .unwrap();

    // still open at the last bar, so the only trade is the end-of-data close
    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.dca_count, 1);
    assert_eq!(trade.exit_reason, ExitReason::EndOfData);
    assert!(trade.entry_price > 94.0 && trade.entry_price < 100.0);
    // 50 at the entry, 100 on the DCA
    assert_relative_eq!(trade.cost_basis, 150.0, epsilon = 1e-9);
}

#[test]
fn test_trailing_exit_fires_once() {
    // activation at 105; line trails 0.5% under the peak of 107
    let bars = warmup_then(&[100.0, 106.0, 107.0, 106.0, 106.0, 106.0]);
    let result = free_engine(Arc::new(FixedLevels(101.0)))
        .run(&Symbol::new("BTC"), &bars)
        .unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_reason, ExitReason::TrailingStop);
    assert_eq!(trade.exit_time, bars[53].timestamp);
    assert_relative_eq!(trade.pnl, 50.0 * 0.06, epsilon = 1e-9);
    assert!(trade.is_win());
    assert_relative_eq!(result.final_capital, 10_003.0, epsilon = 1e-9);
}

#[test]
fn test_simulation_is_deterministic() {
    let bars = wavy_bars(400);
    let engine = SimulationEngine::with_params(
        StrategyConfig::default().with_entry_level_count(2),
        10_000.0,
        50,
        Arc::new(SupportLevelPredictor::default()),
    );

    let first = engine.run(&Symbol::new("ETH"), &bars).unwrap();
    let second = engine.run(&Symbol::new("ETH"), &bars).unwrap();

    assert_eq!(
        serde_json::to_string(&first.trades).unwrap(),
        serde_json::to_string(&second.trades).unwrap()
    );
    assert_eq!(first.equity_curve, second.equity_curve);
    assert_eq!(first.final_capital, second.final_capital);
}

#[test]
fn test_equity_curve_covers_every_traded_bar() {
    let bars = wavy_bars(120);
    let result = SimulationEngine::with_params(
        StrategyConfig::default(),
        10_000.0,
        50,
        Arc::new(SupportLevelPredictor::default()),
    )
    .run(&Symbol::new("XRP"), &bars)
    .unwrap();

    assert_eq!(result.equity_curve.len(), 70);
    assert_eq!(result.equity_curve[0].timestamp, bars[50].timestamp);
    assert_eq!(result.start, Some(bars[50].timestamp));
    assert_eq!(result.end, Some(bars[119].timestamp));
    assert!(result.equity_curve.iter().all(|p| p.equity > 0.0));
}

#[test]
fn test_max_drawdown_on_reference_curve() {
    let curve: Vec<EquityPoint> = [100.0, 120.0, 90.0, 110.0]
        .iter()
        .enumerate()
        .map(|(i, &equity)| EquityPoint {
            timestamp: start() + Duration::hours(i as i64),
            equity,
        })
        .collect();
    assert_relative_eq!(MetricsCalculator::max_drawdown_pct(&curve), 25.0);
}

// =============================================================================
// Data pipeline
// =============================================================================

#[test]
fn test_csv_to_engine_to_results_file() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let timeframe = "1hour";

    let btc = Symbol::new("BTC");
    let eth = Symbol::new("ETH");
    save_csv(&wavy_bars(200), data_dir.join(csv_filename(&btc, timeframe))).unwrap();
    save_csv(&bars_from_closes(&[100.0; 60]), data_dir.join(csv_filename(&eth, timeframe)))
        .unwrap();

    let data: BTreeMap<Symbol, Vec<Bar>> =
        load_multi_symbol(&data_dir, &[btc.clone(), eth.clone()], timeframe).unwrap();
    assert_eq!(data[&btc].len(), 200);

    let engine = SimulationEngine::with_params(
        StrategyConfig::default(),
        10_000.0,
        50,
        Arc::new(SupportLevelPredictor::default()),
    );
    let results = engine.run_many(&data);
    assert_eq!(results.len(), 2);

    let eth_result = results[&eth].as_ref().unwrap();
    assert!(eth_result.trades.is_empty());

    let path = report::save_results(eth_result, dir.path().join("results")).unwrap();
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        "ETH_2024-01-03_2024-01-03.json"
    );
}
