//! Backtest command implementation

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use dip_trader::backtest::SimulationEngine;
use dip_trader::predictor::SupportLevelPredictor;
use dip_trader::{data, report};
use tracing::{error, info, warn};

use super::{load_config, Overrides};

fn parse_date(s: &str) -> Result<chrono::DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))?;
    Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}

pub fn run(
    config_path: String,
    overrides: Overrides,
    start: Option<String>,
    end: Option<String>,
    save: bool,
) -> Result<()> {
    info!("Starting backtest");

    let config = load_config(&config_path, &overrides)?;
    let start = start.as_deref().map(parse_date).transpose()?;
    let end = end.as_deref().map(parse_date).transpose()?;

    info!("Loading data from: {}", config.backtest.data_dir);
    let mut data = data::load_multi_symbol(
        &config.backtest.data_dir,
        &config.trading.symbols(),
        &config.trading.timeframe,
    )?;

    for (symbol, bars) in data.iter_mut() {
        bars.retain(|b| {
            start.map_or(true, |s| b.timestamp >= s) && end.map_or(true, |e| b.timestamp <= e)
        });
        let check = data::validate_bars(bars);
        for w in &check.warnings {
            warn!("{}: {}", symbol, w);
        }
        for e in &check.errors {
            warn!("{}: {}", symbol, e);
        }
    }
    info!("Loaded data for {} symbols", data.len());

    let engine = SimulationEngine::new(&config, Arc::new(SupportLevelPredictor::default()));

    info!("Running backtest...");
    let results = engine.run_many(&data);

    let mut failures = 0;
    for (symbol, result) in results {
        match result {
            Ok(result) => {
                report::print_report(&result);
                if save {
                    let path = report::save_results(&result, &config.backtest.results_dir)?;
                    println!("\nResults saved to: {}", path.display());
                }
            }
            Err(e) => {
                failures += 1;
                error!("{}: backtest failed: {}", symbol, e);
            }
        }
    }

    if failures == data.len() {
        anyhow::bail!("Backtest failed for every symbol");
    }

    info!("Backtest completed successfully");
    Ok(())
}
