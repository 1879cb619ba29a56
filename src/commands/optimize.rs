//! Optimize command implementation with progress tracking and custom parameter support

use std::sync::Arc;

use anyhow::{anyhow, Result};
use dip_trader::data;
use dip_trader::optimize::{Optimizer, ParamGrid, SortKey};
use dip_trader::predictor::SupportLevelPredictor;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::{load_config, parse_float_list, parse_int_list, Overrides};

/// Custom grid axes from the command line; unset axes keep the mode's values
#[derive(Debug, Clone, Default)]
pub struct GridOverrides {
    pub levels: Option<String>,
    pub gaps: Option<String>,
    pub pm_no_dca: Option<String>,
    pub pm_with_dca: Option<String>,
}

fn build_grid(mode: &str, custom: &GridOverrides) -> Result<ParamGrid> {
    let mut grid = match mode {
        "full" => ParamGrid::full(),
        "quick" | "custom" => ParamGrid::quick(),
        other => return Err(anyhow!("Unknown mode '{}', expected quick, full or custom", other)),
    };

    if let Some(levels) = &custom.levels {
        grid.entry_level_counts = parse_int_list(levels)?;
    }
    if let Some(gaps) = &custom.gaps {
        grid.trailing_gaps = parse_float_list(gaps)?;
    }
    if let Some(pm) = &custom.pm_no_dca {
        grid.pm_no_dca = parse_float_list(pm)?;
    }
    if let Some(pm) = &custom.pm_with_dca {
        grid.pm_with_dca = parse_float_list(pm)?;
    }
    Ok(grid)
}

pub fn run(
    config_path: String,
    overrides: Overrides,
    mode: String,
    sort_by: String,
    top: usize,
    custom: GridOverrides,
) -> Result<()> {
    info!("Starting optimization");

    let config = load_config(&config_path, &overrides)?;
    let sort_key: SortKey = sort_by.parse().map_err(|e: String| anyhow!(e))?;
    let grid = build_grid(&mode, &custom)?;

    let data = data::load_multi_symbol(
        &config.backtest.data_dir,
        &config.trading.symbols(),
        &config.trading.timeframe,
    )?;

    let runs = grid.generate(&config.strategy).len();
    info!("Optimization mode: {}", mode);
    info!("Parameter combinations: {} ({} valid)", grid.total_combinations(), runs);

    println!("\n{}", "=".repeat(70));
    println!("OPTIMIZATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("  Symbols:       {:?}", data.keys().map(|s| s.as_str()).collect::<Vec<_>>());
    println!("  Timeframe:     {}", config.trading.timeframe);
    println!("  Parameters:    {} combinations", runs);
    println!("{}\n", "=".repeat(70));

    if runs == 0 {
        info!("No valid parameter combinations.");
        return Ok(());
    }

    let pb = ProgressBar::new(runs as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}]")?
            .progress_chars("█░ "),
    );

    let optimizer = Optimizer::new(config.clone(), Arc::new(SupportLevelPredictor::default()));
    let mut results = optimizer.optimize(&data, &grid, Some(&pb));
    pb.finish();
    println!();

    if results.is_empty() {
        info!("No valid results found.");
        return Ok(());
    }

    Optimizer::sort_results(&mut results, sort_key);
    info!("Total results: {}, sorted by: {}", results.len(), sort_by);

    let display_count = top.min(results.len());
    println!("\n{}", "=".repeat(100));
    println!("TOP {} OPTIMIZATION RESULTS (sorted by {})", display_count, sort_by);
    println!("{}", "=".repeat(100));
    println!(
        "{:<4} {:>7} {:>9} {:>8} {:>8} {:>6} | Parameters",
        "Rank", "Sharpe", "Return%", "MaxDD%", "WinR%", "Trades"
    );
    println!("{}", "-".repeat(100));

    for (i, result) in results.iter().take(display_count).enumerate() {
        println!(
            "{:<4} {:>7.2} {:>9.2} {:>8.2} {:>8.2} {:>6} | {}",
            i + 1,
            result.sharpe_ratio,
            result.total_return_pct,
            result.max_drawdown_pct,
            result.win_rate,
            result.total_trades,
            result.params
        );
    }
    println!("{}", "=".repeat(100));

    info!("Optimization completed successfully");
    Ok(())
}
