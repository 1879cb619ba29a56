//! Backtest reporting: console summary and JSON result files

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::backtest::SimulationResult;

const RECENT_TRADES: usize = 10;

fn date_or_unknown(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Format the report printed by `print_report`
pub fn render_report(result: &SimulationResult) -> String {
    let m = &result.metrics;
    let rule = "=".repeat(60);
    let thin = "-".repeat(40);
    let mut out = String::new();

    // writing to a String cannot fail
    let _ = writeln!(out, "\n{}", rule);
    let _ = writeln!(out, "BACKTEST REPORT: {}", result.symbol);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(
        out,
        "\nPeriod: {} to {}",
        date_or_unknown(result.start),
        date_or_unknown(result.end)
    );
    let _ = writeln!(out, "Initial Capital:  ${:>12.2}", result.initial_capital);
    let _ = writeln!(out, "Final Capital:    ${:>12.2}", result.final_capital);
    let _ = writeln!(out, "Total Return:     {:>12.2}%", result.total_return_pct);

    let _ = writeln!(out, "\n{}\nTRADE STATISTICS\n{}", thin, thin);
    let _ = writeln!(out, "Total Trades:     {:>12}", m.total_trades);
    let _ = writeln!(out, "Winning Trades:   {:>12}", m.winning_trades);
    let _ = writeln!(out, "Losing Trades:    {:>12}", m.losing_trades);
    let _ = writeln!(out, "Win Rate:         {:>11.1}%", m.win_rate);
    let _ = writeln!(out, "Avg P&L:          ${:>11.2}", m.avg_pnl);
    let _ = writeln!(out, "Avg P&L %:        {:>11.2}%", m.avg_pnl_pct);
    let _ = writeln!(out, "Profit Factor:    {:>12.2}", m.profit_factor);
    let _ = writeln!(out, "Expectancy:       ${:>11.2}", m.expectancy);
    let _ = writeln!(out, "Avg Holding Time: {:>10.1}h", m.avg_holding_hours);
    let _ = writeln!(out, "Avg DCAs/Trade:   {:>11.1}", m.avg_dca_per_trade);

    let _ = writeln!(out, "\n{}\nRISK METRICS\n{}", thin, thin);
    let _ = writeln!(out, "Max Drawdown:     {:>11.2}%", m.max_drawdown_pct);
    let _ = writeln!(out, "Sharpe Ratio:     {:>12.2}", m.sharpe_ratio);
    let _ = writeln!(out, "Total Fees Paid:  ${:>11.2}", m.total_fees);

    if !result.trades.is_empty() {
        let _ = writeln!(out, "\n{}\nRECENT TRADES (Last {})\n{}", thin, RECENT_TRADES, thin);
        let skip = result.trades.len().saturating_sub(RECENT_TRADES);
        for trade in &result.trades[skip..] {
            let _ = writeln!(
                out,
                "  {} -> {}: ${:>8.2} ({:>5.1}%) [{}] DCAs:{} {:?}",
                trade.entry_time.format("%Y-%m-%d"),
                trade.exit_time.format("%Y-%m-%d"),
                trade.pnl,
                trade.pnl_pct,
                if trade.is_win() { "WIN" } else { "LOSS" },
                trade.dca_count,
                trade.exit_reason
            );
        }
    }

    let _ = writeln!(out, "\n{}", rule);
    out
}

pub fn print_report(result: &SimulationResult) {
    print!("{}", render_report(result));
}

/// Write `result` as pretty JSON to `{dir}/{SYMBOL}_{start}_{end}.json`
pub fn save_results(result: &SimulationResult, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create results dir {}", dir.display()))?;

    let path = dir.join(format!(
        "{}_{}_{}.json",
        result.symbol,
        date_or_unknown(result.start),
        date_or_unknown(result.end)
    ));
    let json = serde_json::to_string_pretty(result).context("Failed to serialize results")?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

    info!("Results saved to: {}", path.display());
    Ok(path)
}
