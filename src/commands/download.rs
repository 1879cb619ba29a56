//! Download command - fetch historical candles from KuCoin into CSV files

use std::path::Path;

use anyhow::Result;
use chrono::{Duration, Utc};
use dip_trader::data::{csv_filename, save_csv};
use dip_trader::kucoin::{timeframe_secs, KuCoinClient};
use dip_trader::{Config, Symbol};
use tracing::{error, info};

use super::parse_list;

pub fn run(
    config_path: Option<String>,
    symbols: String,
    timeframes: String,
    days: u32,
    output: String,
) -> Result<()> {
    info!("Starting data download from KuCoin");

    let config = match &config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let client = KuCoinClient::new(&config.exchange, &config.trading.quote_currency)?;

    let symbols: Vec<Symbol> = parse_list(&symbols)
        .iter()
        .map(|s| Symbol::new(s.to_uppercase()))
        .collect();
    let intervals = parse_list(&timeframes);
    for tf in &intervals {
        if timeframe_secs(tf).is_none() {
            anyhow::bail!("Unsupported timeframe '{}'", tf);
        }
    }

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOADING HISTORICAL DATA FROM KUCOIN");
    println!("{}", "=".repeat(60));
    println!("  Symbols:    {:?}", symbols.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    println!("  Timeframes: {:?}", intervals);
    println!("  Days:       {}", days);
    println!("  Output:     {}", output);
    println!("{}\n", "=".repeat(60));

    let end = Utc::now();
    let start = end - Duration::days(i64::from(days));

    let mut total_candles = 0;
    let mut success_count = 0;
    let mut total_downloads = 0;

    for symbol in &symbols {
        println!("\n{}:", symbol);

        for interval in &intervals {
            total_downloads += 1;
            print!("  Downloading {} {}... ", symbol, interval);

            let path = Path::new(&output).join(csv_filename(symbol, interval));
            let outcome = client
                .fetch_history(symbol, interval, start, end)
                .map_err(anyhow::Error::from)
                .and_then(|bars| save_csv(&bars, &path).map(|_| bars.len()));

            match outcome {
                Ok(count) => {
                    total_candles += count;
                    success_count += 1;
                    println!("✓ {} candles", count);
                }
                Err(e) => {
                    println!("✗ Error: {:#}", e);
                    error!("{} {} download failed: {:#}", symbol, interval, e);
                }
            }
        }
    }

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOAD COMPLETE");
    println!("{}", "=".repeat(60));
    println!("  Successful: {}/{}", success_count, total_downloads);
    println!("  Total candles: {}", total_candles);
    println!("{}", "=".repeat(60));

    Ok(())
}
