//! CLI subcommands

pub mod backtest;
pub mod download;
pub mod live;
pub mod optimize;

use anyhow::{Context, Result};
use clap::Args;
use dip_trader::Config;
use tracing::info;

/// Config overrides shared by every command that runs the strategy
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Initial capital
    #[arg(long)]
    pub capital: Option<f64>,

    /// Fee per fill in percent
    #[arg(long)]
    pub fee: Option<f64>,

    /// Slippage per fill in percent
    #[arg(long)]
    pub slippage: Option<f64>,

    /// Support levels price must break to enter (1-7)
    #[arg(long)]
    pub entry_level: Option<usize>,

    /// Bar timeframe, e.g. "1hour"
    #[arg(long)]
    pub timeframe: Option<String>,

    /// Symbols to trade (comma-separated), e.g. "BTC,ETH"
    #[arg(long)]
    pub symbols: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(capital) = self.capital {
            info!("Overriding initial capital to: ${:.2}", capital);
            config.trading.initial_capital = capital;
        }
        if let Some(fee) = self.fee {
            info!("Overriding fee to: {}%", fee);
            config.strategy.fee_pct = fee;
        }
        if let Some(slippage) = self.slippage {
            info!("Overriding slippage to: {}%", slippage);
            config.strategy.slippage_pct = slippage;
        }
        if let Some(level) = self.entry_level {
            info!("Overriding entry level count to: {}", level);
            config.strategy.entry_level_count = level;
        }
        if let Some(timeframe) = &self.timeframe {
            info!("Overriding timeframe to: {}", timeframe);
            config.trading.timeframe = timeframe.clone();
        }
        if let Some(symbols) = &self.symbols {
            config.trading.symbols = parse_list(symbols)
                .into_iter()
                .map(|s| s.to_uppercase())
                .collect();
            info!("Overriding symbols to: {:?}", config.trading.symbols);
        }

        config
            .strategy
            .validate()
            .context("Invalid strategy after CLI overrides")?;
        Ok(())
    }
}

/// Load the config file and apply CLI overrides
pub fn load_config(path: &str, overrides: &Overrides) -> Result<Config> {
    let mut config =
        Config::from_file(path).with_context(|| format!("Failed to load config from {}", path))?;
    info!("Loaded configuration from: {}", path);
    overrides.apply(&mut config)?;
    Ok(config)
}

/// Split a comma-separated list, dropping empty entries
pub fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

/// Parse comma-separated floats, failing on the first bad entry
pub fn parse_float_list(s: &str) -> Result<Vec<f64>> {
    parse_list(s)
        .iter()
        .map(|x| x.parse().with_context(|| format!("Invalid number '{}'", x)))
        .collect()
}

/// Parse comma-separated integers, failing on the first bad entry
pub fn parse_int_list(s: &str) -> Result<Vec<usize>> {
    parse_list(s)
        .iter()
        .map(|x| x.parse().with_context(|| format!("Invalid integer '{}'", x)))
        .collect()
}
