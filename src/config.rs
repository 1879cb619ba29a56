//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::TradingError;
use crate::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides();
        config
            .strategy
            .validate()
            .context("Invalid strategy section")?;

        Ok(config)
    }

    /// Load API credentials from the environment (and `.env`) if present
    pub fn apply_env_overrides(&mut self) {
        dotenv::dotenv().ok();

        if let Ok(api_key) = std::env::var("KUCOIN_API_KEY") {
            self.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("KUCOIN_API_SECRET") {
            self.exchange.api_secret = Some(api_secret);
        }
        if let Ok(passphrase) = std::env::var("KUCOIN_API_PASSPHRASE") {
            self.exchange.api_passphrase = Some(passphrase);
        }
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_passphrase: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Delay between paged REST requests
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://api.kucoin.com".to_string()
}
fn default_request_delay_ms() -> u64 {
    200
}
fn default_max_retries() -> u32 {
    3
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            api_passphrase: None,
            base_url: default_base_url(),
            request_delay_ms: default_request_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Trading configuration
///
/// `initial_capital` is the allocation base for entry sizing and the starting
/// cash of every simulation, in the quote currency of the traded pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    pub initial_capital: f64,
    /// Seconds between live ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// How long a last-known-good quote may stand in for a failed fetch
    #[serde(default = "default_stale_quote_secs")]
    pub stale_quote_secs: i64,
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}
fn default_timeframe() -> String {
    "1hour".to_string()
}
fn default_poll_interval() -> u64 {
    30
}
fn default_stale_quote_secs() -> i64 {
    300
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec![
                "BTC".to_string(),
                "ETH".to_string(),
                "XRP".to_string(),
                "BNB".to_string(),
                "DOGE".to_string(),
            ],
            quote_currency: default_quote_currency(),
            timeframe: default_timeframe(),
            initial_capital: 10_000.0,
            poll_interval_secs: default_poll_interval(),
            stale_quote_secs: default_stale_quote_secs(),
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }
}

/// Strategy parameters shared verbatim by the simulator and the live loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Number of predicted support levels price must be below to enter (1-7)
    #[serde(default = "default_entry_level_count")]
    pub entry_level_count: usize,

    /// DCA ladder in percent below average cost, strictly decreasing
    #[serde(default = "default_dca_levels")]
    pub dca_levels: Vec<f64>,

    /// Each DCA buys `last fill notional * dca_multiplier`
    #[serde(default = "default_dca_multiplier")]
    pub dca_multiplier: f64,

    #[serde(default = "default_max_dca_per_24h")]
    pub max_dca_per_24h: usize,

    /// Profit margin that arms the trailing exit when no DCA happened
    #[serde(default = "default_pm_no_dca")]
    pub pm_start_pct_no_dca: f64,

    /// Profit margin that arms the trailing exit after at least one DCA
    #[serde(default = "default_pm_with_dca")]
    pub pm_start_pct_with_dca: f64,

    /// Distance of the trailing line below the peak, in percent
    #[serde(default = "default_trailing_gap")]
    pub trailing_gap_pct: f64,

    #[serde(default = "default_fee_pct")]
    pub fee_pct: f64,

    #[serde(default = "default_slippage_pct")]
    pub slippage_pct: f64,

    /// Percent of the allocation base committed to a fresh entry
    #[serde(default = "default_start_alloc_pct")]
    pub start_alloc_pct: f64,
}

fn default_entry_level_count() -> usize {
    3
}
fn default_dca_levels() -> Vec<f64> {
    vec![-2.5, -5.0, -10.0, -20.0, -30.0, -40.0, -50.0]
}
fn default_dca_multiplier() -> f64 {
    2.0
}
fn default_max_dca_per_24h() -> usize {
    2
}
fn default_pm_no_dca() -> f64 {
    5.0
}
fn default_pm_with_dca() -> f64 {
    2.5
}
fn default_trailing_gap() -> f64 {
    0.5
}
fn default_fee_pct() -> f64 {
    0.075
}
fn default_slippage_pct() -> f64 {
    0.05
}
fn default_start_alloc_pct() -> f64 {
    0.5
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            entry_level_count: default_entry_level_count(),
            dca_levels: default_dca_levels(),
            dca_multiplier: default_dca_multiplier(),
            max_dca_per_24h: default_max_dca_per_24h(),
            pm_start_pct_no_dca: default_pm_no_dca(),
            pm_start_pct_with_dca: default_pm_with_dca(),
            trailing_gap_pct: default_trailing_gap(),
            fee_pct: default_fee_pct(),
            slippage_pct: default_slippage_pct(),
            start_alloc_pct: default_start_alloc_pct(),
        }
    }
}

impl StrategyConfig {
    pub fn with_entry_level_count(mut self, count: usize) -> Self {
        self.entry_level_count = count;
        self
    }

    pub fn with_dca_levels(mut self, levels: Vec<f64>) -> Self {
        self.dca_levels = levels;
        self
    }

    pub fn with_profit_margins(mut self, no_dca: f64, with_dca: f64) -> Self {
        self.pm_start_pct_no_dca = no_dca;
        self.pm_start_pct_with_dca = with_dca;
        self
    }

    pub fn with_trailing_gap(mut self, gap_pct: f64) -> Self {
        self.trailing_gap_pct = gap_pct;
        self
    }

    /// Set fee and slippage, both in percent
    pub fn with_costs(mut self, fee_pct: f64, slippage_pct: f64) -> Self {
        self.fee_pct = fee_pct;
        self.slippage_pct = slippage_pct;
        self
    }

    /// Check every invariant the state machine relies on
    pub fn validate(&self) -> Result<(), TradingError> {
        let invalid = |msg: String| Err(TradingError::InvalidConfig(msg));

        if !(1..=7).contains(&self.entry_level_count) {
            return invalid(format!(
                "entry_level_count must be between 1 and 7, got {}",
                self.entry_level_count
            ));
        }

        if self.dca_levels.is_empty() {
            return invalid("dca_levels must not be empty".to_string());
        }
        if self.dca_levels.iter().any(|l| !l.is_finite() || *l >= 0.0) {
            return invalid(format!(
                "dca_levels must all be negative percentages, got {:?}",
                self.dca_levels
            ));
        }
        if self.dca_levels.windows(2).any(|w| w[1] >= w[0]) {
            return invalid(format!(
                "dca_levels must be strictly decreasing, got {:?}",
                self.dca_levels
            ));
        }

        if !(self.dca_multiplier >= 1.0) {
            return invalid(format!(
                "dca_multiplier must be >= 1.0, got {}",
                self.dca_multiplier
            ));
        }

        if !(self.pm_start_pct_no_dca > 0.0) || !(self.pm_start_pct_with_dca > 0.0) {
            return invalid("profit margin thresholds must be positive".to_string());
        }

        let min_activation = self.pm_start_pct_no_dca.min(self.pm_start_pct_with_dca);
        if !(self.trailing_gap_pct > 0.0) || self.trailing_gap_pct >= min_activation {
            return invalid(format!(
                "trailing_gap_pct must be positive and below {}, got {}",
                min_activation, self.trailing_gap_pct
            ));
        }

        if !(self.fee_pct >= 0.0) || !(self.slippage_pct >= 0.0) {
            return invalid("fee_pct and slippage_pct must be >= 0".to_string());
        }

        if !(self.start_alloc_pct > 0.0 && self.start_alloc_pct <= 100.0) {
            return invalid(format!(
                "start_alloc_pct must be in (0, 100], got {}",
                self.start_alloc_pct
            ));
        }

        Ok(())
    }

    /// Activation threshold for the trailing exit given how many DCAs filled
    pub fn profit_margin_pct(&self, dca_count: usize) -> f64 {
        if dca_count > 0 {
            self.pm_start_pct_with_dca
        } else {
            self.pm_start_pct_no_dca
        }
    }

    /// Fee plus slippage, the total price adjustment applied to every fill
    pub fn total_cost_pct(&self) -> f64 {
        self.fee_pct + self.slippage_pct
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
    /// Bars consumed as predictor history before trading starts
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,
}

fn default_warmup_bars() -> usize {
    50
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            results_dir: "backtest_results".to_string(),
            warmup_bars: default_warmup_bars(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_is_valid() {
        assert!(StrategyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_entry_level_count_range() {
        let cfg = StrategyConfig::default().with_entry_level_count(0);
        assert!(cfg.validate().is_err());
        let cfg = StrategyConfig::default().with_entry_level_count(8);
        assert!(cfg.validate().is_err());
        let cfg = StrategyConfig::default().with_entry_level_count(7);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_dca_levels_must_decrease() {
        let cfg = StrategyConfig::default().with_dca_levels(vec![-2.5, -2.5, -10.0]);
        assert!(cfg.validate().is_err());
        let cfg = StrategyConfig::default().with_dca_levels(vec![-5.0, -2.5]);
        assert!(cfg.validate().is_err());
        let cfg = StrategyConfig::default().with_dca_levels(vec![1.0, -2.5]);
        assert!(cfg.validate().is_err());
        let cfg = StrategyConfig::default().with_dca_levels(vec![]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_trailing_gap_below_activation() {
        let cfg = StrategyConfig::default().with_trailing_gap(2.5);
        assert!(cfg.validate().is_err());
        let cfg = StrategyConfig::default().with_trailing_gap(0.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_profit_margin_switches_after_dca() {
        let cfg = StrategyConfig::default();
        assert_eq!(cfg.profit_margin_pct(0), 5.0);
        assert_eq!(cfg.profit_margin_pct(3), 2.5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "trading": { "symbols": ["BTC"], "initial_capital": 5000.0 },
            "strategy": { "entry_level_count": 4 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.initial_capital, 5000.0);
        assert_eq!(config.trading.timeframe, "1hour");
        assert_eq!(config.strategy.entry_level_count, 4);
        assert_eq!(config.strategy.dca_levels.len(), 7);
        assert_eq!(config.backtest.warmup_bars, 50);
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/default.json");
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.strategy, StrategyConfig::default());
        assert_eq!(config.trading.symbols().len(), 5);
    }
}
