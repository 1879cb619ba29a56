//! Dip Trader
//!
//! Buy-the-dip, scale-in, trail-out strategy for crypto spot markets. One
//! per-asset state machine drives both the backtester and the live trader:
//! entry when price breaks predicted support levels, DCA down a percentage
//! ladder, exit on a trailing profit line.

pub mod backtest;
pub mod capital;
pub mod config;
pub mod data;
pub mod error;
pub mod execution;
pub mod journal;
pub mod kucoin;
pub mod live;
pub mod metrics;
pub mod optimize;
pub mod position;
pub mod predictor;
pub mod report;
pub mod state_machine;
pub mod types;

pub use config::Config;
pub use error::{Result, TradingError};
pub use types::*;
