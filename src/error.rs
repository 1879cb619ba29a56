//! Error taxonomy for the strategy core

use thiserror::Error;

use crate::types::BarValidationError;

#[derive(Debug, Error)]
pub enum TradingError {
    /// Fewer bars than the warmup period; fatal to the run
    #[error("insufficient data: got {available} bars, need at least {required}")]
    InsufficientData { available: usize, required: usize },

    #[error("insufficient funds: requested {requested:.2}, available {available:.2}")]
    InsufficientFunds { requested: f64, available: f64 },

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A fill was applied in a state that cannot accept it
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    InvalidBar(#[from] BarValidationError),
}

impl TradingError {
    /// Errors that only void the current decision tick
    pub fn is_tick_local(&self) -> bool {
        matches!(
            self,
            TradingError::InsufficientFunds { .. } | TradingError::OrderRejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;
