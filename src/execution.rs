//! Order execution seam
//!
//! The state machine never talks to an exchange. A decision is turned into a
//! `FillRequest`, an `ExecutionAdapter` produces a `FillResult`, and only a
//! successful fill is applied to the position.

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::error::{Result, TradingError};
use crate::{FillSide, Symbol};

/// Size of an order, either in quote currency or in base units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderAmount {
    Notional(f64),
    Quantity(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillRequest {
    pub side: FillSide,
    pub symbol: Symbol,
    pub amount: OrderAmount,
    /// Quote the decision was made on
    pub reference_price: f64,
}

impl FillRequest {
    pub fn buy(side: FillSide, symbol: Symbol, notional: f64, reference_price: f64) -> Self {
        Self {
            side,
            symbol,
            amount: OrderAmount::Notional(notional),
            reference_price,
        }
    }

    pub fn sell(symbol: Symbol, quantity: f64, reference_price: f64) -> Self {
        Self {
            side: FillSide::Exit,
            symbol,
            amount: OrderAmount::Quantity(quantity),
            reference_price,
        }
    }
}

/// Executed fill
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FillResult {
    pub price: f64,
    pub quantity: f64,
    /// Explicit fee charged on top of the fill price
    pub fee: f64,
}

impl FillResult {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }

    /// Signed change to cash: buys pay notional plus fee, sells receive notional minus fee
    pub fn cash_delta(&self, side: FillSide) -> f64 {
        if side.is_buy() {
            -(self.notional() + self.fee)
        } else {
            self.notional() - self.fee
        }
    }
}

/// Turns a decision into a fill
pub trait ExecutionAdapter: Send + Sync {
    /// Execute `request`. Any error means no fill happened.
    fn fill(&self, request: &FillRequest) -> Result<FillResult>;
}

/// Fee and slippage model used by the backtester and paper trading
///
/// Fills are priced at `reference * (1 ± (fee + slippage)/100)` and the fee
/// is charged again as an explicit line item on the order notional, matching
/// how the live strategy books its fills.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedExecution {
    pub fee_pct: f64,
    pub slippage_pct: f64,
}

impl SimulatedExecution {
    pub fn new(fee_pct: f64, slippage_pct: f64) -> Self {
        Self {
            fee_pct,
            slippage_pct,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.fee_pct, config.slippage_pct)
    }

    /// Reference price adjusted for fee and slippage against the trader
    pub fn fill_price(&self, reference_price: f64, is_buy: bool) -> f64 {
        let total_pct = self.fee_pct + self.slippage_pct;
        if is_buy {
            reference_price * (1.0 + total_pct / 100.0)
        } else {
            reference_price * (1.0 - total_pct / 100.0)
        }
    }
}

impl ExecutionAdapter for SimulatedExecution {
    fn fill(&self, request: &FillRequest) -> Result<FillResult> {
        let reference = request.reference_price;
        if !(reference > 0.0) {
            return Err(TradingError::OrderRejected(format!(
                "{} {}: reference price must be positive, got {}",
                request.side, request.symbol, reference
            )));
        }

        if request.side.is_buy() {
            let notional = match request.amount {
                OrderAmount::Notional(n) => n,
                OrderAmount::Quantity(q) => q * reference,
            };
            if !(notional > 0.0) {
                return Err(TradingError::OrderRejected(format!(
                    "{} {}: notional must be positive, got {}",
                    request.side, request.symbol, notional
                )));
            }

            let price = self.fill_price(reference, true);
            let fee = notional * (self.fee_pct / 100.0);
            let quantity = (notional - fee) / price;
            Ok(FillResult {
                price,
                quantity,
                fee,
            })
        } else {
            let quantity = match request.amount {
                OrderAmount::Quantity(q) => q,
                OrderAmount::Notional(n) => n / reference,
            };
            if !(quantity > 0.0) {
                return Err(TradingError::OrderRejected(format!(
                    "{} {}: quantity must be positive, got {}",
                    request.side, request.symbol, quantity
                )));
            }

            let price = self.fill_price(reference, false);
            let fee = quantity * price * (self.fee_pct / 100.0);
            Ok(FillResult {
                price,
                quantity,
                fee,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_buy_fill_charges_fee_twice() {
        let exec = SimulatedExecution::new(0.075, 0.05);
        let req = FillRequest::buy(FillSide::Entry, Symbol::new("BTC"), 50.0, 100.0);
        let fill = exec.fill(&req).unwrap();

        assert_relative_eq!(fill.price, 100.125, epsilon = 1e-9);
        assert_relative_eq!(fill.fee, 0.0375, epsilon = 1e-12);
        assert_relative_eq!(fill.quantity, (50.0 - 0.0375) / 100.125, epsilon = 1e-12);
        assert_relative_eq!(fill.cash_delta(FillSide::Entry), -50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sell_fill() {
        let exec = SimulatedExecution::new(0.075, 0.05);
        let req = FillRequest::sell(Symbol::new("BTC"), 2.0, 100.0);
        let fill = exec.fill(&req).unwrap();

        assert_relative_eq!(fill.price, 99.875, epsilon = 1e-9);
        assert_relative_eq!(fill.fee, 2.0 * 99.875 * 0.00075, epsilon = 1e-12);
        assert_relative_eq!(
            fill.cash_delta(FillSide::Exit),
            2.0 * 99.875 - fill.fee,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_zero_cost_fill_is_exact() {
        let exec = SimulatedExecution::new(0.0, 0.0);
        let fill = exec
            .fill(&FillRequest::buy(FillSide::Dca, Symbol::new("ETH"), 100.0, 94.0))
            .unwrap();
        assert_eq!(fill.price, 94.0);
        assert_eq!(fill.fee, 0.0);
        assert_relative_eq!(fill.quantity, 100.0 / 94.0);
    }

    #[test]
    fn test_rejects_non_positive_orders() {
        let exec = SimulatedExecution::new(0.1, 0.0);
        let err = exec
            .fill(&FillRequest::buy(FillSide::Entry, Symbol::new("BTC"), 0.0, 100.0))
            .unwrap_err();
        assert!(err.is_tick_local());

        let err = exec
            .fill(&FillRequest::sell(Symbol::new("BTC"), 1.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, TradingError::OrderRejected(_)));
    }
}
