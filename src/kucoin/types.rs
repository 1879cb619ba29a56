//! Request and response types for the KuCoin spot REST API
//!
//! KuCoin wraps every payload in `{"code": "200000", "data": ...}` and sends
//! decimals as strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Quote;
use crate::error::TradingError;
use crate::execution::FillResult;
use crate::Bar;

pub const SUCCESS_CODE: &str = "200000";

/// Response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub code: String,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Payload of a successful response; any other code becomes `map_err(msg)`
    pub fn into_data(self, map_err: impl FnOnce(String) -> TradingError) -> Result<T, TradingError> {
        if self.code != SUCCESS_CODE {
            return Err(map_err(format!(
                "KuCoin error {}: {}",
                self.code,
                self.msg.as_deref().unwrap_or("unknown error")
            )));
        }
        self.data
            .ok_or_else(|| map_err("KuCoin response without data".to_string()))
    }
}

/// Candle row: `[time(s), open, close, high, low, volume, turnover]`
pub type CandleRow = Vec<String>;

/// Parse a candle row. Note the KuCoin column order puts close before high/low.
pub fn parse_candle_row(row: &[String]) -> Option<Bar> {
    if row.len() < 6 {
        return None;
    }
    let secs: i64 = row[0].parse().ok()?;
    let num = |i: usize| row[i].parse::<f64>().ok();

    Some(Bar::new_unchecked(
        DateTime::from_timestamp(secs, 0)?,
        num(1)?,
        num(3)?,
        num(4)?,
        num(2)?,
        num(5)?,
    ))
}

/// Level-1 order book snapshot
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level1 {
    pub price: String,
    pub best_bid: String,
    pub best_ask: String,
    /// Milliseconds since epoch
    pub time: i64,
}

impl Level1 {
    pub fn to_quote(&self) -> Option<Quote> {
        let quote = Quote {
            bid: self.best_bid.parse().ok()?,
            ask: self.best_ask.parse().ok()?,
            last: self.price.parse().ok()?,
            timestamp: DateTime::from_timestamp_millis(self.time).unwrap_or_else(Utc::now),
        };
        quote.is_valid().then_some(quote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Market order body for `POST /api/v1/orders`. Buys are sized in quote
/// currency (`funds`), sells in base units (`size`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketOrderRequest {
    pub client_oid: String,
    pub side: OrderSide,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funds: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl MarketOrderRequest {
    pub fn buy_funds(client_oid: String, symbol: String, funds: f64) -> Self {
        Self {
            client_oid,
            side: OrderSide::Buy,
            symbol,
            order_type: "market",
            funds: Some(format_decimal(funds)),
            size: None,
        }
    }

    pub fn sell_size(client_oid: String, symbol: String, size: f64) -> Self {
        Self {
            client_oid,
            side: OrderSide::Sell,
            symbol,
            order_type: "market",
            funds: None,
            size: Some(format_decimal(size)),
        }
    }
}

// TODO: round to the pair's baseIncrement/quoteIncrement from /api/v2/symbols
pub fn format_decimal(value: f64) -> String {
    let s = format!("{:.8}", value);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub order_id: String,
}

/// Subset of `GET /api/v1/orders/{orderId}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    pub id: String,
    pub symbol: String,
    pub deal_funds: String,
    pub deal_size: String,
    pub fee: String,
    pub is_active: bool,
    #[serde(default)]
    pub cancel_exist: bool,
}

impl OrderDetails {
    /// Executed fill; None while nothing has been dealt
    pub fn to_fill(&self) -> Option<FillResult> {
        let funds: f64 = self.deal_funds.parse().ok()?;
        let size: f64 = self.deal_size.parse().ok()?;
        let fee: f64 = self.fee.parse().ok()?;
        if !(size > 0.0) || !(funds > 0.0) {
            return None;
        }
        Some(FillResult {
            price: funds / size,
            quantity: size,
            fee,
        })
    }
}
