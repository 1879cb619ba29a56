//! Blocking KuCoin REST client
//!
//! Serves as both the live `PriceSource` (paged candles, level-1 quotes) and
//! the live `ExecutionAdapter` (signed market orders). The live loop calls it
//! from tokio's blocking pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::sleep;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::auth::Credentials;
use super::types::{
    parse_candle_row, ApiResponse, CandleRow, Level1, MarketOrderRequest, OrderDetails,
    OrderPlaced,
};
use crate::config::ExchangeConfig;
use crate::data::{normalize_bars, PriceSource, Quote};
use crate::error::{Result, TradingError};
use crate::execution::{ExecutionAdapter, FillRequest, FillResult, OrderAmount};
use crate::{Bar, Symbol};

/// Most candles KuCoin returns per request
pub const MAX_CANDLES_PER_REQUEST: i64 = 1500;

/// Times an order is polled before giving up on a fill report
const ORDER_POLL_ATTEMPTS: u32 = 10;

/// Candle type string to its length in seconds
pub fn timeframe_secs(timeframe: &str) -> Option<i64> {
    let secs = match timeframe {
        "1min" => 60,
        "3min" => 180,
        "5min" => 300,
        "15min" => 900,
        "30min" => 1_800,
        "1hour" => 3_600,
        "2hour" => 7_200,
        "4hour" => 14_400,
        "6hour" => 21_600,
        "8hour" => 28_800,
        "12hour" => 43_200,
        "1day" => 86_400,
        "1week" => 604_800,
        _ => return None,
    };
    Some(secs)
}

pub struct KuCoinClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    quote_currency: String,
    request_delay: StdDuration,
    max_retries: u32,
    order_seq: AtomicU64,
}

/// Doubling backoff: base, 2x base, 4x base, ...
fn retry_backoff(base: StdDuration, attempt: u32) -> StdDuration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

impl KuCoinClient {
    pub fn new(config: &ExchangeConfig, quote_currency: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(10))
            .user_agent(concat!("dip-trader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: Credentials::from_config(config),
            quote_currency: quote_currency.into(),
            request_delay: StdDuration::from_millis(config.request_delay_ms),
            max_retries: config.max_retries,
            order_seq: AtomicU64::new(0),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Exchange pair for a base symbol: BTC -> BTC-USDT
    pub fn pair(&self, symbol: &Symbol) -> String {
        let s = symbol.as_str().to_uppercase();
        if s.contains('-') {
            s
        } else {
            format!("{}-{}", s, self.quote_currency.to_uppercase())
        }
    }

    /// Send with retries on transport errors, 429 and 5xx
    fn send<T: DeserializeOwned>(
        &self,
        build: impl Fn() -> RequestBuilder,
        map_err: fn(String) -> TradingError,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            let outcome = build().send();
            let retryable = match &outcome {
                Ok(resp) => {
                    resp.status() == StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error()
                }
                Err(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            };

            if retryable && attempt < self.max_retries {
                attempt += 1;
                let backoff = retry_backoff(self.request_delay, attempt);
                warn!("KuCoin request failed, retry {}/{} in {:?}", attempt, self.max_retries, backoff);
                sleep(backoff);
                continue;
            }

            let resp = outcome.map_err(|e| map_err(format!("request failed: {}", e)))?;
            let status = resp.status();
            let body = resp
                .text()
                .map_err(|e| map_err(format!("failed to read response: {}", e)))?;
            if !status.is_success() {
                return Err(map_err(format!("HTTP {}: {}", status, body)));
            }

            let envelope: ApiResponse<T> = serde_json::from_str(&body)
                .map_err(|e| map_err(format!("failed to parse response: {}", e)))?;
            return envelope.into_data(map_err);
        }
    }

    fn get_public<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        self.send(
            || self.client.get(&url).query(query),
            TradingError::DataUnavailable,
        )
    }

    fn signed<T: DeserializeOwned>(&self, method: &str, endpoint: &str, body: Option<String>) -> Result<T> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            TradingError::InvalidConfig("KuCoin API credentials are not configured".to_string())
        })?;
        let url = format!("{}{}", self.base_url, endpoint);
        let body = body.unwrap_or_default();

        self.send(
            || {
                // timestamp is part of the signature, so each attempt re-signs
                let ts = Utc::now().timestamp_millis();
                let mut req = match method {
                    "POST" => self
                        .client
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .body(body.clone()),
                    _ => self.client.get(&url),
                };
                for (name, value) in creds.headers(ts, method, endpoint, &body) {
                    req = req.header(name, value);
                }
                req
            },
            TradingError::OrderRejected,
        )
    }

    /// One page of candles in `[start, end)`, unsorted as returned
    pub fn fetch_candles(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let rows: Vec<CandleRow> = self.get_public(
            "/api/v1/market/candles",
            &[
                ("symbol", self.pair(symbol)),
                ("type", timeframe.to_string()),
                ("startAt", start.timestamp().to_string()),
                ("endAt", end.timestamp().to_string()),
            ],
        )?;

        let total = rows.len();
        let bars: Vec<Bar> = rows.iter().filter_map(|row| parse_candle_row(row)).collect();
        if bars.len() < total {
            warn!("{}: skipped {} malformed candle rows", symbol, total - bars.len());
        }
        Ok(bars)
    }

    /// Full history between `start` and `end`, fetched in windows of
    /// `MAX_CANDLES_PER_REQUEST` candles
    pub fn fetch_history(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let step = timeframe_secs(timeframe).ok_or_else(|| {
            TradingError::InvalidConfig(format!("unsupported KuCoin timeframe '{}'", timeframe))
        })?;
        let window = Duration::seconds(step * MAX_CANDLES_PER_REQUEST);

        info!("Fetching {} {} data from {} to {}", symbol, timeframe, start, end);

        let mut all_bars = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let chunk_end = (cursor + window).min(end);
            let bars = self.fetch_candles(symbol, timeframe, cursor, chunk_end)?;
            debug!("  {} candles for {} .. {}", bars.len(), cursor, chunk_end);
            all_bars.extend(bars);
            cursor = chunk_end;

            if cursor < end {
                sleep(self.request_delay);
            }
        }

        let mut bars = normalize_bars(all_bars);
        bars.retain(|b| b.timestamp >= start && b.timestamp <= end);
        info!("Total candles fetched for {}: {}", symbol, bars.len());
        Ok(bars)
    }

    pub fn level1(&self, symbol: &Symbol) -> Result<Quote> {
        let level1: Level1 = self.get_public(
            "/api/v1/market/orderbook/level1",
            &[("symbol", self.pair(symbol))],
        )?;
        level1
            .to_quote()
            .ok_or_else(|| TradingError::DataUnavailable(format!("{}: empty order book", symbol)))
    }

    fn next_client_oid(&self) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed);
        format!("dip-{}-{}", Utc::now().timestamp_millis(), seq)
    }

    pub fn place_market_order(&self, order: &MarketOrderRequest) -> Result<String> {
        let body = serde_json::to_string(order)
            .map_err(|e| TradingError::OrderRejected(format!("failed to encode order: {}", e)))?;
        let placed: OrderPlaced = self.signed("POST", "/api/v1/orders", Some(body))?;
        info!("Placed {} market order {} on {}", order.side, placed.order_id, order.symbol);
        Ok(placed.order_id)
    }

    pub fn order_details(&self, order_id: &str) -> Result<OrderDetails> {
        self.signed("GET", &format!("/api/v1/orders/{}", order_id), None)
    }

    /// Poll an order until it is no longer active and report what was dealt
    fn wait_for_fill(&self, order_id: &str) -> Result<FillResult> {
        for _ in 0..ORDER_POLL_ATTEMPTS {
            let details = self.order_details(order_id)?;
            if !details.is_active {
                return details.to_fill().ok_or_else(|| {
                    TradingError::OrderRejected(format!(
                        "order {} on {} closed without a fill",
                        details.id, details.symbol
                    ))
                });
            }
            sleep(self.request_delay);
        }
        Err(TradingError::OrderRejected(format!(
            "order {} still active after {} polls",
            order_id, ORDER_POLL_ATTEMPTS
        )))
    }
}

impl PriceSource for KuCoinClient {
    fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        self.fetch_history(symbol, timeframe, start, end)
    }

    fn fetch_quote(&self, symbol: &Symbol) -> Result<Quote> {
        self.level1(symbol)
    }
}

impl ExecutionAdapter for KuCoinClient {
    fn fill(&self, request: &FillRequest) -> Result<FillResult> {
        let pair = self.pair(&request.symbol);
        let oid = self.next_client_oid();

        let order = match (request.side.is_buy(), request.amount) {
            (true, OrderAmount::Notional(funds)) => MarketOrderRequest::buy_funds(oid, pair, funds),
            (true, OrderAmount::Quantity(qty)) => {
                MarketOrderRequest::buy_funds(oid, pair, qty * request.reference_price)
            }
            (false, OrderAmount::Quantity(qty)) => MarketOrderRequest::sell_size(oid, pair, qty),
            (false, OrderAmount::Notional(funds)) => {
                MarketOrderRequest::sell_size(oid, pair, funds / request.reference_price)
            }
        };

        let order_id = self.place_market_order(&order)?;
        self.wait_for_fill(&order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(quote: &str) -> KuCoinClient {
        KuCoinClient::new(&ExchangeConfig::default(), quote).unwrap()
    }

    #[test]
    fn test_pair_formatting() {
        let c = client("USDT");
        assert_eq!(c.pair(&Symbol::new("btc")), "BTC-USDT");
        assert_eq!(c.pair(&Symbol::new("ETH-BTC")), "ETH-BTC");
    }

    #[test]
    fn test_timeframe_secs() {
        assert_eq!(timeframe_secs("1hour"), Some(3_600));
        assert_eq!(timeframe_secs("1day"), Some(86_400));
        assert_eq!(timeframe_secs("1h"), None);
    }

    #[test]
    fn test_signed_requests_need_credentials() {
        let c = client("USDT");
        assert!(!c.has_credentials());
        let err = c.order_details("abc").unwrap_err();
        assert!(matches!(err, TradingError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_timeframe_rejected_before_network() {
        let c = client("USDT");
        let now = Utc::now();
        let err = c
            .fetch_history(&Symbol::new("BTC"), "7min", now - Duration::days(1), now)
            .unwrap_err();
        assert!(matches!(err, TradingError::InvalidConfig(_)));
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let base = StdDuration::from_millis(200);
        assert_eq!(retry_backoff(base, 1), base);
        assert_eq!(retry_backoff(base, 2), StdDuration::from_millis(400));
        assert_eq!(retry_backoff(base, 4), StdDuration::from_millis(1_600));
    }

    #[test]
    fn test_client_oids_are_unique() {
        let c = client("USDT");
        assert_ne!(c.next_client_oid(), c.next_client_oid());
    }
}
