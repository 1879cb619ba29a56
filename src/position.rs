//! Per-asset position bookkeeping
//!
//! `Position` and `TrailingExit` live only while a trade is open. `DcaWindow`
//! outlives them so the rolling 24h DCA cap keeps working across trades and,
//! when persisted by a journal, across restarts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Open position state. A fresh `Position` is flat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub quantity: f64,
    /// Cumulative spend of buy fills (price * quantity, explicit fees excluded)
    pub cost_basis: f64,
    pub avg_price: f64,
    pub entry_time: Option<DateTime<Utc>>,
    pub dca_count: usize,
    pub dca_fill_timestamps: Vec<DateTime<Utc>>,
    pub peak_price_since_entry: f64,
    /// Dollar size of the most recent buy fill, base of the next DCA
    pub last_fill_notional: f64,
    /// Explicit fees paid on buy fills of this trade
    pub fees_paid: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.quantity > 0.0
    }

    /// Add a buy fill (entry or DCA)
    pub fn add(&mut self, price: f64, quantity: f64, fee: f64, timestamp: DateTime<Utc>) {
        let cost = price * quantity;
        self.cost_basis += cost;
        self.quantity += quantity;
        self.avg_price = if self.quantity > 0.0 {
            self.cost_basis / self.quantity
        } else {
            0.0
        };
        if self.entry_time.is_none() {
            self.entry_time = Some(timestamp);
        }
        self.last_fill_notional = cost;
        self.fees_paid += fee;
    }

    /// Raise the running peak; never lowers it
    pub fn observe_high(&mut self, high: f64) {
        if high > self.peak_price_since_entry {
            self.peak_price_since_entry = high;
        }
    }

    /// Unrealized return of `price` against average cost, in percent
    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        if self.avg_price <= 0.0 {
            return 0.0;
        }
        (price - self.avg_price) / self.avg_price * 100.0
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity * price
    }

    pub fn reset(&mut self) {
        *self = Position::default();
    }
}

/// Trailing profit-margin exit
///
/// `line` starts on the activation line (average cost plus the profit margin)
/// and only ever rises while the position is open, including when a DCA lowers
/// the activation line. Price closing at or above it arms the trail; from then
/// on the line also follows `peak * (1 - gap)` upward. An exit fires on the tick price moves from at-or-above
/// the line to below it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrailingExit {
    pub armed: bool,
    pub line: f64,
    pub was_above: bool,
}

impl TrailingExit {
    pub fn new(activation_line: f64) -> Self {
        Self {
            armed: false,
            line: activation_line,
            was_above: false,
        }
    }

    /// Advance one tick. Returns true when the exit fires.
    pub fn update(&mut self, price: f64, peak: f64, activation_line: f64, gap_pct: f64) -> bool {
        if self.line < activation_line {
            self.line = activation_line;
        }

        let above_now = price >= self.line;
        if !self.armed && above_now {
            self.armed = true;
        }

        let mut fire = false;
        if self.armed {
            let trailed = (peak * (1.0 - gap_pct / 100.0)).max(activation_line);
            if trailed > self.line {
                self.line = trailed;
            }
            fire = self.was_above && price < self.line;
        }

        self.was_above = above_now;
        fire
    }
}

/// Rolling window of DCA fill times
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DcaWindow {
    fills: Vec<DateTime<Utc>>,
    last_exit: Option<DateTime<Utc>>,
}

impl DcaWindow {
    pub const SPAN_HOURS: i64 = 24;

    pub fn from_parts(fills: Vec<DateTime<Utc>>, last_exit: Option<DateTime<Utc>>) -> Self {
        let mut window = Self { fills, last_exit };
        window.fills.sort();
        window
    }

    pub fn record_fill(&mut self, at: DateTime<Utc>) {
        self.fills.push(at);
    }

    /// Close the current trade; earlier fills stop counting
    pub fn record_exit(&mut self, at: DateTime<Utc>) {
        self.last_exit = Some(at);
        self.fills.clear();
    }

    /// Fills of the current trade that are less than 24h old at `now`
    pub fn count_recent(&self, now: DateTime<Utc>) -> usize {
        let span = Duration::hours(Self::SPAN_HOURS);
        self.fills
            .iter()
            .filter(|&&t| self.last_exit.map_or(true, |exit| t > exit))
            .filter(|&&t| now - t < span)
            .count()
    }

    /// Drop fills that can no longer count at `now`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let span = Duration::hours(Self::SPAN_HOURS);
        let last_exit = self.last_exit;
        self.fills
            .retain(|&t| now - t < span && last_exit.map_or(true, |exit| t > exit));
    }

    pub fn fills(&self) -> &[DateTime<Utc>] {
        &self.fills
    }

    pub fn last_exit(&self) -> Option<DateTime<Utc>> {
        self.last_exit
    }
}
