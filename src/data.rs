//! Data loading and management
//!
//! Loads OHLCV bars from CSV files, normalizes them for the simulator and
//! defines the `PriceSource` seam the live trader reads prices through.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::TradingError;
use crate::{Bar, Symbol};

/// Current top of book for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.last > 0.0
    }

    /// Seconds elapsed between the quote and `now`
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

/// Source of historical bars and current quotes
pub trait PriceSource: Send + Sync {
    /// Bars for `symbol` in `[start, end]`, sorted ascending without duplicates.
    /// Fails with `DataUnavailable` when the source cannot serve the range.
    fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> crate::error::Result<Vec<Bar>>;

    fn fetch_quote(&self, symbol: &Symbol) -> crate::error::Result<Quote>;
}

// =============================================================================
// CSV Data Loading
// =============================================================================

const CSV_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, CSV_DATETIME_FORMAT)
                .ok()
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .or_else(|| {
            // unix seconds, as written by some exporters
            s.parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        })
}

/// Load OHLCV data from a CSV file with header `datetime,open,high,low,close,volume`
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut bars = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let timestamp = parse_datetime(dt_str)
            .with_context(|| format!("Failed to parse datetime: {}", dt_str))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .with_context(|| format!("Missing {} column", name))?
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Failed to parse {} on row {}", name, row_idx + 1))
        };

        bars.push(Bar::new_unchecked(
            timestamp,
            field(1, "open")?,
            field(2, "high")?,
            field(3, "low")?,
            field(4, "close")?,
            field(5, "volume")?,
        ));
    }

    Ok(bars)
}

/// Write bars to `path`, creating parent directories as needed
pub fn save_csv(bars: &[Bar], path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["datetime", "open", "high", "low", "close", "volume"])?;

    for bar in bars {
        writer.write_record(&[
            bar.timestamp.format(CSV_DATETIME_FORMAT).to_string(),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
        ])?;
    }
    writer.flush()?;

    info!("Saved {} rows to {}", bars.len(), path.display());
    Ok(path.to_path_buf())
}

/// Conventional file name for a symbol's bars
pub fn csv_filename(symbol: &Symbol, timeframe: &str) -> String {
    format!("{}_{}.csv", symbol.as_str(), timeframe)
}

/// Load data for multiple symbols from `{data_dir}/{SYMBOL}_{timeframe}.csv`.
/// Missing files are skipped with a warning; loaded series are normalized.
pub fn load_multi_symbol(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    timeframe: &str,
) -> Result<BTreeMap<Symbol, Vec<Bar>>> {
    let mut data = BTreeMap::new();

    for symbol in symbols {
        let path = data_dir.as_ref().join(csv_filename(symbol, timeframe));

        if !path.exists() {
            warn!("Data file not found: {}", path.display());
            continue;
        }

        let bars = load_csv(&path).with_context(|| format!("Failed to load data for {}", symbol))?;
        let bars = normalize_bars(bars);

        info!("Loaded {} bars for {}", bars.len(), symbol);
        data.insert(symbol.clone(), bars);
    }

    if data.is_empty() {
        anyhow::bail!("No data loaded for any symbol");
    }

    Ok(data)
}

/// Sort ascending by timestamp and drop duplicate timestamps, keeping the
/// first occurrence
pub fn normalize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    let before = bars.len();
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() < before {
        debug!("Dropped {} duplicate bars", before - bars.len());
    }
    bars
}

// =============================================================================
// CSV Price Source
// =============================================================================

/// `PriceSource` backed by CSV files on disk. The quote is the last bar's close.
#[derive(Debug, Clone)]
pub struct CsvPriceSource {
    data_dir: PathBuf,
    timeframe: String,
}

impl CsvPriceSource {
    pub fn new(data_dir: impl AsRef<Path>, timeframe: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            timeframe: timeframe.into(),
        }
    }

    fn load(&self, symbol: &Symbol, timeframe: &str) -> crate::error::Result<Vec<Bar>> {
        let path = self.data_dir.join(csv_filename(symbol, timeframe));
        load_csv(&path)
            .map(normalize_bars)
            .map_err(|e| TradingError::DataUnavailable(format!("{}: {:#}", symbol, e)))
    }
}

impl PriceSource for CsvPriceSource {
    fn fetch_bars(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> crate::error::Result<Vec<Bar>> {
        let mut bars = self.load(symbol, timeframe)?;
        bars.retain(|b| b.timestamp >= start && b.timestamp <= end);
        Ok(bars)
    }

    fn fetch_quote(&self, symbol: &Symbol) -> crate::error::Result<Quote> {
        let bars = self.load(symbol, &self.timeframe)?;
        let last = bars
            .last()
            .ok_or_else(|| TradingError::DataUnavailable(format!("{}: no bars", symbol)))?;
        Ok(Quote {
            bid: last.close,
            ask: last.close,
            last: last.close,
            timestamp: last.timestamp,
        })
    }
}

// =============================================================================
// Data Validation
// =============================================================================

/// Validate bar data for consistency
pub fn validate_bars(bars: &[Bar]) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if bars.is_empty() {
        errors.push("No bars provided".to_string());
        return ValidationResult { errors, warnings };
    }

    for (i, bar) in bars.iter().enumerate() {
        if let Err(e) = bar.validate() {
            errors.push(format!("Bar {} ({}): {}", i, bar.timestamp, e));
        }
        if i > 0 && bar.timestamp <= bars[i - 1].timestamp {
            warnings.push(format!("Bar {}: not chronological", i));
        }
    }

    ValidationResult { errors, warnings }
}

/// Result of data validation
#[derive(Debug)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn bar(hours: i64, close: f64) -> Bar {
        Bar::new_unchecked(t(hours), close, close + 1.0, close - 1.0, close, 10.0)
    }

    #[test]
    fn test_normalize_sorts_and_dedupes() {
        let bars = vec![bar(2, 102.0), bar(0, 100.0), bar(1, 101.0), bar(1, 999.0)];
        let bars = normalize_bars(bars);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![100.0, 101.0, 102.0]);
    }

    #[test]
    fn test_csv_roundtrip_and_price_source() {
        let dir = tempfile::tempdir().unwrap();
        let symbol = Symbol::new("BTC");
        let path = dir.path().join(csv_filename(&symbol, "1hour"));
        let bars: Vec<Bar> = (0..5).map(|h| bar(h, 100.0 + h as f64)).collect();

        save_csv(&bars, &path).unwrap();
        assert_eq!(load_csv(&path).unwrap(), bars);

        let source = CsvPriceSource::new(dir.path(), "1hour");
        let ranged = source.fetch_bars(&symbol, "1hour", t(1), t(3)).unwrap();
        assert_eq!(ranged.len(), 3);
        assert_eq!(ranged[0].timestamp, t(1));

        let quote = source.fetch_quote(&symbol).unwrap();
        assert_eq!(quote.last, 104.0);
        assert_eq!(quote.timestamp, t(4));
    }

    #[test]
    fn test_missing_file_is_data_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvPriceSource::new(dir.path(), "1hour");
        let err = source.fetch_quote(&Symbol::new("NOPE")).unwrap_err();
        assert!(matches!(err, TradingError::DataUnavailable(_)));
    }

    #[test]
    fn test_load_csv_accepts_rfc3339_and_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.csv");
        fs::write(
            &path,
            "datetime,open,high,low,close,volume\n\
             2024-03-01T00:00:00Z,1,2,0.5,1.5,10\n\
             1709254800,1.5,2,1,1.8,12\n",
        )
        .unwrap();

        let bars = load_csv(&path).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, t(0));
        assert_eq!(bars[1].timestamp, t(1));
    }

    #[test]
    fn test_validate_bars() {
        let mut bars = vec![bar(0, 100.0), bar(1, 101.0)];
        assert!(validate_bars(&bars).is_valid());

        bars.push(Bar::new_unchecked(t(1), 100.0, 90.0, 95.0, 92.0, 1.0));
        let result = validate_bars(&bars);
        assert!(!result.is_valid());
        assert_eq!(result.warnings.len(), 1);
        assert!(!validate_bars(&[]).is_valid());
    }
}
