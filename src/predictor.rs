//! Support level prediction used to gate entries
//!
//! The predictor is an opaque oracle to the state machine: it receives the
//! recent bar history and current price and returns named price levels. Entry
//! happens once price has fallen below enough of them.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::Bar;

/// Named support levels. A `BTreeMap` keeps iteration order stable, which the
/// backtest determinism guarantee depends on.
pub type PredictedLevels = BTreeMap<String, f64>;

/// Source of predicted support levels
pub trait LevelPredictor: Send + Sync {
    /// Predict support levels from `recent_bars` (oldest first) and the current price.
    /// An empty map means no opinion; entry never triggers on it.
    fn predict_levels(&self, recent_bars: &[Bar], current_price: f64) -> PredictedLevels;
}

/// Count how many predicted levels sit strictly above `price`, i.e. how many
/// support levels the price has broken through.
pub fn levels_broken(levels: &PredictedLevels, price: f64) -> usize {
    levels.values().filter(|&&level| price < level).count()
}

/// Technical support levels derived from the recent trading range
///
/// Five levels are produced from the last `window` bars: two just under the
/// current price (2% and 5% of the range), the average low, the range low and
/// a level 5% of the range below it.
#[derive(Debug, Clone)]
pub struct SupportLevelPredictor {
    window: usize,
}

impl SupportLevelPredictor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }
}

impl Default for SupportLevelPredictor {
    fn default() -> Self {
        Self::new(20)
    }
}

impl LevelPredictor for SupportLevelPredictor {
    fn predict_levels(&self, recent_bars: &[Bar], current_price: f64) -> PredictedLevels {
        let start = recent_bars.len().saturating_sub(self.window);
        let window = &recent_bars[start..];

        let (min_low, max_high) = match (
            window.iter().map(|b| b.low).minmax_by(f64::total_cmp).into_option(),
            window.iter().map(|b| b.high).max_by(f64::total_cmp),
        ) {
            (Some((min_low, _)), Some(max_high)) => (min_low, max_high),
            _ => return PredictedLevels::new(),
        };

        let avg_low = window.iter().map(|b| b.low).sum::<f64>() / window.len() as f64;
        let range = max_high - min_low;

        let mut levels = PredictedLevels::new();
        levels.insert("support_1".to_string(), current_price - range * 0.02);
        levels.insert("support_2".to_string(), current_price - range * 0.05);
        levels.insert("support_3".to_string(), avg_low);
        levels.insert("support_4".to_string(), min_low);
        levels.insert("support_5".to_string(), min_low - range * 0.05);
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(prices: &[(f64, f64)]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &(low, high))| {
                let mid = (low + high) / 2.0;
                Bar::new_unchecked(start + Duration::hours(i as i64), mid, high, low, mid, 1.0)
            })
            .collect()
    }

    #[test]
    fn test_empty_history_yields_no_levels() {
        let predictor = SupportLevelPredictor::default();
        assert!(predictor.predict_levels(&[], 100.0).is_empty());
    }

    #[test]
    fn test_flat_history_breaks_nothing() {
        let predictor = SupportLevelPredictor::default();
        let history = bars(&[(100.0, 100.0); 30]);
        let levels = predictor.predict_levels(&history, 100.0);
        assert_eq!(levels.len(), 5);
        assert_eq!(levels_broken(&levels, 100.0), 0);
    }

    #[test]
    fn test_price_below_range_breaks_structural_levels() {
        let predictor = SupportLevelPredictor::default();
        let history = bars(&[(90.0, 110.0), (95.0, 105.0), (92.0, 108.0)]);
        // Range is 20, min low 90, avg low 92.33
        let levels = predictor.predict_levels(&history, 88.0);
        assert_eq!(levels["support_4"], 90.0);
        assert!((levels["support_5"] - 89.0).abs() < 1e-9);
        // 88 is below avg low, min low and min low - 5% of range
        assert_eq!(levels_broken(&levels, 88.0), 3);
    }

    #[test]
    fn test_window_limits_history() {
        let predictor = SupportLevelPredictor::new(2);
        let history = bars(&[(10.0, 20.0), (95.0, 105.0), (96.0, 104.0)]);
        let levels = predictor.predict_levels(&history, 100.0);
        assert_eq!(levels["support_4"], 95.0);
    }
}
