#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV bucket. Identity is `open_time`; the venue may re-emit the
/// currently forming candle with updated close/volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn body_size(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Body smaller than 10% of the full range.
    pub fn is_doji(&self) -> bool {
        let range = self.range();
        if range <= 0.0 {
            return true;
        }
        self.body_size() / range < 0.1
    }

    pub fn change_pct(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open) / self.open * 100.0
    }
}

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

pub fn volumes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.volume).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: Utc.timestamp_opt(0, 0).unwrap(),
            close_time: Utc.timestamp_opt(300, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn test_doji_detection() {
        assert!(candle(100.0, 101.0, 99.0, 100.05, 1.0).is_doji());
        assert!(!candle(100.0, 101.0, 99.0, 100.9, 1.0).is_doji());
        // Zero range counts as a doji rather than dividing by zero.
        assert!(candle(100.0, 100.0, 100.0, 100.0, 1.0).is_doji());
    }

    #[test]
    fn test_body_and_direction() {
        let c = candle(100.0, 103.0, 99.0, 102.0, 5.0);
        assert!(c.is_bullish());
        assert_eq!(c.body_size(), 2.0);
        assert_eq!(c.range(), 4.0);
    }
}
