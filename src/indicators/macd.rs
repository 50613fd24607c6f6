use serde::{Deserialize, Serialize};

use super::ema::ema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MacdOutput {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD line = EMA(12) − EMA(26) on closes.
///
/// The default signal line is the historical 0.9 × line approximation kept
/// for behavioural equivalence with recorded decisions; the `macd-ema-signal`
/// feature switches to a proper EMA(9) of the line series.
pub fn macd(closes: &[f64]) -> MacdOutput {
    let line = ema(closes, 12) - ema(closes, 26);
    let signal = signal_line(closes, line);
    MacdOutput {
        line,
        signal,
        histogram: line - signal,
    }
}

#[cfg(not(feature = "macd-ema-signal"))]
fn signal_line(_closes: &[f64], line: f64) -> f64 {
    line * 0.9
}

#[cfg(feature = "macd-ema-signal")]
fn signal_line(closes: &[f64], _line: f64) -> f64 {
    if closes.len() < 26 {
        return 0.0;
    }
    let series: Vec<f64> = (26..=closes.len())
        .map(|end| ema(&closes[..end], 12) - ema(&closes[..end], 26))
        .collect();
    ema(&series, 9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macd_flat_series_is_zero() {
        let out = macd(&[100.0; 40]);
        assert!(out.line.abs() < 1e-9);
        assert!(out.histogram.abs() < 1e-9);
    }

    #[test]
    fn test_macd_positive_in_uptrend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let out = macd(&closes);
        assert!(out.line > 0.0);
        assert!(out.histogram > 0.0);
    }

    #[cfg(not(feature = "macd-ema-signal"))]
    #[test]
    fn test_signal_is_nine_tenths_of_line() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let out = macd(&closes);
        assert!((out.signal - out.line * 0.9).abs() < 1e-12);
        assert!((out.histogram - out.line * 0.1).abs() < 1e-12);
    }
}
