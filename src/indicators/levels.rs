use serde::{Deserialize, Serialize};

use crate::types::Candle;

use super::{simple_returns, stddev};

/// 5-minute buckets per year (365 * 24 * 12). The annualisation factor is
/// fixed at the 5-minute granularity regardless of the configured candle
/// interval so recorded volatility figures stay comparable.
const PERIODS_PER_YEAR_5M: f64 = 105_120.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportResistance {
    pub support: Vec<f64>,
    pub resistance: Vec<f64>,
    /// Proportional to how many extrema the scan found, capped at 1.
    pub strength: f64,
}

/// Local-extremum scan with a ±`window` neighbourhood: a high that exceeds
/// every high within the window is resistance, a low below every low within
/// the window is support.
pub fn support_resistance(candles: &[Candle], window: usize) -> SupportResistance {
    let mut support = Vec::new();
    let mut resistance = Vec::new();

    if candles.len() > 2 * window {
        for i in window..candles.len() - window {
            let neighbourhood = &candles[i - window..=i + window];
            let high = candles[i].high;
            let low = candles[i].low;
            if neighbourhood.iter().all(|c| c.high <= high) {
                resistance.push(high);
            }
            if neighbourhood.iter().all(|c| c.low >= low) {
                support.push(low);
            }
        }
    }

    let strength = ((support.len() + resistance.len()) as f64 / 10.0).min(1.0);
    SupportResistance {
        support,
        resistance,
        strength,
    }
}

/// Annualised volatility from the standard deviation of simple returns over
/// the last `period` closes, scaled by the fixed 5-minute factor.
pub fn annualised_volatility(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let start = candles.len().saturating_sub(period);
    let closes: Vec<f64> = candles[start..].iter().map(|c| c.close).collect();
    let returns = simple_returns(&closes);
    stddev(&returns) * PERIODS_PER_YEAR_5M.sqrt()
}

/// Per-candle return volatility used by the Kalman noise adaptation and the
/// risk score; not annualised.
pub fn returns_volatility(closes: &[f64]) -> f64 {
    stddev(&simple_returns(closes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::series;

    #[test]
    fn test_support_resistance_short_series_is_empty() {
        let candles = series(&[100.0; 8]);
        let sr = support_resistance(&candles, 5);
        assert!(sr.support.is_empty());
        assert!(sr.resistance.is_empty());
        assert_eq!(sr.strength, 0.0);
    }

    #[test]
    fn test_support_resistance_finds_peak() {
        let mut closes = vec![100.0; 21];
        closes[10] = 110.0;
        let candles = series(&closes);
        let sr = support_resistance(&candles, 5);
        assert!(sr.resistance.iter().any(|r| *r > 109.0));
        assert!(sr.strength > 0.0 && sr.strength <= 1.0);
    }

    #[test]
    fn test_volatility_flat_series_is_zero() {
        let candles = series(&[100.0; 30]);
        assert_eq!(annualised_volatility(&candles, 20), 0.0);
    }

    #[test]
    fn test_volatility_positive_on_noise() {
        let closes: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let candles = series(&closes);
        assert!(annualised_volatility(&candles, 20) > 0.0);
    }
}
