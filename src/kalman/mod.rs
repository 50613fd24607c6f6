use serde::{Deserialize, Serialize};

use crate::indicators::{mean, simple_returns, stddev};
use crate::types::{Candle, Trend};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_price: f64,
    pub confidence: f64,
    pub trend: Trend,
    pub accuracy: f64,
    /// Look-ahead horizon expressed in candles.
    pub timeframe: String,
}

/// Scalar local-level Kalman filter over close prices with per-call noise
/// adaptation. The filter reseeds from the first close on every `predict`,
/// so the component is functionally stateless across ticks.
#[derive(Debug, Clone, Default)]
pub struct KalmanPredictor {
    /// Fixed (Q, R) override installed by `set_params`; adaptive when unset.
    params_override: Option<(f64, f64)>,
}

const MIN_SAMPLES: usize = 10;

impl KalmanPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin process/measurement noise to fixed values. Used by tests.
    pub fn set_params(&mut self, q: f64, r: f64) {
        self.params_override = Some((q, r));
    }

    pub fn reset(&mut self) {
        self.params_override = None;
    }

    pub fn predict(&self, candles: &[Candle], look_ahead: usize) -> Prediction {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        if closes.len() < MIN_SAMPLES {
            return Prediction {
                predicted_price: closes.last().copied().unwrap_or(0.0),
                confidence: 0.1,
                trend: Trend::Neutral,
                accuracy: 0.1,
                timeframe: format!("{look_ahead} candles"),
            };
        }

        let (q, r) = match self.params_override {
            Some(params) => params,
            None => adapt_noise(&closes, candles),
        };

        let filtered = run_filter(&closes, q, r);

        // OLS trend of the last 5 filtered values, extrapolated look_ahead
        // steps past the last one.
        let tail5 = &filtered[filtered.len() - 5..];
        let slope5 = ols_slope(tail5);
        let predicted_price = filtered[filtered.len() - 1] + slope5 * look_ahead as f64;

        let confidence = confidence(&closes, &filtered);
        let trend = trend(&filtered);
        let accuracy = direction_accuracy(&closes, &filtered);

        Prediction {
            predicted_price,
            confidence,
            trend,
            accuracy,
            timeframe: format!("{look_ahead} candles"),
        }
    }
}

/// Q from return volatility, R from the short-term volume trend.
fn adapt_noise(closes: &[f64], candles: &[Candle]) -> (f64, f64) {
    let volatility = stddev(&simple_returns(closes));
    let q = (volatility * 0.1).clamp(0.001, 0.1);

    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let all_mean = mean(&volumes);
    let recent_mean = mean(&volumes[volumes.len().saturating_sub(5)..]);
    let volume_trend = if all_mean > 0.0 {
        (recent_mean - all_mean) / all_mean
    } else {
        0.0
    };
    let r = (0.1 * (1.0 + volume_trend)).clamp(0.01, 1.0);

    (q, r)
}

fn run_filter(closes: &[f64], q: f64, r: f64) -> Vec<f64> {
    let mut x = closes[0];
    let mut p = 1.0;
    let mut filtered = Vec::with_capacity(closes.len());

    for &z in closes {
        let x_pred = x;
        let p_pred = p + q;
        let k = p_pred / (p_pred + r);
        x = x_pred + k * (z - x_pred);
        p = (1.0 - k) * p_pred;
        filtered.push(x);
    }

    filtered
}

/// clip(1 − √MSE / (max − min), 0, 1); a flat series has no range to score
/// against and gets zero.
fn confidence(observed: &[f64], filtered: &[f64]) -> f64 {
    let mse = observed
        .iter()
        .zip(filtered)
        .map(|(z, f)| (z - f).powi(2))
        .sum::<f64>()
        / observed.len() as f64;

    let max = observed.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = observed.iter().cloned().fold(f64::INFINITY, f64::min);
    let range = max - min;
    if range <= 0.0 {
        return 0.0;
    }
    (1.0 - mse.sqrt() / range).clamp(0.0, 1.0)
}

fn trend(filtered: &[f64]) -> Trend {
    let tail3 = &filtered[filtered.len() - 3..];
    let slope = ols_slope(tail3);
    if slope.abs() < 1e-3 {
        Trend::Neutral
    } else if slope > 0.0 {
        Trend::Bullish
    } else {
        Trend::Bearish
    }
}

/// Fraction of adjacent pairs whose filtered delta matches the sign of the
/// observed delta.
fn direction_accuracy(observed: &[f64], filtered: &[f64]) -> f64 {
    let pairs = observed.len() - 1;
    if pairs == 0 {
        return 0.0;
    }
    let matches = (1..observed.len())
        .filter(|&i| {
            let obs = observed[i] - observed[i - 1];
            let fit = filtered[i] - filtered[i - 1];
            (obs >= 0.0) == (fit >= 0.0)
        })
        .count();
    matches as f64 / pairs as f64
}

fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::series;

    #[test]
    fn test_short_series_fallback() {
        let predictor = KalmanPredictor::new();
        let candles = series(&[100.0, 101.0, 102.0]);
        let p = predictor.predict(&candles, 5);
        assert_eq!(p.predicted_price, 102.0);
        assert_eq!(p.confidence, 0.1);
        assert_eq!(p.trend, Trend::Neutral);
        assert_eq!(p.accuracy, 0.1);
    }

    #[test]
    fn test_uptrend_is_bullish() {
        let predictor = KalmanPredictor::new();
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let p = predictor.predict(&series(&closes), 5);
        assert_eq!(p.trend, Trend::Bullish);
        assert!(p.predicted_price > *closes.last().unwrap() - 10.0);
        assert!(p.accuracy > 0.9);
    }

    #[test]
    fn test_downtrend_is_bearish() {
        let predictor = KalmanPredictor::new();
        let closes: Vec<f64> = (0..60).map(|i| 1000.0 - i as f64).collect();
        let p = predictor.predict(&series(&closes), 5);
        assert_eq!(p.trend, Trend::Bearish);
    }

    #[test]
    fn test_measures_are_bounded() {
        let predictor = KalmanPredictor::new();
        let closes: Vec<f64> = (0..50)
            .map(|i| 100.0 + ((i * 7919) % 13) as f64 - 6.0)
            .collect();
        let p = predictor.predict(&series(&closes), 5);
        assert!((0.0..=1.0).contains(&p.confidence));
        assert!((0.0..=1.0).contains(&p.accuracy));
    }

    #[test]
    fn test_set_params_overrides_adaptation() {
        let mut predictor = KalmanPredictor::new();
        predictor.set_params(0.1, 0.01);
        // A responsive filter (high Q, low R) tracks the input closely.
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let p = predictor.predict(&series(&closes), 0);
        assert!((p.predicted_price - 129.0).abs() < 2.0);

        predictor.reset();
        assert!(predictor.params_override.is_none());
    }

    #[test]
    fn test_filter_converges_on_constant_series() {
        let filtered = run_filter(&[50.0; 20], 0.01, 0.1);
        assert!(filtered.iter().all(|v| (v - 50.0).abs() < 1e-9));
    }
}
