use serde::{Deserialize, Serialize};

use super::{mean, sma};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// SMA ± k·σ over the last `period` closes. Short input collapses the
/// bands onto the last close.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> BollingerBands {
    if closes.len() < period || period == 0 {
        let last = closes.last().copied().unwrap_or(0.0);
        return BollingerBands {
            upper: last,
            middle: last,
            lower: last,
        };
    }

    let middle = sma(closes, period);
    let window = &closes[closes.len() - period..];
    let m = mean(window);
    let variance = window.iter().map(|v| (v - m).powi(2)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();

    BollingerBands {
        upper: middle + k * sigma,
        middle,
        lower: middle - k * sigma,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bollinger_short_input_collapses() {
        let bands = bollinger(&[100.0, 101.0], 20, 2.0);
        assert_eq!(bands.upper, 101.0);
        assert_eq!(bands.lower, 101.0);
    }

    #[test]
    fn test_bollinger_constant_series() {
        let bands = bollinger(&[50.0; 25], 20, 2.0);
        assert_eq!(bands.upper, 50.0);
        assert_eq!(bands.middle, 50.0);
        assert_eq!(bands.lower, 50.0);
    }

    #[test]
    fn test_bollinger_symmetry() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let bands = bollinger(&closes, 20, 2.0);
        let upper_gap = bands.upper - bands.middle;
        let lower_gap = bands.middle - bands.lower;
        assert!((upper_gap - lower_gap).abs() < 1e-9);
        assert!(upper_gap > 0.0);
    }
}
