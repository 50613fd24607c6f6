use serde::{Deserialize, Serialize};

/// Exponential moving average by the standard recursion, seeded at the
/// first sample. Returns the last close (or 0 on empty input) when the
/// series is shorter than the period.
pub fn ema(values: &[f64], period: usize) -> f64 {
    match values {
        [] => 0.0,
        [.., last] if period == 0 || values.len() < period => *last,
        [first, rest @ ..] => {
            let k = 2.0 / (period as f64 + 1.0);
            rest.iter().fold(*first, |acc, v| v * k + acc * (1.0 - k))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmaLadder {
    pub e9: f64,
    pub e21: f64,
    pub e50: f64,
}

pub fn ema_ladder(closes: &[f64]) -> EmaLadder {
    EmaLadder {
        e9: ema(closes, 9),
        e21: ema(closes, 21),
        e50: ema(closes, 50),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_empty() {
        assert_eq!(ema(&[], 9), 0.0);
    }

    #[test]
    fn test_ema_short_series_falls_back_to_last() {
        assert_eq!(ema(&[1.0, 2.0, 3.0], 9), 3.0);
    }

    #[test]
    fn test_ema_constant_series() {
        let values = [42.0; 30];
        assert!((ema(&values, 9) - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_tracks_uptrend_below_price() {
        let values: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let e = ema(&values, 9);
        assert!(e < *values.last().unwrap());
        assert!(e > values[40]);
    }

    #[test]
    fn test_ladder_ordering_in_trend() {
        let values: Vec<f64> = (0..120).map(|i| 100.0 + i as f64).collect();
        let ladder = ema_ladder(&values);
        // Faster EMAs hug a rising series more closely.
        assert!(ladder.e9 > ladder.e21);
        assert!(ladder.e21 > ladder.e50);
    }
}
