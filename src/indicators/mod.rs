pub mod bollinger;
pub mod ema;
pub mod levels;
pub mod macd;
pub mod patterns;
pub mod rsi;
pub mod volume;

pub use bollinger::*;
pub use ema::*;
pub use levels::*;
pub use macd::*;
pub use patterns::*;
pub use rsi::*;
pub use volume::*;

use serde::{Deserialize, Serialize};

use crate::types::{candle, Candle};

pub fn sma(values: &[f64], period: usize) -> f64 {
    if values.is_empty() || period == 0 || values.len() < period {
        return 0.0;
    }
    values.iter().rev().take(period).sum::<f64>() / period as f64
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Close-to-close simple returns; empty for fewer than two samples.
pub fn simple_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// The fixed-shape composite every analysis tick works from. Short input
/// yields neutral sentinel values rather than errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    pub rsi: f64,
    pub macd: MacdOutput,
    pub bollinger: BollingerBands,
    pub ema: EmaLadder,
    pub volume: VolumeProfile,
}

impl TechnicalSnapshot {
    pub fn compute(candles: &[Candle]) -> Self {
        let closes = candle::closes(candles);
        let volumes = candle::volumes(candles);
        Self {
            rsi: rsi(&closes, 14),
            macd: macd(&closes),
            bollinger: bollinger(&closes, 20, 2.0),
            ema: ema_ladder(&closes),
            volume: volume_profile(&volumes),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::Candle;
    use chrono::{Duration, TimeZone, Utc};

    /// Synthetic 5-minute series with strictly increasing open times.
    pub fn series(closes: &[f64]) -> Vec<Candle> {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: base + Duration::minutes(5 * i as i64),
                close_time: base + Duration::minutes(5 * (i + 1) as i64),
                open: close,
                high: close * 1.001,
                low: close * 0.999,
                close,
                volume: 100.0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_short_input_is_neutral() {
        assert_eq!(sma(&[1.0, 2.0], 5), 0.0);
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), 3.5);
    }

    #[test]
    fn test_simple_returns_guard_zero() {
        let r = simple_returns(&[0.0, 1.0, 2.0]);
        assert_eq!(r, vec![1.0]);
    }

    #[test]
    fn test_snapshot_on_short_series() {
        let candles = test_support::series(&[100.0, 101.0]);
        let snap = TechnicalSnapshot::compute(&candles);
        assert_eq!(snap.rsi, 50.0);
        assert!(snap.macd.line.is_finite());
    }
}
