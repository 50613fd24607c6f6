use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "LONG" => Some(Side::Buy),
            "SELL" | "SHORT" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction label shared by the Kalman predictor, the indicator suite and
/// the reasoning verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Bullish => "bullish",
            Trend::Bearish => "bearish",
            Trend::Neutral => "neutral",
        }
    }

    pub fn from_change(change: f64, threshold: f64) -> Self {
        if change > threshold {
            Trend::Bullish
        } else if change < -threshold {
            Trend::Bearish
        } else {
            Trend::Neutral
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Interval {
    /// Bybit kline interval token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1",
            Interval::M5 => "5",
            Interval::M15 => "15",
            Interval::H1 => "60",
            Interval::H4 => "240",
            Interval::D1 => "D",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1" | "1m" => Some(Interval::M1),
            "5" | "5m" => Some(Interval::M5),
            "15" | "15m" => Some(Interval::M15),
            "60" | "1h" => Some(Interval::H1),
            "240" | "4h" => Some(Interval::H4),
            "D" | "1d" => Some(Interval::D1),
            _ => None,
        }
    }

    pub fn to_minutes(&self) -> u64 {
        match self {
            Interval::M1 => 1,
            Interval::M5 => 5,
            Interval::M15 => 15,
            Interval::H1 => 60,
            Interval::H4 => 240,
            Interval::D1 => 1440,
        }
    }

    pub fn to_seconds(&self) -> u64 {
        self.to_minutes() * 60
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An order the orchestrator wants to place, pending risk-gate validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl TradeProposal {
    pub fn notional(&self, price: f64) -> f64 {
        self.quantity * price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_trend_from_change() {
        assert_eq!(Trend::from_change(0.5, 0.2), Trend::Bullish);
        assert_eq!(Trend::from_change(-0.5, 0.2), Trend::Bearish);
        assert_eq!(Trend::from_change(0.1, 0.2), Trend::Neutral);
    }

    #[test]
    fn test_interval_round_trip() {
        assert_eq!(Interval::from_str("5"), Some(Interval::M5));
        assert_eq!(Interval::from_str("5m"), Some(Interval::M5));
        assert_eq!(Interval::M5.to_seconds(), 300);
    }
}
