#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{Side, Trend};

/// Live position as reported by the venue; only entries with size > 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealised_pnl: f64,
    /// `unrealised_pnl / (entry_price * size) * 100` — not leverage-adjusted.
    pub pnl_pct: f64,
    pub leverage: f64,
    pub timestamp: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn hours_open_since(&self, entry_time: DateTime<Utc>) -> f64 {
        (self.timestamp - entry_time).num_seconds().max(0) as f64 / 3600.0
    }
}

/// Local per-position bookkeeping driving the management policy.
/// Created on a successful open, destroyed on full close.
#[derive(Debug, Clone)]
pub struct PositionTracking {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub max_price_seen: f64,
    pub min_price_seen: f64,
    pub trailing_active: bool,
    /// Watermark of the last trailing SL pushed to the venue; updates must
    /// strictly improve on it.
    pub last_trailing_sl: Option<f64>,
    pub original_stop_loss: Option<f64>,
    pub profit_ladder_fired: BTreeSet<u32>,
    pub last_order_check_time: DateTime<Utc>,
    pub trade_id: String,
}

impl PositionTracking {
    pub fn new(
        symbol: String,
        side: Side,
        entry_price: f64,
        stop_loss: Option<f64>,
        trade_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            side,
            entry_price,
            entry_time: now,
            max_price_seen: entry_price,
            min_price_seen: entry_price,
            trailing_active: false,
            last_trailing_sl: None,
            original_stop_loss: stop_loss,
            profit_ladder_fired: BTreeSet::new(),
            last_order_check_time: now,
            trade_id,
        }
    }

    /// Record a new best-seen price for the favourable direction.
    pub fn observe_price(&mut self, price: f64) {
        if price > self.max_price_seen {
            self.max_price_seen = price;
        }
        if price < self.min_price_seen {
            self.min_price_seen = price;
        }
    }

    pub fn hours_in_position(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_seconds().max(0) as f64 / 3600.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitType {
    TakeProfit,
    StopLoss,
    Liquidation,
    Manual,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::TakeProfit => "TAKE_PROFIT",
            ExitType::StopLoss => "STOP_LOSS",
            ExitType::Liquidation => "LIQUIDATION",
            ExitType::Manual => "MANUAL_CLOSE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeResult {
    Pending,
    Win,
    Loss,
    Liquidation,
}

/// Entry context captured when a trade opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEntry {
    pub price: f64,
    pub rsi: f64,
    pub macd_histogram: f64,
    pub kalman_trend: Trend,
    pub leverage: u32,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExit {
    #[serde(rename = "type")]
    pub exit_type: ExitType,
    pub price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub duration_min: i64,
    pub time: DateTime<Utc>,
}

/// Persisted trade envelope; lives in the capped per-symbol history list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub side: Side,
    pub confidence: f64,
    pub entry: TradeEntry,
    pub exit: Option<TradeExit>,
    pub result: TradeResult,
}

impl TradeRecord {
    pub fn is_closed(&self) -> bool {
        self.exit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tracking_observes_extremes() {
        let t0 = Utc.timestamp_opt(0, 0).unwrap();
        let mut tracking = PositionTracking::new(
            "BTCUSDT".into(),
            Side::Buy,
            50_000.0,
            Some(49_700.0),
            "trade-1".into(),
            t0,
        );
        tracking.observe_price(50_400.0);
        tracking.observe_price(50_100.0);
        tracking.observe_price(49_900.0);
        assert_eq!(tracking.max_price_seen, 50_400.0);
        assert_eq!(tracking.min_price_seen, 49_900.0);
    }

    #[test]
    fn test_hours_in_position() {
        let t0 = Utc.timestamp_opt(0, 0).unwrap();
        let tracking = PositionTracking::new(
            "BTCUSDT".into(),
            Side::Sell,
            50_000.0,
            None,
            "trade-2".into(),
            t0,
        );
        let later = Utc.timestamp_opt(7200, 0).unwrap();
        assert_eq!(tracking.hours_in_position(later), 2.0);
    }
}
