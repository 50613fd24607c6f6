#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest tick with 24h statistics; one per decision tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    pub change_24h_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn spread_pct(&self) -> f64 {
        if self.bid == 0.0 {
            return 0.0;
        }
        self.spread() / self.bid * 100.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Bids descending, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    pub fn total_bid_quantity(&self) -> f64 {
        self.bids.iter().map(|l| l.quantity).sum()
    }

    pub fn total_ask_quantity(&self) -> f64 {
        self.asks.iter().map(|l| l.quantity).sum()
    }
}

/// Instrument metadata used to normalise order quantities and prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
    pub min_order_qty: f64,
    pub qty_step: f64,
    pub tick_size: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub available: f64,
    pub used_margin: f64,
}

/// Result of a successful market order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_price: f64,
    pub fees: f64,
}

/// A filled order from the venue's recent history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub stop_order_type: Option<String>,
    pub avg_price: f64,
    pub qty: f64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of scanning recent order history for conditional-order fills.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TpSlScan {
    pub tp_executed: bool,
    pub sl_executed: bool,
    /// Forced margin close (auto-deleverage / liquidation path).
    pub liq_executed: bool,
    pub fill_price: Option<f64>,
}
