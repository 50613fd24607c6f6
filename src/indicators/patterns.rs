use serde::{Deserialize, Serialize};

use crate::types::{Candle, OrderBook, Trend};

use super::mean;

/// Short-window candle-shape helpers exposed on the tools surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CandlePatterns {
    pub three_green_soldiers: bool,
    pub three_red_soldiers: bool,
    pub momentum_weakening: bool,
    pub volume_spike: bool,
    pub doji: bool,
}

pub fn candle_patterns(candles: &[Candle]) -> CandlePatterns {
    let last3 = if candles.len() >= 3 {
        &candles[candles.len() - 3..]
    } else {
        &[]
    };

    let three_green_soldiers = last3.len() == 3 && last3.iter().all(|c| c.is_bullish());
    let three_red_soldiers = last3.len() == 3 && last3.iter().all(|c| c.is_bearish());

    // Monotonically shrinking bodies over the last three candles.
    let momentum_weakening = last3.len() == 3
        && last3[0].body_size() > last3[1].body_size()
        && last3[1].body_size() > last3[2].body_size();

    let volume_spike = match candles.split_last() {
        Some((last, rest)) if !rest.is_empty() => {
            let trailing = mean(&rest.iter().map(|c| c.volume).collect::<Vec<_>>());
            trailing > 0.0 && last.volume > 3.0 * trailing
        }
        _ => false,
    };

    let doji = candles.last().map(|c| c.is_doji()).unwrap_or(false);

    CandlePatterns {
        three_green_soldiers,
        three_red_soldiers,
        momentum_weakening,
        volume_spike,
        doji,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pressure {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookPressure {
    pub spread: f64,
    pub spread_pct: f64,
    /// total bid quantity / total ask quantity.
    pub imbalance: f64,
    pub bid_walls: Vec<f64>,
    pub ask_walls: Vec<f64>,
    pub pressure: Pressure,
}

/// Depth imbalance with wall detection (levels holding more than 3× the
/// side's average quantity).
pub fn book_pressure(book: &OrderBook) -> BookPressure {
    let (spread, spread_pct) = match (book.best_bid(), book.best_ask()) {
        (Some(bid), Some(ask)) if bid.price > 0.0 => {
            let s = ask.price - bid.price;
            (s, s / bid.price * 100.0)
        }
        _ => (0.0, 0.0),
    };

    let total_bids = book.total_bid_quantity();
    let total_asks = book.total_ask_quantity();
    let imbalance = if total_asks > 0.0 {
        total_bids / total_asks
    } else {
        1.0
    };

    let bid_avg = if book.bids.is_empty() {
        0.0
    } else {
        total_bids / book.bids.len() as f64
    };
    let ask_avg = if book.asks.is_empty() {
        0.0
    } else {
        total_asks / book.asks.len() as f64
    };

    let bid_walls = book
        .bids
        .iter()
        .filter(|l| bid_avg > 0.0 && l.quantity > 3.0 * bid_avg)
        .map(|l| l.price)
        .collect();
    let ask_walls = book
        .asks
        .iter()
        .filter(|l| ask_avg > 0.0 && l.quantity > 3.0 * ask_avg)
        .map(|l| l.price)
        .collect();

    let pressure = if imbalance > 1.5 {
        Pressure::Bullish
    } else if imbalance < 0.67 {
        Pressure::Bearish
    } else {
        Pressure::Neutral
    };

    BookPressure {
        spread,
        spread_pct,
        imbalance,
        bid_walls,
        ask_walls,
        pressure,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeframeComparison {
    pub macro_trend: Trend,
    pub micro_trend: Trend,
    pub macro_change_pct: f64,
    pub micro_change_pct: f64,
    pub divergence: bool,
    pub suggested_action: &'static str,
}

/// Macro trend from the last 20 coarse candles, micro trend from the last
/// 10 fine candles. Divergence between the two is the scalping signal.
pub fn compare_timeframes(coarse: &[Candle], fine: &[Candle]) -> TimeframeComparison {
    let macro_change_pct = window_change_pct(coarse, 20);
    let micro_change_pct = window_change_pct(fine, 10);

    let macro_trend = Trend::from_change(macro_change_pct, 0.2);
    let micro_trend = Trend::from_change(micro_change_pct, 0.1);
    let divergence = matches!(
        (macro_trend, micro_trend),
        (Trend::Bullish, Trend::Bearish) | (Trend::Bearish, Trend::Bullish)
    );

    let suggested_action = match (macro_trend, micro_trend) {
        (Trend::Bullish, Trend::Bullish) => "follow_trend_long",
        (Trend::Bearish, Trend::Bearish) => "follow_trend_short",
        (Trend::Bullish, Trend::Bearish) => "buy_the_dip",
        (Trend::Bearish, Trend::Bullish) => "sell_the_rally",
        _ => "wait",
    };

    TimeframeComparison {
        macro_trend,
        micro_trend,
        macro_change_pct,
        micro_change_pct,
        divergence,
        suggested_action,
    }
}

fn window_change_pct(candles: &[Candle], window: usize) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    let start = candles.len().saturating_sub(window);
    let slice = &candles[start..];
    let first = slice.first().map(|c| c.close).unwrap_or(0.0);
    let last = slice.last().map(|c| c.close).unwrap_or(0.0);
    if first == 0.0 {
        return 0.0;
    }
    (last - first) / first * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::series;
    use crate::types::BookLevel;
    use chrono::Utc;

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".into(),
            bids: bids
                .iter()
                .map(|&(price, quantity)| BookLevel { price, quantity })
                .collect(),
            asks: asks
                .iter()
                .map(|&(price, quantity)| BookLevel { price, quantity })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_three_soldiers() {
        let up = series(&[100.0, 101.0, 102.0, 103.0]);
        // series() builds candles with open == close; force rising bodies.
        let mut up = up;
        for (i, c) in up.iter_mut().enumerate() {
            c.open = c.close - 0.5 - i as f64 * 0.01;
        }
        let p = candle_patterns(&up);
        assert!(p.three_green_soldiers);
        assert!(!p.three_red_soldiers);
    }

    #[test]
    fn test_volume_spike() {
        let mut candles = series(&[100.0; 10]);
        candles.last_mut().unwrap().volume = 500.0;
        assert!(candle_patterns(&candles).volume_spike);
    }

    #[test]
    fn test_empty_input_is_all_false() {
        let p = candle_patterns(&[]);
        assert!(!p.three_green_soldiers && !p.volume_spike && !p.doji);
    }

    #[test]
    fn test_book_pressure_bullish() {
        let b = book(&[(99.0, 10.0), (98.0, 10.0)], &[(100.0, 5.0), (101.0, 5.0)]);
        let p = book_pressure(&b);
        assert_eq!(p.pressure, Pressure::Bullish);
        assert!(p.imbalance > 1.5);
        assert_eq!(p.spread, 1.0);
    }

    #[test]
    fn test_book_walls() {
        let b = book(
            &[(99.0, 1.0), (98.0, 1.0), (97.0, 1.0), (96.0, 1.0), (95.0, 20.0)],
            &[(100.0, 1.0), (101.0, 1.0)],
        );
        let p = book_pressure(&b);
        // 20 > 3 x (24 / 5), the rest of the levels are not walls.
        assert_eq!(p.bid_walls, vec![95.0]);
        assert!(p.ask_walls.is_empty());
    }

    #[test]
    fn test_timeframe_divergence() {
        let coarse: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let fine: Vec<f64> = (0..10).map(|i| 104.0 - i as f64 * 0.1).collect();
        let cmp = compare_timeframes(&series(&coarse), &series(&fine));
        assert_eq!(cmp.macro_trend, Trend::Bullish);
        assert_eq!(cmp.micro_trend, Trend::Bearish);
        assert!(cmp.divergence);
        assert_eq!(cmp.suggested_action, "buy_the_dip");
    }
}
