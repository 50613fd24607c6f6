use crate::indicators::{SupportResistance, TechnicalSnapshot};
use crate::kalman::Prediction;
use crate::types::{PositionSnapshot, Side, Ticker};

/// Threshold tag for an RSI reading, embedded next to the raw value so the
/// model does not have to remember the conventions.
fn rsi_tag(rsi: f64) -> &'static str {
    if rsi < 30.0 {
        "OVERSOLD"
    } else if rsi > 70.0 {
        "OVERBOUGHT"
    } else {
        "neutral"
    }
}

fn volume_tag(ratio: f64) -> &'static str {
    if ratio > 2.0 {
        "ELEVATED"
    } else if ratio < 0.5 {
        "THIN"
    } else {
        "normal"
    }
}

/// Entry-analysis prompt. Pure function of its inputs; the decision rules
/// are intentionally symmetric between BUY and SELL.
pub fn entry_prompt(
    symbol: &str,
    ticker: &Ticker,
    indicators: &TechnicalSnapshot,
    prediction: &Prediction,
    levels: &SupportResistance,
    history_context: Option<&str>,
) -> String {
    let history_block = history_context
        .map(|ctx| format!("\n## Recent Trading History\n{ctx}\n"))
        .unwrap_or_default();

    let fmt_levels = |values: &[f64]| {
        if values.is_empty() {
            "none detected".to_string()
        } else {
            values
                .iter()
                .rev()
                .take(3)
                .map(|v| format!("{v:.2}"))
                .collect::<Vec<_>>()
                .join(", ")
        }
    };
    let support_line = fmt_levels(&levels.support);
    let resistance_line = fmt_levels(&levels.resistance);

    format!(
        r#"You are a disciplined crypto derivatives analyst. Decide whether to open a position on {symbol} perpetual right now.

## Market Snapshot
- Price: {price:.2} (bid {bid:.2} / ask {ask:.2})
- 24h change: {change:+.2}% | 24h high {high:.2} / low {low:.2}
- 24h volume: {volume:.0}

## Technical Indicators
- RSI(14): {rsi:.1} [{rsi_tag}] (RSI<30 = OVERSOLD favours BUY, RSI>70 = OVERBOUGHT favours SELL)
- MACD: line {macd_line:.4}, signal {macd_signal:.4}, histogram {macd_hist:.4} (positive histogram favours BUY, negative favours SELL)
- Bollinger: upper {bb_upper:.2} / middle {bb_middle:.2} / lower {bb_lower:.2}
- EMA ladder: EMA9 {e9:.2}, EMA21 {e21:.2}, EMA50 {e50:.2}
- Volume ratio: {vol_ratio:.2}x average [{vol_tag}]

## Key Levels (strength {level_strength:.1})
- Support: {support_line}
- Resistance: {resistance_line}

## Kalman Forecast
- Predicted price: {pred_price:.2} ({pred_tf})
- Filter confidence: {pred_conf:.2} | direction accuracy: {pred_acc:.2}
- Trend: {pred_trend}
{history_block}
## Decision Rules (apply symmetrically)
- BUY when oversold conditions, positive momentum and a bullish forecast align.
- SELL when overbought conditions, negative momentum and a bearish forecast align.
- HOLD when signals conflict or conviction is low. Shorting a weak market is as valid as buying a strong one; do not prefer longs.

Respond ONLY with valid JSON, no markdown:
{{
  "decision": "BUY|SELL|HOLD",
  "confidence": 0.0,
  "reasoning": "one or two sentences",
  "suggested_leverage": 5,
  "risk_level": "low|medium|high",
  "market_sentiment": "bullish|bearish|neutral"
}}"#,
        symbol = symbol,
        price = ticker.price,
        bid = ticker.bid,
        ask = ticker.ask,
        change = ticker.change_24h_pct,
        high = ticker.high_24h,
        low = ticker.low_24h,
        volume = ticker.volume_24h,
        rsi = indicators.rsi,
        rsi_tag = rsi_tag(indicators.rsi),
        macd_line = indicators.macd.line,
        macd_signal = indicators.macd.signal,
        macd_hist = indicators.macd.histogram,
        bb_upper = indicators.bollinger.upper,
        bb_middle = indicators.bollinger.middle,
        bb_lower = indicators.bollinger.lower,
        e9 = indicators.ema.e9,
        e21 = indicators.ema.e21,
        e50 = indicators.ema.e50,
        vol_ratio = indicators.volume.ratio,
        vol_tag = volume_tag(indicators.volume.ratio),
        level_strength = levels.strength,
        support_line = support_line,
        resistance_line = resistance_line,
        pred_price = prediction.predicted_price,
        pred_tf = prediction.timeframe,
        pred_conf = prediction.confidence,
        pred_acc = prediction.accuracy,
        pred_trend = prediction.trend,
        history_block = history_block,
    )
}

/// Position-management prompt with side-conditional reversal signals and
/// scalping exit thresholds.
pub fn position_prompt(
    position: &PositionSnapshot,
    ticker: &Ticker,
    indicators: &TechnicalSnapshot,
    prediction: &Prediction,
    hours_in_position: f64,
) -> String {
    let side_label = match position.side {
        Side::Buy => "LONG",
        Side::Sell => "SHORT",
    };

    let mut reversal_signals = Vec::new();
    match position.side {
        Side::Buy => {
            if indicators.rsi > 70.0 {
                reversal_signals.push(format!("RSI {:.1} overbought against the long", indicators.rsi));
            }
            if indicators.macd.histogram < 0.0 {
                reversal_signals.push("MACD histogram turned negative".to_string());
            }
            if prediction.trend == crate::types::Trend::Bearish {
                reversal_signals.push("Kalman forecast turned bearish".to_string());
            }
        }
        Side::Sell => {
            if indicators.rsi < 30.0 {
                reversal_signals.push(format!("RSI {:.1} oversold against the short", indicators.rsi));
            }
            if indicators.macd.histogram > 0.0 {
                reversal_signals.push("MACD histogram turned positive".to_string());
            }
            if prediction.trend == crate::types::Trend::Bullish {
                reversal_signals.push("Kalman forecast turned bullish".to_string());
            }
        }
    }
    let reversal_block = if reversal_signals.is_empty() {
        "- none".to_string()
    } else {
        reversal_signals
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are managing an open {side_label} scalp position on {symbol} perpetual.

## Position
- Entry {entry:.2}, now {current:.2}, size {size}
- Unrealised PnL: {pnl:.2} USDT ({pnl_pct:+.2}%)
- Leverage: {leverage}x | time in position: {hours:.1}h

## Market
- Price {price:.2}, 24h change {change:+.2}%
- RSI(14): {rsi:.1} | MACD histogram: {macd_hist:.4} | volume ratio {vol_ratio:.2}x
- Kalman: {pred_trend} towards {pred_price:.2} (confidence {pred_conf:.2})

## Reversal Signals Against This Position
{reversal_block}

## Exit Rules (scalping)
- CLOSE_100 when reversal signals are strong or PnL > +1.0%.
- CLOSE_50 when momentum stalls with PnL above +0.6%.
- CLOSE_25 to bank the first profits above +0.3%.
- HOLD only while the position thesis is intact.

Respond ONLY with valid JSON, no markdown:
{{
  "action": "HOLD|CLOSE_25|CLOSE_50|CLOSE_100",
  "confidence": 0.0,
  "reasoning": "one or two sentences",
  "risk_level": "low|medium|high"
}}"#,
        side_label = side_label,
        symbol = position.symbol,
        entry = position.entry_price,
        current = position.current_price,
        size = position.size,
        pnl = position.unrealised_pnl,
        pnl_pct = position.pnl_pct,
        leverage = position.leverage,
        hours = hours_in_position,
        price = ticker.price,
        change = ticker.change_24h_pct,
        rsi = indicators.rsi,
        macd_hist = indicators.macd.histogram,
        vol_ratio = indicators.volume.ratio,
        pred_trend = prediction.trend,
        pred_price = prediction.predicted_price,
        pred_conf = prediction.confidence,
        reversal_block = reversal_block,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::test_support::series;
    use crate::kalman::KalmanPredictor;
    use crate::types::Trend;
    use chrono::Utc;

    fn fixtures() -> (Ticker, TechnicalSnapshot, Prediction, SupportResistance) {
        let candles = series(&(0..60).map(|i| 100.0 + i as f64 * 0.1).collect::<Vec<_>>());
        let ticker = Ticker {
            symbol: "BTCUSDT".into(),
            price: 105.0,
            bid: 104.9,
            ask: 105.1,
            volume_24h: 1_000_000.0,
            change_24h_pct: 1.2,
            high_24h: 106.0,
            low_24h: 103.0,
            timestamp: Utc::now(),
        };
        let indicators = TechnicalSnapshot::compute(&candles);
        let prediction = KalmanPredictor::new().predict(&candles, 5);
        let levels = crate::indicators::support_resistance(&candles, 5);
        (ticker, indicators, prediction, levels)
    }

    #[test]
    fn test_entry_prompt_is_deterministic() {
        let (ticker, indicators, prediction, levels) = fixtures();
        let a = entry_prompt("BTCUSDT", &ticker, &indicators, &prediction, &levels, Some("ctx"));
        let b = entry_prompt("BTCUSDT", &ticker, &indicators, &prediction, &levels, Some("ctx"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_entry_prompt_mentions_both_sides() {
        let (ticker, indicators, prediction, levels) = fixtures();
        let p = entry_prompt("BTCUSDT", &ticker, &indicators, &prediction, &levels, None);
        assert!(p.contains("BUY when"));
        assert!(p.contains("SELL when"));
        assert!(p.contains("do not prefer longs"));
        assert!(p.contains("Key Levels"));
        assert!(!p.contains("Recent Trading History"));
    }

    #[test]
    fn test_position_prompt_side_conditional_signals() {
        let (ticker, mut indicators, mut prediction, _levels) = fixtures();
        indicators.rsi = 75.0;
        prediction.trend = Trend::Bearish;
        let position = PositionSnapshot {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            size: 0.1,
            entry_price: 100.0,
            current_price: 105.0,
            unrealised_pnl: 0.5,
            pnl_pct: 0.5,
            leverage: 10.0,
            timestamp: Utc::now(),
        };
        let p = position_prompt(&position, &ticker, &indicators, &prediction, 1.5);
        assert!(p.contains("LONG"));
        assert!(p.contains("overbought against the long"));
        assert!(p.contains("turned bearish"));
    }
}
