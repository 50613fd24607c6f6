use crate::indicators::TechnicalSnapshot;
use crate::kalman::Prediction;
use crate::types::{EntryVerdict, Instrument, Side};

/// Base leverage before signal bonuses.
const BASE_LEVERAGE: u32 = 5;

/// Leverage for a new entry: base 5 plus bonuses for AI confidence bands,
/// Kalman confidence, RSI extremes, MACD magnitude and elevated volume,
/// clipped to the configured cap.
pub fn compute_leverage(
    verdict: &EntryVerdict,
    prediction: &Prediction,
    indicators: &TechnicalSnapshot,
    price: f64,
    max_leverage: u32,
) -> u32 {
    let mut leverage = BASE_LEVERAGE;

    leverage += if verdict.confidence >= 0.8 {
        15
    } else if verdict.confidence >= 0.7 {
        10
    } else if verdict.confidence >= 0.6 {
        5
    } else {
        0
    };

    leverage += if prediction.confidence >= 0.8 {
        5
    } else if prediction.confidence >= 0.65 {
        3
    } else {
        0
    };

    if indicators.rsi < 25.0 || indicators.rsi > 75.0 {
        leverage += 3;
    }

    if price > 0.0 && (indicators.macd.histogram / price).abs() > 5e-4 {
        leverage += 2;
    }

    if indicators.volume.ratio > 2.0 {
        leverage += 2;
    }

    leverage.clamp(1, max_leverage.max(1))
}

/// Quantity from the leverage-derived risk fraction:
/// risk_pct = min(max_risk_pct, leverage / 3); notional = available ·
/// risk_pct% · leverage; quantity floored onto the step grid and raised to
/// the instrument minimum if it lands below it.
pub fn compute_quantity(
    available_balance: f64,
    leverage: u32,
    price: f64,
    instrument: &Instrument,
    max_risk_pct: f64,
) -> f64 {
    if price <= 0.0 || available_balance <= 0.0 {
        return 0.0;
    }

    let risk_pct = (leverage as f64 / 3.0).min(max_risk_pct);
    let capital_at_risk = available_balance * risk_pct / 100.0;
    let notional = capital_at_risk * leverage as f64;

    let step = if instrument.qty_step > 0.0 {
        instrument.qty_step
    } else {
        1e-8
    };
    let qty = (notional / price / step).floor() * step;

    if qty < instrument.min_order_qty {
        instrument.min_order_qty
    } else {
        qty
    }
}

/// Entry stop loss at ± `stop_loss_pct` percent, sign by side.
pub fn compute_stop_loss(entry: f64, side: Side, stop_loss_pct: f64) -> f64 {
    let offset = entry * stop_loss_pct / 100.0;
    match side {
        Side::Buy => entry - offset,
        Side::Sell => entry + offset,
    }
}

/// Take profit at risk · (1.5 + 0.5 · confidence) past the entry.
pub fn compute_take_profit(entry: f64, stop_loss: f64, side: Side, confidence: f64) -> f64 {
    let risk = (entry - stop_loss).abs();
    let reward = risk * (1.5 + 0.5 * confidence.clamp(0.0, 1.0));
    match side {
        Side::Buy => entry + reward,
        Side::Sell => entry - reward,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{BollingerBands, EmaLadder, MacdOutput, VolumeProfile};
    use crate::types::{Decision, RiskLevel, Trend};

    fn verdict(confidence: f64) -> EntryVerdict {
        EntryVerdict {
            decision: Decision::Buy,
            confidence,
            reasoning: String::new(),
            suggested_leverage: 15,
            risk_level: RiskLevel::Medium,
            market_sentiment: Trend::Bullish,
        }
    }

    fn prediction(confidence: f64) -> Prediction {
        Prediction {
            predicted_price: 50_500.0,
            confidence,
            trend: Trend::Bullish,
            accuracy: 0.8,
            timeframe: "5 candles".into(),
        }
    }

    fn neutral_indicators() -> TechnicalSnapshot {
        TechnicalSnapshot {
            rsi: 50.0,
            macd: MacdOutput {
                line: 0.0,
                signal: 0.0,
                histogram: 0.0,
            },
            bollinger: BollingerBands {
                upper: 50_100.0,
                middle: 50_000.0,
                lower: 49_900.0,
            },
            ema: EmaLadder {
                e9: 50_000.0,
                e21: 50_000.0,
                e50: 50_000.0,
            },
            volume: VolumeProfile {
                average: 100.0,
                current: 100.0,
                ratio: 1.0,
            },
        }
    }

    fn instrument() -> Instrument {
        Instrument {
            symbol: "BTCUSDT".into(),
            base_coin: "BTC".into(),
            quote_coin: "USDT".into(),
            min_order_qty: 0.001,
            qty_step: 0.001,
            tick_size: 0.1,
        }
    }

    #[test]
    fn test_leverage_caps_at_configured_max() {
        // AI 0.8 => +15, Kalman 0.82 => +5: 5 + 15 + 5 = 25, capped to 20.
        let lev = compute_leverage(
            &verdict(0.8),
            &prediction(0.82),
            &neutral_indicators(),
            50_000.0,
            20,
        );
        assert_eq!(lev, 20);
    }

    #[test]
    fn test_leverage_low_conviction_stays_at_base() {
        let lev = compute_leverage(
            &verdict(0.4),
            &prediction(0.3),
            &neutral_indicators(),
            50_000.0,
            20,
        );
        assert_eq!(lev, BASE_LEVERAGE);
    }

    #[test]
    fn test_leverage_bonus_for_extremes() {
        let mut ind = neutral_indicators();
        ind.rsi = 22.0;
        ind.volume.ratio = 3.0;
        let lev = compute_leverage(&verdict(0.65), &prediction(0.5), &ind, 50_000.0, 50);
        // 5 base + 5 (AI band) + 3 (RSI extreme) + 2 (volume)
        assert_eq!(lev, 15);
    }

    #[test]
    fn test_quantity_seed_scenario() {
        // Balance 10_000, leverage 20: risk_pct = 6.67, capital ~667,
        // notional ~13_333, qty = floor at step 0.001 = 0.266.
        let qty = compute_quantity(10_000.0, 20, 50_000.0, &instrument(), 10.0);
        assert!((qty - 0.266).abs() < 1e-9, "qty was {qty}");
    }

    #[test]
    fn test_quantity_raised_to_minimum() {
        let qty = compute_quantity(10.0, 5, 50_000.0, &instrument(), 10.0);
        assert_eq!(qty, 0.001);
    }

    #[test]
    fn test_stop_loss_and_take_profit_seed_scenario() {
        let sl = compute_stop_loss(50_000.0, Side::Buy, 0.6);
        assert!((sl - 49_700.0).abs() < 1e-9);
        let tp = compute_take_profit(50_000.0, sl, Side::Buy, 0.8);
        assert!((tp - 50_570.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_side_mirrors() {
        let sl = compute_stop_loss(50_000.0, Side::Sell, 0.6);
        assert!((sl - 50_300.0).abs() < 1e-9);
        let tp = compute_take_profit(50_000.0, sl, Side::Sell, 0.8);
        assert!((tp - 49_430.0).abs() < 1e-9);
    }
}
