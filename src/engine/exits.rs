use chrono::{DateTime, Utc};

use crate::indicators::TechnicalSnapshot;
use crate::types::{
    Decision, EntryVerdict, PositionAction, PositionSnapshot, PositionTracking, Side,
};

/// PnL percent at which the trailing stop arms.
pub const TRAILING_ARM_PCT: f64 = 0.5;
/// Distance the trailing stop keeps from the best-seen price.
pub const TRAILING_GAP: f64 = 0.003;
/// Profit-ladder rungs in basis-point-style keys (0.3% / 0.6% / 1.0%).
pub const LADDER_RUNGS: [(u32, f64, PositionAction); 3] = [
    (100, 1.0, PositionAction::Close100),
    (60, 0.6, PositionAction::Close50),
    (30, 0.3, PositionAction::Close25),
];

/// A triggered backup exit. When several trigger in one tick the highest
/// score wins.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub strategy: &'static str,
    pub action: PositionAction,
    pub score: f64,
    pub reason: String,
    /// Ladder rung to mark as fired, when the ladder produced this exit.
    pub ladder_rung: Option<u32>,
}

/// Candidate trailing stop for the current best-seen price, or `None` when
/// no update should be pushed. The returned stop strictly improves on both
/// the entry-based stop and the last trailing stop already sent, so the
/// stop only ever moves in the favourable direction.
pub fn next_trailing_stop(tracking: &PositionTracking) -> Option<f64> {
    if !tracking.trailing_active {
        return None;
    }

    match tracking.side {
        Side::Buy => {
            let candidate = tracking.max_price_seen * (1.0 - TRAILING_GAP);
            let watermark = tracking
                .last_trailing_sl
                .or(tracking.original_stop_loss)
                .unwrap_or(f64::NEG_INFINITY);
            (candidate > watermark).then_some(candidate)
        }
        Side::Sell => {
            let candidate = tracking.min_price_seen * (1.0 + TRAILING_GAP);
            let watermark = tracking
                .last_trailing_sl
                .or(tracking.original_stop_loss)
                .unwrap_or(f64::INFINITY);
            (candidate < watermark).then_some(candidate)
        }
    }
}

/// Evaluate the backup exit ladder for an open position. Strategies are
/// independent; all triggered ones are collected and the highest-scoring
/// decision is returned.
pub fn evaluate_backup_exits(
    position: &PositionSnapshot,
    tracking: &PositionTracking,
    entry_verdict: &EntryVerdict,
    indicators: &TechnicalSnapshot,
    now: DateTime<Utc>,
) -> Option<ExitDecision> {
    let mut triggered: Vec<ExitDecision> = Vec::new();

    // (a) AI reversal: a confident entry verdict against the open side.
    let opposes = matches!(
        (position.side, entry_verdict.decision),
        (Side::Buy, Decision::Sell) | (Side::Sell, Decision::Buy)
    );
    if opposes && entry_verdict.confidence > 0.7 {
        triggered.push(ExitDecision {
            strategy: "AI_REVERSAL",
            action: PositionAction::Close100,
            score: 0.9,
            reason: format!(
                "opposing {} verdict at confidence {:.2}",
                entry_verdict.decision, entry_verdict.confidence
            ),
            ladder_rung: None,
        });
    }

    // (d) profit ladder: first crossing of each rung fires once.
    for (rung, threshold, action) in LADDER_RUNGS {
        if position.pnl_pct >= threshold && !tracking.profit_ladder_fired.contains(&rung) {
            triggered.push(ExitDecision {
                strategy: "PROFIT_LADDER",
                action,
                score: 0.7,
                reason: format!("pnl {:.2}% crossed {threshold}% rung", position.pnl_pct),
                ladder_rung: Some(rung),
            });
            break;
        }
    }

    // (e) technical reversal: side-conditional RSI extremum with an
    // opposing MACD histogram.
    let technical_reversal = match position.side {
        Side::Buy => indicators.rsi > 70.0 && indicators.macd.histogram < 0.0,
        Side::Sell => indicators.rsi < 30.0 && indicators.macd.histogram > 0.0,
    };
    if technical_reversal {
        triggered.push(ExitDecision {
            strategy: "TECHNICAL_REVERSAL",
            action: PositionAction::Close50,
            score: 0.65,
            reason: format!(
                "RSI {:.1} against position with opposing MACD histogram",
                indicators.rsi
            ),
            ladder_rung: None,
        });
    }

    // (c) volatility spike.
    if indicators.volume.ratio > 5.0 {
        triggered.push(ExitDecision {
            strategy: "VOLATILITY_SPIKE",
            action: PositionAction::Close50,
            score: 0.6,
            reason: format!("volume ratio {:.1}x", indicators.volume.ratio),
            ladder_rung: None,
        });
    }

    // (b) staleness: flat for over two hours.
    let hours = tracking.hours_in_position(now);
    if hours > 2.0 && position.pnl_pct < 0.3 {
        triggered.push(ExitDecision {
            strategy: "STALENESS",
            action: PositionAction::Close100,
            score: 0.5,
            reason: format!("{hours:.1}h in position at {:.2}% pnl", position.pnl_pct),
            ladder_rung: None,
        });
    }

    triggered
        .into_iter()
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{BollingerBands, EmaLadder, MacdOutput, VolumeProfile};
    use crate::types::{RiskLevel, Trend};
    use chrono::{Duration, TimeZone};

    fn tracking(side: Side) -> PositionTracking {
        PositionTracking::new(
            "BTCUSDT".into(),
            side,
            50_000.0,
            Some(49_700.0),
            "trade-1".into(),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    fn position(side: Side, pnl_pct: f64) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "BTCUSDT".into(),
            side,
            size: 0.266,
            entry_price: 50_000.0,
            current_price: 50_000.0 * (1.0 + pnl_pct / 100.0),
            unrealised_pnl: 50_000.0 * 0.266 * pnl_pct / 100.0,
            pnl_pct,
            leverage: 20.0,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn hold_verdict() -> EntryVerdict {
        EntryVerdict {
            decision: Decision::Hold,
            confidence: 0.5,
            reasoning: String::new(),
            suggested_leverage: 5,
            risk_level: RiskLevel::Medium,
            market_sentiment: Trend::Neutral,
        }
    }

    fn indicators(rsi: f64, histogram: f64, volume_ratio: f64) -> TechnicalSnapshot {
        TechnicalSnapshot {
            rsi,
            macd: MacdOutput {
                line: histogram,
                signal: 0.0,
                histogram,
            },
            bollinger: BollingerBands {
                upper: 0.0,
                middle: 0.0,
                lower: 0.0,
            },
            ema: EmaLadder {
                e9: 0.0,
                e21: 0.0,
                e50: 0.0,
            },
            volume: VolumeProfile {
                average: 100.0,
                current: 100.0 * volume_ratio,
                ratio: volume_ratio,
            },
        }
    }

    #[test]
    fn test_trailing_stop_long_seed_scenario() {
        let mut t = tracking(Side::Buy);
        t.trailing_active = true;
        t.observe_price(50_400.0);
        t.observe_price(50_600.0);
        let sl = next_trailing_stop(&t).expect("update expected");
        assert!((sl - 50_448.2).abs() < 1e-9);

        // Same high again: the pushed watermark suppresses a second update.
        t.last_trailing_sl = Some(sl);
        assert_eq!(next_trailing_stop(&t), None);

        // A new high produces exactly one further update.
        t.observe_price(50_700.0);
        let next = next_trailing_stop(&t).expect("update after new high");
        assert!(next > sl);
    }

    #[test]
    fn test_trailing_stop_never_moves_against_long() {
        let mut t = tracking(Side::Buy);
        t.trailing_active = true;
        t.observe_price(50_600.0);
        t.last_trailing_sl = Some(50_448.2);
        // Price falls back; max_price_seen is unchanged so no update fires.
        t.observe_price(50_100.0);
        assert_eq!(next_trailing_stop(&t), None);
    }

    #[test]
    fn test_trailing_stop_short_moves_down_only() {
        let mut t = tracking(Side::Sell);
        t.original_stop_loss = Some(50_300.0);
        t.trailing_active = true;
        t.observe_price(49_500.0);
        let sl = next_trailing_stop(&t).expect("update expected");
        assert!((sl - 49_500.0 * 1.003).abs() < 1e-9);
        assert!(sl < 50_300.0);

        t.last_trailing_sl = Some(sl);
        t.observe_price(49_800.0); // adverse move, min unchanged
        assert_eq!(next_trailing_stop(&t), None);
    }

    #[test]
    fn test_inactive_trailing_never_updates() {
        let mut t = tracking(Side::Buy);
        t.observe_price(51_000.0);
        assert_eq!(next_trailing_stop(&t), None);
    }

    #[test]
    fn test_profit_ladder_first_rung_fires_once() {
        let t = tracking(Side::Buy);
        let now = t.entry_time + Duration::minutes(10);
        let exit = evaluate_backup_exits(
            &position(Side::Buy, 0.30),
            &t,
            &hold_verdict(),
            &indicators(55.0, 0.5, 1.0),
            now,
        )
        .expect("ladder should fire");
        assert_eq!(exit.strategy, "PROFIT_LADDER");
        assert_eq!(exit.action, PositionAction::Close25);
        assert_eq!(exit.ladder_rung, Some(30));

        // After marking the rung, the same PnL does not re-fire.
        let mut fired = tracking(Side::Buy);
        fired.profit_ladder_fired.insert(30);
        let again = evaluate_backup_exits(
            &position(Side::Buy, 0.30),
            &fired,
            &hold_verdict(),
            &indicators(55.0, 0.5, 1.0),
            now,
        );
        assert!(again.is_none());
    }

    #[test]
    fn test_ladder_prefers_highest_crossed_rung() {
        let t = tracking(Side::Buy);
        let now = t.entry_time + Duration::minutes(10);
        let exit = evaluate_backup_exits(
            &position(Side::Buy, 1.2),
            &t,
            &hold_verdict(),
            &indicators(55.0, 0.5, 1.0),
            now,
        )
        .expect("ladder should fire");
        assert_eq!(exit.action, PositionAction::Close100);
        assert_eq!(exit.ladder_rung, Some(100));
    }

    #[test]
    fn test_ai_reversal_outranks_ladder() {
        let t = tracking(Side::Buy);
        let now = t.entry_time + Duration::minutes(10);
        let mut verdict = hold_verdict();
        verdict.decision = Decision::Sell;
        verdict.confidence = 0.8;
        let exit = evaluate_backup_exits(
            &position(Side::Buy, 0.4),
            &t,
            &verdict,
            &indicators(55.0, 0.5, 1.0),
            now,
        )
        .expect("exit expected");
        assert_eq!(exit.strategy, "AI_REVERSAL");
        assert_eq!(exit.action, PositionAction::Close100);
    }

    #[test]
    fn test_staleness_exit() {
        let t = tracking(Side::Buy);
        let now = t.entry_time + Duration::hours(3);
        let exit = evaluate_backup_exits(
            &position(Side::Buy, 0.1),
            &t,
            &hold_verdict(),
            &indicators(55.0, 0.5, 1.0),
            now,
        )
        .expect("stale position should close");
        assert_eq!(exit.strategy, "STALENESS");
        assert_eq!(exit.action, PositionAction::Close100);
    }

    #[test]
    fn test_technical_reversal_for_short() {
        let t = tracking(Side::Sell);
        let now = t.entry_time + Duration::minutes(30);
        let exit = evaluate_backup_exits(
            &position(Side::Sell, 0.1),
            &t,
            &hold_verdict(),
            &indicators(25.0, 0.8, 1.0),
            now,
        )
        .expect("reversal expected");
        assert_eq!(exit.strategy, "TECHNICAL_REVERSAL");
        assert_eq!(exit.action, PositionAction::Close50);
    }

    #[test]
    fn test_volatility_spike_partial_exit() {
        let t = tracking(Side::Buy);
        let now = t.entry_time + Duration::minutes(30);
        let exit = evaluate_backup_exits(
            &position(Side::Buy, 0.1),
            &t,
            &hold_verdict(),
            &indicators(55.0, 0.5, 6.0),
            now,
        )
        .expect("spike expected");
        assert_eq!(exit.strategy, "VOLATILITY_SPIKE");
        assert_eq!(exit.action, PositionAction::Close50);
    }

    #[test]
    fn test_quiet_position_holds() {
        let t = tracking(Side::Buy);
        let now = t.entry_time + Duration::minutes(30);
        let exit = evaluate_backup_exits(
            &position(Side::Buy, 0.1),
            &t,
            &hold_verdict(),
            &indicators(55.0, 0.5, 1.0),
            now,
        );
        assert!(exit.is_none());
    }
}
