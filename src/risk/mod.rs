use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::types::TradeProposal;

/// Share of total balance a single order's notional may consume before the
/// gate shrinks it.
const MAX_NOTIONAL_SHARE: f64 = 0.30;
const MAX_RISK_SCORE: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheck {
    pub approved: bool,
    pub reason: String,
    pub risk_score: f64,
    /// A downsized proposal the orchestrator may retry with.
    pub adjusted: Option<TradeProposal>,
}

impl RiskCheck {
    fn approve(risk_score: f64) -> Self {
        Self {
            approved: true,
            reason: "ok".to_string(),
            risk_score,
            adjusted: None,
        }
    }

    fn reject(reason: impl Into<String>, risk_score: f64) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            risk_score,
            adjusted: None,
        }
    }
}

/// Account state the gate evaluates a proposal against.
#[derive(Debug, Clone, Copy)]
pub struct RiskContext {
    pub current_price: f64,
    pub total_balance: f64,
    /// Sum of notional across positions already open.
    pub existing_exposure: f64,
    /// Per-candle return volatility, clipped into the score.
    pub volatility: f64,
    pub qty_step: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskLimitsConfig {
    pub max_leverage: u32,
    pub max_position_size: f64,
    pub stop_loss_pct: f64,
    pub max_daily_trades: u32,
}

/// Order-level risk validation with a process-owned daily trade counter.
/// Checks short-circuit on the first hard failure; soft pressure accumulates
/// into `risk_score`.
pub struct RiskGate {
    limits: RiskLimitsConfig,
    daily: Mutex<DailyCounter>,
}

#[derive(Debug, Clone, Copy)]
struct DailyCounter {
    date: NaiveDate,
    trades: u32,
}

impl RiskGate {
    pub fn new(limits: RiskLimitsConfig) -> Self {
        Self {
            limits,
            daily: Mutex::new(DailyCounter {
                date: Utc::now().date_naive(),
                trades: 0,
            }),
        }
    }

    pub async fn validate(&self, proposal: &TradeProposal, ctx: &RiskContext) -> RiskCheck {
        let daily_trades = self.current_daily_count().await;
        if daily_trades >= self.limits.max_daily_trades {
            return RiskCheck::reject(
                format!("daily trade cap of {} reached", self.limits.max_daily_trades),
                1.0,
            );
        }

        if !proposal.quantity.is_finite() || proposal.quantity <= 0.0 {
            return RiskCheck::reject("quantity must be positive", 1.0);
        }

        let notional = proposal.notional(ctx.current_price);
        let notional_cap = MAX_NOTIONAL_SHARE * ctx.total_balance;
        if notional > notional_cap && ctx.current_price > 0.0 {
            let step = if ctx.qty_step > 0.0 { ctx.qty_step } else { 1e-8 };
            let fitted = (notional_cap / ctx.current_price / step).floor() * step;
            let mut adjusted = proposal.clone();
            adjusted.quantity = fitted;
            return RiskCheck {
                approved: false,
                reason: format!(
                    "notional {notional:.2} exceeds {:.0}% of balance, adjusted to {fitted}",
                    MAX_NOTIONAL_SHARE * 100.0
                ),
                risk_score: 1.0,
                adjusted: Some(adjusted),
            };
        }

        if proposal.leverage > self.limits.max_leverage {
            return RiskCheck::reject(
                format!(
                    "leverage {} exceeds cap {}",
                    proposal.leverage, self.limits.max_leverage
                ),
                1.0,
            );
        }

        if notional + ctx.existing_exposure > self.limits.max_position_size {
            return RiskCheck::reject(
                format!(
                    "total exposure {:.2} exceeds max position size {:.2}",
                    notional + ctx.existing_exposure,
                    self.limits.max_position_size
                ),
                1.0,
            );
        }

        if let Some(stop_loss) = proposal.stop_loss {
            if ctx.current_price > 0.0 {
                let distance_pct =
                    (ctx.current_price - stop_loss).abs() / ctx.current_price * 100.0;
                if distance_pct > 1.05 * self.limits.stop_loss_pct {
                    return RiskCheck::reject(
                        format!(
                            "stop-loss distance {distance_pct:.2}% exceeds limit {:.2}%",
                            1.05 * self.limits.stop_loss_pct
                        ),
                        1.0,
                    );
                }
            }
        }

        let risk_score = self.risk_score(proposal, notional, ctx);
        if risk_score > MAX_RISK_SCORE {
            return RiskCheck::reject(
                format!("risk score {risk_score:.2} exceeds {MAX_RISK_SCORE}"),
                risk_score,
            );
        }

        RiskCheck::approve(risk_score)
    }

    fn risk_score(&self, proposal: &TradeProposal, notional: f64, ctx: &RiskContext) -> f64 {
        let leverage_term = proposal.leverage as f64 / self.limits.max_leverage.max(1) as f64 * 0.3;
        let balance = ctx.total_balance.max(f64::EPSILON);
        let notional_term = (notional / balance).clamp(0.0, 1.0) * 0.2;
        let exposure_term = (ctx.existing_exposure / balance).clamp(0.0, 1.0) * 0.2;
        let volatility_term = ctx.volatility.clamp(0.0, 1.0) * 0.3;
        leverage_term + notional_term + exposure_term + volatility_term
    }

    /// Called by the orchestrator after a confirmed open.
    pub async fn increment_daily(&self) {
        let mut daily = self.daily.lock().await;
        Self::roll_date(&mut daily);
        daily.trades += 1;
    }

    pub async fn current_daily_count(&self) -> u32 {
        let mut daily = self.daily.lock().await;
        Self::roll_date(&mut daily);
        daily.trades
    }

    fn roll_date(daily: &mut DailyCounter) {
        let today = Utc::now().date_naive();
        if daily.date != today {
            info!(previous = %daily.date, trades = daily.trades, "daily trade counter reset");
            daily.date = today;
            daily.trades = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn limits() -> RiskLimitsConfig {
        RiskLimitsConfig {
            max_leverage: 20,
            max_position_size: 100_000.0,
            stop_loss_pct: 0.6,
            max_daily_trades: 10,
        }
    }

    fn ctx() -> RiskContext {
        RiskContext {
            current_price: 50_000.0,
            total_balance: 10_000.0,
            existing_exposure: 0.0,
            volatility: 0.01,
            qty_step: 0.001,
        }
    }

    fn proposal(quantity: f64, leverage: u32) -> TradeProposal {
        TradeProposal {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity,
            leverage,
            stop_loss: Some(49_700.0),
            take_profit: Some(50_570.0),
        }
    }

    #[tokio::test]
    async fn test_oversized_notional_is_adjusted() {
        let gate = RiskGate::new(limits());
        let check = gate.validate(&proposal(1.0, 10), &ctx()).await;
        assert!(!check.approved);
        let adjusted = check.adjusted.expect("adjusted proposal");
        assert!((adjusted.quantity - 0.060).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_exact_boundary_notional_is_approved() {
        let gate = RiskGate::new(limits());
        // 0.06 * 50_000 = 3_000 = exactly 30% of balance.
        let check = gate.validate(&proposal(0.06, 10), &ctx()).await;
        assert!(check.approved, "reason: {}", check.reason);
        assert!(check.adjusted.is_none());
    }

    #[tokio::test]
    async fn test_leverage_cap() {
        let gate = RiskGate::new(limits());
        let check = gate.validate(&proposal(0.01, 25), &ctx()).await;
        assert!(!check.approved);
        assert!(check.reason.contains("leverage"));
    }

    #[tokio::test]
    async fn test_bad_quantity_rejected() {
        let gate = RiskGate::new(limits());
        assert!(!gate.validate(&proposal(0.0, 5), &ctx()).await.approved);
        assert!(!gate.validate(&proposal(f64::NAN, 5), &ctx()).await.approved);
    }

    #[tokio::test]
    async fn test_wide_stop_loss_rejected() {
        let gate = RiskGate::new(limits());
        let mut p = proposal(0.01, 5);
        p.stop_loss = Some(48_000.0); // 4% away on a 0.6% limit
        let check = gate.validate(&p, &ctx()).await;
        assert!(!check.approved);
        assert!(check.reason.contains("stop-loss"));
    }

    #[tokio::test]
    async fn test_daily_cap_and_counter() {
        let mut l = limits();
        l.max_daily_trades = 2;
        let gate = RiskGate::new(l);
        assert!(gate.validate(&proposal(0.01, 5), &ctx()).await.approved);
        gate.increment_daily().await;
        gate.increment_daily().await;
        assert_eq!(gate.current_daily_count().await, 2);
        let check = gate.validate(&proposal(0.01, 5), &ctx()).await;
        assert!(!check.approved);
        assert!(check.reason.contains("daily"));
    }

    #[tokio::test]
    async fn test_risk_score_bounded_and_rejects_extremes() {
        let gate = RiskGate::new(limits());
        let mut c = ctx();
        c.existing_exposure = 50_000.0;
        c.volatility = 5.0;
        let check = gate.validate(&proposal(0.01, 20), &c).await;
        assert!(!check.approved);
        assert!(check.risk_score > 0.8 && check.risk_score <= 1.0);
    }
}
