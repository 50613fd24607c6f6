use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ai::{prompts, ReasoningClient};
use crate::config::Settings;
use crate::exchange::{BybitClient, VenueError};
use crate::history::{self, HistoryStore};
use crate::indicators::{returns_volatility, support_resistance, TechnicalSnapshot};
use crate::kalman::{KalmanPredictor, Prediction};
use crate::market::CandleStore;
use crate::metrics::Metrics;
use crate::risk::{RiskContext, RiskGate};
use crate::types::{
    candle, Candle, Decision, EntryVerdict, ExitType, PositionSnapshot, PositionTracking, Side,
    Ticker, TradeEntry, TradeExit, TradeProposal, TradeRecord, TradeResult,
};

const WARMUP_DEADLINE: Duration = Duration::from_secs(60);
const WARMUP_MIN_CANDLES: usize = 50;
const ANALYSIS_WINDOW: usize = 100;
const ERROR_DELAY: Duration = Duration::from_secs(30);
const KALMAN_LOOK_AHEAD: usize = 5;

/// The control loop: wires the candle store, indicator suite, Kalman
/// predictor, reasoning client, history store, risk gate and venue into
/// one serialised tick per candle interval, and enforces the one-position
/// and no-hedging invariants.
pub struct Orchestrator {
    settings: Arc<Settings>,
    venue: Arc<BybitClient>,
    ai: Arc<ReasoningClient>,
    history: Arc<HistoryStore>,
    risk: Arc<RiskGate>,
    candles: Arc<CandleStore>,
    kalman: KalmanPredictor,
    metrics: Arc<Metrics>,
    tracking: Mutex<HashMap<String, PositionTracking>>,
    stop: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        venue: Arc<BybitClient>,
        ai: Arc<ReasoningClient>,
        history: Arc<HistoryStore>,
        risk: Arc<RiskGate>,
        candles: Arc<CandleStore>,
        metrics: Arc<Metrics>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            venue,
            ai,
            history,
            risk,
            candles,
            kalman: KalmanPredictor::new(),
            metrics,
            tracking: Mutex::new(HashMap::new()),
            stop,
        }
    }

    /// Health-check collaborators, seed the candle window, then run ticks
    /// until the stop signal flips.
    pub async fn run(&self) -> anyhow::Result<()> {
        let symbol = self.settings.symbol.clone();
        let interval = self
            .settings
            .candle_interval()
            .context("unsupported candle interval")?;

        let venue_up = self.venue.health().await;
        let reasoning_up = self.ai.health().await;
        self.metrics.venue_up.set(venue_up as i64);
        self.metrics.reasoning_up.set(reasoning_up as i64);
        if !venue_up {
            bail!("venue health check failed");
        }
        if !reasoning_up {
            bail!("reasoning engine health check failed");
        }

        self.candles
            .start()
            .await
            .context("candle backfill failed")?;

        let warmup_start = Instant::now();
        while !self.candles.has_enough(WARMUP_MIN_CANDLES).await {
            if warmup_start.elapsed() > WARMUP_DEADLINE {
                bail!("candle window did not warm up within {WARMUP_DEADLINE:?}");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let stats = self.candles.stats().await;
        info!(
            count = stats.count,
            first_close = stats.first_close,
            last_close = stats.last_close,
            "candle window ready"
        );

        info!(
            event = "SYSTEM_ENGINE_START",
            symbol = %symbol,
            interval = %interval,
            auto_trading = self.settings.auto_trading,
            paper_trading = self.settings.paper_trading,
            "strategy engine started"
        );

        let period = Duration::from_secs(interval.to_seconds());
        let mut stop = self.stop.clone();

        loop {
            if *stop.borrow() {
                break;
            }

            let delay = match self.tick(&symbol).await {
                Ok(()) => period,
                Err(e) => {
                    self.metrics.errors_total.inc();
                    error!(event = "SYSTEM_TICK_ERROR", error = %e, "tick failed");
                    ERROR_DELAY
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }

        info!(event = "SYSTEM_ENGINE_STOP", symbol = %symbol, "strategy engine stopped");
        Ok(())
    }

    /// One serialised tick: analysis, position management, entry decision.
    async fn tick(&self, symbol: &str) -> Result<(), VenueError> {
        let analysis_start = Instant::now();

        // Step A: composite analysis.
        let window = self.candles.get(ANALYSIS_WINDOW).await;
        let indicators = TechnicalSnapshot::compute(&window);
        let prediction = self.kalman.predict(&window, KALMAN_LOOK_AHEAD);
        let levels = support_resistance(&window, 5);
        let ticker = self.venue.market_data(symbol).await?;

        let context = self.history.context(symbol).await;
        let context_text = history::format_context(&context);
        let prompt = prompts::entry_prompt(
            symbol,
            &ticker,
            &indicators,
            &prediction,
            &levels,
            Some(&context_text),
        );
        let verdict = self.ai.analyze_entry(&prompt).await;

        self.record_analysis_metrics(&indicators, &prediction, &verdict);
        self.metrics
            .analysis_duration
            .observe(analysis_start.elapsed().as_secs_f64());
        info!(
            event = "AI_ANALYSIS",
            symbol = symbol,
            decision = %verdict.decision,
            confidence = verdict.confidence,
            sentiment = %verdict.market_sentiment,
            kalman_trend = %prediction.trend,
            rsi = indicators.rsi,
            "analysis complete"
        );

        // Step B / C: manage the open position, or consider an entry.
        let positions = self.venue.positions(symbol).await?;
        match positions.first() {
            Some(position) => {
                self.metrics.open_positions.set(1);
                self.metrics.position_pnl_pct.set(position.pnl_pct);
                self.metrics.unrealised_pnl.set(position.unrealised_pnl);
                self.advise_on_hedge(position, &verdict);
                self.manage_position(position, &verdict, &ticker, &indicators, &prediction)
                    .await?;
            }
            None => {
                self.metrics.open_positions.set(0);
                self.metrics.position_pnl_pct.set(0.0);
                self.metrics.unrealised_pnl.set(0.0);
                self.reconcile_departed_position(symbol, &ticker).await?;
                self.maybe_open(symbol, &verdict, &ticker, &indicators, &prediction, &window)
                    .await?;
            }
        }

        if let Ok(balance) = self.venue.balance().await {
            self.metrics.balance_total.set(balance.total);
        }
        let context = self.history.context(symbol).await;
        self.metrics.win_rate.set(context.daily.win_rate());
        self.metrics.realised_pnl.set(context.global.pnl);

        Ok(())
    }

    /// No-hedging invariant: an opposing entry verdict while a position is
    /// open is advisory only; exits stay with the management policy.
    fn advise_on_hedge(&self, position: &PositionSnapshot, verdict: &EntryVerdict) {
        let opposes = matches!(
            (position.side, verdict.decision),
            (Side::Buy, Decision::Sell) | (Side::Sell, Decision::Buy)
        );
        if opposes {
            warn!(
                event = "RISK_HEDGE_SUPPRESSED",
                symbol = %position.symbol,
                position_side = %position.side,
                verdict = %verdict.decision,
                confidence = verdict.confidence,
                "opposing verdict while position open; not hedging"
            );
        }
    }

    async fn manage_position(
        &self,
        position: &PositionSnapshot,
        entry_verdict: &EntryVerdict,
        ticker: &Ticker,
        indicators: &TechnicalSnapshot,
        prediction: &Prediction,
    ) -> Result<(), VenueError> {
        let symbol = position.symbol.clone();
        let now = Utc::now();

        // Tracking upkeep; a missing record means the engine restarted or
        // the position was opened elsewhere.
        let (check_since, hours_in_position) = {
            let mut tracking = self.tracking.lock().await;
            let record = tracking.entry(symbol.clone()).or_insert_with(|| {
                warn!(symbol = %symbol, "no tracking record for open position, adopting it");
                PositionTracking::new(
                    symbol.clone(),
                    position.side,
                    position.entry_price,
                    None,
                    Uuid::new_v4().to_string(),
                    now,
                )
            });
            record.observe_price(position.current_price);
            (record.last_order_check_time, record.hours_in_position(now))
        };

        // Conditional-order poll: a fired TP or SL closed the trade on the
        // venue side.
        let scan = self.venue.check_tp_sl(&symbol, check_since).await?;
        {
            let mut tracking = self.tracking.lock().await;
            if let Some(record) = tracking.get_mut(&symbol) {
                record.last_order_check_time = now;
            }
        }
        if scan.tp_executed || scan.sl_executed || scan.liq_executed {
            let exit_type = if scan.tp_executed {
                ExitType::TakeProfit
            } else if scan.sl_executed {
                ExitType::StopLoss
            } else {
                ExitType::Liquidation
            };
            let exit_price = scan.fill_price.unwrap_or(position.current_price);
            self.finalise_close(&symbol, position, exit_price, exit_type, "venue")
                .await;
            return Ok(());
        }

        // Trailing stop: arm at +0.5% and only ever move favourably.
        {
            let mut tracking = self.tracking.lock().await;
            if let Some(record) = tracking.get_mut(&symbol) {
                if !record.trailing_active && position.pnl_pct >= super::exits::TRAILING_ARM_PCT {
                    record.trailing_active = true;
                    info!(symbol = %symbol, pnl_pct = position.pnl_pct, "trailing stop armed");
                }
                if let Some(new_sl) = super::exits::next_trailing_stop(record) {
                    match self.venue.update_stop_loss(&symbol, new_sl, None).await {
                        Ok(()) => {
                            record.last_trailing_sl = Some(new_sl);
                            info!(
                                symbol = %symbol,
                                stop_loss = new_sl,
                                "trailing stop advanced"
                            );
                        }
                        Err(e) => warn!(symbol = %symbol, error = %e, "trailing stop update failed"),
                    }
                }
            }
        }

        // Reasoning-guided exit.
        let verdict = self
            .ai
            .analyze_position(position, ticker, indicators, prediction, hours_in_position)
            .await;
        if let Some(pct) = verdict.action.close_percentage() {
            debug!(
                symbol = %symbol,
                action = verdict.action.as_str(),
                confidence = verdict.confidence,
                "reasoning requested exit"
            );
            self.execute_close(position, pct, "ai", &verdict.reasoning)
                .await?;
            return Ok(());
        }

        // Backup exit ladder.
        let exit = {
            let tracking = self.tracking.lock().await;
            tracking.get(&symbol).and_then(|record| {
                super::exits::evaluate_backup_exits(
                    position,
                    record,
                    entry_verdict,
                    indicators,
                    now,
                )
            })
        };
        if let Some(decision) = exit {
            if let Some(rung) = decision.ladder_rung {
                let mut tracking = self.tracking.lock().await;
                if let Some(record) = tracking.get_mut(&symbol) {
                    record.profit_ladder_fired.insert(rung);
                }
            }
            if let Some(pct) = decision.action.close_percentage() {
                info!(
                    symbol = %symbol,
                    strategy = decision.strategy,
                    reason = %decision.reason,
                    "backup exit triggered"
                );
                self.execute_close(position, pct, decision.strategy, &decision.reason)
                    .await?;
            }
        }

        Ok(())
    }

    /// Market-close `pct` percent of the position; a full close settles the
    /// trade record.
    async fn execute_close(
        &self,
        position: &PositionSnapshot,
        pct: u8,
        executed_by: &str,
        reason: &str,
    ) -> Result<(), VenueError> {
        let execution_start = Instant::now();
        let fill = self
            .venue
            .close(&position.symbol, position.side, pct)
            .await?;
        self.metrics
            .execution_duration
            .observe(execution_start.elapsed().as_secs_f64());

        info!(
            event = "TRADE_CLOSE_ORDER",
            symbol = %position.symbol,
            pct,
            executed_by,
            reason,
            order_id = %fill.order_id,
            "close order submitted"
        );

        if pct >= 100 {
            self.finalise_close(
                &position.symbol,
                position,
                fill.avg_price,
                ExitType::Manual,
                executed_by,
            )
            .await;
        }
        Ok(())
    }

    /// Settle history, metrics and tracking once a position is fully gone.
    async fn finalise_close(
        &self,
        symbol: &str,
        position: &PositionSnapshot,
        exit_price: f64,
        exit_type: ExitType,
        executed_by: &str,
    ) {
        let removed = self.tracking.lock().await.remove(symbol);
        let Some(record) = removed else {
            warn!(symbol, "close without tracking record");
            return;
        };

        let direction = if position.side.is_long() { 1.0 } else { -1.0 };
        let pnl = (exit_price - record.entry_price) * position.size * direction;
        let pnl_pct = if record.entry_price > 0.0 {
            (exit_price - record.entry_price) / record.entry_price * 100.0 * direction
        } else {
            0.0
        };
        let duration_min = (Utc::now() - record.entry_time).num_minutes();

        info!(
            event = "TRADE_CLOSE",
            symbol,
            r#type = exit_type.as_str(),
            executed_by,
            pnl,
            pnl_pct,
            duration_min,
            "position closed"
        );

        let outcome = if exit_type == ExitType::Liquidation {
            "liquidation"
        } else if pnl > 0.0 {
            "win"
        } else {
            "loss"
        };
        self.metrics.trades_total.with_label_values(&[outcome]).inc();

        self.history
            .record_close(
                symbol,
                &record.trade_id,
                TradeExit {
                    exit_type,
                    price: exit_price,
                    pnl,
                    pnl_pct,
                    duration_min,
                    time: Utc::now(),
                },
            )
            .await;
    }

    /// Tracking without a venue position means a conditional order closed
    /// the trade between ticks; classify it from recent order history.
    async fn reconcile_departed_position(
        &self,
        symbol: &str,
        ticker: &Ticker,
    ) -> Result<(), VenueError> {
        let record = {
            let tracking = self.tracking.lock().await;
            tracking.get(symbol).cloned()
        };
        let Some(record) = record else {
            return Ok(());
        };

        let scan = self
            .venue
            .check_tp_sl(symbol, record.last_order_check_time)
            .await?;
        let exit_type = if scan.tp_executed {
            ExitType::TakeProfit
        } else if scan.sl_executed {
            ExitType::StopLoss
        } else if scan.liq_executed {
            ExitType::Liquidation
        } else {
            ExitType::Manual
        };
        let exit_price = scan.fill_price.unwrap_or(ticker.price);

        // Rebuild a snapshot shell for the settlement maths.
        let position = PositionSnapshot {
            symbol: symbol.to_string(),
            side: record.side,
            size: 0.0,
            entry_price: record.entry_price,
            current_price: exit_price,
            unrealised_pnl: 0.0,
            pnl_pct: 0.0,
            leverage: 0.0,
            timestamp: Utc::now(),
        };
        warn!(symbol, "position closed outside the loop, settling record");
        self.finalise_close(symbol, &position, exit_price, exit_type, "venue")
            .await;
        Ok(())
    }

    /// Step C: entry decision for a flat book.
    async fn maybe_open(
        &self,
        symbol: &str,
        verdict: &EntryVerdict,
        ticker: &Ticker,
        indicators: &TechnicalSnapshot,
        prediction: &Prediction,
        window: &[Candle],
    ) -> Result<(), VenueError> {
        if verdict.decision == Decision::Hold {
            return Ok(());
        }
        if !self.settings.auto_trading {
            debug!(symbol, decision = %verdict.decision, "auto trading disabled, analysis only");
            return Ok(());
        }
        if !self.tracking.lock().await.is_empty() {
            warn!(symbol, "tracking map not empty on a flat book, skipping entry");
            return Ok(());
        }

        let side = match verdict.decision {
            Decision::Buy => Side::Buy,
            Decision::Sell => Side::Sell,
            Decision::Hold => return Ok(()),
        };

        let leverage = super::sizing::compute_leverage(
            verdict,
            prediction,
            indicators,
            ticker.price,
            self.settings.max_leverage,
        );
        let balance = self.venue.balance().await?;
        let instrument = self.venue.instrument(symbol).await?;
        let quantity = super::sizing::compute_quantity(
            balance.available,
            leverage,
            ticker.price,
            &instrument,
            self.settings.risk_pct,
        );
        let stop_loss =
            super::sizing::compute_stop_loss(ticker.price, side, self.settings.stop_loss_pct);
        let take_profit =
            super::sizing::compute_take_profit(ticker.price, stop_loss, side, verdict.confidence);

        let proposal = TradeProposal {
            symbol: symbol.to_string(),
            side,
            quantity,
            leverage,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
        };

        let risk_ctx = RiskContext {
            current_price: ticker.price,
            total_balance: balance.total,
            existing_exposure: 0.0,
            volatility: returns_volatility(&candle::closes(window)),
            qty_step: instrument.qty_step,
        };

        let mut check = self.risk.validate(&proposal, &risk_ctx).await;
        let proposal = if check.approved {
            proposal
        } else if let Some(adjusted) = check.adjusted.take() {
            info!(
                event = "RISK_ADJUSTED",
                symbol,
                original_qty = proposal.quantity,
                adjusted_qty = adjusted.quantity,
                reason = %check.reason,
                "retrying with adjusted proposal"
            );
            let recheck = self.risk.validate(&adjusted, &risk_ctx).await;
            if !recheck.approved {
                warn!(
                    event = "RISK_REJECT",
                    symbol,
                    reason = %recheck.reason,
                    risk_score = recheck.risk_score,
                    "adjusted proposal rejected"
                );
                return Ok(());
            }
            adjusted
        } else {
            warn!(
                event = "RISK_REJECT",
                symbol,
                reason = %check.reason,
                risk_score = check.risk_score,
                "proposal rejected"
            );
            return Ok(());
        };

        self.execute_open(&proposal, verdict, ticker, indicators, prediction)
            .await
    }

    async fn execute_open(
        &self,
        proposal: &TradeProposal,
        verdict: &EntryVerdict,
        ticker: &Ticker,
        indicators: &TechnicalSnapshot,
        prediction: &Prediction,
    ) -> Result<(), VenueError> {
        let now = Utc::now();
        let trade_id = Uuid::new_v4().to_string();

        let fill = if self.settings.paper_trading {
            info!(
                event = "TRADE_OPEN",
                symbol = %proposal.symbol,
                side = %proposal.side,
                qty = proposal.quantity,
                leverage = proposal.leverage,
                price = ticker.price,
                simulated = true,
                "paper trade recorded, no order sent"
            );
            None
        } else {
            let execution_start = Instant::now();
            let fill = self
                .venue
                .submit_order(
                    &proposal.symbol,
                    proposal.side,
                    proposal.quantity,
                    Some(proposal.leverage),
                    proposal.stop_loss,
                    proposal.take_profit,
                )
                .await?;
            self.metrics
                .execution_duration
                .observe(execution_start.elapsed().as_secs_f64());
            info!(
                event = "TRADE_OPEN",
                symbol = %proposal.symbol,
                side = %proposal.side,
                qty = proposal.quantity,
                leverage = proposal.leverage,
                price = fill.avg_price,
                order_id = %fill.order_id,
                confidence = verdict.confidence,
                "position opened"
            );
            Some(fill)
        };

        let entry_price = fill.as_ref().map(|f| f.avg_price).unwrap_or(ticker.price);
        let record = TradeRecord {
            id: trade_id.clone(),
            symbol: proposal.symbol.clone(),
            open_time: now,
            side: proposal.side,
            confidence: verdict.confidence,
            entry: TradeEntry {
                price: entry_price,
                rsi: indicators.rsi,
                macd_histogram: indicators.macd.histogram,
                kalman_trend: prediction.trend,
                leverage: proposal.leverage,
                quantity: proposal.quantity,
            },
            exit: None,
            result: TradeResult::Pending,
        };
        self.history.record_open(record).await;

        // Paper trades never show up in venue snapshots, so there is no
        // management loop to run for them.
        if fill.is_some() {
            let mut tracking = self.tracking.lock().await;
            tracking.insert(
                proposal.symbol.clone(),
                PositionTracking::new(
                    proposal.symbol.clone(),
                    proposal.side,
                    entry_price,
                    proposal.stop_loss,
                    trade_id,
                    now,
                ),
            );
        }

        self.risk.increment_daily().await;
        Ok(())
    }

    fn record_analysis_metrics(
        &self,
        indicators: &TechnicalSnapshot,
        prediction: &Prediction,
        verdict: &EntryVerdict,
    ) {
        self.metrics.rsi.set(indicators.rsi);
        self.metrics.macd_line.set(indicators.macd.line);
        self.metrics.macd_signal.set(indicators.macd.signal);
        self.metrics.macd_histogram.set(indicators.macd.histogram);
        self.metrics.ai_confidence.set(verdict.confidence);
        self.metrics.kalman_confidence.set(prediction.confidence);
    }
}
