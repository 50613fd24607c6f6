use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::ai::{prompts, ReasoningClient};
use crate::config::Settings;
use crate::engine::sizing;
use crate::exchange::BybitClient;
use crate::history::{self, HistoryStore};
use crate::indicators::{
    annualised_volatility, book_pressure, candle_patterns, compare_timeframes,
    support_resistance, TechnicalSnapshot,
};
use crate::kalman::KalmanPredictor;
use crate::risk::{RiskContext, RiskGate};
use crate::types::{Interval, Side, TradeProposal};

/// Capabilities shared with the external supervisor.
pub struct ToolContext {
    pub settings: Arc<Settings>,
    pub venue: Arc<BybitClient>,
    pub ai: Arc<ReasoningClient>,
    pub history: Arc<HistoryStore>,
    pub risk: Arc<RiskGate>,
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Bidirectional text-frame protocol: one JSON object per frame.
/// `tools/list` describes the surface, `tools/call` dispatches by name.
pub async fn serve(
    ctx: Arc<ToolContext>,
    port: u16,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "tools server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "tools client connected");
                        let ctx = Arc::clone(&ctx);
                        let stop = stop.clone();
                        tokio::spawn(handle_connection(stream, ctx, stop));
                    }
                    Err(e) => warn!(error = %e, "tools server accept failed"),
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }

    info!("tools server stopped");
    Ok(())
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ToolContext>, mut stop: watch::Receiver<bool>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            frame = source.next() => {
                let Some(frame) = frame else { break };
                let message = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let response = handle_message(&ctx, &message).await;
                if sink.send(Message::Text(response.to_string())).await.is_err() {
                    break;
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
}

async fn handle_message(ctx: &ToolContext, raw: &str) -> Value {
    let request: ToolRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return json!({
                "id": Value::Null,
                "error": {"code": -32700, "message": format!("parse error: {e}")},
                "timestamp": Utc::now().timestamp_millis(),
            })
        }
    };

    let outcome = match request.method.as_str() {
        "tools/list" => Ok(tool_listing()),
        "tools/call" => {
            let name = request.params["name"].as_str().unwrap_or_default().to_string();
            let arguments = request.params["arguments"].clone();
            call_tool(ctx, &name, &arguments).await
        }
        other => Err(format!("unknown method '{other}'")),
    };

    match outcome {
        Ok(result) => json!({
            "id": request.id,
            "result": result,
            "timestamp": Utc::now().timestamp_millis(),
        }),
        Err(message) => json!({
            "id": request.id,
            "error": {"code": -32000, "message": message},
            "timestamp": Utc::now().timestamp_millis(),
        }),
    }
}

fn symbol_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "symbol": {"type": "string", "description": "Instrument, defaults to the configured symbol"}
        }
    })
}

fn tool_listing() -> Value {
    json!({
        "tools": [
            {"name": "get_market_data", "description": "Latest ticker with bid/ask and 24h statistics", "input_schema": symbol_schema()},
            {"name": "get_market_data_1m", "description": "Recent 1-minute candles for fine-grained context", "input_schema": symbol_schema()},
            {"name": "analyze_technical", "description": "RSI, MACD, Bollinger, EMA ladder and volume profile", "input_schema": symbol_schema()},
            {"name": "kalman_predict", "description": "Kalman filter price forecast with confidence and trend", "input_schema": json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "look_ahead": {"type": "integer", "minimum": 1, "maximum": 50}
                }
            })},
            {"name": "ai_analysis", "description": "Full entry analysis via the reasoning engine", "input_schema": symbol_schema()},
            {"name": "execute_trade", "description": "Risk-gated market order", "input_schema": json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "side": {"type": "string", "enum": ["Buy", "Sell"]},
                    "quantity": {"type": "number"},
                    "leverage": {"type": "integer", "minimum": 1, "maximum": 50}
                },
                "required": ["side"]
            })},
            {"name": "get_positions", "description": "Open positions on the symbol", "input_schema": symbol_schema()},
            {"name": "close_position", "description": "Close part or all of the open position", "input_schema": json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "percentage": {"type": "integer", "enum": [25, 50, 100]}
                },
                "required": ["percentage"]
            })},
            {"name": "analyze_candle_pattern", "description": "Short-window candle pattern helpers on 1m data", "input_schema": symbol_schema()},
            {"name": "detect_micro_trend", "description": "Coarse/fine timeframe trend comparison with divergence flag", "input_schema": symbol_schema()},
            {"name": "analyze_order_book", "description": "Depth imbalance, walls and pressure label", "input_schema": json!({
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "depth": {"type": "integer", "minimum": 1, "maximum": 200}
                }
            })}
        ]
    })
}

async fn call_tool(ctx: &ToolContext, name: &str, args: &Value) -> Result<Value, String> {
    let symbol = args["symbol"]
        .as_str()
        .unwrap_or(&ctx.settings.symbol)
        .to_string();
    let interval = ctx.settings.candle_interval().unwrap_or(Interval::M5);

    match name {
        "get_market_data" => {
            let ticker = ctx.venue.market_data(&symbol).await.map_err(err)?;
            serde_json::to_value(ticker).map_err(err)
        }
        "get_market_data_1m" => {
            let candles = ctx
                .venue
                .candles(&symbol, Interval::M1, 30)
                .await
                .map_err(err)?;
            serde_json::to_value(candles).map_err(err)
        }
        "analyze_technical" => {
            let candles = ctx.venue.candles(&symbol, interval, 100).await.map_err(err)?;
            let snapshot = TechnicalSnapshot::compute(&candles);
            Ok(json!({
                "indicators": snapshot,
                "support_resistance": support_resistance(&candles, 5),
                "annualised_volatility": annualised_volatility(&candles, 20),
            }))
        }
        "kalman_predict" => {
            let look_ahead = args["look_ahead"].as_u64().unwrap_or(5).clamp(1, 50) as usize;
            let candles = ctx.venue.candles(&symbol, interval, 100).await.map_err(err)?;
            let prediction = KalmanPredictor::new().predict(&candles, look_ahead);
            serde_json::to_value(prediction).map_err(err)
        }
        "ai_analysis" => {
            let candles = ctx.venue.candles(&symbol, interval, 100).await.map_err(err)?;
            let ticker = ctx.venue.market_data(&symbol).await.map_err(err)?;
            let indicators = TechnicalSnapshot::compute(&candles);
            let prediction = KalmanPredictor::new().predict(&candles, 5);
            let levels = support_resistance(&candles, 5);
            let context = ctx.history.context(&symbol).await;
            let context_text = history::format_context(&context);
            let prompt = prompts::entry_prompt(
                &symbol,
                &ticker,
                &indicators,
                &prediction,
                &levels,
                Some(&context_text),
            );
            let verdict = ctx.ai.analyze_entry(&prompt).await;
            serde_json::to_value(verdict).map_err(err)
        }
        "execute_trade" => execute_trade(ctx, &symbol, args).await,
        "get_positions" => {
            let positions = ctx.venue.positions(&symbol).await.map_err(err)?;
            serde_json::to_value(positions).map_err(err)
        }
        "close_position" => {
            let pct = args["percentage"].as_u64().unwrap_or(0);
            if ![25, 50, 100].contains(&pct) {
                return Err("percentage must be 25, 50 or 100".to_string());
            }
            let positions = ctx.venue.positions(&symbol).await.map_err(err)?;
            let position = positions
                .first()
                .ok_or_else(|| format!("no open position on {symbol}"))?;
            let fill = ctx
                .venue
                .close(&symbol, position.side, pct as u8)
                .await
                .map_err(err)?;
            serde_json::to_value(fill).map_err(err)
        }
        "analyze_candle_pattern" => {
            let candles = ctx
                .venue
                .candles(&symbol, Interval::M1, 20)
                .await
                .map_err(err)?;
            serde_json::to_value(candle_patterns(&candles)).map_err(err)
        }
        "detect_micro_trend" => {
            let coarse = ctx.venue.candles(&symbol, interval, 20).await.map_err(err)?;
            let fine = ctx
                .venue
                .candles(&symbol, Interval::M1, 10)
                .await
                .map_err(err)?;
            serde_json::to_value(compare_timeframes(&coarse, &fine)).map_err(err)
        }
        "analyze_order_book" => {
            let depth = args["depth"].as_u64().unwrap_or(50).clamp(1, 200) as u32;
            let book = ctx.venue.order_book(&symbol, depth).await.map_err(err)?;
            serde_json::to_value(book_pressure(&book)).map_err(err)
        }
        other => Err(format!("unknown tool '{other}'")),
    }
}

async fn execute_trade(ctx: &ToolContext, symbol: &str, args: &Value) -> Result<Value, String> {
    let side = args["side"]
        .as_str()
        .and_then(Side::from_str)
        .ok_or("side must be Buy or Sell")?;
    let leverage = args["leverage"].as_u64().unwrap_or(5).clamp(1, 50) as u32;

    let ticker = ctx.venue.market_data(symbol).await.map_err(err)?;
    let balance = ctx.venue.balance().await.map_err(err)?;
    let instrument = ctx.venue.instrument(symbol).await.map_err(err)?;

    let quantity = match args["quantity"].as_f64() {
        Some(q) => q,
        None => sizing::compute_quantity(
            balance.available,
            leverage,
            ticker.price,
            &instrument,
            ctx.settings.risk_pct,
        ),
    };
    let stop_loss = sizing::compute_stop_loss(ticker.price, side, ctx.settings.stop_loss_pct);

    let proposal = TradeProposal {
        symbol: symbol.to_string(),
        side,
        quantity,
        leverage,
        stop_loss: Some(stop_loss),
        take_profit: None,
    };

    let positions = ctx.venue.positions(symbol).await.map_err(err)?;
    let existing_exposure: f64 = positions.iter().map(|p| p.entry_price * p.size).sum();
    if positions.iter().any(|p| p.side != side) {
        return Err("refusing to hedge an open position on the opposite side".to_string());
    }

    let risk_ctx = RiskContext {
        current_price: ticker.price,
        total_balance: balance.total,
        existing_exposure,
        volatility: 0.0,
        qty_step: instrument.qty_step,
    };
    let mut check = ctx.risk.validate(&proposal, &risk_ctx).await;
    let proposal = if check.approved {
        proposal
    } else if let Some(adjusted) = check.adjusted.take() {
        let recheck = ctx.risk.validate(&adjusted, &risk_ctx).await;
        if !recheck.approved {
            return Err(format!("risk gate rejected: {}", recheck.reason));
        }
        adjusted
    } else {
        return Err(format!("risk gate rejected: {}", check.reason));
    };

    if ctx.settings.paper_trading {
        return Ok(json!({
            "simulated": true,
            "symbol": proposal.symbol,
            "side": proposal.side,
            "quantity": proposal.quantity,
            "leverage": proposal.leverage,
            "price": ticker.price,
        }));
    }

    let fill = ctx
        .venue
        .submit_order(
            &proposal.symbol,
            proposal.side,
            proposal.quantity,
            Some(proposal.leverage),
            proposal.stop_loss,
            proposal.take_profit,
        )
        .await
        .map_err(err)?;
    ctx.risk.increment_daily().await;
    serde_json::to_value(fill).map_err(err)
}

fn err(e: impl std::fmt::Display) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_listing_covers_required_surface() {
        let listing = tool_listing();
        let names: Vec<&str> = listing["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for required in [
            "get_market_data",
            "analyze_technical",
            "kalman_predict",
            "ai_analysis",
            "execute_trade",
            "get_positions",
            "close_position",
            "get_market_data_1m",
            "analyze_candle_pattern",
            "detect_micro_trend",
            "analyze_order_book",
        ] {
            assert!(names.contains(&required), "missing tool {required}");
        }
    }

    #[test]
    fn test_request_parsing_defaults() {
        let req: ToolRequest =
            serde_json::from_str(r#"{"method": "tools/list", "timestamp": 1}"#).unwrap();
        assert_eq!(req.method, "tools/list");
        assert!(req.id.is_null());
        assert!(req.params.is_null());
    }
}
