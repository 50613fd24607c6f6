use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::{
    Balance, BookLevel, Candle, HistoricalOrder, Instrument, Interval, OrderBook, OrderFill,
    PositionSnapshot, Side, Ticker, TpSlScan,
};

use super::VenueError;

const BYBIT_API: &str = "https://api.bybit.com";
const BYBIT_TESTNET: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// retCodes demoted to warnings: 110043 = leverage not modified,
/// 34040 = position mode not modified.
const TOLERATED_RET_CODES: &[i64] = &[110043, 34040];

type HmacSha256 = Hmac<Sha256>;

/// Typed transport to Bybit's V5 REST API for linear perpetuals.
/// Purely mechanical; every trading decision lives upstream.
#[derive(Debug, Clone)]
pub struct BybitClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

impl BybitClient {
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Self {
        let base_url = if testnet { BYBIT_TESTNET } else { BYBIT_API };
        Self {
            http: Client::builder()
                .timeout(REQUEST_DEADLINE)
                .build()
                .unwrap_or_default(),
            api_key,
            api_secret,
            base_url: base_url.to_string(),
        }
    }

    /// V5 signature: HMAC-SHA256 over timestamp + api_key + recv_window +
    /// payload, where payload is the query string for reads and the raw
    /// JSON body for writes.
    fn sign(&self, timestamp: i64, payload: &str) -> String {
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, VenueError> {
        // Deterministic key-sorted query string so the signature is stable.
        let mut sorted: Vec<(&str, &str)> = params.to_vec();
        sorted.sort_by_key(|(k, _)| *k);
        let query = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &query);
        let url = format!("{}{path}?{query}", self.base_url);

        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?;

        Self::unwrap_envelope(resp.json().await?)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, VenueError> {
        let payload = body.to_string();
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &payload);
        let url = format!("{}{path}", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;

        Self::unwrap_envelope(resp.json().await?)
    }

    fn unwrap_envelope(envelope: Envelope) -> Result<Value, VenueError> {
        if envelope.ret_code == 0 {
            return Ok(envelope.result);
        }
        if TOLERATED_RET_CODES.contains(&envelope.ret_code) {
            warn!(
                code = envelope.ret_code,
                message = %envelope.ret_msg,
                "venue returned tolerated error"
            );
            return Ok(envelope.result);
        }
        Err(VenueError::Api {
            code: envelope.ret_code,
            message: envelope.ret_msg,
        })
    }

    pub async fn health(&self) -> bool {
        let url = format!("{}/v5/market/time", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn market_data(&self, symbol: &str) -> Result<Ticker, VenueError> {
        let result = self
            .get(
                "/v5/market/tickers",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;

        let item = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or(VenueError::MissingData("ticker list"))?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            price: field_f64(item, "lastPrice"),
            bid: field_f64(item, "bid1Price"),
            ask: field_f64(item, "ask1Price"),
            volume_24h: field_f64(item, "volume24h"),
            // price24hPcnt is a fraction, e.g. "0.0123".
            change_24h_pct: field_f64(item, "price24hPcnt") * 100.0,
            high_24h: field_f64(item, "highPrice24h"),
            low_24h: field_f64(item, "lowPrice24h"),
            timestamp: Utc::now(),
        })
    }

    /// Chronological candles, oldest first. The venue returns newest first.
    pub async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, VenueError> {
        let limit = limit.to_string();
        let result = self
            .get(
                "/v5/market/kline",
                &[
                    ("category", CATEGORY),
                    ("symbol", symbol),
                    ("interval", interval.as_str()),
                    ("limit", &limit),
                ],
            )
            .await?;

        let rows = result["list"]
            .as_array()
            .ok_or(VenueError::MissingData("kline list"))?;

        let interval_ms = interval.to_seconds() as i64 * 1000;
        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                let open_ms: i64 = row.first()?.as_str()?.parse().ok()?;
                Some(Candle {
                    open_time: Utc.timestamp_millis_opt(open_ms).single()?,
                    close_time: Utc.timestamp_millis_opt(open_ms + interval_ms).single()?,
                    open: index_f64(row, 1),
                    high: index_f64(row, 2),
                    low: index_f64(row, 3),
                    close: index_f64(row, 4),
                    volume: index_f64(row, 5),
                })
            })
            .collect();

        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    pub async fn order_book(&self, symbol: &str, depth: u32) -> Result<OrderBook, VenueError> {
        let depth = depth.to_string();
        let result = self
            .get(
                "/v5/market/orderbook",
                &[
                    ("category", CATEGORY),
                    ("symbol", symbol),
                    ("limit", &depth),
                ],
            )
            .await?;

        let parse_side = |key: &str| -> Vec<BookLevel> {
            result[key]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let row = row.as_array()?;
                            Some(BookLevel {
                                price: row.first()?.as_str()?.parse().ok()?,
                                quantity: row.get(1)?.as_str()?.parse().ok()?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_side("b"),
            asks: parse_side("a"),
            timestamp: Utc::now(),
        })
    }

    pub async fn instrument(&self, symbol: &str) -> Result<Instrument, VenueError> {
        let result = self
            .get(
                "/v5/market/instruments-info",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;

        let item = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or(VenueError::MissingData("instrument info"))?;

        Ok(Instrument {
            symbol: symbol.to_string(),
            base_coin: item["baseCoin"].as_str().unwrap_or_default().to_string(),
            quote_coin: item["quoteCoin"].as_str().unwrap_or_default().to_string(),
            min_order_qty: field_f64(&item["lotSizeFilter"], "minOrderQty"),
            qty_step: field_f64(&item["lotSizeFilter"], "qtyStep"),
            tick_size: field_f64(&item["priceFilter"], "tickSize"),
        })
    }

    /// Market IOC order with optional conditional exits attached. Quantity
    /// and prices are normalised to the instrument's steps before they go
    /// on the wire.
    pub async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        leverage: Option<u32>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<OrderFill, VenueError> {
        let instrument = self.instrument(symbol).await?;

        if let Some(lev) = leverage {
            self.set_leverage(symbol, lev).await?;
        }

        let qty_str = normalize_step(qty, instrument.qty_step)
            .ok_or(VenueError::ZeroQuantity(qty, instrument.qty_step))?;

        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": side.as_str(),
            "orderType": "Market",
            "qty": qty_str,
            "timeInForce": "IOC",
        });
        if let Some(sl) = stop_loss {
            body["stopLoss"] = json!(normalize_price(sl, instrument.tick_size));
        }
        if let Some(tp) = take_profit {
            body["takeProfit"] = json!(normalize_price(tp, instrument.tick_size));
        }

        let result = self.post("/v5/order/create", &body).await?;
        let order_id = result["orderId"]
            .as_str()
            .ok_or(VenueError::MissingData("orderId"))?
            .to_string();

        // The create call does not echo the fill; pull it from history and
        // fall back to the current mark when it has not settled yet.
        let (avg_price, fees) = match self.order_fill(symbol, &order_id).await {
            Ok(Some(fill)) => fill,
            _ => {
                let ticker = self.market_data(symbol).await?;
                (ticker.price, 0.0)
            }
        };

        Ok(OrderFill {
            order_id,
            avg_price,
            fees,
        })
    }

    async fn order_fill(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<(f64, f64)>, VenueError> {
        let result = self
            .get(
                "/v5/order/history",
                &[
                    ("category", CATEGORY),
                    ("symbol", symbol),
                    ("orderId", order_id),
                ],
            )
            .await?;

        Ok(result["list"].as_array().and_then(|l| l.first()).map(|o| {
            (field_f64(o, "avgPrice"), field_f64(o, "cumExecFee"))
        }))
    }

    /// Idempotent; "leverage not modified" comes back from the venue as a
    /// tolerated retCode.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let lev = leverage.to_string();
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": lev,
            "sellLeverage": lev,
        });
        self.post("/v5/position/set-leverage", &body).await?;
        Ok(())
    }

    /// Only entries with size > 0.
    pub async fn positions(&self, symbol: &str) -> Result<Vec<PositionSnapshot>, VenueError> {
        let result = self
            .get(
                "/v5/position/list",
                &[("category", CATEGORY), ("symbol", symbol)],
            )
            .await?;

        let now = Utc::now();
        let positions = result["list"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let size = field_f64(row, "size");
                        if size <= 0.0 {
                            return None;
                        }
                        let side = Side::from_str(row["side"].as_str()?)?;
                        let entry_price = field_f64(row, "avgPrice");
                        let unrealised_pnl = field_f64(row, "unrealisedPnl");
                        let entry_value = entry_price * size;
                        let pnl_pct = if entry_value > 0.0 {
                            unrealised_pnl / entry_value * 100.0
                        } else {
                            0.0
                        };
                        Some(PositionSnapshot {
                            symbol: symbol.to_string(),
                            side,
                            size,
                            entry_price,
                            current_price: field_f64(row, "markPrice"),
                            unrealised_pnl,
                            pnl_pct,
                            leverage: field_f64(row, "leverage"),
                            timestamp: now,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(positions)
    }

    pub async fn balance(&self) -> Result<Balance, VenueError> {
        let result = self
            .get("/v5/account/wallet-balance", &[("accountType", "UNIFIED")])
            .await?;

        let account = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or(VenueError::MissingData("wallet balance"))?;

        let total = field_f64(account, "totalEquity");
        let available = match account.get("totalAvailableBalance").and_then(Value::as_str) {
            Some(v) if !v.is_empty() => v.parse().unwrap_or(total * 0.95),
            _ => total * 0.95,
        };
        let used_margin = field_f64(account, "totalInitialMargin");

        Ok(Balance {
            total,
            available,
            used_margin,
        })
    }

    /// Modify the live position's conditional exits.
    pub async fn update_stop_loss(
        &self,
        symbol: &str,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<(), VenueError> {
        let instrument = self.instrument(symbol).await?;
        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "stopLoss": normalize_price(stop_loss, instrument.tick_size),
            "positionIdx": 0,
        });
        if let Some(tp) = take_profit {
            body["takeProfit"] = json!(normalize_price(tp, instrument.tick_size));
        }
        self.post("/v5/position/trading-stop", &body).await?;
        Ok(())
    }

    /// Reduce-only market close of `pct` percent of the open position.
    pub async fn close(&self, symbol: &str, side: Side, pct: u8) -> Result<OrderFill, VenueError> {
        let positions = self.positions(symbol).await?;
        let position = positions
            .iter()
            .find(|p| p.side == side)
            .ok_or(VenueError::MissingData("open position to close"))?;

        let instrument = self.instrument(symbol).await?;
        let raw_qty = position.size * pct as f64 / 100.0;
        let qty_str = normalize_step(raw_qty, instrument.qty_step)
            .ok_or(VenueError::ZeroQuantity(raw_qty, instrument.qty_step))?;

        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "side": side.opposite().as_str(),
            "orderType": "Market",
            "qty": qty_str,
            "timeInForce": "IOC",
            "reduceOnly": true,
        });

        let result = self.post("/v5/order/create", &body).await?;
        let order_id = result["orderId"]
            .as_str()
            .ok_or(VenueError::MissingData("orderId"))?
            .to_string();

        let (avg_price, fees) = match self.order_fill(symbol, &order_id).await {
            Ok(Some(fill)) => fill,
            _ => (position.current_price, 0.0),
        };

        debug!(symbol, pct, order_id = %order_id, "position close submitted");
        Ok(OrderFill {
            order_id,
            avg_price,
            fees,
        })
    }

    /// Filled orders, newest first.
    pub async fn order_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<HistoricalOrder>, VenueError> {
        let limit = limit.to_string();
        let result = self
            .get(
                "/v5/order/history",
                &[
                    ("category", CATEGORY),
                    ("symbol", symbol),
                    ("limit", &limit),
                ],
            )
            .await?;

        let orders = result["list"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        if row["orderStatus"].as_str() != Some("Filled") {
                            return None;
                        }
                        let updated_ms: i64 =
                            row["updatedTime"].as_str().and_then(|v| v.parse().ok())?;
                        Some(HistoricalOrder {
                            order_id: row["orderId"].as_str().unwrap_or_default().to_string(),
                            symbol: symbol.to_string(),
                            side: row["side"].as_str().unwrap_or_default().to_string(),
                            order_type: row["orderType"].as_str().unwrap_or_default().to_string(),
                            stop_order_type: row["stopOrderType"]
                                .as_str()
                                .filter(|s| !s.is_empty())
                                .map(str::to_string),
                            avg_price: field_f64(row, "avgPrice"),
                            qty: field_f64(row, "qty"),
                            updated_at: Utc.timestamp_millis_opt(updated_ms).single()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(orders)
    }

    /// Scan recent fills for a conditional order that fired after `since`.
    pub async fn check_tp_sl(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<TpSlScan, VenueError> {
        let orders = self.order_history(symbol, 20).await?;
        let mut scan = TpSlScan::default();

        for order in orders {
            if order.updated_at <= since {
                continue;
            }
            match order.stop_order_type.as_deref() {
                Some(t) if t.contains("TakeProfit") => {
                    scan.tp_executed = true;
                    scan.fill_price.get_or_insert(order.avg_price);
                }
                Some(t) if t.contains("StopLoss") => {
                    scan.sl_executed = true;
                    scan.fill_price.get_or_insert(order.avg_price);
                }
                Some("MmRateClose") => {
                    scan.liq_executed = true;
                    scan.fill_price.get_or_insert(order.avg_price);
                }
                _ => {}
            }
        }

        Ok(scan)
    }
}

fn field_f64(value: &Value, key: &str) -> f64 {
    match &value[key] {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn index_f64(row: &[Value], index: usize) -> f64 {
    row.get(index)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Floor a quantity onto the instrument's step grid and render it without
/// floating-point tails. `None` when the result rounds to zero.
pub fn normalize_step(qty: f64, step: f64) -> Option<String> {
    let qty = Decimal::try_from(qty).ok()?;
    let step = Decimal::try_from(step).ok()?;
    if step <= Decimal::ZERO || qty <= Decimal::ZERO {
        return None;
    }
    let stepped = (qty / step).floor() * step;
    if stepped <= Decimal::ZERO {
        return None;
    }
    Some(stepped.normalize().to_string())
}

/// Round a price onto the tick grid; falls back to a plain render when the
/// tick is degenerate.
pub fn normalize_price(price: f64, tick: f64) -> String {
    let fallback = || {
        Decimal::try_from(price)
            .map(|d| d.normalize().to_string())
            .unwrap_or_else(|_| price.to_string())
    };
    let (Ok(price_d), Ok(tick_d)) = (Decimal::try_from(price), Decimal::try_from(tick)) else {
        return fallback();
    };
    if tick_d <= Decimal::ZERO {
        return fallback();
    }
    let ticks = (price_d / tick_d).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (ticks * tick_d).normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_step_strips_fp_tails() {
        assert_eq!(normalize_step(0.26680000000000004, 0.001).as_deref(), Some("0.266"));
        assert_eq!(normalize_step(1.0, 0.001).as_deref(), Some("1"));
        assert_eq!(normalize_step(0.0605, 0.001).as_deref(), Some("0.06"));
    }

    #[test]
    fn test_normalize_step_rejects_zero() {
        assert_eq!(normalize_step(0.0004, 0.001), None);
        assert_eq!(normalize_step(0.0, 0.001), None);
        assert_eq!(normalize_step(1.0, 0.0), None);
    }

    #[test]
    fn test_normalize_price_rounds_to_tick() {
        assert_eq!(normalize_price(50448.2344, 0.1), "50448.2");
        assert_eq!(normalize_price(50448.25, 0.5), "50448.5");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let client = BybitClient::new("key".into(), "secret".into(), true);
        let a = client.sign(1_700_000_000_000, "symbol=BTCUSDT");
        let b = client.sign(1_700_000_000_000, "symbol=BTCUSDT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_tolerated_ret_code_unwraps() {
        let envelope = Envelope {
            ret_code: 110043,
            ret_msg: "leverage not modified".into(),
            result: serde_json::json!({}),
        };
        assert!(BybitClient::unwrap_envelope(envelope).is_ok());

        let envelope = Envelope {
            ret_code: 10001,
            ret_msg: "params error".into(),
            result: serde_json::json!({}),
        };
        assert!(BybitClient::unwrap_envelope(envelope).is_err());
    }
}
