use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::{ExitType, TradeExit, TradeRecord, TradeResult};

const DECISIONS_CAP: isize = 20;
const CURRENT_POSITION_TTL_SECS: u64 = 24 * 60 * 60;
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("history store timeout")]
    Timeout,
    #[error("history serialisation: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregate {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub liquidations: u64,
    pub pnl: f64,
    pub pnl_wins: f64,
    pub pnl_losses: f64,
}

impl Aggregate {
    pub fn win_rate(&self) -> f64 {
        let decided = self.wins + self.losses;
        if decided == 0 {
            return 0.0;
        }
        self.wins as f64 / decided as f64 * 100.0
    }

    fn apply(&mut self, exit: &TradeExit, result: TradeResult) {
        self.trades += 1;
        self.pnl += exit.pnl;
        match result {
            TradeResult::Win => {
                self.wins += 1;
                self.pnl_wins += exit.pnl;
            }
            TradeResult::Loss => {
                self.losses += 1;
                self.pnl_losses += exit.pnl;
            }
            TradeResult::Liquidation => {
                self.liquidations += 1;
                self.pnl_losses += exit.pnl;
            }
            TradeResult::Pending => {}
        }
    }
}

/// Enrichment block handed to the reasoning prompt.
#[derive(Debug, Clone, Default)]
pub struct HistoryContext {
    pub recent: Vec<TradeRecord>,
    pub daily: Aggregate,
    pub global: Aggregate,
    pub patterns: Vec<String>,
}

#[derive(Default)]
struct MemoryState {
    decisions: HashMap<String, Vec<TradeRecord>>,
    daily: HashMap<NaiveDate, Aggregate>,
    global: Aggregate,
}

/// Append-and-trim trade history with derived aggregates.
///
/// Backed by Redis when reachable; every write also lands in an in-memory
/// mirror so reads can degrade when the store goes away mid-run. History
/// enrichment is best-effort and never blocks a tick beyond `CALL_TIMEOUT`.
#[derive(Clone)]
pub struct HistoryStore {
    redis: Option<ConnectionManager>,
    memory: Arc<Mutex<MemoryState>>,
}

impl HistoryStore {
    pub async fn connect(url: &str) -> Self {
        let client = match redis::Client::open(url) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "invalid history store url, using in-memory stub");
                return Self::in_memory();
            }
        };

        match tokio::time::timeout(CALL_TIMEOUT, client.get_connection_manager()).await {
            Ok(Ok(manager)) => {
                info!("history store connected");
                Self {
                    redis: Some(manager),
                    memory: Arc::new(Mutex::new(MemoryState::default())),
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "history store unreachable, using in-memory stub");
                Self::in_memory()
            }
            Err(_) => {
                warn!("history store connect timed out, using in-memory stub");
                Self::in_memory()
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            redis: None,
            memory: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn decisions_key(symbol: &str) -> String {
        format!("trading:decisions:{symbol}")
    }

    fn current_key(symbol: &str) -> String {
        format!("trading:position:{symbol}:current")
    }

    fn daily_key(date: NaiveDate) -> String {
        format!("trading:daily:{}", date.format("%Y-%m-%d"))
    }

    /// Push a PENDING trade envelope onto the capped per-symbol list and
    /// remember the open position descriptor with a 24h TTL.
    pub async fn record_open(&self, record: TradeRecord) -> String {
        let trade_id = record.id.clone();

        {
            let mut mem = self.memory.lock().await;
            let list = mem.decisions.entry(record.symbol.clone()).or_default();
            list.insert(0, record.clone());
            list.truncate(DECISIONS_CAP as usize);
        }

        if let Some(redis) = &self.redis {
            let result = Self::redis_record_open(redis.clone(), &record).await;
            if let Err(e) = result {
                warn!(error = %e, trade_id = %trade_id, "failed to persist trade open");
            }
        }

        trade_id
    }

    async fn redis_record_open(
        mut con: ConnectionManager,
        record: &TradeRecord,
    ) -> Result<(), HistoryError> {
        let payload = serde_json::to_string(record)?;
        let key = Self::decisions_key(&record.symbol);
        let current = Self::current_key(&record.symbol);

        tokio::time::timeout(CALL_TIMEOUT, async {
            redis::pipe()
                .lpush(&key, &payload)
                .ltrim(&key, 0, DECISIONS_CAP - 1)
                .set_ex(&current, &record.id, CURRENT_POSITION_TTL_SECS)
                .query_async::<_, ()>(&mut con)
                .await
        })
        .await
        .map_err(|_| HistoryError::Timeout)??;

        Ok(())
    }

    /// Close out an envelope: set exit + result, bump the daily and global
    /// counters, drop the current-position descriptor.
    pub async fn record_close(&self, symbol: &str, trade_id: &str, exit: TradeExit) {
        let result = if exit.exit_type == ExitType::Liquidation {
            TradeResult::Liquidation
        } else if exit.pnl > 0.0 {
            TradeResult::Win
        } else {
            TradeResult::Loss
        };

        {
            let mut mem = self.memory.lock().await;
            let today = Utc::now().date_naive();
            mem.daily.entry(today).or_default().apply(&exit, result);
            mem.global.apply(&exit, result);
            if let Some(list) = mem.decisions.get_mut(symbol) {
                if let Some(record) = list.iter_mut().find(|r| r.id == trade_id) {
                    record.exit = Some(exit.clone());
                    record.result = result;
                }
            }
        }

        if let Some(redis) = &self.redis {
            let outcome =
                Self::redis_record_close(redis.clone(), symbol, trade_id, &exit, result).await;
            if let Err(e) = outcome {
                warn!(error = %e, trade_id, "failed to persist trade close");
            }
        }
    }

    async fn redis_record_close(
        mut con: ConnectionManager,
        symbol: &str,
        trade_id: &str,
        exit: &TradeExit,
        result: TradeResult,
    ) -> Result<(), HistoryError> {
        let key = Self::decisions_key(symbol);

        tokio::time::timeout(CALL_TIMEOUT, async {
            let raw: Vec<String> = redis::cmd("LRANGE")
                .arg(&key)
                .arg(0)
                .arg(-1)
                .query_async(&mut con)
                .await?;

            for (index, item) in raw.iter().enumerate() {
                let Ok(mut record) = serde_json::from_str::<TradeRecord>(item) else {
                    continue;
                };
                if record.id != trade_id {
                    continue;
                }
                record.exit = Some(exit.clone());
                record.result = result;
                let updated = serde_json::to_string(&record)?;
                redis::cmd("LSET")
                    .arg(&key)
                    .arg(index)
                    .arg(updated)
                    .query_async::<_, ()>(&mut con)
                    .await?;
                break;
            }

            let daily = Self::daily_key(Utc::now().date_naive());
            let mut pipe = redis::pipe();
            pipe.cmd("HINCRBY").arg(&daily).arg("trades").arg(1).ignore();
            pipe.cmd("HINCRBY")
                .arg("trading:global:stats")
                .arg("trades")
                .arg(1)
                .ignore();
            let field = match result {
                TradeResult::Win => "wins",
                TradeResult::Loss => "losses",
                TradeResult::Liquidation => "liquidations",
                TradeResult::Pending => "trades",
            };
            for key in [daily.as_str(), "trading:global:stats"] {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(1).ignore();
                pipe.cmd("HINCRBYFLOAT")
                    .arg(key)
                    .arg("pnl")
                    .arg(exit.pnl)
                    .ignore();
                let pnl_field = if exit.pnl > 0.0 { "pnl_wins" } else { "pnl_losses" };
                pipe.cmd("HINCRBYFLOAT")
                    .arg(key)
                    .arg(pnl_field)
                    .arg(exit.pnl)
                    .ignore();
            }
            pipe.cmd("DEL").arg(Self::current_key(symbol)).ignore();
            pipe.query_async::<_, ()>(&mut con).await?;
            Ok::<_, HistoryError>(())
        })
        .await
        .map_err(|_| HistoryError::Timeout)??;

        Ok(())
    }

    /// Last 5 closed trades, today's aggregate, the never-reset global
    /// aggregate and a few derived patterns.
    pub async fn context(&self, symbol: &str) -> HistoryContext {
        if let Some(redis) = &self.redis {
            match Self::redis_context(redis.clone(), symbol).await {
                Ok(ctx) => return ctx,
                Err(e) => warn!(error = %e, "history context unavailable, using mirror"),
            }
        }
        self.memory_context(symbol).await
    }

    async fn redis_context(
        mut con: ConnectionManager,
        symbol: &str,
    ) -> Result<HistoryContext, HistoryError> {
        tokio::time::timeout(CALL_TIMEOUT, async {
            let raw: Vec<String> = redis::cmd("LRANGE")
                .arg(Self::decisions_key(symbol))
                .arg(0)
                .arg(-1)
                .query_async(&mut con)
                .await?;
            let records: Vec<TradeRecord> = raw
                .iter()
                .filter_map(|item| serde_json::from_str(item).ok())
                .collect();

            let daily_raw: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(Self::daily_key(Utc::now().date_naive()))
                .query_async(&mut con)
                .await?;
            let global_raw: HashMap<String, String> = redis::cmd("HGETALL")
                .arg("trading:global:stats")
                .query_async(&mut con)
                .await?;

            Ok::<_, HistoryError>(build_context(
                records,
                aggregate_from_hash(&daily_raw),
                aggregate_from_hash(&global_raw),
            ))
        })
        .await
        .map_err(|_| HistoryError::Timeout)?
    }

    async fn memory_context(&self, symbol: &str) -> HistoryContext {
        let mem = self.memory.lock().await;
        let records = mem.decisions.get(symbol).cloned().unwrap_or_default();
        let daily = mem
            .daily
            .get(&Utc::now().date_naive())
            .cloned()
            .unwrap_or_default();
        build_context(records, daily, mem.global.clone())
    }
}

fn aggregate_from_hash(hash: &HashMap<String, String>) -> Aggregate {
    let int = |k: &str| hash.get(k).and_then(|v| v.parse().ok()).unwrap_or(0);
    let float = |k: &str| hash.get(k).and_then(|v| v.parse().ok()).unwrap_or(0.0);
    Aggregate {
        trades: int("trades"),
        wins: int("wins"),
        losses: int("losses"),
        liquidations: int("liquidations"),
        pnl: float("pnl"),
        pnl_wins: float("pnl_wins"),
        pnl_losses: float("pnl_losses"),
    }
}

fn build_context(records: Vec<TradeRecord>, daily: Aggregate, global: Aggregate) -> HistoryContext {
    let closed: Vec<&TradeRecord> = records.iter().filter(|r| r.is_closed()).collect();
    let patterns = derive_patterns(&closed, &global);
    let recent = closed.into_iter().take(5).cloned().collect();
    HistoryContext {
        recent,
        daily,
        global,
        patterns,
    }
}

fn derive_patterns(closed: &[&TradeRecord], global: &Aggregate) -> Vec<String> {
    let mut patterns = Vec::new();

    let rsi_avg = |result: TradeResult| {
        let entries: Vec<f64> = closed
            .iter()
            .filter(|r| r.result == result)
            .map(|r| r.entry.rsi)
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(entries.iter().sum::<f64>() / entries.len() as f64)
        }
    };

    if let (Some(win_rsi), Some(loss_rsi)) = (rsi_avg(TradeResult::Win), rsi_avg(TradeResult::Loss))
    {
        patterns.push(format!(
            "Winning entries averaged RSI {win_rsi:.1}, losing entries {loss_rsi:.1}"
        ));
    }

    if global.liquidations > 0 {
        let liq_leverage: Vec<u32> = closed
            .iter()
            .filter(|r| r.result == TradeResult::Liquidation)
            .map(|r| r.entry.leverage)
            .collect();
        if let Some(max) = liq_leverage.iter().max() {
            patterns.push(format!(
                "{} liquidation(s) on record; keep leverage below {max}x",
                global.liquidations
            ));
        } else {
            patterns.push(format!(
                "{} liquidation(s) on record; reduce leverage",
                global.liquidations
            ));
        }
    }

    patterns
}

/// Deterministic prose block embedded into entry prompts.
pub fn format_context(ctx: &HistoryContext) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Today: {} trades, {:.0}% win rate, {:+.2} USDT realised.\n",
        ctx.daily.trades,
        ctx.daily.win_rate(),
        ctx.daily.pnl
    ));
    out.push_str(&format!(
        "All time: {} trades ({} wins / {} losses / {} liquidations), {:+.2} USDT.\n",
        ctx.global.trades,
        ctx.global.wins,
        ctx.global.losses,
        ctx.global.liquidations,
        ctx.global.pnl
    ));

    if !ctx.recent.is_empty() {
        out.push_str("Recent closed trades:\n");
        for record in &ctx.recent {
            if let Some(exit) = &record.exit {
                out.push_str(&format!(
                    "- {} {} @ {:.2} -> {:.2} ({:+.2}%, {})\n",
                    record.side,
                    record.symbol,
                    record.entry.price,
                    exit.price,
                    exit.pnl_pct,
                    exit.exit_type.as_str()
                ));
            }
        }
    }

    for pattern in &ctx.patterns {
        out.push_str(&format!("Pattern: {pattern}\n"));
    }

    out
}
