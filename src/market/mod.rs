use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::exchange::{BybitClient, VenueError};
use crate::types::{Candle, Interval};

pub const WINDOW_CAP: usize = 200;
const BACKFILL_LIMIT: u32 = 200;
const REFRESH_LIMIT: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub first_close: Option<f64>,
    pub last_close: Option<f64>,
}

/// Bounded, de-duplicated sliding window of candles for one instrument.
/// Seeded by a historical backfill, then refreshed on the candle interval
/// by a background task. Reads and the refresh write share a mutex; the
/// critical section is just the merge.
pub struct CandleStore {
    symbol: String,
    interval: Interval,
    venue: Arc<BybitClient>,
    window: Arc<Mutex<Vec<Candle>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl CandleStore {
    pub fn new(symbol: String, interval: Interval, venue: Arc<BybitClient>) -> Self {
        Self {
            symbol,
            interval,
            venue,
            window: Arc::new(Mutex::new(Vec::new())),
            refresh_task: Mutex::new(None),
        }
    }

    /// Backfill the window (failure here is fatal), then schedule the
    /// periodic refresh. Refresh failures are transient: the window keeps
    /// its last state and the next tick retries.
    pub async fn start(&self) -> Result<(), VenueError> {
        let seed = self
            .venue
            .candles(&self.symbol, self.interval, BACKFILL_LIMIT)
            .await?;
        {
            let mut window = self.window.lock().await;
            *window = merge_candles(&window, seed, WINDOW_CAP);
            info!(symbol = %self.symbol, count = window.len(), "candle window seeded");
        }

        let symbol = self.symbol.clone();
        let interval = self.interval;
        let venue = Arc::clone(&self.venue);
        let shared = Arc::clone(&self.window);

        let handle = tokio::spawn(async move {
            let period = std::time::Duration::from_secs(interval.to_seconds());
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is the seed above

            loop {
                ticker.tick().await;
                match venue.candles(&symbol, interval, REFRESH_LIMIT).await {
                    Ok(fresh) => {
                        let mut window = shared.lock().await;
                        *window = merge_candles(&window, fresh, WINDOW_CAP);
                        debug!(symbol = %symbol, count = window.len(), "candle window refreshed");
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "candle refresh failed, retrying next tick");
                    }
                }
            }
        });

        *self.refresh_task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.refresh_task.lock().await.take() {
            handle.abort();
            info!(symbol = %self.symbol, "candle refresh stopped");
        }
    }

    /// Last `n` candles, oldest first.
    pub async fn get(&self, n: usize) -> Vec<Candle> {
        let window = self.window.lock().await;
        let start = window.len().saturating_sub(n);
        window[start..].to_vec()
    }

    pub async fn has_enough(&self, min: usize) -> bool {
        self.window.lock().await.len() >= min
    }

    pub async fn stats(&self) -> WindowStats {
        let window = self.window.lock().await;
        WindowStats {
            count: window.len(),
            first_time: window.first().map(|c| c.open_time),
            last_time: window.last().map(|c| c.open_time),
            first_close: window.first().map(|c| c.close),
            last_close: window.last().map(|c| c.close),
        }
    }
}

/// Append `fresh` onto `existing`, dedupe by open_time keeping the newer
/// record (the venue re-emits the forming candle with updated close and
/// volume), sort ascending and trim the oldest entries beyond `cap`.
/// Applying this twice with the same input yields the same window.
pub fn merge_candles(existing: &[Candle], fresh: Vec<Candle>, cap: usize) -> Vec<Candle> {
    let mut by_open: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
    for candle in existing.iter().copied().chain(fresh) {
        by_open.insert(candle.open_time, candle);
    }

    let mut merged: Vec<Candle> = by_open.into_values().collect();
    if merged.len() > cap {
        merged.drain(..merged.len() - cap);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn candle(minute: i64, close: f64, volume: f64) -> Candle {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Candle {
            open_time: base + Duration::minutes(minute),
            close_time: base + Duration::minutes(minute + 5),
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn test_merge_dedupes_keeping_newer() {
        let existing = vec![candle(0, 100.0, 10.0), candle(5, 101.0, 10.0)];
        // The forming candle at minute 5 comes back with updated values.
        let fresh = vec![candle(5, 102.5, 25.0), candle(10, 103.0, 5.0)];
        let merged = merge_candles(&existing, fresh, 200);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].close, 102.5);
        assert_eq!(merged[1].volume, 25.0);
    }

    #[test]
    fn test_merge_is_sorted_and_unique() {
        let existing = vec![candle(10, 103.0, 1.0), candle(0, 100.0, 1.0)];
        let fresh = vec![candle(5, 101.0, 1.0)];
        let merged = merge_candles(&existing, fresh, 200);
        let times: Vec<_> = merged.iter().map(|c| c.open_time).collect();
        let mut sorted = times.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(times, sorted);
    }

    #[test]
    fn test_merge_trims_oldest_beyond_cap() {
        let existing: Vec<Candle> = (0..10).map(|i| candle(i * 5, 100.0 + i as f64, 1.0)).collect();
        let merged = merge_candles(&existing, vec![candle(50, 120.0, 1.0)], 5);
        assert_eq!(merged.len(), 5);
        assert_eq!(merged.last().unwrap().close, 120.0);
        assert_eq!(merged.first().unwrap().close, 106.0);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let existing: Vec<Candle> = (0..8).map(|i| candle(i * 5, 100.0, 1.0)).collect();
        let fresh: Vec<Candle> = (6..9).map(|i| candle(i * 5, 101.0, 2.0)).collect();
        let once = merge_candles(&existing, fresh.clone(), 6);
        let twice = merge_candles(&once, fresh, 6);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(&twice) {
            assert_eq!(a.open_time, b.open_time);
            assert_eq!(a.close, b.close);
        }
    }
}
