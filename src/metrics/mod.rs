use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Process-wide metric families with the `agent_` prefix. One collector is
/// initialised at startup and shared read-only after that.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub realised_pnl: Gauge,
    pub unrealised_pnl: Gauge,
    pub balance_total: Gauge,
    pub trades_total: IntCounterVec,
    pub win_rate: Gauge,
    pub open_positions: IntGauge,
    pub position_pnl_pct: Gauge,
    pub ai_confidence: Gauge,
    pub kalman_confidence: Gauge,
    pub rsi: Gauge,
    pub macd_line: Gauge,
    pub macd_signal: Gauge,
    pub macd_histogram: Gauge,
    pub venue_up: IntGauge,
    pub reasoning_up: IntGauge,
    pub errors_total: IntCounter,
    pub analysis_duration: Histogram,
    pub execution_duration: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let realised_pnl = Gauge::with_opts(Opts::new(
            "agent_realised_pnl_usdt",
            "Realised PnL in quote currency",
        ))?;
        let unrealised_pnl = Gauge::with_opts(Opts::new(
            "agent_unrealised_pnl_usdt",
            "Unrealised PnL across open positions",
        ))?;
        let balance_total = Gauge::with_opts(Opts::new(
            "agent_balance_total_usdt",
            "Total account balance",
        ))?;
        let trades_total = IntCounterVec::new(
            Opts::new("agent_trades_total", "Trades by outcome"),
            &["outcome"],
        )?;
        let win_rate = Gauge::with_opts(Opts::new("agent_win_rate", "Daily win rate 0-100"))?;
        let open_positions = IntGauge::with_opts(Opts::new(
            "agent_open_positions",
            "Open positions on the configured symbol",
        ))?;
        let position_pnl_pct = Gauge::with_opts(Opts::new(
            "agent_position_pnl_pct",
            "Open position PnL percent",
        ))?;
        let ai_confidence = Gauge::with_opts(Opts::new(
            "agent_ai_confidence",
            "Latest reasoning verdict confidence",
        ))?;
        let kalman_confidence = Gauge::with_opts(Opts::new(
            "agent_kalman_confidence",
            "Latest Kalman prediction confidence",
        ))?;
        let rsi = Gauge::with_opts(Opts::new("agent_rsi", "Latest RSI(14)"))?;
        let macd_line = Gauge::with_opts(Opts::new("agent_macd_line", "Latest MACD line"))?;
        let macd_signal = Gauge::with_opts(Opts::new("agent_macd_signal", "Latest MACD signal"))?;
        let macd_histogram =
            Gauge::with_opts(Opts::new("agent_macd_histogram", "Latest MACD histogram"))?;
        let venue_up = IntGauge::with_opts(Opts::new("agent_venue_up", "Venue health bit"))?;
        let reasoning_up = IntGauge::with_opts(Opts::new(
            "agent_reasoning_up",
            "Reasoning engine health bit",
        ))?;
        let errors_total =
            IntCounter::with_opts(Opts::new("agent_errors_total", "Tick errors observed"))?;
        let analysis_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agent_analysis_duration_seconds",
                "Wall time of the per-tick analysis step",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        let execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agent_execution_duration_seconds",
                "Wall time of order submission",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(realised_pnl.clone()))?;
        registry.register(Box::new(unrealised_pnl.clone()))?;
        registry.register(Box::new(balance_total.clone()))?;
        registry.register(Box::new(trades_total.clone()))?;
        registry.register(Box::new(win_rate.clone()))?;
        registry.register(Box::new(open_positions.clone()))?;
        registry.register(Box::new(position_pnl_pct.clone()))?;
        registry.register(Box::new(ai_confidence.clone()))?;
        registry.register(Box::new(kalman_confidence.clone()))?;
        registry.register(Box::new(rsi.clone()))?;
        registry.register(Box::new(macd_line.clone()))?;
        registry.register(Box::new(macd_signal.clone()))?;
        registry.register(Box::new(macd_histogram.clone()))?;
        registry.register(Box::new(venue_up.clone()))?;
        registry.register(Box::new(reasoning_up.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(analysis_duration.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;

        Ok(Self {
            registry,
            realised_pnl,
            unrealised_pnl,
            balance_total,
            trades_total,
            win_rate,
            open_positions,
            position_pnl_pct,
            ai_confidence,
            kalman_confidence,
            rsi,
            macd_line,
            macd_signal,
            macd_histogram,
            venue_up,
            reasoning_up,
            errors_total,
            analysis_duration,
            execution_duration,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Serve `GET /metrics` and `GET /health` until the stop signal flips.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await?;

    info!("metrics server stopped");
    Ok(())
}
