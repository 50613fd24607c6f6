mod ai;
mod config;
mod engine;
mod exchange;
mod history;
mod indicators;
mod kalman;
mod market;
mod metrics;
mod risk;
mod server;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ai::ReasoningClient;
use config::Settings;
use engine::Orchestrator;
use exchange::BybitClient;
use history::HistoryStore;
use indicators::TechnicalSnapshot;
use kalman::KalmanPredictor;
use market::CandleStore;
use risk::{RiskGate, RiskLimitsConfig};
use server::ToolContext;
use types::Interval;

#[derive(Parser)]
#[command(name = "perp-trading-agent")]
#[command(version = "0.1.0")]
#[command(about = "AI-assisted perpetual-futures trading agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine (default)
    Run,
    /// One-shot market analysis without trading
    Analyze,
    /// Show the account balance
    Balance,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_engine(settings).await,
        Commands::Analyze => analyze_once(settings).await,
        Commands::Balance => show_balance(settings).await,
    }
}

async fn run_engine(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    info!(
        symbol = %settings.symbol,
        interval = %settings.interval,
        testnet = settings.bybit_testnet,
        paper = settings.paper_trading,
        "starting perp trading agent"
    );

    let venue = Arc::new(BybitClient::new(
        settings.bybit_api_key.clone(),
        settings.bybit_api_secret.clone(),
        settings.bybit_testnet,
    ));
    let reasoning = Arc::new(ReasoningClient::new(
        settings.llm_host.clone(),
        settings.llm_model.clone(),
        settings.llm_timeout(),
    ));
    let history = Arc::new(HistoryStore::connect(&settings.redis_url()).await);
    let risk = Arc::new(RiskGate::new(RiskLimitsConfig {
        max_leverage: settings.max_leverage,
        max_position_size: settings.max_position_size,
        stop_loss_pct: settings.stop_loss_pct,
        max_daily_trades: settings.max_daily_trades,
    }));
    let interval = settings
        .candle_interval()
        .context("unsupported candle interval")?;
    let candles = Arc::new(CandleStore::new(
        settings.symbol.clone(),
        interval,
        Arc::clone(&venue),
    ));
    let collector = Arc::new(metrics::Metrics::new()?);

    let (stop_tx, stop_rx) = watch::channel(false);

    let metrics_task = tokio::spawn(metrics::serve(
        Arc::clone(&collector),
        settings.metrics_port,
        stop_rx.clone(),
    ));

    let tools_ctx = Arc::new(ToolContext {
        settings: Arc::clone(&settings),
        venue: Arc::clone(&venue),
        ai: Arc::clone(&reasoning),
        history: Arc::clone(&history),
        risk: Arc::clone(&risk),
    });
    let tools_task = tokio::spawn(server::serve(
        tools_ctx,
        settings.tools_port,
        stop_rx.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&settings),
        Arc::clone(&venue),
        reasoning,
        history,
        risk,
        Arc::clone(&candles),
        collector,
        stop_rx,
    ));
    let engine = Arc::clone(&orchestrator);
    let engine_task = tokio::spawn(async move { engine.run().await });

    let outcome = tokio::select! {
        result = engine_task => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("engine task panicked: {e}")),
            }
        }
        _ = shutdown_signal() => {
            info!(event = "SYSTEM_SHUTDOWN", "shutdown signal received");
            Ok(())
        }
    };

    // Graceful sequence: loop, candle store, then the auxiliary servers.
    let _ = stop_tx.send(true);
    candles.stop().await;
    match tools_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "tools server exited with error"),
        Err(e) => warn!(error = %e, "tools server join failed"),
    }
    match metrics_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "metrics server exited with error"),
        Err(e) => warn!(error = %e, "metrics server join failed"),
    }

    if let Err(e) = &outcome {
        error!(event = "SYSTEM_ENGINE_ERROR", error = %e, "engine exited with error");
    }
    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return tokio::signal::ctrl_c().await.unwrap_or_default(),
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(_) => return tokio::signal::ctrl_c().await.unwrap_or_default(),
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn analyze_once(settings: Settings) -> Result<()> {
    let venue = BybitClient::new(
        settings.bybit_api_key.clone(),
        settings.bybit_api_secret.clone(),
        settings.bybit_testnet,
    );
    let interval = settings.candle_interval().unwrap_or(Interval::M5);

    let candles = venue.candles(&settings.symbol, interval, 100).await?;
    let ticker = venue.market_data(&settings.symbol).await?;
    let indicators = TechnicalSnapshot::compute(&candles);
    let prediction = KalmanPredictor::new().predict(&candles, 5);

    println!("=== {} ===", settings.symbol);
    println!(
        "Price: {:.2} ({:+.2}% 24h)",
        ticker.price, ticker.change_24h_pct
    );
    println!("RSI(14): {:.1}", indicators.rsi);
    println!(
        "MACD: line {:.4} signal {:.4} histogram {:.4}",
        indicators.macd.line, indicators.macd.signal, indicators.macd.histogram
    );
    println!(
        "Bollinger: {:.2} / {:.2} / {:.2}",
        indicators.bollinger.upper, indicators.bollinger.middle, indicators.bollinger.lower
    );
    println!(
        "EMA: 9={:.2} 21={:.2} 50={:.2}",
        indicators.ema.e9, indicators.ema.e21, indicators.ema.e50
    );
    println!("Volume ratio: {:.2}x", indicators.volume.ratio);
    println!(
        "Annualised volatility: {:.1}%",
        indicators::annualised_volatility(&candles, 20) * 100.0
    );
    println!(
        "Kalman: {} towards {:.2} (confidence {:.2}, accuracy {:.2})",
        prediction.trend, prediction.predicted_price, prediction.confidence, prediction.accuracy
    );

    Ok(())
}

async fn show_balance(settings: Settings) -> Result<()> {
    let venue = BybitClient::new(
        settings.bybit_api_key.clone(),
        settings.bybit_api_secret.clone(),
        settings.bybit_testnet,
    );
    let balance = venue.balance().await?;
    println!(
        "Total: {:.2} | Available: {:.2} | Used margin: {:.2}",
        balance.total, balance.available, balance.used_margin
    );
    Ok(())
}
