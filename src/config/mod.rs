use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::types::Interval;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error("configuration: {0}")]
    Invalid(String),
}

/// Runtime settings sourced from the environment (a `.env` file is loaded
/// first when present). Missing required keys are fatal at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Venue
    pub bybit_api_key: String,
    pub bybit_api_secret: String,
    #[serde(default)]
    pub bybit_testnet: bool,

    // Reasoning engine
    #[serde(default = "default_llm_host")]
    pub llm_host: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    // History store
    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    // Instrument
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_interval")]
    pub interval: String,

    // Trading behaviour
    #[serde(default)]
    pub auto_trading: bool,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_risk_pct")]
    pub risk_pct: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub paper_trading: bool,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    // Servers
    #[serde(default = "default_tools_port")]
    pub tools_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_llm_host() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5:14b".to_string()
}
fn default_llm_timeout_ms() -> u64 {
    120_000
}
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_interval() -> String {
    "5".to_string()
}
fn default_max_leverage() -> u32 {
    20
}
fn default_max_position_size() -> f64 {
    100_000.0
}
fn default_risk_pct() -> f64 {
    10.0
}
fn default_stop_loss_pct() -> f64 {
    0.6
}
fn default_max_daily_trades() -> u32 {
    30
}
fn default_tools_port() -> u16 {
    8787
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        let settings: Settings = source.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("SYMBOL must not be empty".into()));
        }
        if self.candle_interval().is_none() {
            return Err(ConfigError::Invalid(format!(
                "INTERVAL '{}' is not a supported candle interval",
                self.interval
            )));
        }
        if self.max_leverage == 0 {
            return Err(ConfigError::Invalid("MAX_LEVERAGE must be >= 1".into()));
        }
        if !(0.0..=100.0).contains(&self.risk_pct) {
            return Err(ConfigError::Invalid(
                "RISK_PCT must be between 0 and 100".into(),
            ));
        }
        if self.stop_loss_pct <= 0.0 {
            return Err(ConfigError::Invalid("STOP_LOSS_PCT must be > 0".into()));
        }
        if !self.paper_trading
            && self.auto_trading
            && (self.bybit_api_key.is_empty() || self.bybit_api_secret.is_empty())
        {
            return Err(ConfigError::Invalid(
                "live trading requires BYBIT_API_KEY and BYBIT_API_SECRET".into(),
            ));
        }
        Ok(())
    }

    pub fn candle_interval(&self) -> Option<Interval> {
        Interval::from_str(&self.interval)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            bybit_api_key: "key".into(),
            bybit_api_secret: "secret".into(),
            bybit_testnet: true,
            llm_host: default_llm_host(),
            llm_model: default_llm_model(),
            llm_timeout_ms: default_llm_timeout_ms(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            symbol: "BTCUSDT".into(),
            interval: "5".into(),
            auto_trading: true,
            max_leverage: 20,
            max_position_size: 100_000.0,
            risk_pct: 10.0,
            stop_loss_pct: 0.6,
            paper_trading: false,
            max_daily_trades: 30,
            tools_port: 8787,
            metrics_port: 9090,
            log_level: "info".into(),
        }
    }

    #[test]
    fn test_valid_settings() {
        assert!(base().validate().is_ok());
        assert_eq!(base().candle_interval(), Some(Interval::M5));
        assert_eq!(base().redis_url(), "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_bad_interval_rejected() {
        let mut s = base();
        s.interval = "7m".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_live_trading_requires_credentials() {
        let mut s = base();
        s.bybit_api_key = String::new();
        assert!(s.validate().is_err());

        s.paper_trading = true;
        assert!(s.validate().is_ok());
    }
}
