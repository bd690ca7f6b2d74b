use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::execution::TradeSettings;
use crate::marketdata::{ReconnectPolicy, SynchronizerSettings};
use crate::signal::{SignalSettings, StrategyProfile};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_key: String,
    pub api_secret: String,
    pub rest_url: String,
    pub ws_url: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            rest_url: "https://api.bybit.com".to_string(),
            ws_url: crate::marketdata::stream::DEFAULT_WS_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub book_depth: usize,
    pub candle_capacity: usize,
    pub ticker_staleness_secs: i64,
    pub backfill_limit: usize,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    pub reconnect_max_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            book_depth: 50,
            candle_capacity: 500,
            ticker_staleness_secs: 10,
            backfill_limit: 200,
            reconnect_base_secs: 1,
            reconnect_max_secs: 60,
            reconnect_max_attempts: 10,
        }
    }
}

/// Full bot configuration: file layered under `WHALEBOT__*` environment
/// overrides (e.g. `WHALEBOT__EXCHANGE__API_KEY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub symbols: Vec<String>,
    /// Interval driving the analysis loop
    pub primary_interval: String,
    /// Higher timeframes feeding the confluence vote
    pub mtf_intervals: Vec<String>,
    pub analysis_interval_secs: u64,
    pub ledger_path: String,
    pub exchange: ExchangeConfig,
    pub stream: StreamConfig,
    pub signal: SignalSettings,
    pub strategy: StrategyProfile,
    pub trade: TradeSettings,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            primary_interval: "5".to_string(),
            mtf_intervals: vec!["60".to_string(), "240".to_string()],
            analysis_interval_secs: 60,
            ledger_path: "data/trades.jsonl".to_string(),
            exchange: ExchangeConfig::default(),
            stream: StreamConfig::default(),
            signal: SignalSettings::default(),
            strategy: StrategyProfile::default(),
            trade: TradeSettings::default(),
        }
    }
}

impl BotConfig {
    /// Load from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        match path {
            Some(p) => {
                builder = builder.add_source(config::File::from(p.to_path_buf()));
            }
            None => {
                builder = builder.add_source(config::File::with_name("whalebot").required(false));
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix("WHALEBOT")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BotError::Validation(format!("bad configuration: {e}")))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(BotError::Validation("no symbols configured".into()));
        }
        if self.trade.risk_percent <= Decimal::ZERO || self.trade.risk_percent > Decimal::ONE {
            return Err(BotError::Validation(format!(
                "risk_percent {} outside (0, 1]",
                self.trade.risk_percent
            )));
        }
        if self.trade.qty_step <= Decimal::ZERO {
            return Err(BotError::Validation("qty_step must be positive".into()));
        }
        if self.signal.score_threshold <= 0.0 {
            return Err(BotError::Validation(
                "score_threshold must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.signal.hysteresis_ratio) {
            return Err(BotError::Validation(format!(
                "hysteresis_ratio {} outside [0, 1]",
                self.signal.hysteresis_ratio
            )));
        }
        if self.mtf_intervals.contains(&self.primary_interval) {
            return Err(BotError::Validation(
                "primary interval must not appear in mtf_intervals".into(),
            ));
        }
        Ok(())
    }

    /// All intervals the stream subscribes to
    pub fn all_intervals(&self) -> Vec<String> {
        let mut intervals = vec![self.primary_interval.clone()];
        intervals.extend(self.mtf_intervals.iter().cloned());
        intervals
    }

    pub fn synchronizer_settings(&self) -> SynchronizerSettings {
        SynchronizerSettings {
            symbols: self.symbols.clone(),
            intervals: self.all_intervals(),
            book_depth: self.stream.book_depth,
            candle_capacity: self.stream.candle_capacity,
            ticker_staleness_secs: self.stream.ticker_staleness_secs,
            backfill_limit: self.stream.backfill_limit,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_secs(self.stream.reconnect_base_secs),
            Duration::from_secs(self.stream.reconnect_max_secs),
            self.stream.reconnect_max_attempts,
        )
    }
}
