use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use whalebot::alerts::{AlertSink, TracingAlerts};
use whalebot::api::{BybitClient, ExchangeGateway};
use whalebot::config::BotConfig;
use whalebot::error::BotError;
use whalebot::execution::PositionLifecycleManager;
use whalebot::marketdata::{BybitStream, MarketDataSynchronizer};
use whalebot::models::{Side, Trend, Verdict};
use whalebot::persistence::TradeLedger;
use whalebot::signal::{self, build_indicator_frame, trend_of, ScoringEngine, TrendIndicator};
use whalebot::Result;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "whalebot", about = "Bybit perpetuals monitoring and execution bot")]
struct Cli {
    /// Configuration file (TOML); env vars WHALEBOT__* override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging();

    let config = BotConfig::load(cli.config.as_deref())?;
    if cli.check {
        tracing::info!("Configuration OK: {} symbol(s)", config.symbols.len());
        return Ok(());
    }
    if config.exchange.api_key.is_empty() || config.exchange.api_secret.is_empty() {
        return Err(BotError::Auth(
            "exchange api_key/api_secret not configured".to_string(),
        ));
    }

    tracing::info!(
        symbols = ?config.symbols,
        interval = %config.primary_interval,
        "Whalebot starting"
    );

    let gateway: Arc<dyn ExchangeGateway> = Arc::new(BybitClient::with_base_url(
        config.exchange.api_key.clone(),
        config.exchange.api_secret.clone(),
        config.exchange.rest_url.clone(),
    )?);

    for symbol in &config.symbols {
        gateway.set_leverage(symbol, config.trade.leverage).await?;
    }

    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlerts);
    let ledger = TradeLedger::new(&config.ledger_path)?;
    let lifecycle = Arc::new(Mutex::new(PositionLifecycleManager::new(
        gateway.clone(),
        config.trade.clone(),
        ledger,
        alerts.clone(),
    )?));

    let synchronizer = Arc::new(MarketDataSynchronizer::new(
        config.synchronizer_settings(),
        gateway.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Stream task: feeds the synchronizer, reconnecting per policy
    let stream_task = {
        let synchronizer = synchronizer.clone();
        let policy = config.reconnect_policy();
        let ws_url = config.exchange.ws_url.clone();
        let topics = whalebot::marketdata::stream::topics_for(
            &config.symbols,
            &config.all_intervals(),
            config.stream.book_depth,
        );
        tokio::spawn(async move {
            let connect = || BybitStream::connect(&ws_url, &topics);
            synchronizer.run(connect, policy, shutdown_rx).await
        })
    };

    // Analysis task: one scoring pass per interval per symbol
    let analysis_task = {
        let synchronizer = synchronizer.clone();
        let lifecycle = lifecycle.clone();
        let config = config.clone();
        tokio::spawn(async move {
            analysis_loop(config, synchronizer, lifecycle).await
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, shutting down");
        }
        result = stream_task => {
            tracing::error!("Stream task exited: {result:?}");
            return Err(BotError::Stream("market stream terminated".to_string()));
        }
        result = analysis_task => {
            tracing::error!("Analysis task exited: {result:?}");
            return Err(BotError::Other(anyhow::anyhow!("analysis loop terminated")));
        }
    }

    // Bounded grace: let in-flight work settle, then abandon it
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _guard = lifecycle.lock().await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("Shutdown grace period expired, abandoning in-flight work");
    }
    tracing::info!("Whalebot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("whalebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn analysis_loop(
    config: BotConfig,
    synchronizer: Arc<MarketDataSynchronizer>,
    lifecycle: Arc<Mutex<PositionLifecycleManager>>,
) {
    let mut engine = ScoringEngine::new(config.signal.clone(), config.strategy.clone());
    let mut ticker = interval(Duration::from_secs(config.analysis_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Enough bars for the slowest indicator to produce a value
    let min_bars = config
        .signal
        .sma_long_period
        .max(config.signal.macd_slow + config.signal.macd_signal)
        + 2;

    loop {
        ticker.tick().await;
        for symbol in &config.symbols {
            if let Err(e) = analyze_symbol(
                symbol,
                &config,
                &synchronizer,
                &lifecycle,
                &mut engine,
                min_bars,
            )
            .await
            {
                match e {
                    BotError::StaleData(reason) => {
                        tracing::debug!(symbol, "Cycle skipped: {reason}");
                    }
                    BotError::Auth(reason) => {
                        tracing::error!(symbol, "Fatal auth failure: {reason}");
                        return;
                    }
                    other => tracing::warn!(symbol, "Cycle failed: {other}"),
                }
            }
        }
    }
}

async fn analyze_symbol(
    symbol: &str,
    config: &BotConfig,
    synchronizer: &MarketDataSynchronizer,
    lifecycle: &Mutex<PositionLifecycleManager>,
    engine: &mut ScoringEngine,
    min_bars: usize,
) -> Result<()> {
    let candles = synchronizer
        .get_candles(symbol, &config.primary_interval, min_bars)
        .await?;
    let frame = build_indicator_frame(&candles, &config.signal);
    let atr = frame
        .scalar(signal::ATR)
        .ok_or_else(|| BotError::StaleData(format!("no ATR for {symbol}")))?;

    // Book imbalance is optional input; an unsynced book scores neutral
    let imbalance = synchronizer.imbalance(symbol, config.stream.book_depth).ok();

    let mut mtf_votes: Vec<Trend> = Vec::with_capacity(config.mtf_intervals.len());
    for interval in &config.mtf_intervals {
        let series = synchronizer
            .get_candles(symbol, interval, config.signal.ema_long_period + 1)
            .await?;
        mtf_votes.push(trend_of(
            &series,
            TrendIndicator::EmaAlignment {
                short: config.signal.ema_short_period,
                long: config.signal.ema_long_period,
            },
        ));
    }

    let decision = engine.score(symbol, &frame, imbalance, &mtf_votes, chrono::Utc::now());
    tracing::info!(
        symbol,
        score = decision.score,
        verdict = ?decision.verdict,
        "Analysis cycle complete"
    );

    let mut manager = lifecycle.lock().await;
    manager.reconcile(symbol).await?;
    if decision.verdict != Verdict::Hold {
        manager.on_signal(symbol, decision.verdict, atr).await?;
    }
    for side in [Side::Buy, Side::Sell] {
        manager.monitor(symbol, side, atr).await?;
    }
    Ok(())
}
