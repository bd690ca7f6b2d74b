pub mod candle_buffer;
pub mod stream;

pub use candle_buffer::CandleBuffer;
pub use stream::{BybitStream, MarketStream, ReconnectPolicy, StreamEvent};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::api::ExchangeGateway;
use crate::error::BotError;
use crate::models::{Candle, TickerSnapshot};
use crate::orderbook::{BookState, OrderBook, OrderBookEngine};
use crate::Result;

#[derive(Debug, Clone)]
pub struct SynchronizerSettings {
    pub symbols: Vec<String>,
    /// Bybit interval codes, e.g. ["5", "60", "240"]
    pub intervals: Vec<String>,
    pub book_depth: usize,
    pub candle_capacity: usize,
    /// Streamed ticker older than this falls back to REST
    pub ticker_staleness_secs: i64,
    pub backfill_limit: usize,
}

impl Default for SynchronizerSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            intervals: vec!["5".to_string(), "60".to_string()],
            book_depth: 50,
            candle_capacity: 500,
            ticker_staleness_secs: 10,
            backfill_limit: 200,
        }
    }
}

/// Owns all live market state: one book engine per symbol, a rolling
/// candle buffer per (symbol, interval), and the latest ticker prices.
///
/// Stream events are applied by a single writer (the `run` loop); readers
/// take short lock-guarded copies. Every getter degrades explicitly: a
/// stale ticker falls back to REST, an unsynced book is an error rather
/// than a silently old snapshot.
pub struct MarketDataSynchronizer {
    settings: SynchronizerSettings,
    gateway: Arc<dyn ExchangeGateway>,
    books: RwLock<HashMap<String, OrderBookEngine>>,
    tickers: RwLock<HashMap<String, TickerSnapshot>>,
    candles: CandleBuffer,
}

impl MarketDataSynchronizer {
    pub fn new(settings: SynchronizerSettings, gateway: Arc<dyn ExchangeGateway>) -> Self {
        let books = settings
            .symbols
            .iter()
            .map(|s| (s.clone(), OrderBookEngine::new(s.clone())))
            .collect();
        let candles = CandleBuffer::new(settings.candle_capacity);
        Self {
            settings,
            gateway,
            books: RwLock::new(books),
            tickers: RwLock::new(HashMap::new()),
            candles,
        }
    }

    pub fn settings(&self) -> &SynchronizerSettings {
        &self.settings
    }

    /// Apply one stream event to local state
    pub fn apply_event(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::BookSnapshot(levels) => {
                let mut books = self.lock_books_mut()?;
                if let Some(engine) = books.get_mut(&levels.symbol) {
                    engine.apply_snapshot(&levels.bids, &levels.asks, levels.update_id);
                } else {
                    tracing::warn!(symbol = %levels.symbol, "Snapshot for unsubscribed symbol");
                }
            }
            StreamEvent::BookDelta(levels) => {
                let mut books = self.lock_books_mut()?;
                if let Some(engine) = books.get_mut(&levels.symbol) {
                    engine.apply_delta(&levels.bids, &levels.asks, levels.update_id);
                }
            }
            StreamEvent::Kline { candle, .. } => {
                // Unconfirmed bars are upserted too; the buffer replaces
                // them in place as the bar develops
                self.candles.upsert(candle)?;
            }
            StreamEvent::Ticker(snap) => {
                let mut tickers = self
                    .tickers
                    .write()
                    .map_err(|_| BotError::Other(anyhow::anyhow!("ticker lock poisoned")))?;
                tickers.insert(snap.symbol.clone(), snap);
            }
            StreamEvent::Closed => {}
        }
        Ok(())
    }

    /// Latest price: streamed ticker when fresh, REST otherwise
    pub async fn get_price(&self, symbol: &str) -> Result<f64> {
        let cached = {
            let tickers = self
                .tickers
                .read()
                .map_err(|_| BotError::Other(anyhow::anyhow!("ticker lock poisoned")))?;
            tickers.get(symbol).cloned()
        };
        if let Some(snap) = cached {
            if snap.age(Utc::now()).num_seconds() <= self.settings.ticker_staleness_secs {
                return Ok(snap.price);
            }
            tracing::debug!(symbol, "Ticker stale, falling back to REST");
        }

        let price = self.gateway.fetch_price(symbol).await?;
        let mut tickers = self
            .tickers
            .write()
            .map_err(|_| BotError::Other(anyhow::anyhow!("ticker lock poisoned")))?;
        tickers.insert(
            symbol.to_string(),
            TickerSnapshot {
                symbol: symbol.to_string(),
                price,
                received_at: Utc::now(),
            },
        );
        Ok(price)
    }

    /// At least `min_len` candles oldest-first, backfilling over REST when
    /// the buffer is short
    pub async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        min_len: usize,
    ) -> Result<Vec<Candle>> {
        if self.candles.len(symbol, interval)? >= min_len {
            return self.candles.get(symbol, interval);
        }

        let limit = self.settings.backfill_limit.max(min_len);
        tracing::info!(symbol, interval, limit, "Backfilling candles over REST");
        let fetched = self.gateway.fetch_klines(symbol, interval, limit).await?;
        if fetched.len() < min_len {
            return Err(BotError::StaleData(format!(
                "only {} candles available for {symbol}/{interval}, need {min_len}",
                fetched.len()
            )));
        }
        self.candles.replace(symbol, interval, fetched)?;
        self.candles.get(symbol, interval)
    }

    /// Consistent point-in-time copy of the book; error while unsynced
    pub fn get_order_book(&self, symbol: &str) -> Result<OrderBook> {
        let books = self.lock_books()?;
        let engine = books
            .get(symbol)
            .ok_or_else(|| BotError::Validation(format!("no book for {symbol}")))?;
        if engine.state() != BookState::Synced {
            return Err(BotError::StaleData(format!("book for {symbol} not synced")));
        }
        Ok(engine.snapshot())
    }

    /// Depth-limited bid/ask volume imbalance in [-1, 1]
    pub fn imbalance(&self, symbol: &str, depth: usize) -> Result<f64> {
        let books = self.lock_books()?;
        let engine = books
            .get(symbol)
            .ok_or_else(|| BotError::Validation(format!("no book for {symbol}")))?;
        if engine.state() != BookState::Synced {
            return Err(BotError::StaleData(format!("book for {symbol} not synced")));
        }
        Ok(engine.imbalance(depth))
    }

    /// Drop book sync state; deltas are ignored until the next snapshot
    pub fn mark_all_unsynced(&self) -> Result<()> {
        let mut books = self.lock_books_mut()?;
        for engine in books.values_mut() {
            engine.mark_unsynced();
        }
        Ok(())
    }

    /// Re-seed every book from REST snapshots, e.g. right after reconnect
    pub async fn resync_books(&self) -> Result<()> {
        for symbol in &self.settings.symbols {
            let levels = self
                .gateway
                .fetch_order_book(symbol, self.settings.book_depth)
                .await?;
            let mut books = self.lock_books_mut()?;
            if let Some(engine) = books.get_mut(symbol) {
                engine.apply_snapshot(&levels.bids, &levels.asks, levels.update_id);
            }
        }
        Ok(())
    }

    /// Consume the stream until shutdown, reconnecting per `policy`.
    /// Returns an error once the reconnect budget is exhausted. On
    /// shutdown the subscription is closed explicitly before returning.
    pub async fn run<S, F, Fut>(
        &self,
        mut connect: F,
        mut policy: ReconnectPolicy,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: MarketStream,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        loop {
            let mut stream = tokio::select! {
                connected = connect() => match connected {
                    Ok(s) => s,
                    Err(e) => {
                        let delay = policy.next_delay()?;
                        tracing::warn!("Stream connect failed ({e}), retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => return Ok(()),
            };

            if let Err(e) = self.resync_books().await {
                tracing::warn!("Book resync after connect failed: {e}");
            }

            loop {
                tokio::select! {
                    event = stream.next_event() => match event {
                        Ok(StreamEvent::Closed) => {
                            tracing::info!("Market stream closed by server");
                            break;
                        }
                        Ok(event) => {
                            policy.reset();
                            if let Err(e) = self.apply_event(event) {
                                tracing::error!("Failed to apply stream event: {e}");
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Market stream error: {e}");
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        if let Err(e) = stream.close().await {
                            tracing::debug!("Stream close on shutdown: {e}");
                        }
                        tracing::info!("Market stream closed for shutdown");
                        return Ok(());
                    }
                }
            }

            // Connection lost: everything book-shaped is now suspect
            self.mark_all_unsynced()?;
            let delay = policy.next_delay()?;
            tracing::info!("Reconnecting market stream in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    fn lock_books(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, OrderBookEngine>>> {
        self.books
            .read()
            .map_err(|_| BotError::Other(anyhow::anyhow!("book lock poisoned")))
    }

    fn lock_books_mut(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, OrderBookEngine>>> {
        self.books
            .write()
            .map_err(|_| BotError::Other(anyhow::anyhow!("book lock poisoned")))
    }
}
