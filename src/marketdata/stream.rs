use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::BotError;
use crate::models::{Candle, OrderBookLevels, TickerSnapshot};
use crate::Result;

pub const DEFAULT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// One parsed message from the market stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Full book image; replaces all prior state for the symbol
    BookSnapshot(OrderBookLevels),
    /// Incremental book update keyed on update_id
    BookDelta(OrderBookLevels),
    /// Kline update; `confirmed` is false while the bar is still forming
    Kline { candle: Candle, confirmed: bool },
    Ticker(TickerSnapshot),
    /// Server closed the connection cleanly
    Closed,
}

/// Source of market events. The live implementation wraps a WebSocket;
/// tests drive the synchronizer with a scripted implementation.
#[async_trait]
pub trait MarketStream: Send {
    /// Next event, blocking until one arrives. Errors are fatal for this
    /// connection; the caller reconnects per its policy.
    async fn next_event(&mut self) -> Result<StreamEvent>;

    async fn close(&mut self) -> Result<()>;
}

/// Capped exponential backoff with jitter for stream reconnects
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or an error once the budget is spent
    pub fn next_delay(&mut self) -> Result<Duration> {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            return Err(BotError::Stream(format!(
                "stream failed {} consecutive reconnect attempts",
                self.max_attempts
            )));
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(self.attempts - 1))
            .min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 4);
        Ok(exp + Duration::from_millis(jitter_ms))
    }

    /// Call after a healthy connection is re-established
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Subscription topics for one symbol set
pub fn topics_for(symbols: &[String], intervals: &[String], book_depth: usize) -> Vec<String> {
    let mut topics = Vec::new();
    for symbol in symbols {
        topics.push(format!("orderbook.{book_depth}.{symbol}"));
        topics.push(format!("tickers.{symbol}"));
        for interval in intervals {
            topics.push(format!("kline.{interval}.{symbol}"));
        }
    }
    topics
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    #[serde(default)]
    topic: Option<String>,
    #[serde(rename = "type", default)]
    msg_type: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(rename = "ret_msg", default)]
    ret_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsBookData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
    #[serde(rename = "u")]
    update_id: u64,
}

#[derive(Debug, Deserialize)]
struct WsKlineData {
    start: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct WsTickerData {
    symbol: String,
    #[serde(rename = "lastPrice", default)]
    last_price: Option<String>,
}

fn parse_levels(rows: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>> {
    rows.iter()
        .map(|[p, q]| {
            let price = p
                .parse()
                .map_err(|_| BotError::Validation(format!("bad level price {p:?}")))?;
            let qty = q
                .parse()
                .map_err(|_| BotError::Validation(format!("bad level qty {q:?}")))?;
            Ok((price, qty))
        })
        .collect()
}

/// Parse one raw stream payload. `None` for control frames (subscription
/// acks, pongs) and ticker deltas without a price change.
pub fn parse_message(raw: &str) -> Result<Option<StreamEvent>> {
    let msg: WsMessage = serde_json::from_str(raw)?;

    if let Some(op) = &msg.op {
        match (op.as_str(), msg.success) {
            ("subscribe", Some(false)) => {
                return Err(BotError::Stream(format!(
                    "subscription rejected: {}",
                    msg.ret_msg.unwrap_or_default()
                )))
            }
            _ => return Ok(None), // ack / pong
        }
    }

    let topic = match &msg.topic {
        Some(t) => t.as_str(),
        None => return Ok(None),
    };

    if topic.starts_with("orderbook.") {
        let data: WsBookData = serde_json::from_value(msg.data)?;
        let levels = OrderBookLevels {
            symbol: data.symbol,
            bids: parse_levels(&data.bids)?,
            asks: parse_levels(&data.asks)?,
            update_id: data.update_id,
        };
        return Ok(Some(match msg.msg_type.as_deref() {
            Some("snapshot") => StreamEvent::BookSnapshot(levels),
            _ => StreamEvent::BookDelta(levels),
        }));
    }

    if let Some(rest) = topic.strip_prefix("kline.") {
        let (interval, symbol) = rest
            .split_once('.')
            .ok_or_else(|| BotError::Stream(format!("malformed kline topic {topic:?}")))?;
        let rows: Vec<WsKlineData> = serde_json::from_value(msg.data)?;
        // Bybit batches at most a couple of rows; the last one is current
        let row = match rows.into_iter().last() {
            Some(r) => r,
            None => return Ok(None),
        };
        let open_time = chrono::DateTime::from_timestamp_millis(row.start)
            .ok_or_else(|| BotError::Validation(format!("bad kline start {}", row.start)))?;
        let parse = |raw: &str| -> Result<f64> {
            raw.parse()
                .map_err(|_| BotError::Validation(format!("bad kline field {raw:?}")))
        };
        return Ok(Some(StreamEvent::Kline {
            candle: Candle {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                open_time,
                open: parse(&row.open)?,
                high: parse(&row.high)?,
                low: parse(&row.low)?,
                close: parse(&row.close)?,
                volume: parse(&row.volume)?,
            },
            confirmed: row.confirm,
        }));
    }

    if topic.starts_with("tickers.") {
        let data: WsTickerData = serde_json::from_value(msg.data)?;
        let price = match data.last_price.as_deref() {
            Some(p) if !p.is_empty() => p
                .parse()
                .map_err(|_| BotError::Validation(format!("bad ticker price {p:?}")))?,
            _ => return Ok(None), // delta without a trade
        };
        return Ok(Some(StreamEvent::Ticker(TickerSnapshot {
            symbol: data.symbol,
            price,
            received_at: chrono::Utc::now(),
        })));
    }

    tracing::debug!(topic, "Ignoring unhandled stream topic");
    Ok(None)
}

/// Live Bybit public WebSocket stream
pub struct BybitStream {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    ping_timer: tokio::time::Interval,
}

impl BybitStream {
    /// Connect and subscribe; returns once the socket is up (acks are
    /// consumed lazily inside `next_event`).
    pub async fn connect(url: &str, topics: &[String]) -> Result<Self> {
        let (mut ws, _) = connect_async(url)
            .await
            .map_err(|e| BotError::Stream(format!("connect {url}: {e}")))?;

        let subscribe = serde_json::json!({ "op": "subscribe", "args": topics });
        ws.send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| BotError::Stream(format!("subscribe: {e}")))?;
        tracing::info!(url, topics = topics.len(), "Market stream connected");

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Ok(Self { ws, ping_timer })
    }
}

#[async_trait]
impl MarketStream for BybitStream {
    async fn next_event(&mut self) -> Result<StreamEvent> {
        loop {
            tokio::select! {
                _ = self.ping_timer.tick() => {
                    self.ws
                        .send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                        .await
                        .map_err(|e| BotError::Stream(format!("ping: {e}")))?;
                }
                frame = self.ws.next() => {
                    let frame = frame
                        .ok_or_else(|| BotError::Stream("stream ended".to_string()))?
                        .map_err(|e| BotError::Stream(format!("read: {e}")))?;
                    match frame {
                        Message::Text(text) => {
                            if let Some(event) = parse_message(&text)? {
                                return Ok(event);
                            }
                        }
                        Message::Ping(payload) => {
                            self.ws
                                .send(Message::Pong(payload))
                                .await
                                .map_err(|e| BotError::Stream(format!("pong: {e}")))?;
                        }
                        Message::Close(_) => return Ok(StreamEvent::Closed),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| BotError::Stream(format!("close: {e}")))?;
        Ok(())
    }
}
