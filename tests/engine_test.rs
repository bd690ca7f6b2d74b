use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use whalebot::alerts::TracingAlerts;
use whalebot::api::gateway::{
    ExchangeGateway, OrderRef, OrderRequest, PositionSnapshot,
};
use whalebot::execution::{PositionLifecycleManager, TradeSettings};
use whalebot::marketdata::stream::parse_message;
use whalebot::marketdata::{
    MarketDataSynchronizer, MarketStream, ReconnectPolicy, StreamEvent, SynchronizerSettings,
};
use whalebot::models::{Candle, ClosedBy, OrderBookLevels, Side, Verdict};
use whalebot::persistence::TradeLedger;
use whalebot::{BotError, Result};

// ---------------------------------------------------------------------------
// Shared test doubles
// ---------------------------------------------------------------------------

struct FakeExchange {
    price: StdMutex<f64>,
    balance: Decimal,
    positions: StdMutex<Vec<PositionSnapshot>>,
    orders: StdMutex<Vec<OrderRequest>>,
    kline_calls: AtomicUsize,
}

impl FakeExchange {
    fn new(balance: &str, price: f64) -> Self {
        Self {
            price: StdMutex::new(price),
            balance: balance.parse().unwrap(),
            positions: StdMutex::new(Vec::new()),
            orders: StdMutex::new(Vec::new()),
            kline_calls: AtomicUsize::new(0),
        }
    }

    fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = price;
    }
}

#[async_trait]
impl ExchangeGateway for FakeExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef> {
        self.orders.lock().unwrap().push(request.clone());
        Ok(OrderRef {
            order_id: format!("ord-{}", self.orders.lock().unwrap().len()),
            client_order_id: request.client_order_id.clone(),
        })
    }
    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<()> {
        Ok(())
    }
    async fn fetch_positions(&self, _symbol: &str) -> Result<Vec<PositionSnapshot>> {
        Ok(self.positions.lock().unwrap().clone())
    }
    async fn fetch_balance(&self, _asset: &str) -> Result<Decimal> {
        Ok(self.balance)
    }
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
        Ok(())
    }
    async fn set_trading_stop(&self, _symbol: &str, _side: Side, _stop: Decimal) -> Result<()> {
        Ok(())
    }
    async fn fetch_price(&self, _symbol: &str) -> Result<f64> {
        Ok(*self.price.lock().unwrap())
    }
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.kline_calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..limit)
            .map(|i| Candle {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                open_time: Utc::now() + chrono::Duration::minutes(i as i64),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0 + i as f64 * 0.1,
                volume: 10.0,
            })
            .collect())
    }
    async fn fetch_order_book(&self, symbol: &str, _limit: usize) -> Result<OrderBookLevels> {
        Ok(OrderBookLevels {
            symbol: symbol.to_string(),
            bids: vec![("100".parse().unwrap(), "2".parse().unwrap())],
            asks: vec![("101".parse().unwrap(), "3".parse().unwrap())],
            update_id: 1,
        })
    }
}

/// Plays back a fixed event script, then pends until shutdown
struct ScriptedStream {
    events: VecDeque<StreamEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl MarketStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<StreamEvent> {
        match self.events.pop_front() {
            Some(event) => Ok(event),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn settings() -> SynchronizerSettings {
    SynchronizerSettings {
        symbols: vec!["BTCUSDT".to_string()],
        intervals: vec!["5".to_string()],
        ..SynchronizerSettings::default()
    }
}

// ---------------------------------------------------------------------------
// Wire payloads through the book engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_raw_payload_replay_builds_consistent_book() {
    let gateway = Arc::new(FakeExchange::new("10000", 20000.0));
    let sync = MarketDataSynchronizer::new(settings(), gateway);

    let frames = [
        // snapshot seeds both sides
        r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","ts":1,
            "data":{"s":"BTCUSDT","b":[["100","2"],["99","5"]],"a":[["101","3"],["102","4"]],"u":10}}"#,
        // delete best bid, add a deeper ask
        r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":2,
            "data":{"s":"BTCUSDT","b":[["100","0"]],"a":[["103","1"]],"u":11}}"#,
        // stale delta must be a no-op
        r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":3,
            "data":{"s":"BTCUSDT","b":[["98","9"]],"a":[],"u":11}}"#,
        // re-add the removed level at a new quantity
        r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":4,
            "data":{"s":"BTCUSDT","b":[["100","7"]],"a":[],"u":12}}"#,
    ];
    for raw in frames {
        let event = parse_message(raw).unwrap().unwrap();
        sync.apply_event(event).unwrap();
    }

    let book = sync.get_order_book("BTCUSDT").unwrap();
    let (bid, ask) = book.best_bid_ask();
    assert_eq!(bid, Some("100".parse().unwrap()));
    assert_eq!(ask, Some("101".parse().unwrap()));
    // exactly one entry at the re-added price
    assert_eq!(
        book.bids
            .iter()
            .filter(|l| l.price == "100".parse::<Decimal>().unwrap())
            .count(),
        1
    );
    assert_eq!(
        book.bids
            .iter()
            .find(|l| l.price == "100".parse::<Decimal>().unwrap())
            .unwrap()
            .qty,
        "7".parse().unwrap()
    );
    // the stale delta's phantom bid never landed
    assert!(!book
        .bids
        .iter()
        .any(|l| l.price == "98".parse::<Decimal>().unwrap()));
}

// ---------------------------------------------------------------------------
// Synchronizer run loop with a scripted stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_loop_applies_events_and_closes_on_shutdown() {
    let gateway = Arc::new(FakeExchange::new("10000", 20000.0));
    let sync = Arc::new(MarketDataSynchronizer::new(settings(), gateway));
    let closed = Arc::new(AtomicBool::new(false));

    let events = VecDeque::from(vec![
        StreamEvent::BookSnapshot(OrderBookLevels {
            symbol: "BTCUSDT".to_string(),
            bids: vec![("99".parse().unwrap(), "1".parse().unwrap())],
            asks: vec![("101".parse().unwrap(), "1".parse().unwrap())],
            update_id: 20,
        }),
        StreamEvent::Ticker(whalebot::models::TickerSnapshot {
            symbol: "BTCUSDT".to_string(),
            price: 20100.0,
            received_at: Utc::now(),
        }),
    ]);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_task = {
        let sync = sync.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            let mut script = Some(ScriptedStream {
                events,
                closed: closed.clone(),
            });
            let connect = move || {
                let stream = script.take();
                async move {
                    stream.ok_or_else(|| BotError::Stream("script exhausted".to_string()))
                }
            };
            sync.run(connect, ReconnectPolicy::default(), shutdown_rx)
                .await
        })
    };

    // Events apply in script order, so seeing the ticker price means the
    // snapshot landed first
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            if sync.get_price("BTCUSDT").await.unwrap() == 20100.0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scripted events never applied");

    let book = sync.get_order_book("BTCUSDT").unwrap();
    assert_eq!(book.last_update_id, 20);

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(2), run_task)
        .await
        .expect("run loop did not stop")
        .unwrap();
    assert!(result.is_ok());
    // the subscription was closed explicitly, not just dropped
    assert!(closed.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Lifecycle end to end against the fake exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_signal_to_ledger_round_trip() {
    let gateway = Arc::new(FakeExchange::new("1000000", 20000.0));
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("trades.jsonl");
    let mut manager = PositionLifecycleManager::new(
        gateway.clone(),
        TradeSettings::default(),
        TradeLedger::new(&ledger_path).unwrap(),
        Arc::new(TracingAlerts),
    )
    .unwrap();

    // Buy verdict opens a position sized off ATR
    manager.on_signal("BTCUSDT", Verdict::Buy, 50.0).await.unwrap();
    let position = manager.get_position("BTCUSDT", Side::Buy).unwrap();
    assert_eq!(position.stop_loss, "19925".parse().unwrap());

    // Exchange mirrors the position; reconciliation is a no-op
    gateway.positions.lock().unwrap().push(PositionSnapshot {
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        qty: position.qty,
        entry_price: position.entry_price,
        stop_loss: Some(position.stop_loss),
        take_profit: Some(position.take_profit),
    });
    manager.reconcile("BTCUSDT").await.unwrap();
    assert!(manager.get_position("BTCUSDT", Side::Buy).is_some());

    // Price collapses through the stop
    gateway.set_price(19900.0);
    manager.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();
    assert!(manager.get_position("BTCUSDT", Side::Buy).is_none());

    // Close is durable and reload restores the accounting
    let records = TradeLedger::new(&ledger_path).unwrap().load().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].closed_by, ClosedBy::StopLoss);
    assert!(records[0].pnl < Decimal::ZERO);

    let reloaded = PositionLifecycleManager::new(
        gateway.clone(),
        TradeSettings::default(),
        TradeLedger::new(&ledger_path).unwrap(),
        Arc::new(TracingAlerts),
    )
    .unwrap();
    assert_eq!(reloaded.performance().summary().total_trades, 1);

    // Entry + reduce-only exit hit the exchange
    let orders = gateway.orders.lock().unwrap();
    assert_eq!(orders.len(), 2);
    assert!(orders[1].reduce_only);
}

#[tokio::test]
async fn test_candle_backfill_feeds_scoring_inputs() {
    let gateway = Arc::new(FakeExchange::new("10000", 20000.0));
    let sync = MarketDataSynchronizer::new(settings(), gateway.clone());

    let candles = sync.get_candles("BTCUSDT", "5", 60).await.unwrap();
    assert!(candles.len() >= 60);
    assert_eq!(gateway.kline_calls.load(Ordering::SeqCst), 1);

    let frame = whalebot::signal::build_indicator_frame(
        &candles,
        &whalebot::signal::SignalSettings::default(),
    );
    assert!(frame.scalar(whalebot::signal::ATR).is_some());
    assert!(frame.scalar(whalebot::signal::RSI).is_some());
}
