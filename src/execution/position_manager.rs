use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::alerts::{AlertLevel, AlertSink};
use crate::api::gateway::{ExchangeGateway, OrderRequest, OrderType, PositionSnapshot};
use crate::error::BotError;
use crate::models::{ClosedBy, Side, TradeRecord, Verdict};
use crate::perf::PerformanceTracker;
use crate::persistence::TradeLedger;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Ratcheting stop state. Once armed, `current_stop` only moves toward
/// locking more profit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingState {
    pub armed: bool,
    pub current_stop: Decimal,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    /// Zero means "no stop attached yet" (adopted positions); the next
    /// monitor cycle derives and pushes one
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing: TrailingState,
    pub status: PositionStatus,
    pub exchange_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// The stop currently protecting the position
    fn active_stop(&self) -> Decimal {
        if self.trailing.armed {
            self.trailing.current_stop
        } else {
            self.stop_loss
        }
    }

    fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        match self.side {
            Side::Buy => (exit_price - self.entry_price) * self.qty,
            Side::Sell => (self.entry_price - exit_price) * self.qty,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TradeSettings {
    /// Fraction of balance risked per trade, e.g. 0.01
    pub risk_percent: Decimal,
    pub stop_multiple: Decimal,
    pub take_profit_multiple: Decimal,
    /// Favorable move (in ATRs) before the trailing stop arms
    pub trailing_arm_multiple: Decimal,
    /// Distance (in ATRs) the armed stop trails behind price
    pub trailing_offset_multiple: Decimal,
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub leverage: u32,
    pub max_open_positions: usize,
    pub settlement_asset: String,
}

impl Default for TradeSettings {
    fn default() -> Self {
        Self {
            risk_percent: Decimal::new(1, 2),           // 1%
            stop_multiple: Decimal::new(15, 1),         // 1.5 ATR
            take_profit_multiple: Decimal::new(30, 1),  // 3.0 ATR
            trailing_arm_multiple: Decimal::new(10, 1), // 1.0 ATR
            trailing_offset_multiple: Decimal::new(15, 1),
            qty_step: Decimal::new(1, 3), // 0.001
            min_qty: Decimal::new(1, 3),
            min_notional: Decimal::from(5),
            leverage: 1,
            max_open_positions: 3,
            settlement_asset: "USDT".to_string(),
        }
    }
}

/// Risk-based order size, floored to the exchange quantity step.
///
/// qty = balance * risk% / (atr * stop_multiple) / price. Returns zero
/// when the stop distance is degenerate.
pub fn size_qty(
    balance: Decimal,
    risk_percent: Decimal,
    atr: Decimal,
    stop_multiple: Decimal,
    price: Decimal,
    qty_step: Decimal,
) -> Decimal {
    let stop_distance = atr * stop_multiple;
    if stop_distance <= Decimal::ZERO || price <= Decimal::ZERO || qty_step <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let qty = balance * risk_percent / stop_distance / price;
    (qty / qty_step).floor() * qty_step
}

/// Sizes, opens, monitors and closes positions against the exchange.
///
/// Exactly one instance exists per bot, behind an async Mutex, so at most
/// one open/close per (symbol, side) is ever in flight. The exchange is
/// the source of truth: `reconcile` adopts unknown remote positions and
/// retires local ones the exchange no longer reports.
pub struct PositionLifecycleManager {
    gateway: Arc<dyn ExchangeGateway>,
    settings: TradeSettings,
    ledger: TradeLedger,
    perf: PerformanceTracker,
    alerts: Arc<dyn AlertSink>,
    positions: HashMap<(String, Side), Position>,
}

impl PositionLifecycleManager {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        settings: TradeSettings,
        ledger: TradeLedger,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let perf = PerformanceTracker::from_records(ledger.load()?);
        Ok(Self {
            gateway,
            settings,
            ledger,
            perf,
            alerts,
            positions: HashMap::new(),
        })
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.perf
    }

    pub fn settings(&self) -> &TradeSettings {
        &self.settings
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions
            .values()
            .filter(|p| p.status == PositionStatus::Open || p.status == PositionStatus::Opening)
            .collect()
    }

    pub fn get_position(&self, symbol: &str, side: Side) -> Option<&Position> {
        self.positions.get(&(symbol.to_string(), side))
    }

    fn atr_decimal(atr: f64) -> Result<Decimal> {
        if !atr.is_finite() || atr <= 0.0 {
            return Err(BotError::StaleData(format!("unusable ATR {atr}")));
        }
        Decimal::from_f64(atr).ok_or_else(|| BotError::StaleData(format!("unusable ATR {atr}")))
    }

    fn stops_for(&self, side: Side, entry: Decimal, atr: Decimal) -> (Decimal, Decimal) {
        let stop_distance = atr * self.settings.stop_multiple;
        let target_distance = atr * self.settings.take_profit_multiple;
        match side {
            Side::Buy => (entry - stop_distance, entry + target_distance),
            Side::Sell => (entry + stop_distance, entry - target_distance),
        }
    }

    /// Act on a scored verdict: close any opposite-side position, then
    /// open in the verdict's direction.
    pub async fn on_signal(&mut self, symbol: &str, verdict: Verdict, atr: f64) -> Result<()> {
        let side = match verdict {
            Verdict::Buy => Side::Buy,
            Verdict::Sell => Side::Sell,
            Verdict::Hold => return Ok(()),
        };

        if self
            .positions
            .contains_key(&(symbol.to_string(), side.opposite()))
        {
            let price = self.fetch_price_decimal(symbol).await?;
            self.close(symbol, side.opposite(), price, ClosedBy::Signal)
                .await?;
        }
        self.open(symbol, side, atr).await?;
        Ok(())
    }

    /// Size and submit an entry with attached SL/TP. `Ok(None)` when
    /// nothing was opened (already positioned, at capacity, or the sized
    /// qty fell below exchange minimums).
    pub async fn open(&mut self, symbol: &str, side: Side, atr: f64) -> Result<Option<String>> {
        let key = (symbol.to_string(), side);
        if self.positions.contains_key(&key) {
            tracing::debug!(symbol, side = side.as_str(), "Already positioned, skipping open");
            return Ok(None);
        }
        if self.open_positions().len() >= self.settings.max_open_positions {
            tracing::info!(symbol, "Max open positions reached, skipping open");
            return Ok(None);
        }

        let atr = Self::atr_decimal(atr)?;
        let balance = self
            .gateway
            .fetch_balance(&self.settings.settlement_asset)
            .await?;
        let entry = self.fetch_price_decimal(symbol).await?;

        let qty = size_qty(
            balance,
            self.settings.risk_percent,
            atr,
            self.settings.stop_multiple,
            entry,
            self.settings.qty_step,
        );
        if qty < self.settings.min_qty || qty * entry < self.settings.min_notional {
            tracing::warn!(
                symbol,
                %qty,
                %balance,
                "Sized qty below exchange minimums, no order placed"
            );
            return Ok(None);
        }

        let (stop_loss, take_profit) = self.stops_for(side, entry, atr);
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            reduce_only: false,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            client_order_id: Uuid::new_v4().to_string(),
        };

        let order_ref = match self.gateway.place_order(&request).await {
            Ok(r) => r,
            Err(e) => {
                self.alerts.notify(
                    AlertLevel::Warning,
                    &format!("entry order for {symbol} {} failed: {e}", side.as_str()),
                );
                return Err(e);
            }
        };

        self.positions.insert(
            key,
            Position {
                symbol: symbol.to_string(),
                side,
                qty,
                entry_price: entry,
                stop_loss,
                take_profit,
                trailing: TrailingState {
                    armed: false,
                    current_stop: stop_loss,
                },
                status: PositionStatus::Open,
                exchange_order_id: Some(order_ref.order_id.clone()),
                opened_at: Utc::now(),
            },
        );
        tracing::info!(
            symbol,
            side = side.as_str(),
            %qty,
            %entry,
            %stop_loss,
            %take_profit,
            "Position opened"
        );
        Ok(Some(order_ref.order_id))
    }

    /// One management pass over the position at (symbol, side): exit
    /// checks first, then trailing-stop arming and ratcheting.
    pub async fn monitor(&mut self, symbol: &str, side: Side, atr: f64) -> Result<()> {
        let key = (symbol.to_string(), side);
        let Some(position) = self.positions.get(&key) else {
            return Ok(());
        };
        // A close that failed mid-flight is retried before anything else
        if position.status == PositionStatus::Closing {
            let price = self.fetch_price_decimal(symbol).await?;
            return self.close(symbol, side, price, ClosedBy::StopLoss).await;
        }
        if position.status != PositionStatus::Open {
            return Ok(());
        }

        let atr = Self::atr_decimal(atr)?;
        let price = self.fetch_price_decimal(symbol).await?;

        // Adopted positions arrive without a stop; derive one now
        if self
            .positions
            .get(&key)
            .is_some_and(|p| p.stop_loss.is_zero())
        {
            let entry = self.positions[&key].entry_price;
            let (stop_loss, take_profit) = self.stops_for(side, entry, atr);
            self.gateway.set_trading_stop(symbol, side, stop_loss).await?;
            if let Some(position) = self.positions.get_mut(&key) {
                position.stop_loss = stop_loss;
                position.take_profit = take_profit;
                position.trailing.current_stop = stop_loss;
            }
            tracing::info!(symbol, %stop_loss, "Attached stop to adopted position");
        }

        let Some(position) = self.positions.get(&key) else {
            return Ok(());
        };
        let active_stop = position.active_stop();
        let stop_hit = match side {
            Side::Buy => price <= active_stop,
            Side::Sell => price >= active_stop,
        };
        if stop_hit {
            let closed_by = if position.trailing.armed {
                ClosedBy::TrailingStop
            } else {
                ClosedBy::StopLoss
            };
            return self.close(symbol, side, price, closed_by).await;
        }

        let target_hit = match side {
            Side::Buy => price >= position.take_profit,
            Side::Sell => price <= position.take_profit,
        };
        if target_hit {
            return self.close(symbol, side, price, ClosedBy::TakeProfit).await;
        }

        self.update_trailing(symbol, side, price, atr).await
    }

    /// Arm at `trailing_arm_multiple * ATR` in favor, then ratchet; the
    /// exchange sees an update only when the stop actually moves.
    async fn update_trailing(
        &mut self,
        symbol: &str,
        side: Side,
        price: Decimal,
        atr: Decimal,
    ) -> Result<()> {
        let key = (symbol.to_string(), side);
        let Some(position) = self.positions.get(&key) else {
            return Ok(());
        };

        let offset = atr * self.settings.trailing_offset_multiple;
        let candidate = match side {
            Side::Buy => price - offset,
            Side::Sell => price + offset,
        };

        if !position.trailing.armed {
            let arm_distance = atr * self.settings.trailing_arm_multiple;
            let in_favor = match side {
                Side::Buy => price - position.entry_price,
                Side::Sell => position.entry_price - price,
            };
            if in_favor < arm_distance {
                return Ok(());
            }
            // Never arm looser than the original stop
            let stop = match side {
                Side::Buy => candidate.max(position.stop_loss),
                Side::Sell => candidate.min(position.stop_loss),
            };
            self.gateway.set_trading_stop(symbol, side, stop).await?;
            if let Some(position) = self.positions.get_mut(&key) {
                position.trailing.armed = true;
                position.trailing.current_stop = stop;
            }
            tracing::info!(symbol, side = side.as_str(), %stop, "Trailing stop armed");
            return Ok(());
        }

        let improves = match side {
            Side::Buy => candidate > position.trailing.current_stop,
            Side::Sell => candidate < position.trailing.current_stop,
        };
        if improves {
            self.gateway
                .set_trading_stop(symbol, side, candidate)
                .await?;
            if let Some(position) = self.positions.get_mut(&key) {
                position.trailing.current_stop = candidate;
            }
            tracing::debug!(symbol, side = side.as_str(), stop = %candidate, "Trailing stop ratcheted");
        }
        Ok(())
    }

    /// Reduce-only close. The trade record is written to the ledger
    /// before the close is considered final.
    pub async fn close(
        &mut self,
        symbol: &str,
        side: Side,
        exit_price: Decimal,
        closed_by: ClosedBy,
    ) -> Result<()> {
        let key = (symbol.to_string(), side);
        let Some(position) = self.positions.get_mut(&key) else {
            return Ok(());
        };
        position.status = PositionStatus::Closing;
        let qty = position.qty;

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side: side.opposite(),
            order_type: OrderType::Market,
            qty,
            price: None,
            reduce_only: true,
            stop_loss: None,
            take_profit: None,
            client_order_id: Uuid::new_v4().to_string(),
        };
        if let Err(e) = self.gateway.place_order(&request).await {
            // Stay in Closing; the next monitor cycle retries
            self.alerts.notify(
                AlertLevel::Critical,
                &format!("close order for {symbol} {} failed: {e}", side.as_str()),
            );
            return Err(e);
        }

        self.finalize_close(&key, exit_price, closed_by)
    }

    /// Record the trade and drop local state. Used both after our own
    /// close order and when the exchange reports the position gone.
    fn finalize_close(
        &mut self,
        key: &(String, Side),
        exit_price: Decimal,
        closed_by: ClosedBy,
    ) -> Result<()> {
        let Some(position) = self.positions.get(key) else {
            return Ok(());
        };
        let record = TradeRecord {
            symbol: position.symbol.clone(),
            side: position.side,
            qty: position.qty,
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.opened_at,
            exit_time: Utc::now(),
            pnl: position.pnl_at(exit_price),
            closed_by,
        };
        // Durability before finality
        self.ledger.append(&record)?;
        tracing::info!(
            symbol = %record.symbol,
            side = record.side.as_str(),
            pnl = %record.pnl,
            closed_by = ?closed_by,
            "Position closed"
        );
        self.perf.record(record);
        self.positions.remove(key);
        Ok(())
    }

    /// Converge local state to what the exchange reports for `symbol`.
    pub async fn reconcile(&mut self, symbol: &str) -> Result<()> {
        let remote = self.gateway.fetch_positions(symbol).await?;

        // Local positions the exchange no longer has were closed out from
        // under us (liquidation, manual intervention)
        let local_keys: Vec<(String, Side)> = self
            .positions
            .keys()
            .filter(|(s, _)| s == symbol)
            .cloned()
            .collect();
        for key in local_keys {
            if remote.iter().any(|r| r.side == key.1) {
                continue;
            }
            tracing::warn!(
                symbol,
                side = key.1.as_str(),
                "Exchange no longer reports local position, treating as externally closed"
            );
            self.alerts.notify(
                AlertLevel::Warning,
                &format!("{symbol} {} position closed externally", key.1.as_str()),
            );
            let exit_price = self.fetch_price_decimal(symbol).await?;
            self.finalize_close(&key, exit_price, ClosedBy::ExchangeClosed)?;
        }

        // Remote positions we do not know about get adopted
        for snapshot in remote {
            let key = (snapshot.symbol.clone(), snapshot.side);
            match self.positions.get_mut(&key) {
                Some(local) => {
                    if local.qty != snapshot.qty {
                        tracing::warn!(
                            symbol,
                            local_qty = %local.qty,
                            exchange_qty = %snapshot.qty,
                            "Quantity drift, exchange wins"
                        );
                        local.qty = snapshot.qty;
                    }
                }
                None => {
                    tracing::warn!(
                        symbol,
                        side = snapshot.side.as_str(),
                        qty = %snapshot.qty,
                        "Adopting position reported by exchange"
                    );
                    self.adopt(snapshot);
                }
            }
        }
        Ok(())
    }

    fn adopt(&mut self, snapshot: PositionSnapshot) {
        let stop_loss = snapshot.stop_loss.unwrap_or(Decimal::ZERO);
        let take_profit = snapshot.take_profit.unwrap_or(Decimal::ZERO);
        self.positions.insert(
            (snapshot.symbol.clone(), snapshot.side),
            Position {
                symbol: snapshot.symbol,
                side: snapshot.side,
                qty: snapshot.qty,
                entry_price: snapshot.entry_price,
                stop_loss,
                take_profit,
                trailing: TrailingState {
                    armed: false,
                    current_stop: stop_loss,
                },
                status: PositionStatus::Open,
                exchange_order_id: None,
                opened_at: Utc::now(),
            },
        );
    }

    async fn fetch_price_decimal(&self, symbol: &str) -> Result<Decimal> {
        let price = self.gateway.fetch_price(symbol).await?;
        Decimal::from_f64(price)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| BotError::StaleData(format!("unusable price {price} for {symbol}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::testing::CapturingAlerts;
    use crate::models::{Candle, OrderBookLevels};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scriptable gateway that records every mutating call
    struct MockGateway {
        balance: Decimal,
        price: Mutex<f64>,
        positions: Mutex<Vec<PositionSnapshot>>,
        orders: Mutex<Vec<OrderRequest>>,
        stop_updates: Mutex<Vec<Decimal>>,
        fail_orders: bool,
    }

    impl MockGateway {
        fn new(balance: &str, price: f64) -> Self {
            Self {
                balance: balance.parse().unwrap(),
                price: Mutex::new(price),
                positions: Mutex::new(Vec::new()),
                orders: Mutex::new(Vec::new()),
                stop_updates: Mutex::new(Vec::new()),
                fail_orders: false,
            }
        }

        fn set_price(&self, price: f64) {
            *self.price.lock().unwrap() = price;
        }

        fn orders(&self) -> Vec<OrderRequest> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<crate::api::OrderRef> {
            if self.fail_orders {
                return Err(BotError::ExchangeBusiness("110007: no balance".into()));
            }
            self.orders.lock().unwrap().push(request.clone());
            Ok(crate::api::OrderRef {
                order_id: format!("order-{}", self.orders.lock().unwrap().len()),
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
        async fn set_trading_stop(
            &self,
            _symbol: &str,
            _side: Side,
            stop_loss: Decimal,
        ) -> Result<()> {
            self.stop_updates.lock().unwrap().push(stop_loss);
            Ok(())
        }
        async fn fetch_price(&self, _symbol: &str) -> Result<f64> {
            Ok(*self.price.lock().unwrap())
        }
        async fn fetch_klines(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>> {
            Ok(vec![])
        }
        async fn fetch_order_book(&self, _symbol: &str, _limit: usize) -> Result<OrderBookLevels> {
            Ok(OrderBookLevels::default())
        }
    }

    fn manager(
        gateway: Arc<MockGateway>,
        settings: TradeSettings,
    ) -> (PositionLifecycleManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path().join("trades.jsonl")).unwrap();
        let mgr = PositionLifecycleManager::new(
            gateway,
            settings,
            ledger,
            Arc::new(CapturingAlerts::default()),
        )
        .unwrap();
        (mgr, dir)
    }

    #[test]
    fn test_sizing_example() {
        // balance 10,000 / risk 1% / ATR 50 / stop x1.5 / price 20,000
        let qty = size_qty(
            Decimal::from(10_000),
            Decimal::new(1, 2),
            Decimal::from(50),
            Decimal::new(15, 1),
            Decimal::from(20_000),
            Decimal::new(1, 7), // step 0.0000001
        );
        // riskAmount 100 / stopDistance 75 / price 20,000 = 0.0000666...
        assert_eq!(qty, Decimal::new(666, 7));
    }

    #[test]
    fn test_sizing_degenerate_inputs_are_zero() {
        assert_eq!(
            size_qty(
                Decimal::from(10_000),
                Decimal::new(1, 2),
                Decimal::ZERO,
                Decimal::new(15, 1),
                Decimal::from(20_000),
                Decimal::new(1, 3)
            ),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_open_rejects_below_min_qty() {
        let gateway = Arc::new(MockGateway::new("10000", 20000.0));
        let (mut mgr, _dir) = manager(gateway.clone(), TradeSettings::default());

        // sized qty 0.0000666 floors to 0 at step 0.001
        let opened = mgr.open("BTCUSDT", Side::Buy, 50.0).await.unwrap();
        assert!(opened.is_none());
        assert!(gateway.orders().is_empty());
        assert!(mgr.get_position("BTCUSDT", Side::Buy).is_none());
    }

    #[tokio::test]
    async fn test_open_attaches_side_correct_stops() {
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        let (mut mgr, _dir) = manager(gateway.clone(), TradeSettings::default());

        mgr.open("BTCUSDT", Side::Buy, 50.0).await.unwrap().unwrap();
        let orders = gateway.orders();
        assert_eq!(orders.len(), 1);
        assert!(!orders[0].reduce_only);
        // Buy: SL below entry, TP above
        assert_eq!(orders[0].stop_loss, Some("19925".parse().unwrap()));
        assert_eq!(orders[0].take_profit, Some("20150".parse().unwrap()));
        assert!(!orders[0].client_order_id.is_empty());

        let position = mgr.get_position("BTCUSDT", Side::Buy).unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.stop_loss, "19925".parse().unwrap());
    }

    #[tokio::test]
    async fn test_zero_atr_is_stale_data() {
        let gateway = Arc::new(MockGateway::new("10000", 20000.0));
        let (mut mgr, _dir) = manager(gateway, TradeSettings::default());
        assert!(matches!(
            mgr.open("BTCUSDT", Side::Buy, 0.0).await.unwrap_err(),
            BotError::StaleData(_)
        ));
        assert!(matches!(
            mgr.open("BTCUSDT", Side::Buy, f64::NAN).await.unwrap_err(),
            BotError::StaleData(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_loss_monitor_example() {
        // entry 20,000, SL 19,925; price 19,900 closes with negative PnL
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        let (mut mgr, _dir) = manager(gateway.clone(), TradeSettings::default());
        mgr.open("BTCUSDT", Side::Buy, 50.0).await.unwrap().unwrap();

        gateway.set_price(19900.0);
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();

        assert!(mgr.get_position("BTCUSDT", Side::Buy).is_none());
        let orders = gateway.orders();
        assert_eq!(orders.len(), 2);
        assert!(orders[1].reduce_only);
        assert_eq!(orders[1].side, Side::Sell);

        let summary = mgr.performance().summary();
        assert_eq!(summary.total_trades, 1);
        assert!(summary.total_pnl < Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_trailing_arms_then_ratchets_never_loosens() {
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        let (mut mgr, _dir) = manager(gateway.clone(), TradeSettings::default());
        mgr.open("BTCUSDT", Side::Buy, 50.0).await.unwrap().unwrap();

        // Below the 1 ATR arming threshold: no stop update
        gateway.set_price(20040.0);
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();
        assert!(gateway.stop_updates.lock().unwrap().is_empty());

        // 1 ATR in favor: arms at price - 1.5 ATR
        gateway.set_price(20050.0);
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();
        {
            let updates = gateway.stop_updates.lock().unwrap();
            assert_eq!(updates.as_slice(), ["19975".parse::<Decimal>().unwrap()]);
        }

        // Price advances: stop ratchets up, one push
        gateway.set_price(20100.0);
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();
        {
            let updates = gateway.stop_updates.lock().unwrap();
            assert_eq!(updates.len(), 2);
            assert_eq!(updates[1], "20025".parse().unwrap());
        }

        // Price retreats but stays above the stop: no loosening, no push
        gateway.set_price(20080.0);
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();
        assert_eq!(gateway.stop_updates.lock().unwrap().len(), 2);
        let position = mgr.get_position("BTCUSDT", Side::Buy).unwrap();
        assert_eq!(position.trailing.current_stop, "20025".parse().unwrap());
    }

    #[tokio::test]
    async fn test_trailing_stop_close_is_tagged_trailing() {
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        let (mut mgr, dir) = manager(gateway.clone(), TradeSettings::default());
        mgr.open("BTCUSDT", Side::Buy, 50.0).await.unwrap().unwrap();

        gateway.set_price(20100.0);
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();
        // Fall through the ratcheted stop at 20025
        gateway.set_price(20020.0);
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();

        let ledger = TradeLedger::new(dir.path().join("trades.jsonl")).unwrap();
        let records = ledger.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].closed_by, ClosedBy::TrailingStop);
        // Locked in profit even though price retreated
        assert!(records[0].pnl > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_and_stops_on_next_cycle() {
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        gateway.positions.lock().unwrap().push(PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            qty: "0.5".parse().unwrap(),
            entry_price: "20000".parse().unwrap(),
            stop_loss: None,
            take_profit: None,
        });
        let (mut mgr, _dir) = manager(gateway.clone(), TradeSettings::default());

        mgr.reconcile("BTCUSDT").await.unwrap();
        let position = mgr.get_position("BTCUSDT", Side::Buy).unwrap();
        assert_eq!(position.qty, "0.5".parse().unwrap());
        assert!(position.stop_loss.is_zero());

        // Next monitor derives and pushes a stop
        mgr.monitor("BTCUSDT", Side::Buy, 50.0).await.unwrap();
        assert_eq!(
            gateway.stop_updates.lock().unwrap().as_slice(),
            ["19925".parse::<Decimal>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_reconcile_retires_externally_closed() {
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        let (mut mgr, dir) = manager(gateway.clone(), TradeSettings::default());
        mgr.open("BTCUSDT", Side::Buy, 50.0).await.unwrap().unwrap();

        // Exchange reports nothing: the position is gone
        gateway.set_price(20500.0);
        mgr.reconcile("BTCUSDT").await.unwrap();
        assert!(mgr.get_position("BTCUSDT", Side::Buy).is_none());

        let ledger = TradeLedger::new(dir.path().join("trades.jsonl")).unwrap();
        let records = ledger.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].closed_by, ClosedBy::ExchangeClosed);
    }

    #[tokio::test]
    async fn test_reconcile_quantity_drift_exchange_wins() {
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        let (mut mgr, _dir) = manager(gateway.clone(), TradeSettings::default());
        mgr.open("BTCUSDT", Side::Buy, 50.0).await.unwrap().unwrap();
        let local_qty = mgr.get_position("BTCUSDT", Side::Buy).unwrap().qty;

        gateway.positions.lock().unwrap().push(PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            qty: local_qty * Decimal::TWO,
            entry_price: "20000".parse().unwrap(),
            stop_loss: Some("19925".parse().unwrap()),
            take_profit: None,
        });
        mgr.reconcile("BTCUSDT").await.unwrap();
        assert_eq!(
            mgr.get_position("BTCUSDT", Side::Buy).unwrap().qty,
            local_qty * Decimal::TWO
        );
    }

    #[tokio::test]
    async fn test_signal_flips_position() {
        let gateway = Arc::new(MockGateway::new("1000000", 20000.0));
        let (mut mgr, _dir) = manager(gateway.clone(), TradeSettings::default());
        mgr.on_signal("BTCUSDT", Verdict::Buy, 50.0).await.unwrap();
        assert!(mgr.get_position("BTCUSDT", Side::Buy).is_some());

        mgr.on_signal("BTCUSDT", Verdict::Sell, 50.0).await.unwrap();
        assert!(mgr.get_position("BTCUSDT", Side::Buy).is_none());
        assert!(mgr.get_position("BTCUSDT", Side::Sell).is_some());

        // Buy entry, reduce-only close, Sell entry
        let orders = gateway.orders();
        assert_eq!(orders.len(), 3);
        assert!(orders[1].reduce_only);
    }

    #[tokio::test]
    async fn test_failed_entry_leaves_no_local_position() {
        let mut gateway = MockGateway::new("1000000", 20000.0);
        gateway.fail_orders = true;
        let alerts = Arc::new(CapturingAlerts::default());
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path().join("trades.jsonl")).unwrap();
        let mut mgr = PositionLifecycleManager::new(
            Arc::new(gateway),
            TradeSettings::default(),
            ledger,
            alerts.clone(),
        )
        .unwrap();

        assert!(mgr.open("BTCUSDT", Side::Buy, 50.0).await.is_err());
        assert!(mgr.get_position("BTCUSDT", Side::Buy).is_none());
        assert_eq!(alerts.messages.lock().unwrap().len(), 1);
    }
}
